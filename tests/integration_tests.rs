use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::Router;
use chrono::{NaiveDate, Utc};
use tower::ServiceExt;

use carebook::config::AppConfig;
use carebook::db::{self, queries};
use carebook::handlers;
use carebook::handlers::webhook::{sign_payload, SIGNATURE_HEADER};
use carebook::models::{BookingEvent, Coordinates, ReconciliationKind, Site, Therapist, TherapistAvailability, User};
use carebook::services::geocoding::Geocoder;
use carebook::services::lifecycle::{self, Transition};
use carebook::services::notify::{NotificationSink, TemplateKind};
use carebook::services::payment::{CaptureOutcome, PaymentGateway, RefundOutcome};
use carebook::services::workflow;
use carebook::state::AppState;

// ── Mock Providers ──

#[derive(Default)]
struct GatewayLog {
    captures: AtomicUsize,
    attempts: Mutex<Vec<u32>>,
    refunds: Mutex<Vec<(String, i64)>>,
    releases: Mutex<Vec<String>>,
}

struct MockGateway {
    log: Arc<GatewayLog>,
    decline: bool,
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn capture(
        &self,
        booking_id: &str,
        attempt: u32,
        _amount: i64,
        _authorization_id: Option<&str>,
    ) -> anyhow::Result<CaptureOutcome> {
        self.log.captures.fetch_add(1, Ordering::SeqCst);
        self.log.attempts.lock().unwrap().push(attempt);
        if self.decline {
            return Ok(CaptureOutcome::Declined {
                reason: "card declined".to_string(),
            });
        }
        Ok(CaptureOutcome::Captured {
            transaction_id: format!("tx_{booking_id}"),
        })
    }

    async fn refund(&self, transaction_id: &str, amount: i64) -> anyhow::Result<RefundOutcome> {
        self.log
            .refunds
            .lock()
            .unwrap()
            .push((transaction_id.to_string(), amount));
        Ok(RefundOutcome::Refunded)
    }

    async fn release(&self, authorization_id: &str) -> anyhow::Result<()> {
        self.log
            .releases
            .lock()
            .unwrap()
            .push(authorization_id.to_string());
        Ok(())
    }
}

struct MockNotifier {
    sent: Arc<Mutex<Vec<(TemplateKind, String)>>>,
}

#[async_trait]
impl NotificationSink for MockNotifier {
    async fn send(
        &self,
        template: TemplateKind,
        recipient: &str,
        _context: &serde_json::Value,
    ) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((template, recipient.to_string()));
        Ok(())
    }
}

struct MockGeocoder;

#[async_trait]
impl Geocoder for MockGeocoder {
    async fn resolve(&self, address: &str) -> anyhow::Result<Option<Coordinates>> {
        if address.contains("Shibuya") {
            Ok(Some(Coordinates { lat: 35.0, lng: 139.0 }))
        } else {
            Ok(None)
        }
    }
}

// ── Helpers ──

struct TestEnv {
    state: Arc<AppState>,
    gateway: Arc<GatewayLog>,
    sent: Arc<Mutex<Vec<(TemplateKind, String)>>>,
}

fn test_config() -> AppConfig {
    AppConfig {
        port: 3000,
        database_url: ":memory:".to_string(),
        admin_token: "test-token".to_string(),
        payment_gateway_url: "http://localhost:4242".to_string(),
        payment_api_key: "".to_string(),
        payment_webhook_secret: "".to_string(), // empty = skip signature validation
        mail_api_url: "http://localhost:8025".to_string(),
        mail_api_key: "".to_string(),
        mail_from: "no-reply@test.local".to_string(),
        geocoder_url: "http://localhost:8080".to_string(),
        start_grace_minutes: 15,
        refund_cutoff_hours: 0,
        late_cancel_fee_percent: 0,
        match_limit: 20,
        office_commission_percent: 10,
        pending_expiry_minutes: None,
    }
}

fn build_env(config: AppConfig, decline: bool) -> TestEnv {
    let conn = db::init_db(":memory:").unwrap();
    let gateway = Arc::new(GatewayLog::default());
    let sent = Arc::new(Mutex::new(vec![]));
    let state = Arc::new(AppState::new(
        conn,
        config,
        Box::new(MockGateway {
            log: Arc::clone(&gateway),
            decline,
        }),
        Box::new(MockNotifier {
            sent: Arc::clone(&sent),
        }),
        Box::new(MockGeocoder),
    ));
    TestEnv { state, gateway, sent }
}

fn test_env() -> TestEnv {
    build_env(test_config(), false)
}

fn test_app(state: Arc<AppState>) -> Router {
    handlers::router(state)
}

fn tomorrow() -> NaiveDate {
    Utc::now().date_naive() + chrono::Duration::days(1)
}

fn tomorrow_at(time: &str) -> String {
    format!("{}T{time}:00", tomorrow())
}

fn therapist(id: &str, rating: f64, base: Coordinates, auto_approve: bool) -> Therapist {
    Therapist {
        id: id.to_string(),
        name: format!("Therapist {id}"),
        email: format!("{id}@example.com"),
        rating,
        hourly_rate: 8000,
        base_location: Some(base),
        areas: vec!["Shibuya".to_string()],
        site_ids: vec!["site-1".to_string()],
        office_id: Some("office-1".to_string()),
        auto_approve,
    }
}

/// A therapist open all day tomorrow, plus the user and site they deal with.
fn seed(state: &AppState, id: &str, rating: f64, base: Coordinates, auto_approve: bool) {
    let db = state.db.lock().unwrap();
    queries::upsert_therapist(&db, &therapist(id, rating, base, auto_approve)).unwrap();
    let availability = TherapistAvailability::from_json(&format!(
        r#"{{
            "windows": [{{"date": "{}", "start": "00:00:00", "end": "23:59:00"}}],
            "onsite_enabled": true,
            "outcall_enabled": true,
            "transport_modes": {{"car": {{"enabled": true, "max_distance_km": 10.0, "fee": 1000}}}}
        }}"#,
        tomorrow()
    ))
    .unwrap();
    queries::save_availability(&db, id, &availability).unwrap();
    queries::upsert_user(
        &db,
        &User {
            id: "u1".to_string(),
            name: "Yui".to_string(),
            email: "yui@example.com".to_string(),
        },
    )
    .unwrap();
    queries::upsert_site(
        &db,
        &Site {
            id: "site-1".to_string(),
            name: "Harbor Spa".to_string(),
            host_email: "host@harbor.example".to_string(),
            location: Some(Coordinates { lat: 35.0, lng: 139.0 }),
        },
    )
    .unwrap();
}

fn home() -> Coordinates {
    Coordinates { lat: 35.0, lng: 139.0 }
}

fn as_principal(method: &str, uri: &str, id: &str, role: &str, body: Option<String>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("X-Principal-Id", id)
        .header("X-Principal-Role", role);
    match body {
        Some(b) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(b))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

fn onsite_body(time: &str) -> String {
    format!(
        r#"{{"therapist_id":"t1","site_id":"site-1","scheduled_start":"{}","duration_minutes":60,"mode":"ONSITE","line_items":[{{"name":"aroma oil","price":1000}}]}}"#,
        tomorrow_at(time)
    )
}

async fn json_body(res: Response<Body>) -> serde_json::Value {
    let body = axum::body::to_bytes(res.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

async fn create(state: &Arc<AppState>, time: &str) -> (StatusCode, serde_json::Value) {
    let res = test_app(state.clone())
        .oneshot(as_principal("POST", "/api/bookings", "u1", "user", Some(onsite_body(time))))
        .await
        .unwrap();
    let status = res.status();
    (status, json_body(res).await)
}

async fn post_event(
    state: &Arc<AppState>,
    id: &str,
    event: &str,
    principal: (&str, &str),
    reason: Option<&str>,
) -> (StatusCode, serde_json::Value) {
    let body = reason.map(|r| format!(r#"{{"reason":"{r}"}}"#));
    let res = test_app(state.clone())
        .oneshot(as_principal(
            "POST",
            &format!("/api/bookings/{id}/{event}"),
            principal.0,
            principal.1,
            body,
        ))
        .await
        .unwrap();
    let status = res.status();
    (status, json_body(res).await)
}

/// Posts an unsigned gateway notification; test configs carry no webhook secret.
async fn deliver_notice(state: &Arc<AppState>, payload: String) -> StatusCode {
    let res = test_app(state.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook/payments")
                .body(Body::from(payload))
                .unwrap(),
        )
        .await
        .unwrap();
    res.status()
}

async fn create_authorized(state: &Arc<AppState>, time: &str, authorization_id: &str) -> String {
    let body = onsite_body(time).replacen('{', &format!(r#"{{"authorization_id":"{authorization_id}","#), 1);
    let res = test_app(state.clone())
        .oneshot(as_principal("POST", "/api/bookings", "u1", "user", Some(body)))
        .await
        .unwrap();
    json_body(res).await["id"].as_str().unwrap().to_string()
}

/// Commits a transition straight through the lifecycle, leaving its side
/// effects to the caller.
fn commit(state: &AppState, id: &str, event: BookingEvent, reason: Option<&str>) -> Transition {
    let mut db = state.db.lock().unwrap();
    lifecycle::transition(
        &mut db,
        id,
        event,
        reason,
        Utc::now().naive_utc(),
        chrono::Duration::minutes(15),
    )
    .unwrap()
}

const THERAPIST: (&str, &str) = ("t1", "therapist");
const USER: (&str, &str) = ("u1", "user");

async fn wait_for_mail(sent: &Arc<Mutex<Vec<(TemplateKind, String)>>>, count: usize) {
    for _ in 0..100 {
        if sent.lock().unwrap().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ── Health ──

#[tokio::test]
async fn test_health() {
    let env = test_env();
    let res = test_app(env.state)
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

// ── Auth ──

#[tokio::test]
async fn test_missing_principal_is_unauthorized() {
    let env = test_env();
    let res = test_app(env.state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/bookings")
                .header("Content-Type", "application/json")
                .body(Body::from(onsite_body("10:00")))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_user_cannot_approve() {
    let env = test_env();
    seed(&env.state, "t1", 4.8, home(), false);
    let (_, booking) = create(&env.state, "10:00").await;
    let id = booking["id"].as_str().unwrap();

    let (status, _) = post_event(&env.state, id, "approve", USER, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_other_user_cannot_view_booking() {
    let env = test_env();
    seed(&env.state, "t1", 4.8, home(), false);
    let (_, booking) = create(&env.state, "10:00").await;
    let id = booking["id"].as_str().unwrap();

    let res = test_app(env.state.clone())
        .oneshot(as_principal("GET", &format!("/api/bookings/{id}"), "u2", "user", None))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    let res = test_app(env.state)
        .oneshot(as_principal("GET", &format!("/api/bookings/{id}"), "site-1", "host", None))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_admin_requires_token() {
    let env = test_env();
    let res = test_app(env.state.clone())
        .oneshot(
            Request::builder()
                .uri("/api/admin/reconciliation")
                .header("Authorization", "Bearer wrong-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = test_app(env.state)
        .oneshot(
            Request::builder()
                .uri("/api/admin/reconciliation")
                .header("Authorization", "Bearer test-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(json_body(res).await, serde_json::json!([]));
}

// ── Admin records ──

#[tokio::test]
async fn test_admin_upserts_therapist() {
    let env = test_env();
    let res = test_app(env.state.clone())
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/api/admin/therapists/t9")
                .header("Authorization", "Bearer test-token")
                .header("Content-Type", "application/json")
                .body(Body::from(
                    r#"{"name":"Ren","email":"ren@example.com","rating":4.2,"hourly_rate":6000}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let json = json_body(res).await;
    assert_eq!(json["id"], "t9");

    let db = env.state.db.lock().unwrap();
    let stored = queries::get_therapist(&db, "t9").unwrap().unwrap();
    assert_eq!(stored.hourly_rate, 6000);
    assert!(!stored.auto_approve);
}

#[tokio::test]
async fn test_admin_upsert_rejects_mismatched_id() {
    let env = test_env();
    let res = test_app(env.state)
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/api/admin/users/u1")
                .header("Authorization", "Bearer test-token")
                .header("Content-Type", "application/json")
                .body(Body::from(r#"{"id":"u2","name":"Yui","email":"yui@example.com"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

// ── Creation ──

#[tokio::test]
async fn test_create_pending_without_auto_approval() {
    let env = test_env();
    seed(&env.state, "t1", 4.8, home(), false);

    let (status, json) = create(&env.state, "10:00").await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["status"], "PENDING");
    assert_eq!(json["payment_status"], "UNPAID");
    assert_eq!(json["base_price"], 8000);
    assert_eq!(json["office_id"], "office-1");
    assert_eq!(env.gateway.captures.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_create_auto_approved_confirms_and_captures() {
    let env = test_env();
    seed(&env.state, "t1", 4.8, home(), true);

    let (status, json) = create(&env.state, "10:00").await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["status"], "CONFIRMED");
    assert_eq!(json["payment_status"], "CAPTURED");
    assert_eq!(env.gateway.captures.load(Ordering::SeqCst), 1);

    // user, therapist and host
    wait_for_mail(&env.sent, 3).await;
    let sent = env.sent.lock().unwrap();
    assert_eq!(sent.len(), 3);
    assert!(sent.iter().all(|(t, _)| *t == TemplateKind::BookingConfirmed));
    assert!(sent.iter().any(|(_, to)| to == "host@harbor.example"));
}

#[tokio::test]
async fn test_create_overlapping_slot_conflicts() {
    let env = test_env();
    seed(&env.state, "t1", 4.8, home(), false);

    let (status, _) = create(&env.state, "10:00").await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, json) = create(&env.state, "10:30").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["kind"], "slot_conflict");

    // adjacent slots don't overlap
    let (status, _) = create(&env.state, "11:00").await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_identical_creates_one_wins() {
    let env = test_env();
    seed(&env.state, "t1", 4.8, home(), true);

    let mut handles = vec![];
    for _ in 0..8 {
        let state = env.state.clone();
        handles.push(tokio::spawn(async move { create(&state, "15:00").await.0 }));
    }

    let mut created = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            StatusCode::CREATED => created += 1,
            StatusCode::CONFLICT => conflicts += 1,
            other => panic!("unexpected status {other}"),
        }
    }
    assert_eq!(created, 1);
    assert_eq!(conflicts, 7);
    assert_eq!(env.gateway.captures.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_create_outside_availability() {
    let env = test_env();
    seed(&env.state, "t1", 4.8, home(), false);

    let body = format!(
        r#"{{"therapist_id":"t1","site_id":"site-1","scheduled_start":"{}T10:00:00","duration_minutes":60,"mode":"ONSITE"}}"#,
        tomorrow() + chrono::Duration::days(3)
    );
    let res = test_app(env.state)
        .oneshot(as_principal("POST", "/api/bookings", "u1", "user", Some(body)))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_create_mobile_geocodes_address() {
    let env = test_env();
    seed(&env.state, "t1", 4.8, Coordinates { lat: 35.045, lng: 139.0 }, false);

    let body = format!(
        r#"{{"therapist_id":"t1","scheduled_start":"{}","duration_minutes":90,"mode":"MOBILE","address":"Shibuya 1-1"}}"#,
        tomorrow_at("18:00")
    );
    let res = test_app(env.state.clone())
        .oneshot(as_principal("POST", "/api/bookings", "u1", "user", Some(body)))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let json = json_body(res).await;
    // 90 minutes at 8000/h plus the car fee
    assert_eq!(json["base_price"], 13000);
    assert!(json["site_id"].is_null());

    let body = format!(
        r#"{{"therapist_id":"t1","scheduled_start":"{}","duration_minutes":60,"mode":"MOBILE","address":"Nowhere 9"}}"#,
        tomorrow_at("21:00")
    );
    let res = test_app(env.state)
        .oneshot(as_principal("POST", "/api/bookings", "u1", "user", Some(body)))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_user_cannot_book_for_someone_else() {
    let env = test_env();
    seed(&env.state, "t1", 4.8, home(), false);
    let body = onsite_body("10:00").replacen('{', r#"{"user_id":"u2","#, 1);
    let res = test_app(env.state)
        .oneshot(as_principal("POST", "/api/bookings", "u1", "user", Some(body)))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_create_rejects_price_overflow() {
    let env = test_env();
    seed(&env.state, "t1", 4.8, home(), true);
    let body = onsite_body("10:00").replace(r#""price":1000"#, &format!(r#""price":{}"#, i64::MAX));
    let res = test_app(env.state.clone())
        .oneshot(as_principal("POST", "/api/bookings", "u1", "user", Some(body)))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_eq!(env.gateway.captures.load(Ordering::SeqCst), 0);

    let db = env.state.db.lock().unwrap();
    let stored = queries::list_bookings(&db, &queries::BookingFilter { limit: 10, ..Default::default() }).unwrap();
    assert!(stored.is_empty());
}

// ── Transitions ──

#[tokio::test]
async fn test_approve_captures_once() {
    let env = test_env();
    seed(&env.state, "t1", 4.8, home(), false);
    let (_, booking) = create(&env.state, "10:00").await;
    let id = booking["id"].as_str().unwrap().to_string();

    let (status, json) = post_event(&env.state, &id, "approve", THERAPIST, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "CONFIRMED");
    assert_eq!(json["payment_status"], "CAPTURED");
    assert_eq!(json["transaction_id"], format!("tx_{id}"));

    // a manual retry is a no-op
    let res = test_app(env.state.clone())
        .oneshot(as_principal(
            "POST",
            &format!("/api/bookings/{id}/payment/capture"),
            "admin",
            "admin",
            None,
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let json = json_body(res).await;
    assert_eq!(json["result"], "already_captured");
    assert_eq!(env.gateway.captures.load(Ordering::SeqCst), 1);

    // approving again is illegal
    let (status, json) = post_event(&env.state, &id, "approve", THERAPIST, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["current"], "CONFIRMED");
    assert_eq!(env.gateway.captures.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_approves_one_wins() {
    let env = test_env();
    seed(&env.state, "t1", 4.8, home(), false);
    let (_, booking) = create(&env.state, "10:00").await;
    let id = booking["id"].as_str().unwrap().to_string();

    let mut handles = vec![];
    for principal in [THERAPIST, ("office-1", "office")] {
        let state = env.state.clone();
        let id = id.clone();
        handles.push(tokio::spawn(async move {
            post_event(&state, &id, "approve", principal, None).await.0
        }));
    }
    let mut statuses = vec![];
    for handle in handles {
        statuses.push(handle.await.unwrap());
    }
    statuses.sort_by_key(|s| s.as_u16());
    assert_eq!(statuses, vec![StatusCode::OK, StatusCode::CONFLICT]);
    assert_eq!(env.gateway.captures.load(Ordering::SeqCst), 1);

    let db = env.state.db.lock().unwrap();
    let stored = queries::get_booking_by_id(&db, &id).unwrap().unwrap();
    assert_eq!(stored.status.as_str(), "confirmed");
    assert_eq!(stored.payment_status.as_str(), "captured");
    assert_eq!(queries::get_lifecycle_events_since(&db, 0).unwrap().len(), 2);
}

#[tokio::test]
async fn test_declined_capture_is_queued_for_reconciliation() {
    let env = build_env(test_config(), true);
    seed(&env.state, "t1", 4.8, home(), false);
    let (_, booking) = create(&env.state, "10:00").await;
    let id = booking["id"].as_str().unwrap().to_string();

    let (status, json) = post_event(&env.state, &id, "approve", THERAPIST, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "CONFIRMED");
    assert_eq!(json["payment_status"], "FAILED");

    let res = test_app(env.state.clone())
        .oneshot(
            Request::builder()
                .uri("/api/admin/reconciliation")
                .header("Authorization", "Bearer test-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let items = json_body(res).await;
    assert_eq!(items.as_array().unwrap().len(), 1);
    assert_eq!(items[0]["booking_id"], id.as_str());

    // manual retry surfaces the gateway failure
    let res = test_app(env.state)
        .oneshot(as_principal(
            "POST",
            &format!("/api/bookings/{id}/payment/capture"),
            "office-1",
            "office",
            None,
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);

    // the retry went out under a new idempotency generation
    assert_eq!(*env.gateway.attempts.lock().unwrap(), vec![0, 1]);
}

#[tokio::test]
async fn test_reject_requires_reason() {
    let env = test_env();
    seed(&env.state, "t1", 4.8, home(), false);
    let (_, booking) = create(&env.state, "10:00").await;
    let id = booking["id"].as_str().unwrap().to_string();

    let (status, _) = post_event(&env.state, &id, "reject", THERAPIST, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, json) = post_event(&env.state, &id, "reject", THERAPIST, Some("fully booked")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "CANCELLED");
    assert_eq!(json["cancellation_reason"], "fully booked");
}

#[tokio::test]
async fn test_cancel_pending_leaves_payment_unpaid() {
    let env = test_env();
    seed(&env.state, "t1", 4.8, home(), false);
    let (_, booking) = create(&env.state, "10:00").await;
    let id = booking["id"].as_str().unwrap().to_string();

    let (status, json) = post_event(&env.state, &id, "cancel", USER, Some("plans changed")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "CANCELLED");
    assert_eq!(json["payment_status"], "UNPAID");
    assert!(env.gateway.refunds.lock().unwrap().is_empty());
    assert!(env.gateway.releases.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_pending_releases_authorization() {
    let env = test_env();
    seed(&env.state, "t1", 4.8, home(), false);
    let body = onsite_body("10:00").replacen('{', r#"{"authorization_id":"auth_1","#, 1);
    let res = test_app(env.state.clone())
        .oneshot(as_principal("POST", "/api/bookings", "u1", "user", Some(body)))
        .await
        .unwrap();
    let booking = json_body(res).await;
    assert_eq!(booking["payment_status"], "AUTHORIZED");
    let id = booking["id"].as_str().unwrap().to_string();

    let (_, json) = post_event(&env.state, &id, "cancel", USER, Some("plans changed")).await;
    assert_eq!(json["payment_status"], "UNPAID");
    assert_eq!(*env.gateway.releases.lock().unwrap(), vec!["auth_1".to_string()]);
}

#[tokio::test]
async fn test_cancel_confirmed_refunds_in_full() {
    let env = test_env();
    seed(&env.state, "t1", 4.8, home(), true);
    let (_, booking) = create(&env.state, "10:00").await;
    let id = booking["id"].as_str().unwrap().to_string();

    let (status, json) = post_event(&env.state, &id, "cancel", USER, Some("sick")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "CANCELLED");
    assert_eq!(json["payment_status"], "REFUNDED");
    assert_eq!(json["refunded_amount"], 9000);
    assert_eq!(
        *env.gateway.refunds.lock().unwrap(),
        vec![(format!("tx_{id}"), 9000)]
    );

    // the slot is free again
    let (status, _) = create(&env.state, "10:00").await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn test_start_too_early() {
    let env = test_env();
    seed(&env.state, "t1", 4.8, home(), true);
    let (_, booking) = create(&env.state, "23:00").await;
    let id = booking["id"].as_str().unwrap().to_string();

    let (status, json) = post_event(&env.state, &id, "start", THERAPIST, None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["kind"], "start_too_early");

    let db = env.state.db.lock().unwrap();
    let stored = queries::get_booking_by_id(&db, &id).unwrap().unwrap();
    assert_eq!(stored.status.as_str(), "confirmed");
}

#[tokio::test]
async fn test_full_lifecycle_accrues_payout() {
    let mut config = test_config();
    config.start_grace_minutes = 3 * 24 * 60;
    let env = build_env(config, false);
    seed(&env.state, "t1", 4.8, home(), true);
    let (_, booking) = create(&env.state, "10:00").await;
    let id = booking["id"].as_str().unwrap().to_string();

    let (status, json) = post_event(&env.state, &id, "complete", THERAPIST, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["allowed"], serde_json::json!(["CANCELLED", "IN_PROGRESS"]));

    let (status, json) = post_event(&env.state, &id, "start", THERAPIST, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "IN_PROGRESS");
    assert!(!json["started_at"].is_null());

    // in progress can no longer be cancelled
    let (status, _) = post_event(&env.state, &id, "cancel", USER, Some("too late")).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, json) = post_event(&env.state, &id, "complete", THERAPIST, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "COMPLETED");
    assert_eq!(json["payment_status"], "CAPTURED");

    let db = env.state.db.lock().unwrap();
    let payout = queries::get_payout(&db, &id).unwrap().unwrap();
    assert_eq!(payout.gross_amount, 9000);
    assert_eq!(payout.commission, 900);
    assert_eq!(payout.therapist_amount, 8100);
}

#[tokio::test]
async fn test_events_are_recorded_per_transition() {
    let env = test_env();
    seed(&env.state, "t1", 4.8, home(), false);
    let mut rx = env.state.events_tx.subscribe();
    let (_, booking) = create(&env.state, "10:00").await;
    let id = booking["id"].as_str().unwrap().to_string();
    post_event(&env.state, &id, "approve", THERAPIST, None).await;

    let first = rx.recv().await.unwrap();
    assert_eq!(first.event, "create");
    assert!(first.from.is_none());
    let second = rx.recv().await.unwrap();
    assert_eq!(second.event, "approve");
    assert_eq!(second.to.as_str(), "confirmed");

    let db = env.state.db.lock().unwrap();
    let stored = queries::get_lifecycle_events_since(&db, 0).unwrap();
    assert_eq!(stored.len(), 2);
}

#[tokio::test]
async fn test_list_bookings_scoped_to_party() {
    let env = test_env();
    seed(&env.state, "t1", 4.8, home(), false);
    create(&env.state, "10:00").await;
    create(&env.state, "12:00").await;

    let res = test_app(env.state.clone())
        .oneshot(as_principal("GET", "/api/bookings?status=pending", "t1", "therapist", None))
        .await
        .unwrap();
    assert_eq!(json_body(res).await.as_array().unwrap().len(), 2);

    let res = test_app(env.state)
        .oneshot(as_principal("GET", "/api/bookings", "u2", "user", None))
        .await
        .unwrap();
    assert_eq!(json_body(res).await.as_array().unwrap().len(), 0);
}

// ── Therapist settings ──

#[tokio::test]
async fn test_auto_approval_toggle() {
    let env = test_env();
    seed(&env.state, "t1", 4.8, home(), false);

    let res = test_app(env.state.clone())
        .oneshot(as_principal(
            "PUT",
            "/api/therapists/t1/auto-approval",
            "t2",
            "therapist",
            Some(r#"{"enabled":true}"#.to_string()),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    let res = test_app(env.state.clone())
        .oneshot(as_principal(
            "PUT",
            "/api/therapists/t1/auto-approval",
            "office-1",
            "office",
            Some(r#"{"enabled":true}"#.to_string()),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let (_, json) = create(&env.state, "10:00").await;
    assert_eq!(json["status"], "CONFIRMED");
}

#[tokio::test]
async fn test_put_invalid_availability() {
    let env = test_env();
    seed(&env.state, "t1", 4.8, home(), false);

    let body = format!(
        r#"{{"windows":[{{"date":"{}","start":"18:00:00","end":"09:00:00"}}],"onsite_enabled":true}}"#,
        tomorrow()
    );
    let res = test_app(env.state)
        .oneshot(as_principal("PUT", "/api/therapists/t1/availability", "t1", "therapist", Some(body)))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

// ── Matching ──

#[tokio::test]
async fn test_match_mobile_distance_filters_range() {
    let env = test_env();
    // A is ~5 km away, B ~12 km; the car only reaches 10 km
    seed(&env.state, "a", 4.8, Coordinates { lat: 35.045, lng: 139.0 }, false);
    seed(&env.state, "b", 4.9, Coordinates { lat: 35.108, lng: 139.0 }, false);

    let body = format!(
        r#"{{"date":"{}","time":"14:00:00","duration_minutes":60,"mode":"MOBILE","address":"Shibuya 1-1"}}"#,
        tomorrow()
    );
    let res = test_app(env.state.clone())
        .oneshot(as_principal("POST", "/api/match", "u1", "user", Some(body)))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let json = json_body(res).await;
    let candidates = json["candidates"].as_array().unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0]["therapist_id"], "a");
    assert_eq!(candidates[0]["transport_mode"], "car");
    assert_eq!(json["broaden_criteria"], false);
}

#[tokio::test]
async fn test_match_onsite_ranks_by_rating() {
    let env = test_env();
    seed(&env.state, "a", 4.5, home(), false);
    seed(&env.state, "b", 4.9, home(), false);

    let body = format!(
        r#"{{"date":"{}","time":"10:00:00","duration_minutes":60,"mode":"ONSITE","site_id":"site-1"}}"#,
        tomorrow()
    );
    let res = test_app(env.state)
        .oneshot(as_principal("POST", "/api/match", "u1", "user", Some(body)))
        .await
        .unwrap();
    let json = json_body(res).await;
    let ids: Vec<&str> = json["candidates"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["therapist_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["b", "a"]);
}

#[tokio::test]
async fn test_match_nothing_suggests_broadening() {
    let env = test_env();
    seed(&env.state, "a", 4.5, home(), false);

    let body = format!(
        r#"{{"date":"{}","time":"10:00:00","duration_minutes":60,"mode":"ONSITE","site_id":"site-1","min_rating":4.9}}"#,
        tomorrow()
    );
    let res = test_app(env.state)
        .oneshot(as_principal("POST", "/api/match", "u1", "user", Some(body)))
        .await
        .unwrap();
    let json = json_body(res).await;
    assert_eq!(json["candidates"], serde_json::json!([]));
    assert_eq!(json["broaden_criteria"], true);
}

// ── Post-commit follow-up ──

#[tokio::test]
async fn test_mail_follows_committed_status() {
    let env = test_env();
    seed(&env.state, "t1", 4.8, home(), false);
    let (_, booking) = create(&env.state, "10:00").await;
    let id = booking["id"].as_str().unwrap().to_string();

    // a cancel commits before the approve's follow-up runs
    let approved = commit(&env.state, &id, BookingEvent::Approve, None);
    commit(&env.state, &id, BookingEvent::Cancel, Some("plans changed"));

    let current = workflow::after_commit(&env.state, &approved).await.unwrap();
    assert_eq!(current.status.as_str(), "cancelled");
    assert_eq!(env.gateway.captures.load(Ordering::SeqCst), 0);

    wait_for_mail(&env.sent, 3).await;
    let sent = env.sent.lock().unwrap();
    assert_eq!(sent.len(), 3);
    assert!(sent.iter().all(|(template, _)| *template == TemplateKind::BookingConfirmed));
}

#[tokio::test]
async fn test_follow_up_failure_does_not_stop_the_rest() {
    let env = test_env();
    seed(&env.state, "t1", 4.8, home(), false);
    let first = create_authorized(&env.state, "10:00", "auth_1").await;
    let second = create_authorized(&env.state, "12:00", "auth_2").await;

    let mut vanished = commit(&env.state, &first, BookingEvent::Cancel, Some("expired"));
    vanished.booking.id = "missing".to_string();
    let cancelled = commit(&env.state, &second, BookingEvent::Cancel, Some("expired"));

    let finished = workflow::after_commit_each(&env.state, &[vanished, cancelled]).await;
    assert_eq!(finished, 1);
    assert_eq!(*env.gateway.releases.lock().unwrap(), vec!["auth_2".to_string()]);
}

// ── Payment webhook ──

#[tokio::test]
async fn test_webhook_rejects_bad_signature() {
    let mut config = test_config();
    config.payment_webhook_secret = "whsec".to_string();
    let env = build_env(config, false);

    let payload = r#"{"type":"capture_failed","booking_id":"b1","reason":"expired"}"#;
    let res = test_app(env.state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook/payments")
                .header(SIGNATURE_HEADER, "bm9wZQ==")
                .body(Body::from(payload))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_webhook_capture_failure_marks_booking() {
    let mut config = test_config();
    config.payment_webhook_secret = "whsec".to_string();
    let env = build_env(config, false);
    seed(&env.state, "t1", 4.8, home(), false);
    let (_, booking) = create(&env.state, "10:00").await;
    let id = booking["id"].as_str().unwrap().to_string();

    let payload = format!(r#"{{"type":"capture_failed","booking_id":"{id}","reason":"expired card"}}"#);
    let signature = sign_payload("whsec", payload.as_bytes()).unwrap();
    let res = test_app(env.state.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook/payments")
                .header(SIGNATURE_HEADER, signature)
                .body(Body::from(payload))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let db = env.state.db.lock().unwrap();
    let stored = queries::get_booking_by_id(&db, &id).unwrap().unwrap();
    assert_eq!(stored.payment_status.as_str(), "failed");
    assert_eq!(queries::list_open_reconciliation(&db).unwrap().len(), 1);
}

#[tokio::test]
async fn test_late_capture_failure_keeps_captured_payment() {
    let env = test_env();
    seed(&env.state, "t1", 4.8, home(), false);
    let (_, booking) = create(&env.state, "10:00").await;
    let id = booking["id"].as_str().unwrap().to_string();
    let (_, json) = post_event(&env.state, &id, "approve", THERAPIST, None).await;
    assert_eq!(json["payment_status"], "CAPTURED");

    let payload = format!(r#"{{"type":"capture_failed","booking_id":"{id}","reason":"expired card"}}"#);
    assert_eq!(deliver_notice(&env.state, payload).await, StatusCode::OK);

    let db = env.state.db.lock().unwrap();
    let stored = queries::get_booking_by_id(&db, &id).unwrap().unwrap();
    assert_eq!(stored.payment_status.as_str(), "captured");
    assert_eq!(stored.transaction_id, Some(format!("tx_{id}")));
    assert!(queries::list_open_reconciliation(&db).unwrap().is_empty());
}

#[tokio::test]
async fn test_capture_notice_settles_failed_payment() {
    let env = build_env(test_config(), true);
    seed(&env.state, "t1", 4.8, home(), false);
    let (_, booking) = create(&env.state, "10:00").await;
    let id = booking["id"].as_str().unwrap().to_string();
    let (_, json) = post_event(&env.state, &id, "approve", THERAPIST, None).await;
    assert_eq!(json["payment_status"], "FAILED");

    let payload = format!(r#"{{"type":"capture_succeeded","booking_id":"{id}","transaction_id":"tx_async"}}"#);
    assert_eq!(deliver_notice(&env.state, payload).await, StatusCode::OK);

    let db = env.state.db.lock().unwrap();
    let stored = queries::get_booking_by_id(&db, &id).unwrap().unwrap();
    assert_eq!(stored.payment_status.as_str(), "captured");
    assert_eq!(stored.transaction_id.as_deref(), Some("tx_async"));
    assert!(queries::list_open_reconciliation(&db).unwrap().is_empty());
}

#[tokio::test]
async fn test_capture_notice_after_cancel_is_refunded() {
    let env = test_env();
    seed(&env.state, "t1", 4.8, home(), false);
    let (_, booking) = create(&env.state, "10:00").await;
    let id = booking["id"].as_str().unwrap().to_string();
    let (_, json) = post_event(&env.state, &id, "cancel", USER, Some("plans changed")).await;
    assert_eq!(json["payment_status"], "UNPAID");

    let payload = format!(r#"{{"type":"capture_succeeded","booking_id":"{id}","transaction_id":"tx_late"}}"#);
    assert_eq!(deliver_notice(&env.state, payload).await, StatusCode::OK);

    assert_eq!(
        *env.gateway.refunds.lock().unwrap(),
        vec![("tx_late".to_string(), 9000)]
    );
    let db = env.state.db.lock().unwrap();
    let stored = queries::get_booking_by_id(&db, &id).unwrap().unwrap();
    assert_eq!(stored.status.as_str(), "cancelled");
    assert_eq!(stored.payment_status.as_str(), "refunded");
    assert_eq!(stored.refunded_amount, Some(9000));
    assert_eq!(stored.transaction_id.as_deref(), Some("tx_late"));
}

#[tokio::test]
async fn test_capture_notice_for_pending_booking_is_not_refunded() {
    let env = test_env();
    seed(&env.state, "t1", 4.8, home(), false);
    let (_, booking) = create(&env.state, "10:00").await;
    let id = booking["id"].as_str().unwrap().to_string();

    let payload = format!(r#"{{"type":"capture_succeeded","booking_id":"{id}","transaction_id":"tx_early"}}"#);
    assert_eq!(deliver_notice(&env.state, payload).await, StatusCode::OK);
    assert!(env.gateway.refunds.lock().unwrap().is_empty());
    {
        let db = env.state.db.lock().unwrap();
        let stored = queries::get_booking_by_id(&db, &id).unwrap().unwrap();
        assert_eq!(stored.status.as_str(), "pending");
        assert_eq!(stored.payment_status.as_str(), "unpaid");
        let open = queries::list_open_reconciliation(&db).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].kind, ReconciliationKind::UnmatchedCapture);
    }

    // approval still charges the booking
    let (status, json) = post_event(&env.state, &id, "approve", THERAPIST, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "CONFIRMED");
    assert_eq!(json["payment_status"], "CAPTURED");
    assert_eq!(env.gateway.captures.load(Ordering::SeqCst), 1);
}

// ── Expiry ──

#[tokio::test]
async fn test_expire_pending_disabled_by_default() {
    let env = test_env();
    seed(&env.state, "t1", 4.8, home(), false);
    create(&env.state, "10:00").await;

    let res = test_app(env.state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/admin/expire-pending")
                .header("Authorization", "Bearer test-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(json_body(res).await["expired"], 0);
}
