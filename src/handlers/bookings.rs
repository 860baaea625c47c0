use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use super::auth::{Principal, Role};
use crate::db::queries::{self, BookingFilter};
use crate::errors::{AppError, AppResult};
use crate::models::{Booking, BookingEvent, BookingMode, BookingStatus, Coordinates, LineItem};
use crate::services::geocoding;
use crate::services::lifecycle::{self, NewBooking};
use crate::services::payment::coordinator::{self, CaptureResult};
use crate::services::workflow;
use crate::state::AppState;

fn load(state: &AppState, id: &str) -> AppResult<Booking> {
    let db = state.conn()?;
    queries::get_booking_by_id(&db, id)?.ok_or_else(|| AppError::NotFound(format!("booking {id}")))
}

// POST /api/bookings
#[derive(Deserialize)]
pub struct CreateBookingRequest {
    /// Taken from the principal for users; admins must name one.
    pub user_id: Option<String>,
    pub therapist_id: String,
    pub site_id: Option<String>,
    pub scheduled_start: NaiveDateTime,
    pub duration_minutes: i32,
    pub mode: BookingMode,
    pub address: Option<String>,
    pub origin: Option<Coordinates>,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
    pub authorization_id: Option<String>,
}

pub async fn create_booking(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Json(body): Json<CreateBookingRequest>,
) -> AppResult<(StatusCode, Json<Booking>)> {
    let user_id = match principal.role {
        Role::User => {
            if body.user_id.as_deref().is_some_and(|u| u != principal.id) {
                return Err(AppError::Forbidden);
            }
            principal.id.clone()
        }
        Role::Admin => body
            .user_id
            .clone()
            .ok_or_else(|| AppError::BadRequest("user_id is required".to_string()))?,
        _ => return Err(AppError::Forbidden),
    };

    // geocode before taking the lock
    let origin = match body.mode {
        BookingMode::Mobile => {
            geocoding::resolve_origin(state.geocoder.as_ref(), body.origin, body.address.as_deref()).await
        }
        BookingMode::Onsite => body.origin,
    };

    let new = NewBooking {
        user_id,
        therapist_id: body.therapist_id,
        site_id: body.site_id,
        scheduled_start: body.scheduled_start,
        duration_minutes: body.duration_minutes,
        mode: body.mode,
        address: body.address,
        origin,
        line_items: body.line_items,
        authorization_id: body.authorization_id,
    };

    let created = {
        let mut db = state.conn()?;
        lifecycle::create_booking(&mut db, new, Utc::now().naive_utc())?
    };

    let booking = workflow::after_commit(&state, &created).await?;
    Ok((StatusCode::CREATED, Json(booking)))
}

// GET /api/bookings
#[derive(Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

pub async fn list_bookings(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<Booking>>> {
    let status = match query.status.as_deref() {
        Some(s) => Some(BookingStatus::parse(s).ok_or_else(|| AppError::BadRequest(format!("unknown status {s}")))?),
        None => None,
    };
    let filter = BookingFilter {
        party_id: (!principal.is_admin()).then_some(principal.id.as_str()),
        status,
        limit: query.limit.unwrap_or(50).clamp(1, 500),
    };

    let bookings = {
        let db = state.conn()?;
        queries::list_bookings(&db, &filter)?
    };
    Ok(Json(bookings))
}

// GET /api/bookings/:id
pub async fn get_booking(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(id): Path<String>,
) -> AppResult<Json<Booking>> {
    let booking = load(&state, &id)?;
    principal.can_view(&booking)?;
    Ok(Json(booking))
}

#[derive(Deserialize, Default)]
pub struct TransitionRequest {
    pub reason: Option<String>,
}

async fn apply_event(
    state: Arc<AppState>,
    principal: Principal,
    id: String,
    event: BookingEvent,
    body: Option<Json<TransitionRequest>>,
) -> AppResult<Json<Booking>> {
    let booking = load(&state, &id)?;
    principal.can_apply(&booking, event)?;

    let reason = body.and_then(|Json(b)| b.reason);
    let applied = {
        let mut db = state.conn()?;
        lifecycle::transition(
            &mut db,
            &id,
            event,
            reason.as_deref(),
            Utc::now().naive_utc(),
            state.config.start_grace(),
        )?
    };

    let booking = workflow::after_commit(&state, &applied).await?;
    Ok(Json(booking))
}

// POST /api/bookings/:id/approve
pub async fn approve(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(id): Path<String>,
    body: Option<Json<TransitionRequest>>,
) -> AppResult<Json<Booking>> {
    apply_event(state, principal, id, BookingEvent::Approve, body).await
}

// POST /api/bookings/:id/reject
pub async fn reject(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(id): Path<String>,
    body: Option<Json<TransitionRequest>>,
) -> AppResult<Json<Booking>> {
    apply_event(state, principal, id, BookingEvent::Reject, body).await
}

// POST /api/bookings/:id/cancel
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(id): Path<String>,
    body: Option<Json<TransitionRequest>>,
) -> AppResult<Json<Booking>> {
    apply_event(state, principal, id, BookingEvent::Cancel, body).await
}

// POST /api/bookings/:id/start
pub async fn start(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(id): Path<String>,
    body: Option<Json<TransitionRequest>>,
) -> AppResult<Json<Booking>> {
    apply_event(state, principal, id, BookingEvent::Start, body).await
}

// POST /api/bookings/:id/complete
pub async fn complete(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(id): Path<String>,
    body: Option<Json<TransitionRequest>>,
) -> AppResult<Json<Booking>> {
    apply_event(state, principal, id, BookingEvent::Complete, body).await
}

// POST /api/bookings/:id/payment/capture
pub async fn capture_payment(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let booking = load(&state, &id)?;
    if !matches!(principal.role, Role::Admin | Role::Office) || !principal.is_party_to(&booking) {
        return Err(AppError::Forbidden);
    }

    let result = match coordinator::capture(&state, &id).await? {
        CaptureResult::Captured { .. } => "captured",
        CaptureResult::AlreadyCaptured => "already_captured",
        CaptureResult::InFlight => "in_flight",
        CaptureResult::Reversed => "reversed",
        CaptureResult::Failed { reason } => return Err(AppError::PaymentCaptureFailed(reason)),
    };

    let booking = load(&state, &id)?;
    Ok(Json(json!({"result": result, "booking": booking})))
}
