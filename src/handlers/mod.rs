pub mod admin;
pub mod auth;
pub mod bookings;
pub mod events;
pub mod health;
pub mod matching;
pub mod therapists;
pub mod webhook;

use std::sync::Arc;

use axum::routing::{get, post, put};
use axum::Router;

use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/api/match", post(matching::find_matches))
        .route(
            "/api/bookings",
            post(bookings::create_booking).get(bookings::list_bookings),
        )
        .route("/api/bookings/:id", get(bookings::get_booking))
        .route("/api/bookings/:id/approve", post(bookings::approve))
        .route("/api/bookings/:id/reject", post(bookings::reject))
        .route("/api/bookings/:id/cancel", post(bookings::cancel))
        .route("/api/bookings/:id/start", post(bookings::start))
        .route("/api/bookings/:id/complete", post(bookings::complete))
        .route(
            "/api/bookings/:id/payment/capture",
            post(bookings::capture_payment),
        )
        .route(
            "/api/therapists/:id/availability",
            get(therapists::get_availability).put(therapists::put_availability),
        )
        .route(
            "/api/therapists/:id/auto-approval",
            get(therapists::get_auto_approval).put(therapists::put_auto_approval),
        )
        .route("/api/admin/therapists/:id", put(admin::upsert_therapist))
        .route("/api/admin/users/:id", put(admin::upsert_user))
        .route("/api/admin/sites/:id", put(admin::upsert_site))
        .route("/api/admin/reconciliation", get(admin::list_reconciliation))
        .route("/api/admin/expire-pending", post(admin::expire_pending))
        .route("/api/events", get(events::events_stream))
        .route("/webhook/payments", post(webhook::payment_webhook))
        .with_state(state)
}
