use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::NaiveDateTime;

use crate::models::{BookingEvent, BookingStatus};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("therapist {therapist_id} already has a booking overlapping {start}..{end}")]
    SlotConflict {
        therapist_id: String,
        start: NaiveDateTime,
        end: NaiveDateTime,
    },

    #[error("cannot {event} a booking in state {current}")]
    InvalidTransition {
        current: BookingStatus,
        event: BookingEvent,
        allowed: Vec<BookingStatus>,
    },

    #[error("requested time is outside the therapist's availability")]
    OutsideAvailability,

    #[error("booking cannot be started before {earliest}")]
    StartTooEarly { earliest: NaiveDateTime },

    #[error("payment capture failed: {0}")]
    PaymentCaptureFailed(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::SlotConflict { .. } | AppError::InvalidTransition { .. } => StatusCode::CONFLICT,
            AppError::OutsideAvailability | AppError::StartTooEarly { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            AppError::PaymentCaptureFailed(_) => StatusCode::BAD_GATEWAY,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            AppError::Database(_) | AppError::Internal(_) => "internal",
            AppError::SlotConflict { .. } => "slot_conflict",
            AppError::InvalidTransition { .. } => "invalid_transition",
            AppError::OutsideAvailability => "outside_availability",
            AppError::StartTooEarly { .. } => "start_too_early",
            AppError::PaymentCaptureFailed(_) => "payment_capture_failed",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::Unauthorized => "unauthorized",
            AppError::Forbidden => "forbidden",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let mut body = serde_json::json!({
            "error": self.to_string(),
            "kind": self.kind(),
        });
        if let AppError::InvalidTransition { current, event, allowed } = &self {
            body["current"] = serde_json::json!(current);
            body["event"] = serde_json::json!(event);
            body["allowed"] = serde_json::json!(allowed);
        }

        (status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
