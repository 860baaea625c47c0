use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::booking::{BookingEvent, BookingStatus};

/// A committed lifecycle transition, as recorded and broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub id: i64,
    pub booking_id: String,
    pub from: Option<BookingStatus>,
    pub to: BookingStatus,
    /// `create` for the initial insert, otherwise the triggering event.
    pub event: String,
    pub created_at: NaiveDateTime,
}

impl LifecycleEvent {
    pub fn event_name(event: Option<BookingEvent>) -> &'static str {
        event.map(|e| e.as_str()).unwrap_or("create")
    }
}
