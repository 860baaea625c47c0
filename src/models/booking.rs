use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    pub name: String,
    pub price: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    pub id: String,
    pub user_id: String,
    pub therapist_id: String,
    pub site_id: Option<String>,
    pub office_id: Option<String>,
    pub scheduled_start: NaiveDateTime,
    pub duration_minutes: i32,
    pub mode: BookingMode,
    pub address: Option<String>,
    pub base_price: i64,
    pub line_items: Vec<LineItem>,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub authorization_id: Option<String>,
    pub transaction_id: Option<String>,
    pub refunded_amount: Option<i64>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub started_at: Option<NaiveDateTime>,
    pub completed_at: Option<NaiveDateTime>,
    pub cancelled_at: Option<NaiveDateTime>,
    pub cancellation_reason: Option<String>,
}

impl Booking {
    pub fn scheduled_end(&self) -> NaiveDateTime {
        self.scheduled_start + Duration::minutes(self.duration_minutes as i64)
    }

    /// Base price plus every line item, in yen. Creation rejects bookings
    /// whose total does not fit, so this only saturates on rows written
    /// around [`Booking::checked_total`].
    pub fn total_price(&self) -> i64 {
        self.line_items
            .iter()
            .fold(self.base_price, |acc, i| acc.saturating_add(i.price))
    }

    /// `None` when the sum overflows.
    pub fn checked_total(base_price: i64, line_items: &[LineItem]) -> Option<i64> {
        line_items
            .iter()
            .try_fold(base_price, |acc, i| acc.checked_add(i.price))
    }

    pub fn overlaps(&self, start: &NaiveDateTime, end: &NaiveDateTime) -> bool {
        self.scheduled_start < *end && self.scheduled_end() > *start
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::InProgress => "in_progress",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(BookingStatus::Pending),
            "confirmed" => Some(BookingStatus::Confirmed),
            "in_progress" => Some(BookingStatus::InProgress),
            "completed" => Some(BookingStatus::Completed),
            "cancelled" => Some(BookingStatus::Cancelled),
            _ => None,
        }
    }

    /// The status an event leads to from here, if the transition table permits it.
    pub fn next(&self, event: BookingEvent) -> Option<BookingStatus> {
        match (self, event) {
            (BookingStatus::Pending, BookingEvent::Approve) => Some(BookingStatus::Confirmed),
            (BookingStatus::Pending, BookingEvent::Reject) => Some(BookingStatus::Cancelled),
            (BookingStatus::Pending, BookingEvent::Cancel) => Some(BookingStatus::Cancelled),
            (BookingStatus::Confirmed, BookingEvent::Cancel) => Some(BookingStatus::Cancelled),
            (BookingStatus::Confirmed, BookingEvent::Start) => Some(BookingStatus::InProgress),
            (BookingStatus::InProgress, BookingEvent::Complete) => Some(BookingStatus::Completed),
            _ => None,
        }
    }

    pub fn allowed_next(&self) -> Vec<BookingStatus> {
        let mut next: Vec<BookingStatus> = BookingEvent::ALL
            .iter()
            .filter_map(|e| self.next(*e))
            .collect();
        next.dedup();
        next
    }

    /// Statuses under which a captured charge may be held.
    pub fn may_hold_capture(&self) -> bool {
        matches!(
            self,
            BookingStatus::Confirmed | BookingStatus::InProgress | BookingStatus::Completed
        )
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_str().to_uppercase())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Unpaid,
    Authorized,
    Captured,
    Refunded,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Unpaid => "unpaid",
            PaymentStatus::Authorized => "authorized",
            PaymentStatus::Captured => "captured",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "authorized" => PaymentStatus::Authorized,
            "captured" => PaymentStatus::Captured,
            "refunded" => PaymentStatus::Refunded,
            "failed" => PaymentStatus::Failed,
            _ => PaymentStatus::Unpaid,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingMode {
    Onsite,
    Mobile,
}

impl BookingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingMode::Onsite => "onsite",
            BookingMode::Mobile => "mobile",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "mobile" => BookingMode::Mobile,
            _ => BookingMode::Onsite,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BookingEvent {
    Approve,
    Reject,
    Cancel,
    Start,
    Complete,
}

impl BookingEvent {
    pub const ALL: [BookingEvent; 5] = [
        BookingEvent::Approve,
        BookingEvent::Reject,
        BookingEvent::Cancel,
        BookingEvent::Start,
        BookingEvent::Complete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingEvent::Approve => "approve",
            BookingEvent::Reject => "reject",
            BookingEvent::Cancel => "cancel",
            BookingEvent::Start => "start",
            BookingEvent::Complete => "complete",
        }
    }

    pub fn requires_reason(&self) -> bool {
        matches!(self, BookingEvent::Reject | BookingEvent::Cancel)
    }
}

impl std::fmt::Display for BookingEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
