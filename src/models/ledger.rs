use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Amount owed to the therapist (and office commission) for a completed booking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Payout {
    pub booking_id: String,
    pub therapist_id: String,
    pub office_id: Option<String>,
    pub gross_amount: i64,
    pub commission: i64,
    pub therapist_amount: i64,
}

impl Payout {
    pub fn accrue(
        booking_id: &str,
        therapist_id: &str,
        office_id: Option<&str>,
        gross_amount: i64,
        commission_percent: i64,
    ) -> Self {
        let commission = match office_id {
            Some(_) => gross_amount * commission_percent / 100,
            None => 0,
        };
        Self {
            booking_id: booking_id.to_string(),
            therapist_id: therapist_id.to_string(),
            office_id: office_id.map(str::to_string),
            gross_amount,
            commission,
            therapist_amount: gross_amount - commission,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationKind {
    CaptureFailed,
    RefundFailed,
    ReleaseFailed,
    /// The gateway reported a capture for a booking that cannot hold one.
    UnmatchedCapture,
}

impl ReconciliationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconciliationKind::CaptureFailed => "capture_failed",
            ReconciliationKind::RefundFailed => "refund_failed",
            ReconciliationKind::ReleaseFailed => "release_failed",
            ReconciliationKind::UnmatchedCapture => "unmatched_capture",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "capture_failed" => Some(ReconciliationKind::CaptureFailed),
            "refund_failed" => Some(ReconciliationKind::RefundFailed),
            "release_failed" => Some(ReconciliationKind::ReleaseFailed),
            "unmatched_capture" => Some(ReconciliationKind::UnmatchedCapture),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationItem {
    pub id: i64,
    pub booking_id: String,
    pub kind: ReconciliationKind,
    pub reason: String,
    pub created_at: NaiveDateTime,
}
