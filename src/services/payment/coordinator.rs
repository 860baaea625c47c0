//! Bridges committed booking transitions to gateway calls.
//!
//! Nothing here runs under the database lock while the gateway is being
//! called: state is read, the lock is dropped, the gateway answers, and the
//! result is written back with a conditional update.

use chrono::{Duration, NaiveDateTime, Utc};

use super::{CaptureOutcome, RefundOutcome};
use crate::db::queries::{self, PaymentUpdate};
use crate::errors::{AppError, AppResult};
use crate::models::{Booking, BookingStatus, PaymentStatus, Payout, ReconciliationKind};
use crate::state::AppState;

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureResult {
    Captured { transaction_id: String },
    AlreadyCaptured,
    /// Another request is already capturing this booking.
    InFlight,
    /// Captured after the booking was cancelled; the charge was refunded again.
    Reversed,
    Failed { reason: String },
}

/// Marks a payment operation as in flight for as long as it lives.
struct InFlight<'a> {
    state: &'a AppState,
    key: String,
}

impl<'a> InFlight<'a> {
    fn acquire(state: &'a AppState, key: String) -> Option<Self> {
        let mut set = state.payments_in_flight.lock().ok()?;
        if !set.insert(key.clone()) {
            return None;
        }
        Some(Self { state, key })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.state.payments_in_flight.lock() {
            set.remove(&self.key);
        }
    }
}

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

fn load(state: &AppState, booking_id: &str) -> AppResult<Booking> {
    let db = state.conn()?;
    queries::get_booking_by_id(&db, booking_id)?.ok_or_else(|| AppError::NotFound(format!("booking {booking_id}")))
}

fn flag_for_reconciliation(state: &AppState, booking: &Booking, kind: ReconciliationKind, reason: &str) {
    tracing::error!(
        booking_id = %booking.id,
        kind = kind.as_str(),
        reason,
        "payment needs manual reconciliation"
    );
    let result = state
        .conn()
        .map_err(anyhow::Error::from)
        .and_then(|db| queries::enqueue_reconciliation(&db, &booking.id, kind, reason));
    if let Err(e) = result {
        tracing::error!(error = %e, booking_id = %booking.id, "failed to enqueue reconciliation item");
    }
}

/// Runs the payment side of a committed transition and returns the booking as
/// stored afterwards. Gateway failures are recorded, never returned.
pub async fn on_transition(state: &AppState, booking: &Booking) -> AppResult<Booking> {
    let result = match booking.status {
        BookingStatus::Confirmed => capture(state, &booking.id).await.map(|_| ()),
        BookingStatus::Cancelled => match booking.payment_status {
            PaymentStatus::Captured => refund(state, &booking.id).await,
            PaymentStatus::Authorized => release(state, &booking.id).await,
            _ => Ok(()),
        },
        BookingStatus::Completed => settle_completion(state, &booking.id).await,
        _ => Ok(()),
    };
    // the transition already committed; a concurrent change may have made the
    // follow-up moot
    if let Err(e) = result {
        tracing::warn!(error = %e, booking_id = %booking.id, "payment follow-up skipped");
    }
    load(state, &booking.id)
}

/// Captures the booking's total. A booking already CAPTURED is left alone, so
/// retries never charge twice.
pub async fn capture(state: &AppState, booking_id: &str) -> AppResult<CaptureResult> {
    let booking = load(state, booking_id)?;
    match booking.payment_status {
        PaymentStatus::Captured => return Ok(CaptureResult::AlreadyCaptured),
        PaymentStatus::Refunded => {
            return Err(AppError::BadRequest(format!("booking {booking_id} was already refunded")));
        }
        _ => {}
    }
    if !booking.status.may_hold_capture() {
        return Err(AppError::BadRequest(format!(
            "booking {booking_id} in state {} cannot be captured",
            booking.status
        )));
    }

    let Some(_guard) = InFlight::acquire(state, format!("capture:{booking_id}")) else {
        return Ok(CaptureResult::InFlight);
    };

    // each queued capture failure opens a new attempt at the gateway
    let attempt = {
        let db = state.conn()?;
        queries::count_reconciliation(&db, booking_id, ReconciliationKind::CaptureFailed)?
    };
    let amount = booking.total_price();
    let outcome = state
        .payments
        .capture(&booking.id, attempt, amount, booking.authorization_id.as_deref())
        .await;

    let reason = match outcome {
        Ok(CaptureOutcome::Captured { transaction_id }) => {
            return record_capture(state, &booking, &transaction_id, amount).await;
        }
        Ok(CaptureOutcome::Declined { reason }) => reason,
        Err(e) => e.to_string(),
    };

    {
        let db = state.conn()?;
        let current = queries::get_booking_by_id(&db, booking_id)?
            .map(|b| b.payment_status)
            .unwrap_or(booking.payment_status);
        if current != PaymentStatus::Captured {
            queries::update_payment(
                &db,
                booking_id,
                current,
                &PaymentUpdate {
                    status: PaymentStatus::Failed,
                    transaction_id: None,
                    refunded_amount: None,
                },
                &now(),
            )?;
        }
    }
    flag_for_reconciliation(state, &booking, ReconciliationKind::CaptureFailed, &reason);
    Ok(CaptureResult::Failed { reason })
}

async fn record_capture(
    state: &AppState,
    booking: &Booking,
    transaction_id: &str,
    amount: i64,
) -> AppResult<CaptureResult> {
    let (captured, current) = {
        let db = state.conn()?;
        let captured = queries::mark_captured(&db, &booking.id, transaction_id, &now())?;
        if captured {
            queries::resolve_reconciliation(&db, &booking.id, ReconciliationKind::CaptureFailed)?;
        }
        (captured, queries::get_booking_by_id(&db, &booking.id)?)
    };

    if captured {
        tracing::info!(booking_id = %booking.id, transaction_id, amount, "payment captured");
        return Ok(CaptureResult::Captured {
            transaction_id: transaction_id.to_string(),
        });
    }

    let Some(current) = current else {
        return Err(AppError::NotFound(format!("booking {}", booking.id)));
    };
    if current.payment_status == PaymentStatus::Captured {
        return Ok(CaptureResult::AlreadyCaptured);
    }
    if current.status != BookingStatus::Cancelled {
        let reason = format!("capture {transaction_id} reported for booking in state {}", current.status);
        flag_for_reconciliation(state, &current, ReconciliationKind::UnmatchedCapture, &reason);
        return Ok(CaptureResult::Failed { reason });
    }

    // cancelled while the gateway was busy: hand the money back
    tracing::warn!(booking_id = %booking.id, status = %current.status, "capture landed after cancellation, refunding");
    match state.payments.refund(transaction_id, amount).await {
        Ok(RefundOutcome::Refunded) => {
            let db = state.conn()?;
            queries::update_payment(
                &db,
                &booking.id,
                current.payment_status,
                &PaymentUpdate {
                    status: PaymentStatus::Refunded,
                    transaction_id: Some(transaction_id),
                    refunded_amount: Some(amount),
                },
                &now(),
            )?;
            Ok(CaptureResult::Reversed)
        }
        Ok(RefundOutcome::Declined { reason }) => {
            fail_refund(state, &current, Some(transaction_id), &reason)?;
            Ok(CaptureResult::Failed { reason })
        }
        Err(e) => {
            let reason = e.to_string();
            fail_refund(state, &current, Some(transaction_id), &reason)?;
            Ok(CaptureResult::Failed { reason })
        }
    }
}

fn fail_refund(state: &AppState, booking: &Booking, transaction_id: Option<&str>, reason: &str) -> AppResult<()> {
    {
        let db = state.conn()?;
        queries::update_payment(
            &db,
            &booking.id,
            booking.payment_status,
            &PaymentUpdate {
                status: PaymentStatus::Failed,
                transaction_id,
                refunded_amount: None,
            },
            &now(),
        )?;
    }
    flag_for_reconciliation(state, booking, ReconciliationKind::RefundFailed, reason);
    Ok(())
}

/// Amount returned on cancellation: the full total, less the late fee when
/// cancelled inside the cutoff before the scheduled start.
pub fn refund_amount(
    booking: &Booking,
    cancelled_at: NaiveDateTime,
    cutoff_hours: i64,
    late_fee_percent: i64,
) -> i64 {
    let total = booking.total_price();
    if cutoff_hours <= 0 || late_fee_percent <= 0 {
        return total;
    }
    let cutoff = booking.scheduled_start - Duration::hours(cutoff_hours);
    if cancelled_at < cutoff {
        total
    } else {
        total - total * late_fee_percent / 100
    }
}

pub async fn refund(state: &AppState, booking_id: &str) -> AppResult<()> {
    let booking = load(state, booking_id)?;
    if booking.payment_status != PaymentStatus::Captured {
        return Ok(());
    }
    let Some(transaction_id) = booking.transaction_id.clone() else {
        fail_refund(state, &booking, None, "captured booking has no transaction id")?;
        return Ok(());
    };
    let Some(_guard) = InFlight::acquire(state, format!("refund:{booking_id}")) else {
        return Ok(());
    };

    let amount = refund_amount(
        &booking,
        booking.cancelled_at.unwrap_or_else(now),
        state.config.refund_cutoff_hours,
        state.config.late_cancel_fee_percent,
    );

    match state.payments.refund(&transaction_id, amount).await {
        Ok(RefundOutcome::Refunded) => {
            let db = state.conn()?;
            queries::update_payment(
                &db,
                booking_id,
                PaymentStatus::Captured,
                &PaymentUpdate {
                    status: PaymentStatus::Refunded,
                    transaction_id: None,
                    refunded_amount: Some(amount),
                },
                &now(),
            )?;
            tracing::info!(booking_id, amount, "payment refunded");
        }
        Ok(RefundOutcome::Declined { reason }) => fail_refund(state, &booking, None, &reason)?,
        Err(e) => fail_refund(state, &booking, None, &e.to_string())?,
    }
    Ok(())
}

/// Drops the authorization hold of a booking cancelled before capture.
pub async fn release(state: &AppState, booking_id: &str) -> AppResult<()> {
    let booking = load(state, booking_id)?;
    if booking.payment_status != PaymentStatus::Authorized {
        return Ok(());
    }
    let Some(authorization_id) = booking.authorization_id.clone() else {
        return Ok(());
    };

    match state.payments.release(&authorization_id).await {
        Ok(()) => {
            let db = state.conn()?;
            queries::update_payment(
                &db,
                booking_id,
                PaymentStatus::Authorized,
                &PaymentUpdate {
                    status: PaymentStatus::Unpaid,
                    transaction_id: None,
                    refunded_amount: None,
                },
                &now(),
            )?;
            tracing::info!(booking_id, "authorization hold released");
        }
        Err(e) => flag_for_reconciliation(state, &booking, ReconciliationKind::ReleaseFailed, &e.to_string()),
    }
    Ok(())
}

/// On completion: make sure the money was captured, then accrue the payout.
pub async fn settle_completion(state: &AppState, booking_id: &str) -> AppResult<()> {
    let booking = load(state, booking_id)?;
    if booking.payment_status != PaymentStatus::Captured {
        capture(state, booking_id).await?;
    }

    let db = state.conn()?;
    let Some(booking) = queries::get_booking_by_id(&db, booking_id)? else {
        return Err(AppError::NotFound(format!("booking {booking_id}")));
    };
    if booking.payment_status != PaymentStatus::Captured {
        tracing::warn!(booking_id, "completed without captured payment, payout deferred");
        return Ok(());
    }

    let payout = Payout::accrue(
        &booking.id,
        &booking.therapist_id,
        booking.office_id.as_deref(),
        booking.total_price(),
        state.config.office_commission_percent,
    );
    if queries::insert_payout(&db, &payout)? {
        tracing::info!(
            booking_id,
            therapist_amount = payout.therapist_amount,
            commission = payout.commission,
            "payout accrued"
        );
    }
    Ok(())
}

/// Asynchronous capture outcome reported by the gateway's webhook.
#[derive(Debug, Clone)]
pub enum GatewayNotice {
    CaptureSucceeded { booking_id: String, transaction_id: String },
    CaptureFailed { booking_id: String, reason: String },
}

pub async fn apply_gateway_notice(state: &AppState, notice: GatewayNotice) -> AppResult<()> {
    match notice {
        GatewayNotice::CaptureSucceeded { booking_id, transaction_id } => {
            let booking = load(state, &booking_id)?;
            if booking.payment_status == PaymentStatus::Captured {
                return Ok(());
            }
            record_capture(state, &booking, &transaction_id, booking.total_price()).await?;
        }
        GatewayNotice::CaptureFailed { booking_id, reason } => {
            let booking = load(state, &booking_id)?;
            // notices arrive out of order; a later success or refund wins
            if matches!(
                booking.payment_status,
                PaymentStatus::Captured | PaymentStatus::Refunded | PaymentStatus::Failed
            ) {
                tracing::info!(booking_id = %booking_id, payment_status = booking.payment_status.as_str(), "stale capture failure ignored");
                return Ok(());
            }
            let updated = {
                let db = state.conn()?;
                queries::update_payment(
                    &db,
                    &booking_id,
                    booking.payment_status,
                    &PaymentUpdate {
                        status: PaymentStatus::Failed,
                        transaction_id: None,
                        refunded_amount: None,
                    },
                    &now(),
                )?
            };
            if !updated {
                tracing::info!(booking_id = %booking_id, "payment changed while applying capture failure, ignored");
                return Ok(());
            }
            flag_for_reconciliation(state, &booking, ReconciliationKind::CaptureFailed, &reason);
        }
    }
    Ok(())
}
