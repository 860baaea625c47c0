//! Booking lifecycle: creation and every status transition.
//!
//! All writes happen inside an `IMMEDIATE` transaction on the shared
//! connection, and each status change is a conditional update on the status
//! read in that same transaction. Payment and notification side effects are
//! the caller's job, after the transaction has committed.

use chrono::{Duration, NaiveDateTime};
use rusqlite::{Connection, TransactionBehavior};
use serde::Deserialize;

use crate::db::queries;
use crate::errors::{AppError, AppResult};
use crate::models::{
    Booking, BookingEvent, BookingMode, BookingStatus, Coordinates, LifecycleEvent, LineItem,
    PaymentStatus,
};
use crate::services::approval;

#[derive(Debug, Clone, Deserialize)]
pub struct NewBooking {
    pub user_id: String,
    pub therapist_id: String,
    #[serde(default)]
    pub site_id: Option<String>,
    pub scheduled_start: NaiveDateTime,
    pub duration_minutes: i32,
    pub mode: BookingMode,
    #[serde(default)]
    pub address: Option<String>,
    /// Resolved location of `address`; required for MOBILE.
    #[serde(default)]
    pub origin: Option<Coordinates>,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
    /// Card authorization obtained by the client before booking, if any.
    #[serde(default)]
    pub authorization_id: Option<String>,
}

/// Outcome of a committed write: the booking as stored afterwards, the
/// status it left, and the recorded event.
#[derive(Debug, Clone)]
pub struct Transition {
    pub from: Option<BookingStatus>,
    pub booking: Booking,
    pub event: LifecycleEvent,
}

pub fn create_booking(conn: &mut Connection, new: NewBooking, now: NaiveDateTime) -> AppResult<Transition> {
    if new.duration_minutes <= 0 {
        return Err(AppError::BadRequest("duration must be positive".to_string()));
    }
    if new.scheduled_start <= now {
        return Err(AppError::BadRequest("scheduled start is in the past".to_string()));
    }
    if new.line_items.iter().any(|i| i.price < 0) {
        return Err(AppError::BadRequest("line item prices cannot be negative".to_string()));
    }

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let therapist = queries::get_therapist(&tx, &new.therapist_id)?
        .ok_or_else(|| AppError::NotFound(format!("therapist {}", new.therapist_id)))?;

    // consulted once, before the conflict check; a conflict fails outright either way
    let auto_confirm = approval::should_auto_confirm(&tx, &therapist.id)?;

    let availability = queries::get_availability(&tx, &therapist.id)?.ok_or(AppError::OutsideAvailability)?;
    if !availability.covers(&new.scheduled_start, new.duration_minutes)
        || !availability.serves_mode(new.mode, &new.scheduled_start, new.duration_minutes)
    {
        return Err(AppError::OutsideAvailability);
    }

    let surcharge = match new.mode {
        BookingMode::Onsite => {
            let site_id = new
                .site_id
                .as_deref()
                .ok_or_else(|| AppError::BadRequest("site_id is required for ONSITE bookings".to_string()))?;
            if !therapist.serves_site(site_id) {
                return Err(AppError::OutsideAvailability);
            }
            0
        }
        BookingMode::Mobile => {
            if new.address.as_deref().map(str::trim).unwrap_or("").is_empty() {
                return Err(AppError::BadRequest("address is required for MOBILE bookings".to_string()));
            }
            let origin = new
                .origin
                .ok_or_else(|| AppError::BadRequest("address could not be located".to_string()))?;
            let base = therapist.base_location.ok_or(AppError::OutsideAvailability)?;
            let (_, mode) = availability
                .transport_modes
                .cheapest_viable(base.distance_km(&origin))
                .ok_or(AppError::OutsideAvailability)?;
            mode.fee
        }
    };

    let base_price = therapist
        .quote(new.duration_minutes)
        .and_then(|quote| quote.checked_add(surcharge))
        .filter(|base| Booking::checked_total(*base, &new.line_items).is_some())
        .ok_or_else(|| AppError::BadRequest("booking price is out of range".to_string()))?;

    let end = new.scheduled_start + Duration::minutes(new.duration_minutes as i64);
    if !queries::find_overlapping(&tx, &therapist.id, &new.scheduled_start, &end, None)?.is_empty() {
        tracing::info!(therapist_id = %therapist.id, start = %new.scheduled_start, "slot conflict on create");
        return Err(AppError::SlotConflict {
            therapist_id: therapist.id,
            start: new.scheduled_start,
            end,
        });
    }

    let status = if auto_confirm {
        BookingStatus::Confirmed
    } else {
        BookingStatus::Pending
    };
    let payment_status = if new.authorization_id.is_some() {
        PaymentStatus::Authorized
    } else {
        PaymentStatus::Unpaid
    };

    let booking = Booking {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: new.user_id,
        therapist_id: therapist.id.clone(),
        site_id: match new.mode {
            BookingMode::Onsite => new.site_id,
            BookingMode::Mobile => None,
        },
        office_id: therapist.office_id.clone(),
        scheduled_start: new.scheduled_start,
        duration_minutes: new.duration_minutes,
        mode: new.mode,
        address: new.address,
        base_price,
        line_items: new.line_items,
        status,
        payment_status,
        authorization_id: new.authorization_id,
        transaction_id: None,
        refunded_amount: None,
        created_at: now,
        updated_at: now,
        started_at: None,
        completed_at: None,
        cancelled_at: None,
        cancellation_reason: None,
    };

    queries::insert_booking(&tx, &booking)?;
    let event = queries::insert_lifecycle_event(&tx, &booking.id, None, status, LifecycleEvent::event_name(None), &now)?;
    tx.commit()?;

    tracing::info!(
        booking_id = %booking.id,
        therapist_id = %booking.therapist_id,
        status = %booking.status,
        auto_confirm,
        "booking created"
    );

    Ok(Transition {
        from: None,
        booking,
        event,
    })
}

/// Applies one event to a booking. Illegal events fail with
/// `InvalidTransition` and leave the booking untouched.
pub fn transition(
    conn: &mut Connection,
    booking_id: &str,
    event: BookingEvent,
    reason: Option<&str>,
    now: NaiveDateTime,
    start_grace: Duration,
) -> AppResult<Transition> {
    let reason = reason.map(str::trim).filter(|r| !r.is_empty());
    if event.requires_reason() && reason.is_none() {
        return Err(AppError::BadRequest(format!("a reason is required to {event}")));
    }

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let booking = queries::get_booking_by_id(&tx, booking_id)?
        .ok_or_else(|| AppError::NotFound(format!("booking {booking_id}")))?;
    let from = booking.status;
    let to = from.next(event).ok_or_else(|| invalid(from, event))?;

    match event {
        BookingEvent::Approve => {
            // a PENDING hold may have been overtaken by a booking confirmed elsewhere
            let end = booking.scheduled_end();
            let overlapping =
                queries::find_overlapping(&tx, &booking.therapist_id, &booking.scheduled_start, &end, Some(&booking.id))?;
            if !overlapping.is_empty() {
                return Err(AppError::SlotConflict {
                    therapist_id: booking.therapist_id,
                    start: booking.scheduled_start,
                    end,
                });
            }
        }
        BookingEvent::Start => {
            let earliest = booking.scheduled_start - start_grace;
            if now < earliest {
                return Err(AppError::StartTooEarly { earliest });
            }
        }
        _ => {}
    }

    let stored_reason = if to == BookingStatus::Cancelled { reason } else { None };
    if !queries::update_status(&tx, booking_id, from, to, &now, stored_reason)? {
        let current = queries::get_booking_by_id(&tx, booking_id)?
            .map(|b| b.status)
            .unwrap_or(from);
        return Err(invalid(current, event));
    }

    let event_row = queries::insert_lifecycle_event(&tx, booking_id, Some(from), to, event.as_str(), &now)?;
    let booking = queries::get_booking_by_id(&tx, booking_id)?
        .ok_or_else(|| AppError::NotFound(format!("booking {booking_id}")))?;
    tx.commit()?;

    Ok(Transition {
        from: Some(from),
        booking,
        event: event_row,
    })
}

fn invalid(current: BookingStatus, event: BookingEvent) -> AppError {
    tracing::warn!(current = %current, event = %event, "invalid transition attempted");
    AppError::InvalidTransition {
        current,
        event,
        allowed: current.allowed_next(),
    }
}

/// Cancels PENDING bookings created more than `max_age` ago. Bookings that
/// moved on concurrently are skipped.
pub fn expire_stale_pending(conn: &mut Connection, now: NaiveDateTime, max_age: Duration) -> AppResult<Vec<Transition>> {
    let stale = queries::list_stale_pending(conn, &(now - max_age))?;

    let mut expired = vec![];
    for id in stale {
        match transition(conn, &id, BookingEvent::Cancel, Some("expired"), now, Duration::zero()) {
            Ok(t) => expired.push(t),
            Err(AppError::InvalidTransition { .. }) => continue,
            Err(e) => return Err(e),
        }
    }

    if !expired.is_empty() {
        tracing::info!(count = expired.len(), "expired stale pending bookings");
    }
    Ok(expired)
}
