use std::sync::Arc;

use serde_json::json;

use super::TemplateKind;
use crate::db::queries;
use crate::models::{Booking, BookingStatus};
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    User,
    Therapist,
    Host,
}

const ALL_PARTIES: &[Party] = &[Party::User, Party::Therapist, Party::Host];
const USER_AND_THERAPIST: &[Party] = &[Party::User, Party::Therapist];

/// Template and audience for a booking that just entered `status`.
pub fn plan(status: BookingStatus) -> Option<(TemplateKind, &'static [Party])> {
    match status {
        BookingStatus::Confirmed => Some((TemplateKind::BookingConfirmed, ALL_PARTIES)),
        BookingStatus::Cancelled => Some((TemplateKind::BookingCancelled, ALL_PARTIES)),
        BookingStatus::Completed => Some((TemplateKind::BookingCompleted, USER_AND_THERAPIST)),
        BookingStatus::Pending | BookingStatus::InProgress => None,
    }
}

fn recipient(state: &AppState, booking: &Booking, party: Party) -> anyhow::Result<Option<String>> {
    let db = state
        .db
        .lock()
        .map_err(|_| anyhow::anyhow!("database mutex poisoned"))?;
    let email = match party {
        Party::User => queries::get_user(&db, &booking.user_id)?.map(|u| u.email),
        Party::Therapist => queries::get_therapist(&db, &booking.therapist_id)?.map(|t| t.email),
        Party::Host => match booking.site_id.as_deref() {
            Some(site_id) => queries::get_site(&db, site_id)?.map(|s| s.host_email),
            None => None,
        },
    };
    Ok(email)
}

/// Sends the lifecycle mail for a booking that just entered `status`. The
/// booking may already have moved on; it only fills in the mail. Failures are
/// logged and swallowed. Returns how many messages went out.
pub async fn notify(state: &AppState, booking: &Booking, status: BookingStatus) -> usize {
    let Some((template, parties)) = plan(status) else {
        return 0;
    };

    let context = json!({
        "booking_id": booking.id,
        "status": status,
        "scheduled_start": booking.scheduled_start,
        "duration_minutes": booking.duration_minutes,
        "mode": booking.mode,
        "total_price": booking.total_price(),
        "cancellation_reason": booking.cancellation_reason,
    });

    let mut sent = 0;
    for party in parties {
        let address = match recipient(state, booking, *party) {
            Ok(Some(address)) => address,
            Ok(None) => {
                if *party != Party::Host || booking.site_id.is_some() {
                    tracing::warn!(booking_id = %booking.id, party = ?party, "no contact address, skipping notification");
                }
                continue;
            }
            Err(e) => {
                tracing::warn!(error = %e, booking_id = %booking.id, party = ?party, "failed to look up recipient");
                continue;
            }
        };

        match state.notifier.send(template, &address, &context).await {
            Ok(()) => sent += 1,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    booking_id = %booking.id,
                    template = template.as_str(),
                    "notification failed"
                );
            }
        }
    }
    sent
}

/// Fire-and-forget variant used on the request path.
pub fn spawn_notify(state: Arc<AppState>, booking: Booking, status: BookingStatus) {
    tokio::spawn(async move {
        notify(&state, &booking, status).await;
    });
}
