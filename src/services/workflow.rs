use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::errors::AppResult;
use crate::models::Booking;
use crate::services::lifecycle::{self, Transition};
use crate::services::notify::dispatcher;
use crate::services::payment::coordinator;
use crate::services::events;
use crate::state::AppState;

/// Side effects of a committed transition, in order: event fan-out, payment,
/// then mail in the background. Call only after the database lock is released.
///
/// Mail follows the status this transition committed, even if a concurrent
/// transition has moved the booking on by the time payment returns.
pub async fn after_commit(state: &Arc<AppState>, transition: &Transition) -> AppResult<Booking> {
    events::publish(state, &transition.event);
    let booking = coordinator::on_transition(state, &transition.booking).await?;
    dispatcher::spawn_notify(Arc::clone(state), booking.clone(), transition.booking.status);
    Ok(booking)
}

/// Runs [`after_commit`] for each transition, logging failures instead of
/// stopping. Returns how many finished.
pub async fn after_commit_each(state: &Arc<AppState>, transitions: &[Transition]) -> usize {
    let mut finished = 0;
    for transition in transitions {
        match after_commit(state, transition).await {
            Ok(_) => finished += 1,
            Err(e) => tracing::error!(
                error = %e,
                booking_id = %transition.booking.id,
                status = %transition.booking.status,
                "post-commit follow-up failed"
            ),
        }
    }
    finished
}

/// Cancels PENDING bookings older than the configured threshold.
pub async fn expire_pending(state: &Arc<AppState>) -> AppResult<usize> {
    let Some(minutes) = state.config.pending_expiry_minutes else {
        return Ok(0);
    };
    let expired = {
        let mut db = state.conn()?;
        lifecycle::expire_stale_pending(&mut db, Utc::now().naive_utc(), Duration::minutes(minutes))?
    };

    after_commit_each(state, &expired).await;
    Ok(expired.len())
}
