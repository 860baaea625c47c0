use crate::models::LifecycleEvent;
use crate::state::AppState;

/// Fans a committed lifecycle event out to SSE subscribers. The event row was
/// already written inside the transition's transaction.
pub fn publish(state: &AppState, event: &LifecycleEvent) {
    tracing::info!(
        booking_id = %event.booking_id,
        from = ?event.from,
        to = %event.to,
        event = %event.event,
        "booking transition committed"
    );
    // no receivers is fine
    let _ = state.events_tx.send(event.clone());
}
