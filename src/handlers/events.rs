use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event, Sse};
use serde::Deserialize;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};
use tokio_stream::{Stream, StreamExt};

use crate::db::queries;
use crate::errors::{AppError, AppResult};
use crate::models::LifecycleEvent;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct SseQuery {
    pub token: Option<String>,
    pub last_id: Option<i64>,
}

fn to_sse(event: &LifecycleEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_default();
    Event::default()
        .id(event.id.to_string())
        .event("booking_transition")
        .data(data)
}

// GET /api/events
pub async fn events_stream(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SseQuery>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    // EventSource can't set headers
    let token = query.token.as_deref().unwrap_or("");
    if token.is_empty() || token != state.config.admin_token {
        return Err(AppError::Unauthorized);
    }

    // subscribe before reading the backlog so nothing falls in between
    let rx = state.events_tx.subscribe();
    let last_id = query.last_id.unwrap_or(0);
    let backlog = {
        let db = state.conn()?;
        queries::get_lifecycle_events_since(&db, last_id)?
    };
    let high_water = backlog.last().map(|e| e.id).unwrap_or(last_id);

    let catchup = tokio_stream::iter(backlog.into_iter().map(|event| Ok::<_, Infallible>(to_sse(&event))));

    let live = BroadcastStream::new(rx).filter_map(move |result| match result {
        Ok(event) if event.id > high_water => Some(Ok(to_sse(&event))),
        Ok(_) => None,
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::warn!(skipped, "event stream subscriber lagged");
            None
        }
    });

    let keepalive = IntervalStream::new(tokio::time::interval(Duration::from_secs(30)))
        .map(|_| Ok(Event::default().comment("keepalive")));

    Ok(Sse::new(catchup.chain(live).merge(keepalive)))
}
