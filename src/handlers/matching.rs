use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::auth::Principal;
use crate::errors::AppResult;
use crate::models::{BookingMode, MatchCandidate, MatchRequest};
use crate::services::{geocoding, matching};
use crate::state::AppState;

#[derive(Serialize)]
pub struct MatchResponse {
    pub candidates: Vec<MatchCandidate>,
    /// Nothing matched; the client should relax date, area, budget or rating.
    pub broaden_criteria: bool,
}

// POST /api/match
pub async fn find_matches(
    State(state): State<Arc<AppState>>,
    _principal: Principal,
    Json(request): Json<MatchRequest>,
) -> AppResult<Json<MatchResponse>> {
    let origin = match request.mode {
        BookingMode::Mobile => {
            geocoding::resolve_origin(
                state.geocoder.as_ref(),
                request.origin,
                request.address.as_deref(),
            )
            .await
        }
        BookingMode::Onsite => request.origin,
    };

    let candidates = {
        let db = state.conn()?;
        matching::find_candidates(&db, &request, origin, state.config.match_limit)?
    };

    tracing::debug!(count = candidates.len(), mode = ?request.mode, "match request served");
    Ok(Json(MatchResponse {
        broaden_criteria: candidates.is_empty(),
        candidates,
    }))
}
