use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use super::auth::{Principal, Role};
use crate::db::queries;
use crate::errors::{AppError, AppResult};
use crate::models::{Therapist, TherapistAvailability};
use crate::services::approval;
use crate::state::AppState;

fn load_therapist(state: &AppState, id: &str) -> AppResult<Therapist> {
    let db = state.conn()?;
    queries::get_therapist(&db, id)?.ok_or_else(|| AppError::NotFound(format!("therapist {id}")))
}

/// The therapist, their office and admins manage a therapist's settings.
fn check_manager(principal: &Principal, therapist: &Therapist) -> AppResult<()> {
    let allowed = match principal.role {
        Role::Admin => true,
        Role::Therapist => principal.id == therapist.id,
        Role::Office => therapist.office_id.as_deref() == Some(principal.id.as_str()),
        Role::User | Role::Host => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(AppError::Forbidden)
    }
}

// GET /api/therapists/:id/availability
pub async fn get_availability(
    State(state): State<Arc<AppState>>,
    _principal: Principal,
    Path(id): Path<String>,
) -> AppResult<Json<TherapistAvailability>> {
    let availability = {
        let db = state.conn()?;
        queries::get_availability(&db, &id)?
    };
    availability
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("availability for therapist {id}")))
}

// PUT /api/therapists/:id/availability
pub async fn put_availability(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(id): Path<String>,
    Json(availability): Json<TherapistAvailability>,
) -> AppResult<Json<TherapistAvailability>> {
    let therapist = load_therapist(&state, &id)?;
    check_manager(&principal, &therapist)?;
    availability
        .validate()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    {
        let db = state.conn()?;
        queries::save_availability(&db, &id, &availability)?;
    }
    tracing::info!(therapist_id = %id, windows = availability.windows.len(), "availability replaced");
    Ok(Json(availability))
}

#[derive(Serialize, Deserialize)]
pub struct AutoApproval {
    pub enabled: bool,
}

// GET /api/therapists/:id/auto-approval
pub async fn get_auto_approval(
    State(state): State<Arc<AppState>>,
    _principal: Principal,
    Path(id): Path<String>,
) -> AppResult<Json<AutoApproval>> {
    let enabled = {
        let db = state.conn()?;
        approval::should_auto_confirm(&db, &id)?
    };
    Ok(Json(AutoApproval { enabled }))
}

// PUT /api/therapists/:id/auto-approval
pub async fn put_auto_approval(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(id): Path<String>,
    Json(body): Json<AutoApproval>,
) -> AppResult<Json<AutoApproval>> {
    let therapist = load_therapist(&state, &id)?;
    check_manager(&principal, &therapist)?;
    {
        let db = state.conn()?;
        approval::set_auto_confirm(&db, &id, body.enabled)?;
    }
    Ok(Json(body))
}
