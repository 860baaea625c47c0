use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};

use super::auth::check_admin;
use crate::db::queries;
use crate::errors::{AppError, AppResult};
use crate::models::{ReconciliationItem, Site, Therapist, User};
use crate::services::workflow;
use crate::state::AppState;

/// The path id wins; a body naming a different id is rejected.
fn bind_id(path_id: &str, body_id: &mut String) -> AppResult<()> {
    if !body_id.is_empty() && body_id != path_id {
        return Err(AppError::BadRequest(format!("body id {body_id} does not match path id {path_id}")));
    }
    *body_id = path_id.to_string();
    Ok(())
}

// PUT /api/admin/therapists/:id
pub async fn upsert_therapist(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(mut therapist): Json<Therapist>,
) -> AppResult<Json<Therapist>> {
    check_admin(&headers, &state.config.admin_token)?;
    bind_id(&id, &mut therapist.id)?;
    if therapist.hourly_rate < 0 {
        return Err(AppError::BadRequest("hourly_rate cannot be negative".to_string()));
    }
    if !(0.0..=5.0).contains(&therapist.rating) {
        return Err(AppError::BadRequest("rating must be between 0 and 5".to_string()));
    }

    {
        let db = state.conn()?;
        queries::upsert_therapist(&db, &therapist)?;
    }
    tracing::info!(therapist_id = %therapist.id, "therapist profile saved");
    Ok(Json(therapist))
}

// PUT /api/admin/users/:id
pub async fn upsert_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(mut user): Json<User>,
) -> AppResult<Json<User>> {
    check_admin(&headers, &state.config.admin_token)?;
    bind_id(&id, &mut user.id)?;
    {
        let db = state.conn()?;
        queries::upsert_user(&db, &user)?;
    }
    Ok(Json(user))
}

// PUT /api/admin/sites/:id
pub async fn upsert_site(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(mut site): Json<Site>,
) -> AppResult<Json<Site>> {
    check_admin(&headers, &state.config.admin_token)?;
    bind_id(&id, &mut site.id)?;
    {
        let db = state.conn()?;
        queries::upsert_site(&db, &site)?;
    }
    Ok(Json(site))
}

// GET /api/admin/reconciliation
pub async fn list_reconciliation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> AppResult<Json<Vec<ReconciliationItem>>> {
    check_admin(&headers, &state.config.admin_token)?;
    let items = {
        let db = state.conn()?;
        queries::list_open_reconciliation(&db)?
    };
    Ok(Json(items))
}

// POST /api/admin/expire-pending
pub async fn expire_pending(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    check_admin(&headers, &state.config.admin_token)?;
    let expired = workflow::expire_pending(&state).await?;
    Ok(Json(json!({"expired": expired})))
}
