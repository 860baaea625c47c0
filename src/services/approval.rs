use rusqlite::Connection;

use crate::db::queries;
use crate::errors::{AppError, AppResult};

/// Whether new bookings for this therapist skip PENDING. Read from storage on
/// every call so a toggle on another instance is seen immediately.
pub fn should_auto_confirm(conn: &Connection, therapist_id: &str) -> AppResult<bool> {
    queries::get_auto_approve(conn, therapist_id)?
        .ok_or_else(|| AppError::NotFound(format!("therapist {therapist_id}")))
}

pub fn set_auto_confirm(conn: &Connection, therapist_id: &str, enabled: bool) -> AppResult<()> {
    if !queries::set_auto_approve(conn, therapist_id, enabled)? {
        return Err(AppError::NotFound(format!("therapist {therapist_id}")));
    }
    tracing::info!(therapist_id, enabled, "auto-approval updated");
    Ok(())
}
