//! Filesystem endpoints: backup targets and read-permission checks.

use super::error::ApiError;
use super::AppState;
use crate::fs::{PermissionCheck, Volume};
use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize)]
pub struct PermissionQuery {
    pub path: PathBuf,
}

/// GET /volumes - Candidate backup targets
pub async fn list_volumes(State(state): State<AppState>) -> Result<Json<Vec<Volume>>, ApiError> {
    Ok(Json(state.engine.list_volumes().await?))
}

/// GET /fs/permission?path= - Whether the daemon can read a path
pub async fn check_permission(
    State(state): State<AppState>,
    Query(query): Query<PermissionQuery>,
) -> Json<PermissionCheck> {
    Json(state.engine.check_permission(&query.path))
}
