//! Backup lifecycle endpoints.

use super::error::ApiError;
use super::AppState;
use crate::catalog::BackupSummary;
use crate::manifest::BackupManifest;
use crate::restore::{RestoreRequest, RestoreResult};
use crate::utils::errors::SuiteError;
use crate::verify::VerifyReport;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Deserialize)]
pub struct TargetQuery {
    pub target: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct StartBackupRequest {
    pub target: PathBuf,
    pub directories: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct StartBackupResponse {
    pub status: String,
    pub run_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelBackupRequest {
    #[serde(default)]
    pub target: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
pub struct CancelBackupResponse {
    pub status: String,
    pub cancelled: usize,
}

#[derive(Debug, Deserialize)]
pub struct VerifyBackupRequest {
    pub target: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct RestoreItemsRequest {
    pub target: PathBuf,
    #[serde(flatten)]
    pub restore: RestoreRequest,
}

#[derive(Debug, Deserialize)]
pub struct QuickRestoreRequest {
    pub target: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct ManualAppsResponse {
    pub apps: Vec<String>,
}

/// POST /backups - Start a backup in the background
pub async fn start_backup(
    State(state): State<AppState>,
    Json(req): Json<StartBackupRequest>,
) -> Result<(StatusCode, Json<StartBackupResponse>), ApiError> {
    if req.directories.is_empty() {
        return Err(SuiteError::InvalidInput("no directories given".to_string()).into());
    }
    tracing::info!(
        "Starting backup to {} for {:?}",
        req.target.display(),
        req.directories
    );

    let (run_id, handle) = state.engine.spawn_backup(&req.target, req.directories)?;
    let id = run_id.clone();
    tokio::spawn(async move {
        match handle.await {
            Ok(Ok(manifest)) => tracing::info!("Backup {} finished as {}", id, manifest.timestamp),
            Ok(Err(e)) => tracing::warn!("Backup {} ended: {}", id, e),
            Err(e) => tracing::error!("Backup task {} panicked: {}", id, e),
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(StartBackupResponse {
            status: "started".to_string(),
            run_id,
        }),
    ))
}

/// POST /backups/cancel - Cancel the backup on a target, or all of them
pub async fn cancel_backup(
    State(state): State<AppState>,
    Json(req): Json<CancelBackupRequest>,
) -> Json<CancelBackupResponse> {
    let cancelled = state.engine.cancel_backup(req.target.as_deref());
    tracing::info!("Cancel requested: {} run(s) signalled", cancelled);

    Json(CancelBackupResponse {
        status: if cancelled > 0 { "cancelling" } else { "idle" }.to_string(),
        cancelled,
    })
}

/// GET /backups?target= - Backups on a target, newest first
pub async fn list_backups(
    State(state): State<AppState>,
    Query(query): Query<TargetQuery>,
) -> Result<Json<Vec<BackupSummary>>, ApiError> {
    Ok(Json(state.engine.list_backups(&query.target).await?))
}

/// GET /backups/{timestamp}?target=
pub async fn get_backup(
    State(state): State<AppState>,
    Path(timestamp): Path<String>,
    Query(query): Query<TargetQuery>,
) -> Result<Json<BackupManifest>, ApiError> {
    Ok(Json(state.engine.get_backup_details(&query.target, &timestamp).await?))
}

/// DELETE /backups/{timestamp}?target=
pub async fn delete_backup(
    State(state): State<AppState>,
    Path(timestamp): Path<String>,
    Query(query): Query<TargetQuery>,
) -> Result<StatusCode, ApiError> {
    state.engine.delete_backup(&query.target, &timestamp).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /backups/{timestamp}/verify
pub async fn verify_backup(
    State(state): State<AppState>,
    Path(timestamp): Path<String>,
    Json(req): Json<VerifyBackupRequest>,
) -> Result<Json<VerifyReport>, ApiError> {
    Ok(Json(state.engine.verify_backup(&req.target, &timestamp).await?))
}

/// POST /backups/{timestamp}/restore
pub async fn restore_items(
    State(state): State<AppState>,
    Path(timestamp): Path<String>,
    Json(req): Json<RestoreItemsRequest>,
) -> Result<Json<RestoreResult>, ApiError> {
    if req.restore.items.is_empty() {
        return Err(SuiteError::InvalidInput("no items selected".to_string()).into());
    }
    Ok(Json(
        state
            .engine
            .restore_items(&req.target, &timestamp, req.restore)
            .await?,
    ))
}

/// POST /backups/{timestamp}/quick-restore - Essential packages only
pub async fn quick_restore(
    State(state): State<AppState>,
    Path(timestamp): Path<String>,
    Json(req): Json<QuickRestoreRequest>,
) -> Result<Json<RestoreResult>, ApiError> {
    Ok(Json(state.engine.quick_restore(&req.target, &timestamp).await?))
}

/// GET /backups/{timestamp}/manual-apps?target=
pub async fn manual_apps(
    State(state): State<AppState>,
    Path(timestamp): Path<String>,
    Query(query): Query<TargetQuery>,
) -> Result<Json<ManualAppsResponse>, ApiError> {
    let apps = state.engine.get_manual_apps(&query.target, &timestamp).await?;
    Ok(Json(ManualAppsResponse { apps }))
}
