//! Health check endpoints.

use super::AppState;
use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};

static START_TIME: std::sync::OnceLock<u64> = std::sync::OnceLock::new();

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn init_start_time() {
    START_TIME.get_or_init(now_secs);
}

/// Seconds since [`init_start_time`]
pub fn uptime_secs() -> u64 {
    START_TIME
        .get()
        .map(|start| now_secs().saturating_sub(*start))
        .unwrap_or(0)
}

/// GET /health - Health check endpoint
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let busy = state.engine.busy_targets();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": uptime_secs(),
        "busy_targets": busy
            .iter()
            .map(|(target, operation)| json!({ "target": target, "operation": operation }))
            .collect::<Vec<_>>(),
    }))
}

/// GET /version - Version information endpoint
pub async fn version() -> impl IntoResponse {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "features": ["zstd", "gzip", "sha256"],
    }))
}
