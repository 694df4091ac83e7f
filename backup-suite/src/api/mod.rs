//! HTTP API module for the backup daemon.

pub mod backup;
pub mod error;
pub mod filesystem;
pub mod health;

use crate::engine::Engine;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

/// Create the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health::health))
        .route("/version", get(health::version))
        // Backup endpoints
        .route("/backups", get(backup::list_backups).post(backup::start_backup))
        .route("/backups/cancel", post(backup::cancel_backup))
        .route(
            "/backups/{timestamp}",
            get(backup::get_backup).delete(backup::delete_backup),
        )
        .route("/backups/{timestamp}/verify", post(backup::verify_backup))
        .route("/backups/{timestamp}/restore", post(backup::restore_items))
        .route("/backups/{timestamp}/quick-restore", post(backup::quick_restore))
        .route("/backups/{timestamp}/manual-apps", get(backup::manual_apps))
        // Filesystem endpoints
        .route("/volumes", get(filesystem::list_volumes))
        .route("/fs/permission", get(filesystem::check_permission))
        // WebSocket endpoint
        .route("/ws", get(crate::ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::Collaborators;
    use crate::manifest::{write_manifest, BackupManifest, SuiteLayout};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use chrono::Local;
    use serde_json::Value;
    use std::path::Path;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn app() -> Router {
        let config = Config::default();
        let collaborators = Collaborators::host(&config);
        create_router(AppState::new(Engine::new(config, collaborators)))
    }

    fn seed(target: &Path, timestamp: &str) -> std::io::Result<()> {
        let layout = SuiteLayout::new(target);
        std::fs::create_dir_all(layout.backup_dir(timestamp))?;
        let now = Local::now();
        let manifest = BackupManifest::new(timestamp.to_string(), Vec::new(), now, now, Vec::new());
        write_manifest(&layout.manifest_path(timestamp), &manifest)
            .map_err(|e| std::io::Error::other(e.to_string()))
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn get(uri: String) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = send(app(), get("/health".to_string())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert!(body["busy_targets"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_and_details() {
        let temp = TempDir::new().unwrap();
        seed(temp.path(), "20240101-120000").unwrap();
        let target = temp.path().display();

        let (status, body) = send(app(), get(format!("/backups?target={}", target))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["timestamp"], "20240101-120000");
        assert_eq!(body[0]["hash_verified"], false);

        let (status, body) =
            send(app(), get(format!("/backups/20240101-120000?target={}", target))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["timestamp"], "20240101-120000");
    }

    #[tokio::test]
    async fn test_unknown_backup_is_404() {
        let temp = TempDir::new().unwrap();
        let request = Request::builder()
            .method("DELETE")
            .uri(format!("/backups/20240101-120000?target={}", temp.path().display()))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(app(), request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_empty_backup_request_is_400() {
        let temp = TempDir::new().unwrap();
        let request = Request::builder()
            .method("POST")
            .uri("/backups")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({ "target": temp.path(), "directories": [] }).to_string(),
            ))
            .unwrap();
        let (status, body) = send(app(), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "invalid_input");
    }

    #[tokio::test]
    async fn test_quick_restore_without_package_inventory_is_404() {
        let temp = TempDir::new().unwrap();
        seed(temp.path(), "20240101-120000").unwrap();
        let request = Request::builder()
            .method("POST")
            .uri("/backups/20240101-120000/quick-restore")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::json!({ "target": temp.path() }).to_string()))
            .unwrap();
        let (status, body) = send(app(), request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("package inventory"));
    }

    #[tokio::test]
    async fn test_cancel_without_runs() {
        let request = Request::builder()
            .method("POST")
            .uri("/backups/cancel")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let (status, body) = send(app(), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cancelled"], 0);
    }

    #[tokio::test]
    async fn test_permission_check() {
        let temp = TempDir::new().unwrap();
        let (status, body) =
            send(app(), get(format!("/fs/permission?path={}", temp.path().display()))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["readable"], true);
    }
}
