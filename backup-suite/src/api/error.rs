use crate::utils::errors::SuiteError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Engine error rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub SuiteError);

impl From<SuiteError> for ApiError {
    fn from(err: SuiteError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            SuiteError::NotFound(_) => StatusCode::NOT_FOUND,
            SuiteError::TargetBusy { .. } | SuiteError::Cancelled => StatusCode::CONFLICT,
            SuiteError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Internal error: {}", self.0);
        }
        let body = json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
            "paths": self.0.paths(),
        });
        (status, Json(body)).into_response()
    }
}
