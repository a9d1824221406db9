//! Error taxonomy for the telemetry core (see design notes §7).
//!
//! Hot-path errors (ingest, delta math, fan-out dispatch) are recovered
//! locally and never propagate back to an endpoint connection or close a
//! stream — callers log and continue. This enum exists for the boundary
//! paths that do need a typed `Result`: endpoint client setup, persistence,
//! and the handful of read surfaces this crate exposes directly.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("endpoint transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("endpoint {0} not found in cache")]
    EndpointNotFound(String),

    #[error("tunnel {endpoint_id}/{instance_id} not found in cache")]
    TunnelNotFound {
        endpoint_id: String,
        instance_id: String,
    },

    #[error("config error: {0}")]
    Config(String),
}

/// Allows `CoreError` to be returned directly from the handful of axum
/// handlers this crate exposes, formatted per §7's structured JSON policy.
impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = match &self {
            CoreError::EndpointNotFound(_) | CoreError::TunnelNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            CoreError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::Database(_) | CoreError::Transport(_) => StatusCode::BAD_GATEWAY,
        };
        let body = Json(json!({ "error": status.as_str(), "message": self.to_string() }));
        (status, body).into_response()
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
