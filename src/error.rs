use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::models::ErrorBody;

/// Failures inside the limiter itself. Callers treat these as fail-open.
#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("clock unavailable: {0}")]
    Clock(String),

    #[error("window end overflows for key {key}")]
    WindowOverflow { key: String },

    #[error("failed to encode response body: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("failed to encode metrics: {0}")]
    Metrics(String),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match self {
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Metrics(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(status = %status, error = %self, "request failed");
        }

        let body = Json(ErrorBody {
            error: self.to_string(),
        });

        (status, body).into_response()
    }
}
