//! Gateway error taxonomy, mapped onto HTTP statuses and the uniform
//! `{success:false, error}` envelope.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Bad device id or PIN format, bad JSON, missing required field.
    #[error("{0}")]
    Malformed(String),

    /// Unknown or expired PIN; invalid, expired, or mis-scoped token.
    #[error("{0}")]
    Auth(String),

    /// Room cap reached.
    #[error("{0}")]
    CapReached(String),

    /// `/connect` hit without a WebSocket upgrade.
    #[error("WebSocket upgrade required")]
    UpgradeRequired,

    /// Anything unexpected. The message is surfaced, never a backtrace.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    fn status(&self) -> StatusCode {
        match self {
            GatewayError::Malformed(_) => StatusCode::BAD_REQUEST,
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::CapReached(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::UpgradeRequired => StatusCode::UPGRADE_REQUIRED,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if let GatewayError::Internal(ref e) = self {
            tracing::error!(err = %e, "internal gateway error");
        }
        let body = json!({ "success": false, "error": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
