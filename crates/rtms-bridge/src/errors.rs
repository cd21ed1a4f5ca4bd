//! RTMS bridge error types.
//!
//! All errors map to HTTP status codes via the `IntoResponse` impl, for the
//! few paths where an error reaches an HTTP caller. Messages returned to
//! callers are generic for internal failures; actual errors are logged
//! server-side.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// RTMS bridge error type.
///
/// Maps to HTTP status codes:
/// - BadRequest: 400 Bad Request
/// - SessionNotFound: 404 Not Found
/// - Transport, Forward: 502 Bad Gateway
/// - Config, Protocol, ContractViolation, Internal: 500 Internal Server Error
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Configuration problem discovered at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// WebSocket connect, send or close failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A frame could not be encoded or decoded.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A channel operation was attempted out of order.
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// No live session for the given stream.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Transcript delivery to the ingestion sink failed.
    #[error("Forwarding failed: {0}")]
    Forward(String),

    /// Malformed inbound request.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Internal error (actor mailbox closed, task failure).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            BridgeError::BadRequest(_) => 400,
            BridgeError::SessionNotFound(_) => 404,
            BridgeError::Transport(_) | BridgeError::Forward(_) => 502,
            BridgeError::Config(_)
            | BridgeError::Protocol(_)
            | BridgeError::ContractViolation(_)
            | BridgeError::Internal(_) => 500,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            BridgeError::BadRequest(reason) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST", reason.clone())
            }
            BridgeError::SessionNotFound(_) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                "Stream session not found".to_string(),
            ),
            BridgeError::Transport(_) | BridgeError::Forward(_) => {
                tracing::warn!(target: "rtms.errors", error = %self, "Upstream failure");
                (
                    StatusCode::BAD_GATEWAY,
                    "UPSTREAM_ERROR",
                    "An upstream service failed".to_string(),
                )
            }
            BridgeError::Config(_)
            | BridgeError::Protocol(_)
            | BridgeError::ContractViolation(_)
            | BridgeError::Internal(_) => {
                tracing::error!(target: "rtms.errors", error = %self, "Internal failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let error_response = ErrorResponse {
            error: ErrorDetail {
                code: code.to_string(),
                message,
            },
        };

        (status, Json(error_response)).into_response()
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Protocol(err.to_string())
    }
}
