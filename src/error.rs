//! Error types for Lagoon
//!
//! Every failure inside the federation engine is an `AppError`. Handlers
//! convert it to an HTTP response via `IntoResponse`; background task
//! runners branch on [`AppError::is_retryable`] to decide retry vs terminal.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
///
/// The variants mirror the engine's failure taxonomy: structural problems
/// and signature failures are terminal for the triggering request, network
/// failures are retryable, and a duplicate activity is a silent success.
#[derive(Debug, Error)]
pub enum AppError {
    /// Malformed or missing fields in a payload (400, terminal)
    #[error("Validation error: {0}")]
    Validation(String),

    /// HTTP Signature absent, invalid, or expired (401, terminal)
    #[error("Signature error: {0}")]
    Signature(String),

    /// Timeout/DNS/TLS failure while talking to a peer (retryable)
    #[error("Network error: {0}")]
    Network(String),

    /// Resolution target unreachable or not an actor document
    /// (drop the dependent activity, terminal)
    #[error("Actor fetch error: {0}")]
    ActorFetch(String),

    /// An activity with this id was already processed (silent success)
    #[error("Duplicate activity")]
    DuplicateActivity,

    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Authentication required (401)
    #[error("Authentication required")]
    Unauthorized,

    /// Access denied (403)
    #[error("Access denied")]
    Forbidden,

    /// Persistence layer failure (500)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Whether a task runner should retry the failed operation.
    ///
    /// Only transient transport failures qualify. Everything else is
    /// terminal for the single request or activity that produced it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Network(_))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Network(err.to_string())
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// A `DuplicateActivity` maps to 200: remote senders retry deliveries,
    /// and the idempotent re-receipt of an activity is not an error.
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_message, error_type) = match &self {
            AppError::DuplicateActivity => {
                return StatusCode::OK.into_response();
            }
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone(), "validation"),
            AppError::Signature(msg) => (StatusCode::UNAUTHORIZED, msg.clone(), "signature"),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string(), "unauthorized"),
            AppError::Forbidden => (StatusCode::FORBIDDEN, self.to_string(), "forbidden"),
            AppError::NotFound => (StatusCode::NOT_FOUND, self.to_string(), "not_found"),
            AppError::Network(msg) => (StatusCode::BAD_GATEWAY, msg.clone(), "network"),
            AppError::ActorFetch(msg) => (StatusCode::BAD_GATEWAY, msg.clone(), "actor_fetch"),
            AppError::Storage(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone(), "storage"),
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone(), "config"),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                "internal",
            ),
        };

        crate::metrics::ERRORS_TOTAL
            .with_label_values(&[error_type])
            .inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_errors_are_retryable() {
        assert!(AppError::Network("connect timeout".to_string()).is_retryable());
    }

    #[test]
    fn validation_signature_and_fetch_errors_are_terminal() {
        assert!(!AppError::Validation("missing id".to_string()).is_retryable());
        assert!(!AppError::Signature("digest mismatch".to_string()).is_retryable());
        assert!(!AppError::ActorFetch("404".to_string()).is_retryable());
        assert!(!AppError::DuplicateActivity.is_retryable());
    }
}
