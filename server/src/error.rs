//! Error types for the TabPulse server.
//!
//! [`ServerError`] is returned by route handlers and renders as a JSON
//! [`ErrorResponse`] with a stable `code` the agent can match on.
//!
//! # Example
//!
//! ```rust,ignore
//! use tabpulse_server::error::ServerError;
//!
//! fn check_batch(events: &[Event]) -> Result<(), ServerError> {
//!     if events.is_empty() {
//!         return Err(ServerError::validation("empty_batch", "batch contains no events"));
//!     }
//!     Ok(())
//! }
//! ```

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

use crate::config::ConfigError;

/// Top-level error type for the TabPulse server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Configuration error during server initialization.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Missing, unknown or expired token.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Email and password did not match a configured user.
    #[error("invalid email or password")]
    InvalidCredentials,

    /// Malformed request body or event.
    #[error("validation error: {message}")]
    Validation { code: &'static str, message: String },

    /// The caller exceeded its request rate.
    #[error("rate limit exceeded, retry after {retry_after} seconds")]
    RateLimit { retry_after: u64 },

    /// Unexpected internal server error.
    #[error("internal server error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Creates a new authentication error.
    ///
    /// ```rust
    /// use tabpulse_server::error::ServerError;
    ///
    /// let err = ServerError::auth("token expired");
    /// assert!(matches!(err, ServerError::Auth(_)));
    /// ```
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    /// Creates a new validation error with a machine-readable code.
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    /// Creates a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// HTTP status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Auth(_) | Self::InvalidCredentials => StatusCode::UNAUTHORIZED,
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Config(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable error code for clients.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth(_) => "unauthorized",
            Self::InvalidCredentials => "invalid_credentials",
            Self::Validation { code, .. } => code,
            Self::RateLimit { .. } => "rate_limited",
            Self::Config(_) | Self::Internal(_) => "server_error",
        }
    }

    /// Returns `true` if this error indicates a client-side problem.
    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }
}

/// JSON error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            error!(error = %self, "Request failed");
            "internal server error".to_string()
        } else {
            self.to_string()
        };
        let body = Json(ErrorResponse {
            error: message,
            code: self.code().to_string(),
        });

        match self {
            Self::RateLimit { retry_after } => (
                status,
                [(header::RETRY_AFTER, retry_after.to_string())],
                body,
            )
                .into_response(),
            _ => (status, body).into_response(),
        }
    }
}

/// A specialized Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
