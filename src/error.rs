// src/error.rs

//! Unified error handling for the alert bridge.

use thiserror::Error;

use crate::services::weather::ApiError;

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// Embedded database error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Weather API fetch failed
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Webhook delivery exhausted all attempts
    #[error("notification failed after {attempts} attempt(s): {message}")]
    Notification { attempts: u32, message: String },

    /// Notifier circuit breaker is open; send was not attempted
    #[error("notifier circuit open")]
    CircuitOpen,

    /// Configuration error (fatal, pre-start)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// State store error
    #[error("State error: {0}")]
    State(String),

    /// Operation interrupted by shutdown
    #[error("cancelled")]
    Cancelled,
}

impl AppError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a state store error.
    pub fn state(message: impl Into<String>) -> Self {
        Self::State(message.into())
    }

    /// Whether this error should stop the service loop instead of being
    /// retried on the next cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Validation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_are_fatal() {
        assert!(AppError::config("missing key").is_fatal());
        assert!(AppError::validation("bad date").is_fatal());
    }

    #[test]
    fn test_runtime_errors_are_retriable() {
        assert!(!AppError::state("persist failed").is_fatal());
        assert!(!AppError::Cancelled.is_fatal());
        assert!(
            !AppError::Notification {
                attempts: 3,
                message: "HTTP 500".into()
            }
            .is_fatal()
        );
    }
}
