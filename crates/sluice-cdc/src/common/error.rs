//! Error types for CDC operations
//!
//! Errors are classified so that steady-state failures can be absorbed,
//! logged and reflected in liveness/metrics while setup-time failures
//! propagate to the caller of `start()`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Source change-stream errors (connection loss, invalid cursor)
    Source,
    /// Handler errors (exception or `false` return)
    Handler,
    /// Resume token persistence errors
    Checkpoint,
    /// Configuration errors (invalid settings, unknown handlers)
    Configuration,
    /// Serialization errors (JSON, YAML)
    Serialization,
    /// Lifecycle errors (shutdown, invalid state, timeouts)
    Lifecycle,
    /// Other/unknown errors
    Other,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::Handler => write!(f, "handler"),
            Self::Checkpoint => write!(f, "checkpoint"),
            Self::Configuration => write!(f, "configuration"),
            Self::Serialization => write!(f, "serialization"),
            Self::Lifecycle => write!(f, "lifecycle"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// CDC-specific errors
#[derive(Error, Debug)]
pub enum CdcError {
    /// Change stream failed (disconnect, cursor invalidated)
    #[error("Stream error for {entity_type}: {message}")]
    Stream {
        entity_type: String,
        message: String,
    },

    /// Resume token rejected by the source (expired or unknown)
    #[error("Invalid resume token for {entity_type}: {token}")]
    InvalidResumeToken { entity_type: String, token: String },

    /// Handler failed
    #[error("Handler '{handler}' failed: {message}")]
    Handler { handler: String, message: String },

    /// Resume token persistence error
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Component already shut down
    #[error("Shut down: {0}")]
    Shutdown(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CdcError {
    /// Create a new stream error
    pub fn stream(entity_type: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Stream {
            entity_type: entity_type.into(),
            message: msg.into(),
        }
    }

    /// Create a new invalid resume token error
    pub fn invalid_resume_token(entity_type: impl Into<String>, token: impl Into<String>) -> Self {
        Self::InvalidResumeToken {
            entity_type: entity_type.into(),
            token: token.into(),
        }
    }

    /// Create a new handler error
    pub fn handler(handler: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Handler {
            handler: handler.into(),
            message: msg.into(),
        }
    }

    /// Create a new checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a shutdown error
    pub fn shutdown(msg: impl Into<String>) -> Self {
        Self::Shutdown(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Check if this error is retriable.
    ///
    /// Returns true for transient errors that may succeed on retry.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Stream { message, .. } => {
                message.contains("temporarily")
                    || message.contains("connection reset")
                    || message.contains("connection lost")
            }
            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }
            Self::InvalidResumeToken { .. }
            | Self::Handler { .. }
            | Self::Checkpoint(_)
            | Self::Config(_)
            | Self::Serialization(_)
            | Self::Json(_)
            | Self::InvalidState(_)
            | Self::Shutdown(_)
            | Self::Other(_) => false,
        }
    }

    /// Get the error category for metrics and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Stream { .. } | Self::InvalidResumeToken { .. } => ErrorCategory::Source,
            Self::Handler { .. } => ErrorCategory::Handler,
            Self::Checkpoint(_) => ErrorCategory::Checkpoint,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Serialization(_) | Self::Json(_) => ErrorCategory::Serialization,
            Self::Timeout(_) | Self::InvalidState(_) | Self::Shutdown(_) => {
                ErrorCategory::Lifecycle
            }
            Self::Io(_) | Self::Other(_) => ErrorCategory::Other,
        }
    }
}

impl From<serde_yaml::Error> for CdcError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<validator::ValidationErrors> for CdcError {
    fn from(e: validator::ValidationErrors) -> Self {
        Self::Config(e.to_string())
    }
}

/// Result type for CDC operations
pub type Result<T> = std::result::Result<T, CdcError>;
