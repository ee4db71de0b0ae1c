//! Error types for creg
//!
//! This module defines all error types used throughout the crate.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for creg operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for creg
#[derive(Error, Debug)]
pub enum Error {
    /// Event source errors (runtime unreachable, stream broken)
    #[error("Event source error: {0}")]
    Source(String),

    /// Registry client errors, tagged with the backend that issued the call
    #[error("Registry error ({backend}): {message}")]
    Registry {
        /// Backend routing name
        backend: String,
        /// Error message
        message: String,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed label data on a container
    #[error("Invalid label: {0}")]
    Label(String),

    /// HTTP transport errors
    #[error("HTTP error: {0}")]
    Http(String),

    /// A registry call exceeded its deadline
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Configured deadline
        after: Duration,
    },

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an event source error
    pub fn source(msg: impl Into<String>) -> Self {
        Self::Source(msg.into())
    }

    /// Create a registry error for the given backend
    pub fn registry(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Registry {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a label error
    pub fn label(msg: impl Into<String>) -> Self {
        Self::Label(msg.into())
    }

    /// Create an HTTP error
    pub fn http(msg: impl Into<String>) -> Self {
        Self::Http(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
