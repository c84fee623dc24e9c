//! Error types for pipehub.
//!
//! Peer-level failures never surface here: they stay inside the peer's worker
//! task. What does surface is whatever decides a role (connect outcomes,
//! endpoint binding) or ends the process (exhausted reconnects, I/O setup).

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for pipehub.
#[derive(Debug, Error)]
pub enum RelayError {
    // Transport errors
    #[error("No hub reachable on {endpoint} within {timeout:?}")]
    ConnectTimeout { endpoint: String, timeout: Duration },

    #[error("Transport broken on {endpoint}: {message}")]
    TransportBroken {
        endpoint: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("A hub is already listening on {endpoint}")]
    HubAlreadyRunning { endpoint: String },

    #[error("Frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    // Election errors
    #[error("Gave up reconnecting to {endpoint} after {attempts} attempts: {last_error}")]
    ReconnectExhausted {
        endpoint: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Failed to open lock {name} at {path}: {message}")]
    Lock {
        name: String,
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Operation was cancelled")]
    Cancelled,
}

/// Result type alias for pipehub operations.
pub type Result<T> = std::result::Result<T, RelayError>;

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl RelayError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        RelayError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Wrap an I/O failure on an established or half-open transport.
    pub fn broken(endpoint: impl Into<String>, err: std::io::Error) -> Self {
        RelayError::TransportBroken {
            endpoint: endpoint.into(),
            message: err.to_string(),
            source: Some(err),
        }
    }

    /// True when no hub answered at all, as opposed to a hub that answered
    /// and then failed.
    pub fn is_hub_unreachable(&self) -> bool {
        matches!(self, RelayError::ConnectTimeout { .. })
    }

    /// Check if this error should trigger another reconnect attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::ConnectTimeout { .. } | RelayError::TransportBroken { .. }
        )
    }
}
