//! Error types for Hearth.
//!
//! Absence of a server is not an error: lookups return `Option`/`bool`.
//! The variants here cover hard I/O failures, timeouts, protocol framing
//! violations, and the two lock-wait outcomes (`Interrupted`, `Closed`) that
//! callers handle as answers rather than faults.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the Hearth library.
#[derive(Debug, Error)]
pub enum HearthError {
    // Port file errors
    #[error("Failed to lock port file {path:?}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to delete port file {path:?} after {attempts} attempts")]
    Delete { path: PathBuf, attempts: u32 },

    #[error("No valid port file appeared after waiting {elapsed:?}")]
    Timeout { elapsed: Duration },

    #[error("Port file lock wait was interrupted")]
    Interrupted,

    #[error("Port file has been closed")]
    Closed,

    // Protocol errors
    #[error("Protocol framing error: {message}")]
    Framing { message: String },

    // File system and socket errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Server coordination errors
    #[error("A build server is already running on port {port}")]
    AlreadyRunning { port: u16 },

    #[error("Failed to connect to build server on port {port}: {source}")]
    Connect {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for Hearth operations.
pub type Result<T> = std::result::Result<T, HearthError>;

impl From<std::io::Error> for HearthError {
    fn from(err: std::io::Error) -> Self {
        HearthError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl HearthError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        HearthError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a framing error.
    pub fn framing(message: impl Into<String>) -> Self {
        HearthError::Framing {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display_includes_elapsed() {
        let err = HearthError::Timeout {
            elapsed: Duration::from_secs(2),
        };
        assert_eq!(
            err.to_string(),
            "No valid port file appeared after waiting 2s"
        );
    }

    #[test]
    fn test_framing_display() {
        let err = HearthError::framing("missing ':' in line");
        assert_eq!(
            err.to_string(),
            "Protocol framing error: missing ':' in line"
        );
    }

    #[test]
    fn test_io_with_path_keeps_path() {
        let err = HearthError::io_with_path(
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
            "/tmp/hearth.port",
        );
        match err {
            HearthError::Io { path, .. } => {
                assert_eq!(path, Some(PathBuf::from("/tmp/hearth.port")));
            }
            other => panic!("Expected Io, got: {:?}", other),
        }
    }
}
