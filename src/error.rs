// file: src/error.rs
// description: Custom error types and result type aliases
// reference: https://docs.rs/thiserror

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BatchError>;

/// Errors that abort a whole run or reject a control request.
///
/// Per-file failures never surface here; they are recorded on the
/// [`JobRecord`](crate::models::JobRecord) as a [`JobError`](crate::models::JobError).
#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cannot enumerate input directory {path}: {source}")]
    Enumeration {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{source_name} collides with {existing} after sanitization ({sanitized})")]
    NameCollision {
        source_name: String,
        existing: String,
        sanitized: String,
    },

    #[error("Missing collaborator: {0}")]
    MissingCollaborator(String),

    #[error("A batch run is already in progress")]
    AlreadyRunning,

    #[error("No batch run has been started")]
    NotRunning,

    #[error("File operation failed for {path}: {source}")]
    FileOperation {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl BatchError {
    pub fn file_operation(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileOperation {
            path: path.into(),
            source,
        }
    }

    /// Whether this error ends the run before any job starts.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::NameCollision { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collision_is_not_fatal() {
        let err = BatchError::NameCollision {
            source_name: "a?.wav".to_string(),
            existing: "a.wav".to_string(),
            sanitized: "a".to_string(),
        };
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("a?.wav"));
    }

    #[test]
    fn test_enumeration_is_fatal() {
        let err = BatchError::Enumeration {
            path: PathBuf::from("/missing"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(err.is_fatal());
    }
}
