//! Application-wide error types.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Remote index error (code {code}): {message}")]
    Remote { code: i64, message: String },

    #[error("Invalid remote path: {0:?}")]
    InvalidRemotePath(String),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Task {task_id} is already running")]
    AlreadyRunning { task_id: i64 },

    #[error("Run cancelled")]
    Cancelled,

    #[error("IO error while {op} {}: {source}", path.display())]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.to_string(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether a remote call that failed with this error is worth retrying.
    ///
    /// Path, validation and configuration errors fail the same way on every
    /// attempt, so they are surfaced immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) | Self::Remote { .. } | Self::Io(_) | Self::IoPath { .. } => true,
            Self::Serialization(_) | Self::Other(_) => true,
            Self::DatabaseSqlx(_)
            | Self::Migration(_)
            | Self::InvalidRemotePath(_)
            | Self::NotFound { .. }
            | Self::Validation(_)
            | Self::Configuration(_)
            | Self::AlreadyRunning { .. }
            | Self::Cancelled => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(
            Error::Remote {
                code: 500,
                message: "boom".to_string()
            }
            .is_transient()
        );
        assert!(Error::Other("timeout".to_string()).is_transient());
        assert!(!Error::InvalidRemotePath(String::new()).is_transient());
        assert!(!Error::config("missing host").is_transient());
        assert!(!Error::AlreadyRunning { task_id: 1 }.is_transient());
    }

    #[test]
    fn test_io_path_display() {
        let err = Error::io_path(
            "writing",
            Path::new("/tmp/a.strm"),
            std::io::Error::other("disk full"),
        );
        let msg = err.to_string();
        assert!(msg.contains("writing"));
        assert!(msg.contains("/tmp/a.strm"));
    }
}
