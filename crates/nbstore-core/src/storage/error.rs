//! Storage error handling
//!
//! Provides typed errors for storage operations with descriptive messages
//! and recovery suggestions.
//!
//! Missing docs and blobs are not errors: lookups return `None` or an empty
//! collection instead.

use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// Failed to create the directory holding a space database
    #[error("Failed to create data directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Native open or close failed; the next connect attempt retries
    #[error("Connection error for '{share_id}': {details}")]
    Connection { share_id: String, details: String },

    /// Operation issued while the shared connection is not open
    #[error("Storage '{share_id}' is not connected")]
    NotConnected { share_id: String },

    /// A mutation was rejected by SQLite (disk full, read-only file, ...)
    #[error("Failed to write {what}: {source}")]
    Write {
        what: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// Updates for a document could not be merged into its snapshot
    #[error("Failed to merge updates for doc '{doc_id}': {details}")]
    Merge { doc_id: String, details: String },

    /// Timestamp finer than the millisecond precision that is persisted
    #[error("Timestamp {timestamp} of {what} has a sub-millisecond part")]
    SubMillisecondTimestamp {
        what: &'static str,
        timestamp: DateTime<Utc>,
    },

    /// Universal id string could not be decoded
    #[error("Invalid universal id '{id}': {reason}")]
    InvalidUniversalId { id: String, reason: String },

    /// SQLite read error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Blocking storage task panicked or was cancelled
    #[error("Storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// The registry has been shut down
    #[error("Store registry is shut down")]
    RegistryClosed,
}

impl StoreError {
    /// Wrap a SQLite error raised by a mutation
    pub fn write(what: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| StoreError::Write { what, source }
    }

    /// Check if retrying the connection may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Connection { .. } | StoreError::CreateDirectory { .. }
        )
    }

    /// Check if this error came from a rejected write
    pub fn is_write_error(&self) -> bool {
        matches!(self, StoreError::Write { .. } | StoreError::NotConnected { .. })
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StoreError::CreateDirectory { .. } => {
                Some("Check that the data directory exists and you have write permissions.")
            }
            StoreError::Connection { .. } => {
                Some("Connect again; the storage is not poisoned by a failed open.")
            }
            StoreError::NotConnected { .. } => Some("Connect the space before using it."),
            StoreError::Write { source, .. } if is_disk_full(source) => {
                Some("Free up disk space and try again.")
            }
            _ => None,
        }
    }
}

/// Check if a SQLite error indicates a full disk
fn is_disk_full(error: &rusqlite::Error) -> bool {
    matches!(
        error.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DiskFull)
    )
}

/// Result type for storage operations
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_is_retryable() {
        let err = StoreError::Connection {
            share_id: "sqlite:@peer(p);@type(workspace);@id(s);".to_string(),
            details: "unable to open database file".to_string(),
        };

        assert!(err.is_retryable());
        assert!(!err.is_write_error());
        assert!(err.recovery_suggestion().is_some());
        assert!(err.to_string().contains("sqlite:@peer(p);@type(workspace);@id(s);"));
    }

    #[test]
    fn test_not_connected_is_write_error() {
        let err = StoreError::NotConnected {
            share_id: "sqlite:@peer(p);@type(workspace);@id(s);".to_string(),
        };

        assert!(err.is_write_error());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_disk_full_suggestion() {
        let source = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_FULL),
            None,
        );
        let err = StoreError::write("doc update")(source);

        assert!(err.is_write_error());
        assert_eq!(
            err.recovery_suggestion(),
            Some("Free up disk space and try again.")
        );
        assert!(err.to_string().starts_with("Failed to write doc update"));
    }

    #[test]
    fn test_create_directory_display() {
        let err = StoreError::CreateDirectory {
            path: PathBuf::from("/readonly/space"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };

        let msg = err.to_string();
        assert!(msg.contains("/readonly/space"));
        assert!(err.is_retryable());
    }
}
