//! Errors - store and upload error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by queue store operations.
///
/// `StorageFull` and `StorageIo` are fatal to the triggering call, never to
/// the process.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Enqueue would exceed the configured capacity bound.
    #[error("queue store is full (capacity {capacity})")]
    StorageFull { capacity: usize },

    /// Persistence failed (query, transaction, lock poisoning, ...).
    #[error("queue store I/O failed: {0}")]
    StorageIo(String),

    /// Failed to open or create the store file.
    #[error("failed to open queue store at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    /// The on-disk schema is newer than this build understands.
    #[error("queue store schema version {found} is newer than supported version {expected}")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },

    /// A persisted row could not be decoded.
    #[error("corrupt queue record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

impl StoreError {
    pub fn io(source: impl std::fmt::Display) -> Self {
        Self::StorageIo(source.to_string())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(source: rusqlite::Error) -> Self {
        Self::io(source)
    }
}

/// Failure reported by an upload operation.
///
/// Always retryable from the queue's point of view: the retry policy and
/// `max_attempts` decide whether the item gets another try.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct UploadError {
    message: String,
}

impl UploadError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for UploadError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for UploadError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<std::io::Error> for UploadError {
    fn from(source: std::io::Error) -> Self {
        Self::new(source.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_full_mentions_capacity() {
        let err = StoreError::StorageFull { capacity: 10 };
        assert_eq!(err.to_string(), "queue store is full (capacity 10)");
    }

    #[test]
    fn rusqlite_errors_become_storage_io() {
        let err: StoreError = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, StoreError::StorageIo(_)));
    }

    #[test]
    fn upload_error_displays_message() {
        let err = UploadError::from("connection reset");
        assert_eq!(err.to_string(), "connection reset");
        assert_eq!(err.message(), "connection reset");
    }
}
