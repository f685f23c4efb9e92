//! Error types for preference synchronization

use thiserror::Error;

/// Main error type for preference sync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// The transport rejected or failed an operation
    #[error("Transport error: {0}")]
    Transport(String),

    /// The transport is not connected
    #[error("Transport not connected")]
    NotConnected,

    /// Error raised by a local store adapter
    #[error("Store error: {0}")]
    Store(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),

    /// A value could not be parsed into a preference
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::Transport("listing failed".to_string());
        assert_eq!(format!("{}", err), "Transport error: listing failed");
        assert_eq!(format!("{}", SyncError::NotConnected), "Transport not connected");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let sync_err: SyncError = io_err.into();
        assert!(matches!(sync_err, SyncError::Io(_)));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<u32>("nope").unwrap_err();
        let sync_err: SyncError = json_err.into();
        assert!(matches!(sync_err, SyncError::Serialization(_)));
    }
}
