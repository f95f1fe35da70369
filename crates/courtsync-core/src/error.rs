//! Error types for courtsync

use thiserror::Error;

/// Main error type for courtsync coordination operations
#[derive(Error, Debug)]
pub enum CoordError {
    /// Session was not found in the shared store
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Local precondition failure (e.g. missing session id on an arbitration
    /// call). Raised synchronously, never retried.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Error from the peer-to-peer transport (advertise/browse failure,
    /// peer unreachable). Recoverable by rediscovery.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Transient shared-store error (service unavailable). Retried with
    /// capped backoff by the store client.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Shared-store permission/authentication error. Never retried;
    /// requires user action.
    #[error("Store permission denied: {0}")]
    StorePermission(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

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

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl CoordError {
    /// Whether the store client may retry the failed operation.
    ///
    /// Only transient store errors are retriable; permission failures and
    /// local precondition errors are surfaced immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoordError::StoreUnavailable(_))
    }
}

/// Result type alias using CoordError
pub type CoordResult<T> = Result<T, CoordError>;
