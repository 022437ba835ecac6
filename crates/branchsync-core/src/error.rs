//! Error types for BranchSync

use thiserror::Error;

/// Main error type for BranchSync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Idea was not found in storage
    #[error("Idea not found: {0}")]
    IdeaNotFound(String),

    /// Branch was not found in storage
    #[error("Branch not found: {0}")]
    BranchNotFound(String),

    /// Bind was not found in storage
    #[error("Bind not found: {0}")]
    BindNotFound(String),

    /// Snapshot was not found in storage
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// The environment lacks a required capability (camera, radio, network)
    #[error("Capability unavailable: {0}")]
    CapabilityUnavailable(String),

    /// The user or OS refused access to a hardware resource
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// A transfer failed mid-flight (network fault, relay error, truncated stream)
    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    /// Received bytes failed JSON or schema validation
    #[error("Parse error: {0}")]
    Parse(String),

    /// Payload exceeds the transport's chunk budget
    #[error("Payload too large: {chunks} chunks exceeds maximum of {max}")]
    PayloadTooLarge {
        /// Number of chunks the payload would require
        chunks: usize,
        /// Configured maximum for the transport
        max: usize,
    },

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
    Serialization(String),

    /// Network-related error
    #[error("Network error: {0}")]
    Network(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;
