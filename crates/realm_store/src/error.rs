//! Storage error types.

use uuid::Uuid;

use crate::entity::EntityKind;

/// Errors that can occur in a [`ReplicaStore`](crate::ReplicaStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Error reported by SQLite.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// An entity body could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A row with the same kind and id already exists.
    #[error("Duplicate {kind} id: {id}")]
    DuplicateId { kind: EntityKind, id: Uuid },

    /// Stored data does not match the expected shape.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// An I/O error occurred while opening the backing file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
