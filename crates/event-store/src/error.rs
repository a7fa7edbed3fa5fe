use common::InstanceKey;
use thiserror::Error;

use crate::Version;

/// Errors that can occur when interacting with the journal or its companion stores.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// A concurrency conflict occurred when appending events.
    /// The expected version did not match the actual version.
    #[error(
        "Concurrency conflict for aggregate {instance}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        instance: InstanceKey,
        expected: Version,
        actual: Version,
    },

    /// The instance has no history, or the requested record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A snapshot already exists for the instance and `insert` was used.
    #[error("Snapshot already exists for {0}")]
    DuplicateSnapshot(InstanceKey),

    /// The events handed to `append` are not a valid batch.
    #[error("Append validation error: {0}")]
    InvalidAppend(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EventStoreError {
    /// Returns true for optimistic concurrency failures.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type for event store operations.
pub type Result<T> = std::result::Result<T, EventStoreError>;
