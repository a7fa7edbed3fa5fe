//! Projection error types.

use thiserror::Error;

/// Errors that can occur during projection processing.
#[derive(Debug, Error)]
pub enum ProjectionError {
    /// An error occurred in the journal or offset store.
    #[error("Event store error: {0}")]
    EventStore(#[from] event_store::EventStoreError),

    /// Failed to deserialize an event payload.
    #[error("Event deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// A projection rejected a batch.
    #[error("Projection {name} failed: {reason}")]
    Projection { name: String, reason: String },
}

impl ProjectionError {
    pub fn projection(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Projection {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;
