//! Projection error types.

use thiserror::Error;

/// Errors that can occur during read model catchup.
#[derive(Debug, Error)]
pub enum ProjectionError {
    /// An error occurred in the event store.
    #[error("Event store error: {0}")]
    EventStore(#[from] event_store::EventStoreError),

    /// Failed to deserialize an event body.
    #[error("Event deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// A read model database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Two projectors resolved to the same read model name.
    #[error("Duplicate read model names: {}", .0.join(", "))]
    DuplicateReadModelNames(Vec<String>),

    /// A projector failed to handle an event.
    #[error("Projection error: {0}")]
    Projection(String),
}

impl ProjectionError {
    /// Convenience constructor for projector code.
    pub fn projection(message: impl Into<String>) -> Self {
        ProjectionError::Projection(message.into())
    }
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;
