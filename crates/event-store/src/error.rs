use thiserror::Error;

use crate::AggregateId;

/// Errors that can occur when interacting with the event store.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// An event with the same stream, aggregate and sequence number
    /// has already been recorded.
    #[error(
        "Concurrency conflict: {stream_name} {aggregate_id} already has an event with sequence number {sequence_number}"
    )]
    ConcurrencyConflict {
        stream_name: String,
        aggregate_id: AggregateId,
        sequence_number: i64,
    },

    /// The events passed to `append` are not a valid batch.
    #[error("Invalid append: {0}")]
    InvalidAppend(String),

    /// The reader backing an event stream went away mid-read.
    #[error("Event reader closed: {0}")]
    ReaderClosed(String),

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
    /// Returns true for faults that a reader can recover from by reconnecting
    /// and re-issuing its query.
    pub fn is_transient(&self) -> bool {
        match self {
            EventStoreError::ReaderClosed(_) => true,
            EventStoreError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }

    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, EventStoreError::ConcurrencyConflict { .. })
    }
}

/// Result type for event store operations.
pub type Result<T> = std::result::Result<T, EventStoreError>;
