//! Domain error types.

use common::AggregateId;
use event_store::EventStoreError;
use thiserror::Error;

/// Errors that can occur during domain operations.
#[derive(Debug, Error)]
pub enum DomainError {
    /// Another writer recorded events on the aggregate since it was loaded.
    #[error("Concurrency conflict on {aggregate_type} {aggregate_id} at version {expected_version}")]
    Concurrency {
        aggregate_type: &'static str,
        aggregate_id: AggregateId,
        expected_version: i64,
    },

    /// The aggregate refused the command.
    #[error("{command} rejected by {aggregate_type}: {source}")]
    Rejected {
        aggregate_type: &'static str,
        command: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An error occurred in the event store.
    #[error("Event store error: {0}")]
    EventStore(EventStoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DomainError {
    pub fn rejected<E>(aggregate_type: &'static str, command: &'static str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        DomainError::Rejected {
            aggregate_type,
            command,
            source: Box::new(source),
        }
    }

    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, DomainError::Concurrency { .. })
    }
}

impl From<EventStoreError> for DomainError {
    fn from(e: EventStoreError) -> Self {
        DomainError::EventStore(e)
    }
}

/// Result type for domain operations.
pub type Result<T> = std::result::Result<T, DomainError>;
