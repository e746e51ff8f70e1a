//! Scheduler error types.

use chrono::{DateTime, Utc};
use common::AggregateId;
use domain::DomainError;
use event_store::EventStoreError;
use projections::ProjectionError;
use thiserror::Error;

/// Errors that can occur during scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Another writer changed the scheduled command row first.
    #[error("Concurrency conflict on scheduled command {aggregate_id}/{sequence_number}")]
    Concurrency {
        aggregate_id: AggregateId,
        sequence_number: i64,
    },

    /// A clock may only move forward.
    #[error("Clock '{clock}' cannot move backward from {current} to {requested}")]
    ClockMovedBackward {
        clock: String,
        current: DateTime<Utc>,
        requested: DateTime<Utc>,
    },

    #[error("Clock '{0}' already exists")]
    ClockAlreadyExists(String),

    #[error("Clock '{0}' not found")]
    ClockNotFound(String),

    /// The requested clock time is past the representable range.
    #[error("Clock '{clock}' cannot be advanced past {current} by that much")]
    ClockOutOfRange { clock: String, current: DateTime<Utc> },

    /// Scheduler-assigned sequence numbers kept colliding.
    #[error("Could not assign a sequence number for {aggregate_id} after {attempts} attempts")]
    SequenceExhausted {
        aggregate_id: AggregateId,
        attempts: u32,
    },

    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    #[error("Projection error: {0}")]
    Projection(#[from] ProjectionError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SchedulerError {
    /// True for optimistic concurrency failures in any layer. These are
    /// retried by the scheduler rather than counted against a command.
    pub fn is_concurrency_conflict(&self) -> bool {
        match self {
            SchedulerError::Concurrency { .. } => true,
            SchedulerError::Domain(e) => e.is_concurrency_conflict(),
            SchedulerError::EventStore(e) => e.is_concurrency_conflict(),
            _ => false,
        }
    }
}

impl From<SchedulerError> for ProjectionError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::Projection(inner) => inner,
            SchedulerError::EventStore(inner) => ProjectionError::EventStore(inner),
            SchedulerError::Database(inner) => ProjectionError::Database(inner),
            SchedulerError::Serialization(inner) => ProjectionError::Deserialization(inner),
            other => ProjectionError::projection(other.to_string()),
        }
    }
}

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;
