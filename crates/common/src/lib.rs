//! Identifiers shared by the event store, catchup engine and scheduler.

mod types;

pub use types::{AggregateId, ETag, EventId, Precondition};
