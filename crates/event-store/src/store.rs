use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;

use crate::{AggregateId, ETag, EventFilter, EventId, NewEvent, Result, StoredEvent};

/// A lazily produced, ordered stream of stored events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StoredEvent>> + Send>>;

/// Core trait for event store implementations.
///
/// The store is an append-only log. Every event gets a store-assigned id
/// that orders it against every other event, and readers query forward from
/// an id cursor. All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends events to the store.
    ///
    /// Events are appended atomically - either all succeed or none do.
    /// Fails with `ConcurrencyConflict` if any `(stream, aggregate, sequence)`
    /// is already taken.
    async fn append(&self, events: Vec<NewEvent>) -> Result<Vec<StoredEvent>>;

    /// Streams events with `id >= from`, matching `filter`, in id order,
    /// yielding at most `limit` events.
    async fn read_events(&self, from: EventId, filter: &EventFilter, limit: u64)
    -> Result<EventStream>;

    /// Counts the events `read_events` would yield without a limit.
    async fn count_matching(&self, from: EventId, filter: &EventFilter) -> Result<u64>;

    /// Returns the highest id assigned so far, or `EventId::NONE` when empty.
    async fn latest_event_id(&self) -> Result<EventId>;

    /// Retrieves all events for one aggregate in sequence order.
    async fn events_for_aggregate(
        &self,
        stream_name: &str,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>>;

    /// Finds the first event recorded on `aggregate_id` with the given etag.
    async fn find_by_etag(&self, aggregate_id: AggregateId, etag: &ETag)
    -> Result<Option<StoredEvent>>;

    /// Administrative rename of an event type within a stream.
    ///
    /// Ids and ordering are unchanged. Returns the number of events renamed.
    async fn rename_event_type(&self, stream_name: &str, from: &str, to: &str) -> Result<u64>;
}

/// Extension trait providing convenience methods for event stores.
#[async_trait]
pub trait EventStoreExt: EventStore {
    /// Appends a single event to the store.
    async fn append_event(&self, event: NewEvent) -> Result<StoredEvent> {
        let mut stored = self.append(vec![event]).await?;
        stored
            .pop()
            .ok_or_else(|| crate::EventStoreError::InvalidAppend("append returned no events".into()))
    }

    /// Returns the highest sequence number recorded for an aggregate, or 0.
    async fn stream_version(&self, stream_name: &str, aggregate_id: AggregateId) -> Result<i64> {
        Ok(self
            .events_for_aggregate(stream_name, aggregate_id)
            .await?
            .iter()
            .map(|e| e.sequence_number)
            .max()
            .unwrap_or(0))
    }

    /// Reads every matching event from `from` onward into memory.
    async fn collect_events(&self, from: EventId, filter: &EventFilter) -> Result<Vec<StoredEvent>> {
        use futures_util::TryStreamExt;

        self.read_events(from, filter, u64::MAX)
            .await?
            .try_collect()
            .await
    }
}

// Blanket implementation for all EventStore implementations
impl<T: EventStore + ?Sized> EventStoreExt for T {}

/// Validates events before appending.
///
/// A batch must be non-empty, target one aggregate of one stream, and carry
/// consecutive sequence numbers.
pub fn validate_new_events(events: &[NewEvent]) -> std::result::Result<(), String> {
    let Some(first) = events.first() else {
        return Err("Cannot append empty event list".to_string());
    };

    for event in events.iter().skip(1) {
        if event.aggregate_id != first.aggregate_id {
            return Err("All events must be for the same aggregate".to_string());
        }
        if event.stream_name != first.stream_name {
            return Err("All events must be for the same stream".to_string());
        }
    }

    let mut expected = first.sequence_number;
    for event in events.iter().skip(1) {
        expected += 1;
        if event.sequence_number != expected {
            return Err(format!(
                "Event sequence numbers must be consecutive. Expected {}, got {}",
                expected, event.sequence_number
            ));
        }
    }

    Ok(())
}
