use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use tokio::sync::RwLock;

use crate::{
    AggregateId, ETag, EventFilter, EventId, EventStoreError, InMemoryLockGuard,
    InMemoryNamedLock, NamedLock, NewEvent, Result, StoredEvent,
    store::{EventStore, EventStream, validate_new_events},
};

#[derive(Default)]
struct EventLog {
    events: Vec<StoredEvent>,
    keys: HashSet<(String, AggregateId, i64)>,
}

/// In-memory event store implementation for testing.
///
/// This implementation stores all events in memory and provides
/// the same interface as the PostgreSQL implementation, including named
/// locks shared by every clone of the store.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    log: Arc<RwLock<EventLog>>,
    locks: InMemoryNamedLock,
    read_fault: Arc<Mutex<Option<usize>>>,
}

impl InMemoryEventStore {
    /// Creates a new empty in-memory event store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of events stored.
    pub async fn event_count(&self) -> usize {
        self.log.read().await.events.len()
    }

    /// Returns the lock table backing `NamedLock` for this store.
    pub fn locks(&self) -> &InMemoryNamedLock {
        &self.locks
    }

    /// Makes the next `read_events` stream yield `after` events and then fail
    /// with `ReaderClosed`, as a dropped database connection would.
    pub fn fail_next_read_after(&self, after: usize) {
        *self.read_fault.lock().unwrap_or_else(|e| e.into_inner()) = Some(after);
    }

    /// Overwrites the body of a stored event.
    ///
    /// Only for tests that need a malformed payload in the log.
    pub async fn corrupt_body(&self, id: EventId, body: impl Into<String>) {
        let mut log = self.log.write().await;
        if let Some(event) = log.events.get_mut(index_of(id)) {
            event.body = body.into();
        }
    }

    fn take_read_fault(&self) -> Option<usize> {
        self.read_fault
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

fn index_of(id: EventId) -> usize {
    (id.as_u64() as usize).saturating_sub(1)
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, events: Vec<NewEvent>) -> Result<Vec<StoredEvent>> {
        validate_new_events(&events).map_err(EventStoreError::InvalidAppend)?;

        let mut log = self.log.write().await;

        // Unique (stream, aggregate, sequence) - all or nothing
        for event in &events {
            let key = (
                event.stream_name.clone(),
                event.aggregate_id,
                event.sequence_number,
            );
            if log.keys.contains(&key) {
                return Err(EventStoreError::ConcurrencyConflict {
                    stream_name: event.stream_name.clone(),
                    aggregate_id: event.aggregate_id,
                    sequence_number: event.sequence_number,
                });
            }
        }

        let mut stored = Vec::with_capacity(events.len());
        for event in events {
            let id = EventId::new(log.events.len() as u64 + 1);
            log.keys.insert((
                event.stream_name.clone(),
                event.aggregate_id,
                event.sequence_number,
            ));
            let event = event.into_stored(id);
            log.events.push(event.clone());
            stored.push(event);
        }

        metrics::counter!("event_store_events_appended_total").increment(stored.len() as u64);
        Ok(stored)
    }

    async fn read_events(
        &self,
        from: EventId,
        filter: &EventFilter,
        limit: u64,
    ) -> Result<EventStream> {
        let log = self.log.read().await;
        let start = index_of(from.max(EventId::new(1)));
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        let events: Vec<StoredEvent> = log
            .events
            .iter()
            .skip(start)
            .filter(|e| filter.matches_event(e))
            .take(limit)
            .cloned()
            .collect();
        drop(log);

        match self.take_read_fault() {
            Some(after) => {
                let yielded = events.into_iter().take(after).map(Ok);
                let fault = std::iter::once(Err(EventStoreError::ReaderClosed(format!(
                    "injected fault after {after} events"
                ))));
                Ok(Box::pin(stream::iter(yielded.chain(fault))))
            }
            None => Ok(Box::pin(stream::iter(events.into_iter().map(Ok)))),
        }
    }

    async fn count_matching(&self, from: EventId, filter: &EventFilter) -> Result<u64> {
        let log = self.log.read().await;
        let start = index_of(from.max(EventId::new(1)));
        Ok(log
            .events
            .iter()
            .skip(start)
            .filter(|e| filter.matches_event(e))
            .count() as u64)
    }

    async fn latest_event_id(&self) -> Result<EventId> {
        Ok(EventId::new(self.log.read().await.events.len() as u64))
    }

    async fn events_for_aggregate(
        &self,
        stream_name: &str,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>> {
        let log = self.log.read().await;
        let mut events: Vec<_> = log
            .events
            .iter()
            .filter(|e| e.aggregate_id == aggregate_id && e.stream_name == stream_name)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.sequence_number);
        Ok(events)
    }

    async fn find_by_etag(
        &self,
        aggregate_id: AggregateId,
        etag: &ETag,
    ) -> Result<Option<StoredEvent>> {
        let log = self.log.read().await;
        Ok(log
            .events
            .iter()
            .find(|e| e.aggregate_id == aggregate_id && e.etag.as_ref() == Some(etag))
            .cloned())
    }

    async fn rename_event_type(&self, stream_name: &str, from: &str, to: &str) -> Result<u64> {
        let mut log = self.log.write().await;
        let mut renamed = 0;
        for event in log
            .events
            .iter_mut()
            .filter(|e| e.stream_name == stream_name && e.event_type == from)
        {
            event.event_type = to.to_string();
            renamed += 1;
        }
        Ok(renamed)
    }
}

#[async_trait]
impl NamedLock for InMemoryEventStore {
    type Guard = InMemoryLockGuard;

    async fn acquire(&self, name: &str, timeout: Duration) -> Result<Option<InMemoryLockGuard>> {
        self.locks.acquire(name, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventStoreExt, Interest};
    use futures_util::StreamExt;

    fn create_test_event(aggregate_id: AggregateId, sequence_number: i64, event_type: &str) -> NewEvent {
        NewEvent::builder()
            .stream_name("TestAggregate")
            .event_type(event_type)
            .aggregate_id(aggregate_id)
            .sequence_number(sequence_number)
            .body_raw(r#"{"test":true}"#)
            .build()
    }

    #[tokio::test]
    async fn append_assigns_increasing_ids() {
        let store = InMemoryEventStore::new();
        let a = AggregateId::new();
        let b = AggregateId::new();

        let first = store
            .append(vec![
                create_test_event(a, 1, "Event1"),
                create_test_event(a, 2, "Event2"),
            ])
            .await
            .unwrap();
        let second = store.append_event(create_test_event(b, 1, "Event1")).await.unwrap();

        assert_eq!(first[0].id, EventId::new(1));
        assert_eq!(first[1].id, EventId::new(2));
        assert_eq!(second.id, EventId::new(3));
        assert_eq!(store.latest_event_id().await.unwrap(), EventId::new(3));
    }

    #[tokio::test]
    async fn duplicate_sequence_number_is_a_concurrency_conflict() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        store.append_event(create_test_event(id, 1, "Event1")).await.unwrap();

        let result = store
            .append(vec![
                create_test_event(id, 1, "Event1"),
                create_test_event(id, 2, "Event2"),
            ])
            .await;

        assert!(matches!(result, Err(EventStoreError::ConcurrencyConflict { .. })));
        // nothing from the failed batch was written
        assert_eq!(store.event_count().await, 1);
    }

    #[tokio::test]
    async fn read_events_respects_cursor_filter_and_limit() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        for seq in 1..=10 {
            let event_type = if seq % 2 == 0 { "Even" } else { "Odd" };
            store
                .append_event(create_test_event(id, seq, event_type))
                .await
                .unwrap();
        }

        let filter = EventFilter::from_interests(&[Interest::event("TestAggregate", "Even")]);
        let events: Vec<_> = store
            .read_events(EventId::new(5), &filter, 2)
            .await
            .unwrap()
            .map(|e| e.unwrap().id.as_u64())
            .collect()
            .await;

        assert_eq!(events, vec![6, 8]);
        assert_eq!(
            store.count_matching(EventId::new(5), &filter).await.unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn injected_fault_closes_reader_once() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        for seq in 1..=5 {
            store.append_event(create_test_event(id, seq, "E")).await.unwrap();
        }
        store.fail_next_read_after(2);

        let results: Vec<_> = store
            .read_events(EventId::NONE, &EventFilter::everything(), 100)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(results.len(), 3);
        assert!(results[2].as_ref().unwrap_err().is_transient());

        // the next reader is healthy
        let all = store
            .collect_events(EventId::NONE, &EventFilter::everything())
            .await
            .unwrap();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn events_for_aggregate_sorted_by_sequence() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        store
            .append(vec![
                create_test_event(id, 1, "A"),
                create_test_event(id, 2, "B"),
            ])
            .await
            .unwrap();
        store.append_event(create_test_event(AggregateId::new(), 1, "A")).await.unwrap();

        let events = store.events_for_aggregate("TestAggregate", id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(store.stream_version("TestAggregate", id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn find_by_etag() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        let mut event = create_test_event(id, 1, "A");
        event.etag = Some(ETag::new("cmd-1"));
        store.append_event(event).await.unwrap();

        assert!(store.find_by_etag(id, &ETag::new("cmd-1")).await.unwrap().is_some());
        assert!(store.find_by_etag(id, &ETag::new("cmd-2")).await.unwrap().is_none());
        assert!(
            store
                .find_by_etag(AggregateId::new(), &ETag::new("cmd-1"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn rename_keeps_ids_and_order() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        store
            .append(vec![
                create_test_event(id, 1, "Old"),
                create_test_event(id, 2, "Other"),
                create_test_event(id, 3, "Old"),
            ])
            .await
            .unwrap();

        let renamed = store.rename_event_type("TestAggregate", "Old", "New").await.unwrap();
        assert_eq!(renamed, 2);

        let events = store
            .collect_events(EventId::NONE, &EventFilter::everything())
            .await
            .unwrap();
        let summary: Vec<_> = events
            .iter()
            .map(|e| (e.id.as_u64(), e.event_type.as_str()))
            .collect();
        assert_eq!(summary, vec![(1, "New"), (2, "Other"), (3, "New")]);
    }

    #[tokio::test]
    async fn clones_share_locks() {
        let store = InMemoryEventStore::new();
        let other = store.clone();

        let _guard = store.acquire("catchup", Duration::ZERO).await.unwrap().unwrap();
        assert!(other.acquire("catchup", Duration::ZERO).await.unwrap().is_none());
    }
}
