//! Exclusive, reconnecting reads of a bounded batch of events.
//!
//! A catchup first takes the named lock ([`ExclusiveCatchupQuery::lock`]),
//! reads its cursors while holding it, and only then opens the batch
//! ([`LockedCatchup::start_at`]). The query holds the lock for as long as it
//! lives.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use event_store::{
    EventFilter, EventId, EventStore, EventStoreError, EventStream, LockGuard, NamedLock,
    StoredEvent,
};
use futures_util::StreamExt;

/// Default number of times a query re-opens its reader after transient faults.
pub const DEFAULT_MAX_READER_RECONNECTS: u32 = 5;

/// A held catchup lock, before the batch has been sized.
pub struct LockedCatchup<S: EventStore + NamedLock> {
    store: S,
    guard: S::Guard,
    lock_timeout: Duration,
    cancel: Arc<AtomicBool>,
    max_reconnects: u32,
}

impl<S: EventStore + NamedLock> LockedCatchup<S> {
    /// Sets how many transient reader faults the query recovers from.
    pub fn with_max_reconnects(mut self, max_reconnects: u32) -> Self {
        self.max_reconnects = max_reconnects;
        self
    }

    pub fn lock_name(&self) -> &str {
        self.guard.name()
    }

    /// Sizes the batch: every event from `start` matching `filter`, capped at
    /// `batch_size`.
    pub async fn start_at(
        self,
        start: EventId,
        filter: EventFilter,
        batch_size: u64,
    ) -> event_store::Result<ExclusiveCatchupQuery<S>> {
        let total_matched = self.store.count_matching(start, &filter).await?;
        let expected = total_matched.min(batch_size);
        tracing::debug!(
            lock = self.guard.name(),
            start = %start,
            total_matched,
            expected,
            "starting exclusive catchup query"
        );

        Ok(ExclusiveCatchupQuery {
            lock_name: self.guard.name().to_string(),
            store: self.store,
            guard: Some(self.guard),
            lock_timeout: self.lock_timeout,
            cancel: self.cancel,
            filter,
            next_id: start,
            total_matched,
            expected,
            received: 0,
            reader: None,
            reconnects: 0,
            max_reconnects: self.max_reconnects,
            requeried: false,
            done: false,
        })
    }
}

/// A bounded, ordered sequence of events read under an exclusive lock.
///
/// Events are pulled one at a time with [`next`](Self::next). The query
/// tracks the id after the last yielded event, so when the reader fails with
/// a transient fault it re-opens a reader at that id instead of abandoning
/// the batch. It stops when the expected number of events has been yielded,
/// when the log has nothing more to give, when the cancel flag is raised, or
/// when the lock is found to be lost.
pub struct ExclusiveCatchupQuery<S: EventStore + NamedLock> {
    store: S,
    guard: Option<S::Guard>,
    lock_name: String,
    lock_timeout: Duration,
    cancel: Arc<AtomicBool>,
    filter: EventFilter,
    next_id: EventId,
    total_matched: u64,
    expected: u64,
    received: u64,
    reader: Option<EventStream>,
    reconnects: u32,
    max_reconnects: u32,
    requeried: bool,
    done: bool,
}

impl<S: EventStore + NamedLock> ExclusiveCatchupQuery<S> {
    /// Takes the lock `name`, waiting up to `timeout`.
    ///
    /// Returns `None` when another owner holds the lock for the whole wait.
    pub async fn lock(
        store: S,
        name: &str,
        timeout: Duration,
        cancel: Arc<AtomicBool>,
    ) -> event_store::Result<Option<LockedCatchup<S>>> {
        let Some(guard) = store.acquire(name, timeout).await? else {
            tracing::debug!(lock = name, "catchup lock is held elsewhere");
            return Ok(None);
        };
        Ok(Some(LockedCatchup {
            store,
            guard,
            lock_timeout: timeout,
            cancel,
            max_reconnects: DEFAULT_MAX_READER_RECONNECTS,
        }))
    }

    /// Events from the start id matching the filter, before the batch cap.
    pub fn total_matched(&self) -> u64 {
        self.total_matched
    }

    /// Number of events this batch will yield if nothing goes wrong.
    pub fn expected(&self) -> u64 {
        self.expected
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// The id the next read starts from.
    pub fn next_id(&self) -> EventId {
        self.next_id
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    /// Yields the next event of the batch, or `None` once the batch is over.
    ///
    /// An `Err` is returned only for faults that are not transient or after
    /// the reconnect budget is spent; the query is finished afterwards.
    pub async fn next(&mut self) -> Option<event_store::Result<StoredEvent>> {
        loop {
            if self.done || self.received >= self.expected {
                return None;
            }
            if self.cancel.load(Ordering::SeqCst) {
                tracing::debug!(lock = %self.lock_name, "catchup query cancelled");
                self.done = true;
                return None;
            }
            let held = match self.guard.as_mut() {
                Some(guard) => guard.is_held().await,
                None => false,
            };
            if !held {
                tracing::warn!(lock = %self.lock_name, received = self.received, "catchup lock lost mid-batch");
                self.done = true;
                return None;
            }

            if self.reader.is_none() {
                let remaining = self.expected - self.received;
                match self.store.read_events(self.next_id, &self.filter, remaining).await {
                    Ok(reader) => self.reader = Some(reader),
                    Err(e) if e.is_transient() => {
                        if let Some(fatal) = self.reconnect(e).await {
                            return fatal;
                        }
                        continue;
                    }
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
            }
            let Some(reader) = self.reader.as_mut() else {
                continue;
            };

            match reader.next().await {
                Some(Ok(event)) => {
                    if event.id < self.next_id {
                        continue;
                    }
                    self.next_id = event.id.next();
                    self.received += 1;
                    self.requeried = false;
                    return Some(Ok(event));
                }
                Some(Err(e)) if e.is_transient() => {
                    self.reader = None;
                    if let Some(fatal) = self.reconnect(e).await {
                        return fatal;
                    }
                }
                Some(Err(e)) => {
                    self.reader = None;
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.reader = None;
                    // The count said there was more: look once more from the
                    // cursor before concluding the log is exhausted.
                    if self.requeried {
                        self.done = true;
                        return None;
                    }
                    self.requeried = true;
                }
            }
        }
    }

    /// Prepares to re-open the reader after `fault`. Returns `Some` when the
    /// query has to end instead.
    async fn reconnect(
        &mut self,
        fault: EventStoreError,
    ) -> Option<Option<event_store::Result<StoredEvent>>> {
        if self.reconnects >= self.max_reconnects {
            tracing::warn!(lock = %self.lock_name, error = %fault, "reader reconnect budget exhausted");
            self.done = true;
            return Some(Some(Err(fault)));
        }
        self.reconnects += 1;
        metrics::counter!("catchup_reader_reconnects_total").increment(1);
        tracing::info!(
            lock = %self.lock_name,
            next_id = %self.next_id,
            attempt = self.reconnects,
            error = %fault,
            "event reader failed, reconnecting"
        );

        let still_held = match self.guard.as_mut() {
            Some(guard) => guard.is_held().await,
            None => false,
        };
        if still_held {
            return None;
        }

        self.guard = None;
        match self.store.acquire(&self.lock_name, self.lock_timeout).await {
            Ok(Some(guard)) => {
                self.guard = Some(guard);
                None
            }
            Ok(None) => {
                tracing::warn!(lock = %self.lock_name, "could not reacquire catchup lock after reader fault");
                self.done = true;
                Some(None)
            }
            Err(e) => {
                self.done = true;
                Some(Some(Err(e)))
            }
        }
    }

    /// Ends the query and releases the lock.
    pub async fn finish(mut self) {
        self.reader = None;
        if let Some(guard) = self.guard.take() {
            guard.release().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::AggregateId;
    use event_store::{EventStoreExt, InMemoryEventStore, Interest, NewEvent};

    const LOCK: &str = "catchup:test";

    async fn store_with_events(count: i64) -> InMemoryEventStore {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        for seq in 1..=count {
            store
                .append_event(
                    NewEvent::builder()
                        .stream_name("Order")
                        .event_type("Placed")
                        .aggregate_id(id)
                        .sequence_number(seq)
                        .body_raw("{}")
                        .build(),
                )
                .await
                .unwrap();
        }
        store
    }

    async fn open(
        store: &InMemoryEventStore,
        start: u64,
        batch_size: u64,
    ) -> ExclusiveCatchupQuery<InMemoryEventStore> {
        ExclusiveCatchupQuery::lock(
            store.clone(),
            LOCK,
            Duration::from_millis(50),
            Arc::new(AtomicBool::new(false)),
        )
        .await
        .unwrap()
        .expect("lock should be free")
        .start_at(EventId::new(start), EventFilter::everything(), batch_size)
        .await
        .unwrap()
    }

    async fn drain(query: &mut ExclusiveCatchupQuery<InMemoryEventStore>) -> Vec<u64> {
        let mut ids = Vec::new();
        while let Some(event) = query.next().await {
            ids.push(event.unwrap().id.as_u64());
        }
        ids
    }

    #[tokio::test]
    async fn batch_is_capped() {
        let store = store_with_events(10).await;
        let mut query = open(&store, 3, 4).await;

        assert_eq!(query.total_matched(), 8);
        assert_eq!(query.expected(), 4);
        assert_eq!(drain(&mut query).await, vec![3, 4, 5, 6]);
        assert_eq!(query.next_id(), EventId::new(7));
    }

    #[tokio::test]
    async fn second_locker_gets_nothing() {
        let store = store_with_events(1).await;
        let query = open(&store, 0, 10).await;

        let second = ExclusiveCatchupQuery::lock(
            store.clone(),
            LOCK,
            Duration::from_millis(20),
            Arc::new(AtomicBool::new(false)),
        )
        .await
        .unwrap();
        assert!(second.is_none());

        query.finish().await;
        assert!(!store.locks().is_locked(LOCK));
    }

    #[tokio::test]
    async fn dropping_query_releases_lock() {
        let store = store_with_events(1).await;
        let query = open(&store, 0, 10).await;
        assert!(store.locks().is_locked(LOCK));
        drop(query);
        assert!(!store.locks().is_locked(LOCK));
    }

    #[tokio::test]
    async fn resumes_after_reader_fault() {
        let store = store_with_events(10).await;
        let mut query = open(&store, 0, 100).await;
        store.fail_next_read_after(4);

        assert_eq!(drain(&mut query).await, (1..=10).collect::<Vec<_>>());
        assert_eq!(query.reconnects(), 1);
    }

    #[tokio::test]
    async fn gives_up_after_reconnect_budget() {
        let store = store_with_events(5).await;
        let mut query = ExclusiveCatchupQuery::lock(
            store.clone(),
            LOCK,
            Duration::from_millis(50),
            Arc::new(AtomicBool::new(false)),
        )
        .await
        .unwrap()
        .unwrap()
        .with_max_reconnects(0)
        .start_at(EventId::NONE, EventFilter::everything(), 100)
        .await
        .unwrap();
        store.fail_next_read_after(2);

        assert!(query.next().await.unwrap().is_ok());
        assert!(query.next().await.unwrap().is_ok());
        assert!(query.next().await.unwrap().unwrap_err().is_transient());
        assert!(query.next().await.is_none());
    }

    #[tokio::test]
    async fn stops_when_lock_is_lost() {
        let store = store_with_events(5).await;
        let mut query = open(&store, 0, 100).await;

        assert!(query.next().await.is_some());
        store.locks().force_release(LOCK);
        assert!(query.next().await.is_none());
        assert_eq!(query.received(), 1);
    }

    #[tokio::test]
    async fn stops_when_cancelled() {
        let store = store_with_events(5).await;
        let cancel = Arc::new(AtomicBool::new(false));
        let mut query = ExclusiveCatchupQuery::lock(
            store.clone(),
            LOCK,
            Duration::from_millis(50),
            Arc::clone(&cancel),
        )
        .await
        .unwrap()
        .unwrap()
        .start_at(EventId::NONE, EventFilter::everything(), 100)
        .await
        .unwrap();

        assert!(query.next().await.is_some());
        cancel.store(true, Ordering::SeqCst);
        assert!(query.next().await.is_none());
    }

    #[tokio::test]
    async fn filter_applies_to_count_and_read() {
        let store = store_with_events(3).await;
        let filter = EventFilter::from_interests(&[Interest::event("Order", "Shipped")]);
        let query = ExclusiveCatchupQuery::lock(
            store.clone(),
            LOCK,
            Duration::from_millis(50),
            Arc::new(AtomicBool::new(false)),
        )
        .await
        .unwrap()
        .unwrap()
        .start_at(EventId::NONE, filter, 100)
        .await
        .unwrap();
        assert_eq!(query.expected(), 0);
    }
}
