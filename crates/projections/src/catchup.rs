//! Read model catchup.
//!
//! A [`ReadModelCatchup`] replays the event log to a fixed set of projectors.
//! Each run takes the catchup's named lock, resumes from the projectors'
//! durable cursors and streams one bounded batch through the [`EventBus`].
//! Every event is offered to each subscribed projector in its own unit of
//! work together with that projector's progress row, so a projector's side
//! effects and its cursor move together.
//!
//! Failures are reported, not retried: a malformed body or a failing
//! projector is recorded as an [`EventHandlingError`] and the batch moves on.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use event_store::{
    EventFilter, EventId, EventStore, Interest, NamedLock, StoredEvent,
};
use futures_core::Stream;
use futures_util::{StreamExt, stream};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::bus::EventBus;
use crate::exclusive_query::{DEFAULT_MAX_READER_RECONNECTS, ExclusiveCatchupQuery};
use crate::projector::{EventEnvelope, Projector, duplicate_names, read_model_name};
use crate::read_model_info::{EventHandlingError, ReadModelInfo};
use crate::status::ReadModelCatchupStatus;
use crate::store::{ReadModelStore, UnitOfWork};
use crate::{ProjectionError, Result};

const STATUS_CHANNEL_CAPACITY: usize = 1024;

/// Tuning for a catchup.
#[derive(Debug, Clone)]
pub struct CatchupConfig {
    /// Most events processed by one run.
    pub batch_size: u64,
    /// How long a run waits for the catchup lock.
    pub lock_timeout: Duration,
    /// Never start a batch before this event, whatever the cursors say.
    pub start_at_event_id: Option<EventId>,
    pub max_reader_reconnects: u32,
}

impl Default for CatchupConfig {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            lock_timeout: Duration::from_secs(5),
            start_at_event_id: None,
            max_reader_reconnects: DEFAULT_MAX_READER_RECONNECTS,
        }
    }
}

/// Result of one [`ReadModelCatchup::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchupOutcome {
    /// Another run of this catchup is in progress in this process.
    AlreadyInProgress,
    RanButNoNewEvents,
    RanAndHandledNewEvents,
}

#[derive(Debug, Clone, Copy, Default)]
struct BatchCompletion {
    batches: u64,
    /// `None` when the batch failed.
    outcome: Option<CatchupOutcome>,
}

/// Builder for [`ReadModelCatchup`].
pub struct ReadModelCatchupBuilder<S, R: ReadModelStore> {
    event_store: S,
    read_models: R,
    projectors: Vec<Arc<dyn Projector<R::UnitOfWork>>>,
    name: Option<String>,
    config: CatchupConfig,
}

impl<S, R> ReadModelCatchupBuilder<S, R>
where
    S: EventStore + NamedLock + Clone + 'static,
    R: ReadModelStore + 'static,
{
    pub fn projector(mut self, projector: impl Projector<R::UnitOfWork> + 'static) -> Self {
        self.projectors.push(Arc::new(projector));
        self
    }

    pub fn shared_projector(mut self, projector: Arc<dyn Projector<R::UnitOfWork>>) -> Self {
        self.projectors.push(projector);
        self
    }

    /// Name of the catchup and of its lock. Competing instances must agree
    /// on it. Defaults to a name derived from the read model names.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn config(mut self, config: CatchupConfig) -> Self {
        self.config = config;
        self
    }

    pub fn batch_size(mut self, batch_size: u64) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    pub fn lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.config.lock_timeout = lock_timeout;
        self
    }

    pub fn start_at_event_id(mut self, id: EventId) -> Self {
        self.config.start_at_event_id = Some(id);
        self
    }

    /// Resolves read model names and the combined filter.
    ///
    /// Fails with [`ProjectionError::DuplicateReadModelNames`] when two
    /// projectors resolve to the same name.
    pub fn build(self) -> Result<ReadModelCatchup<S, R>> {
        let names: Vec<String> = self
            .projectors
            .iter()
            .map(|p| read_model_name(p.as_ref()))
            .collect();
        let duplicates = duplicate_names(&names);
        if !duplicates.is_empty() {
            return Err(ProjectionError::DuplicateReadModelNames(duplicates));
        }

        let interests: Vec<Vec<Interest>> = self.projectors.iter().map(|p| p.interests()).collect();
        let filter = EventFilter::from_interests(interests.iter().flatten());

        let name = self.name.unwrap_or_else(|| {
            let mut sorted = names.clone();
            sorted.sort();
            format!("ReadModelCatchup:{}", sorted.join(","))
        });

        let (status, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let (batches, _) = watch::channel(BatchCompletion::default());

        Ok(ReadModelCatchup {
            inner: Arc::new(Inner {
                name,
                event_store: self.event_store,
                read_models: self.read_models,
                projectors: self.projectors,
                names,
                interests,
                filter,
                config: self.config,
                running: AtomicBool::new(false),
                cancel: Arc::new(AtomicBool::new(false)),
                last_processed: AtomicU64::new(0),
                status,
                batches,
            }),
        })
    }
}

/// Replays events to a set of projectors with durable per-projector progress.
///
/// Cheap to clone; clones drive the same catchup.
pub struct ReadModelCatchup<S, R: ReadModelStore> {
    inner: Arc<Inner<S, R>>,
}

impl<S, R: ReadModelStore> Clone for ReadModelCatchup<S, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<S, R: ReadModelStore> {
    name: String,
    event_store: S,
    read_models: R,
    projectors: Vec<Arc<dyn Projector<R::UnitOfWork>>>,
    names: Vec<String>,
    interests: Vec<Vec<Interest>>,
    filter: EventFilter,
    config: CatchupConfig,
    running: AtomicBool,
    cancel: Arc<AtomicBool>,
    last_processed: AtomicU64,
    status: broadcast::Sender<ReadModelCatchupStatus>,
    batches: watch::Sender<BatchCompletion>,
}

impl<S, R> ReadModelCatchup<S, R>
where
    S: EventStore + NamedLock + Clone + 'static,
    R: ReadModelStore + 'static,
{
    pub fn builder(event_store: S, read_models: R) -> ReadModelCatchupBuilder<S, R> {
        ReadModelCatchupBuilder {
            event_store,
            read_models,
            projectors: Vec::new(),
            name: None,
            config: CatchupConfig::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Read model names, in projector order.
    pub fn read_model_names(&self) -> &[String] {
        &self.inner.names
    }

    /// The combined filter of every projector's interests.
    pub fn filter(&self) -> &EventFilter {
        &self.inner.filter
    }

    pub fn event_store(&self) -> &S {
        &self.inner.event_store
    }

    pub fn read_models(&self) -> &R {
        &self.inner.read_models
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Receives every status report from now on.
    pub fn subscribe_status(&self) -> broadcast::Receiver<ReadModelCatchupStatus> {
        self.inner.status.subscribe()
    }

    /// Status reports as a stream. A subscriber that falls behind skips the
    /// reports it missed instead of failing.
    pub fn progress(&self) -> impl Stream<Item = ReadModelCatchupStatus> + Send + 'static {
        stream::unfold(self.inner.status.subscribe(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(status) => return Some((status, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "catchup status subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }

    /// Runs one batch, unless a run of this catchup is already in progress
    /// in this process.
    #[tracing::instrument(skip(self), fields(catchup = %self.inner.name))]
    pub async fn run(&self) -> Result<CatchupOutcome> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(CatchupOutcome::AlreadyInProgress);
        }

        let mut running = RunningFlag::new(&self.inner.running);
        let result = self.inner.run_batch(&mut running).await;
        running.clear();

        if let Err(e) = &result {
            tracing::error!(error = %e, "catchup batch failed");
        }
        self.inner.batches.send_modify(|completion| {
            completion.batches += 1;
            completion.outcome = result.as_ref().ok().copied();
        });
        result
    }

    /// Runs a batch, or waits for the batch already in flight to finish.
    pub async fn single_batch(&self) -> Result<CatchupOutcome> {
        let mut completions = self.inner.batches.subscribe();
        completions.borrow_and_update();

        match self.run().await? {
            CatchupOutcome::AlreadyInProgress => {
                if completions.changed().await.is_err() {
                    return Ok(CatchupOutcome::AlreadyInProgress);
                }
                let completion = *completions.borrow_and_update();
                completion
                    .outcome
                    .ok_or_else(|| ProjectionError::projection("in-flight catchup batch failed"))
            }
            outcome => Ok(outcome),
        }
    }

    /// Runs the catchup every `interval` until the handle is stopped.
    pub fn poll_event_store(&self, interval: Duration) -> PollingHandle {
        let ticks = stream::unfold(tokio::time::interval(interval), |mut interval| async move {
            interval.tick().await;
            Some(((), interval))
        });
        self.poll_with_trigger(ticks)
    }

    /// Runs the catchup whenever `trigger` yields, until the handle is stopped
    /// or the trigger ends.
    ///
    /// After a batch that handled events, the catchup runs again straight
    /// away if the log has grown past the last event it processed.
    pub fn poll_with_trigger<T>(&self, trigger: T) -> PollingHandle
    where
        T: Stream<Item = ()> + Send + 'static,
    {
        let (stop_tx, stop_rx) = oneshot::channel();
        let catchup = self.clone();
        let task = tokio::spawn(async move {
            catchup.polling_loop(Box::pin(trigger), stop_rx).await;
        });
        PollingHandle {
            stop: Some(stop_tx),
            task: Some(task),
        }
    }

    async fn polling_loop(
        &self,
        mut trigger: Pin<Box<dyn Stream<Item = ()> + Send>>,
        mut stop: oneshot::Receiver<()>,
    ) {
        let mut again = false;
        loop {
            if again {
                if !matches!(stop.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
                    break;
                }
            } else {
                tokio::select! {
                    _ = &mut stop => break,
                    tick = trigger.next() => {
                        if tick.is_none() {
                            break;
                        }
                    }
                }
            }

            again = match self.run().await {
                Ok(CatchupOutcome::RanAndHandledNewEvents) => self.log_has_grown().await,
                Ok(_) => false,
                Err(e) => {
                    tracing::warn!(catchup = %self.inner.name, error = %e, "polled catchup failed");
                    false
                }
            };
        }
        tracing::debug!(catchup = %self.inner.name, "catchup polling stopped");
    }

    async fn log_has_grown(&self) -> bool {
        match self.inner.event_store.latest_event_id().await {
            Ok(latest) => latest.as_u64() > self.inner.last_processed.load(Ordering::SeqCst),
            Err(e) => {
                tracing::warn!(error = %e, "could not read latest event id");
                false
            }
        }
    }

    /// Stops the catchup. A batch in flight ends at its next event and
    /// releases the lock; later runs do nothing.
    pub fn dispose(&self) {
        self.inner.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.cancel.load(Ordering::SeqCst)
    }
}

impl<S, R> Inner<S, R>
where
    S: EventStore + NamedLock + Clone + 'static,
    R: ReadModelStore + 'static,
{
    fn publish(&self, status: ReadModelCatchupStatus) {
        // No subscribers is fine
        let _ = self.status.send(status);
    }

    async fn run_batch(&self, running: &mut RunningFlag<'_>) -> Result<CatchupOutcome> {
        if self.cancel.load(Ordering::SeqCst) {
            tracing::debug!("catchup is disposed");
            return Ok(CatchupOutcome::RanButNoNewEvents);
        }
        let active: Vec<usize> = (0..self.projectors.len())
            .filter(|&i| !self.interests[i].is_empty())
            .collect();
        if active.is_empty() {
            self.publish(ReadModelCatchupStatus::empty_batch(&self.name));
            return Ok(CatchupOutcome::RanButNoNewEvents);
        }

        let locked = ExclusiveCatchupQuery::lock(
            self.event_store.clone(),
            &self.name,
            self.config.lock_timeout,
            Arc::clone(&self.cancel),
        )
        .await?;
        let Some(locked) = locked else {
            tracing::info!("catchup lock is held by another instance");
            self.publish(ReadModelCatchupStatus::empty_batch(&self.name));
            return Ok(CatchupOutcome::RanButNoNewEvents);
        };

        // Cursors are read only under the lock
        let mut progress = self.read_models.load_progress(&self.names).await?;

        let min_cursor = active
            .iter()
            .map(|&i| progress[i].current_as_of_event_id)
            .min()
            .unwrap_or(EventId::NONE);
        let mut start = min_cursor.next();
        if let Some(floor) = self.config.start_at_event_id {
            start = start.max(floor);
        }

        let mut query = locked
            .with_max_reconnects(self.config.max_reader_reconnects)
            .start_at(start, self.filter.clone(), self.config.batch_size)
            .await?;
        let expected = query.expected();
        if expected == 0 {
            query.finish().await;
            self.publish(ReadModelCatchupStatus::empty_batch(&self.name));
            return Ok(CatchupOutcome::RanButNoNewEvents);
        }

        let batch_started = Instant::now();
        let now = Utc::now();
        let mut bus = EventBus::new();
        let mut waiting = Vec::new();
        for &i in &active {
            if progress[i].current_as_of_event_id.next() <= start {
                bus.subscribe(i, &self.interests[i]);
                progress[i].begin_batch(expected, now);
            } else {
                waiting.push(i);
            }
        }
        tracing::info!(start = %start, expected, subscribed = bus.subscribed().len(), "catchup batch starting");
        self.publish(ReadModelCatchupStatus::start_of_batch(&self.name, expected));

        let mut processed: u64 = 0;
        while let Some(next) = query.next().await {
            let event = match next {
                Ok(event) => event,
                Err(e) => {
                    query.finish().await;
                    return Err(e.into());
                }
            };

            waiting.retain(|&i| {
                if progress[i].current_as_of_event_id < event.id {
                    bus.subscribe(i, &self.interests[i]);
                    progress[i].begin_batch(expected - processed, Utc::now());
                    tracing::debug!(projector = %self.names[i], event_id = %event.id, "subscribing projector mid-batch");
                    false
                } else {
                    true
                }
            });

            match EventEnvelope::parse(&event) {
                Ok(envelope) => {
                    let routed = bus.route(&envelope.stream_name, &envelope.event_type);
                    let mut subscribed = bus.subscribed().to_vec();
                    subscribed.sort_unstable();
                    for i in subscribed {
                        let offered = routed.contains(&i).then_some(&envelope);
                        self.offer(i, &event, offered, &mut progress[i]).await?;
                    }
                }
                Err(e) => {
                    tracing::warn!(event_id = %event.id, event_type = %event.event_type, error = %e, "could not parse event body");
                    self.record_error(EventHandlingError::new(&event, &self.name, &e)).await;
                    for &i in bus.subscribed() {
                        self.offer(i, &event, None, &mut progress[i]).await?;
                    }
                }
            }

            processed += 1;
            self.last_processed.fetch_max(event.id.as_u64(), Ordering::SeqCst);
            metrics::counter!("catchup_events_processed_total", "catchup" => self.name.clone()).increment(1);
            tracing::debug!(event_id = %event.id, processed, "event processed");

            let written_at = event.timestamp;
            self.publish(ReadModelCatchupStatus {
                catchup_name: self.name.clone(),
                batch_count: expected,
                current_event_id: Some(event.id),
                number_of_events_processed: processed,
                event_timestamp: Some(written_at),
                latency_ms: Some((Utc::now() - written_at).num_milliseconds().max(0)),
                is_start_of_batch: false,
                is_end_of_batch: processed == expected,
            });
        }

        // Let the next run start while this one releases its lock
        running.clear();
        query.finish().await;

        if processed < expected {
            tracing::info!(processed, expected, "catchup batch ended early");
            self.publish(ReadModelCatchupStatus {
                number_of_events_processed: processed,
                is_start_of_batch: false,
                is_end_of_batch: true,
                ..ReadModelCatchupStatus::start_of_batch(&self.name, expected)
            });
        }

        metrics::counter!("catchup_batches_total", "catchup" => self.name.clone()).increment(1);
        metrics::histogram!("catchup_batch_duration_seconds", "catchup" => self.name.clone())
            .record(batch_started.elapsed().as_secs_f64());
        tracing::info!(
            processed,
            elapsed_ms = batch_started.elapsed().as_millis() as u64,
            "catchup batch complete"
        );

        Ok(if processed > 0 {
            CatchupOutcome::RanAndHandledNewEvents
        } else {
            CatchupOutcome::RanButNoNewEvents
        })
    }

    /// Offers `event` to projector `index` in its own unit of work, handling
    /// it only when `envelope` is given, and advances its cursor.
    async fn offer(
        &self,
        index: usize,
        event: &StoredEvent,
        envelope: Option<&EventEnvelope>,
        info: &mut ReadModelInfo,
    ) -> Result<()> {
        let mut uow = self.read_models.begin().await?;

        if let Some(envelope) = envelope
            && let Err(e) = self.projectors[index].handle(envelope, &mut uow).await
        {
            if let Err(rollback) = uow.rollback().await {
                tracing::warn!(projector = %self.names[index], error = %rollback, "rollback failed");
            }
            self.record_projector_failure(index, event, info, &e).await;
            return Ok(());
        }

        let mut updated = info.clone();
        updated.record_event(event.id, event.timestamp, Utc::now());
        uow.save_progress(&updated).await?;
        uow.commit().await?;
        *info = updated;
        Ok(())
    }

    async fn record_projector_failure(
        &self,
        index: usize,
        event: &StoredEvent,
        info: &mut ReadModelInfo,
        error: &ProjectionError,
    ) {
        let name = &self.names[index];
        tracing::warn!(projector = %name, event_id = %event.id, error = %error, "projector failed to handle event");
        self.record_error(EventHandlingError::new(event, name.as_str(), error))
            .await;

        // The failed event counts as offered: it is reported once, not retried
        let message = error.to_string();
        if let Err(e) = self.read_models.record_failure(name, event.id, &message).await {
            tracing::error!(projector = %name, error = %e, "could not record projector failure");
        }
        info.record_event(event.id, event.timestamp, Utc::now());
        info.failed_on_event_id = Some(event.id);
        info.error = Some(message);
    }

    async fn record_error(&self, error: EventHandlingError) {
        metrics::counter!("catchup_event_handling_errors_total", "catchup" => self.name.clone())
            .increment(1);
        if let Err(e) = self.read_models.record_handling_error(error).await {
            tracing::error!(error = %e, "could not record event handling error");
        }
    }
}

/// The reentrancy flag of a run, held by that run. Cleared once: early on
/// normal completion, or on drop.
struct RunningFlag<'a> {
    flag: &'a AtomicBool,
    cleared: bool,
}

impl<'a> RunningFlag<'a> {
    fn new(flag: &'a AtomicBool) -> Self {
        Self {
            flag,
            cleared: false,
        }
    }

    fn clear(&mut self) {
        if !self.cleared {
            self.cleared = true;
            self.flag.store(false, Ordering::SeqCst);
        }
    }
}

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Handle to a background polling task.
///
/// Dropping the handle stops polling after the current run.
pub struct PollingHandle {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl PollingHandle {
    /// Stops polling and waits for the current run to finish.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            tracing::warn!(error = %e, "catchup polling task failed");
        }
    }
}

impl Drop for PollingHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}
