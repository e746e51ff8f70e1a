//! Command handling infrastructure.

use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use common::{AggregateId, ETag, Precondition};
use event_store::{EventStore, NewEvent};
use serde::{Serialize, de::DeserializeOwned};

use crate::aggregate::{Aggregate, DomainEvent};
use crate::error::{DomainError, Result};
use crate::scheduled::{CommandScheduled, is_scheduled_event};

/// Result of command execution.
#[derive(Debug)]
pub struct CommandResult<A: Aggregate> {
    /// The aggregate after applying the new events.
    pub aggregate: A,

    /// The events that were generated and persisted.
    pub events: Vec<A::Event>,

    /// Commands the aggregate scheduled while handling the command.
    pub scheduled: Vec<CommandScheduled>,

    /// The version of the aggregate after the command.
    pub new_version: i64,
}

impl<A: Aggregate> CommandResult<A> {
    /// True when the command recorded nothing, e.g. a repeated etag.
    pub fn is_unchanged(&self) -> bool {
        self.events.is_empty() && self.scheduled.is_empty()
    }
}

/// Trait for commands that can be executed against an aggregate.
///
/// Commands represent an intention to perform an action. They may be rejected
/// if the aggregate's current state doesn't allow the action. Commands are
/// serializable so they can be stored and delivered later by the scheduler.
pub trait Command: Serialize + DeserializeOwned + Send + Sync {
    /// The type of aggregate this command targets.
    type Aggregate: Aggregate;

    /// Stable name used to route a serialized command back to its type.
    const NAME: &'static str;

    /// Returns the ID of the aggregate this command targets.
    fn aggregate_id(&self) -> AggregateId;

    /// Idempotency token. A command whose etag is already recorded on the
    /// aggregate is not applied again.
    fn etag(&self) -> Option<ETag> {
        None
    }

    /// Checks the command against current state before it runs.
    fn validate(
        &self,
        _aggregate: &Self::Aggregate,
    ) -> std::result::Result<(), <Self::Aggregate as Aggregate>::Error> {
        Ok(())
    }

    /// Produces the events that record the command's effect.
    fn execute(
        &self,
        aggregate: &Self::Aggregate,
        ctx: &mut CommandContext,
    ) -> std::result::Result<Vec<<Self::Aggregate as Aggregate>::Event>, <Self::Aggregate as Aggregate>::Error>;
}

/// Ambient inputs and outputs of a single command execution.
///
/// `now` is the time of the clock the command runs against, which is virtual
/// when the scheduler delivers it while advancing a clock.
#[derive(Debug)]
pub struct CommandContext {
    now: DateTime<Utc>,
    clock: Option<String>,
    etag: Option<ETag>,
    scheduled: Vec<CommandScheduled>,
}

impl CommandContext {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            clock: None,
            etag: None,
            scheduled: Vec::new(),
        }
    }

    pub fn with_clock(mut self, clock: Option<String>) -> Self {
        self.clock = clock;
        self
    }

    /// Idempotency token for commands that carry none of their own.
    pub fn with_etag(mut self, etag: Option<ETag>) -> Self {
        self.etag = etag;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn etag(&self) -> Option<&ETag> {
        self.etag.as_ref()
    }

    pub fn clock(&self) -> Option<&str> {
        self.clock.as_deref()
    }

    /// Schedules `command` against this aggregate, due at `due_time` or as
    /// soon as possible when `None`.
    pub fn schedule<C: Command>(
        &mut self,
        command: &C,
        due_time: Option<DateTime<Utc>>,
    ) -> std::result::Result<(), serde_json::Error> {
        self.push_scheduled(command, due_time, None)
    }

    /// Like [`schedule`](Self::schedule), but the command is held back until
    /// `precondition` has been recorded.
    pub fn schedule_after<C: Command>(
        &mut self,
        command: &C,
        due_time: Option<DateTime<Utc>>,
        precondition: Precondition,
    ) -> std::result::Result<(), serde_json::Error> {
        self.push_scheduled(command, due_time, Some(precondition))
    }

    fn push_scheduled<C: Command>(
        &mut self,
        command: &C,
        due_time: Option<DateTime<Utc>>,
        delivery_depends_on: Option<Precondition>,
    ) -> std::result::Result<(), serde_json::Error> {
        self.scheduled.push(CommandScheduled {
            command_name: C::NAME.to_string(),
            command: serde_json::to_value(command)?,
            due_time,
            clock: self.clock.clone(),
            delivery_depends_on,
        });
        Ok(())
    }

    pub fn into_scheduled(self) -> Vec<CommandScheduled> {
        self.scheduled
    }
}

/// Handler for executing commands against aggregates.
///
/// The handler is responsible for:
/// 1. Loading the aggregate by replaying its stream
/// 2. Validating and executing the command to produce events
/// 3. Persisting the events, plus one scheduling event per command the
///    aggregate scheduled, under optimistic concurrency
pub struct CommandHandler<S, A>
where
    S: EventStore,
    A: Aggregate,
{
    store: S,
    _phantom: PhantomData<fn() -> A>,
}

impl<S, A> CommandHandler<S, A>
where
    S: EventStore,
    A: Aggregate,
{
    /// Creates a new command handler with the given event store.
    pub fn new(store: S) -> Self {
        Self {
            store,
            _phantom: PhantomData,
        }
    }

    /// Returns a reference to the underlying event store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Loads an aggregate from the event store.
    ///
    /// If the aggregate doesn't exist, returns a default instance. Scheduling
    /// events advance the version but are not applied.
    pub async fn load(&self, aggregate_id: AggregateId) -> Result<A> {
        let events = self
            .store
            .events_for_aggregate(A::aggregate_type(), aggregate_id)
            .await?;

        let mut aggregate = A::default();
        for stored in events {
            if !is_scheduled_event(&stored.event_type) {
                let event: A::Event = stored.decode()?;
                aggregate.apply(event);
            }
            aggregate.set_version(stored.sequence_number);
        }

        Ok(aggregate)
    }

    /// Loads an aggregate, returning None if it doesn't exist.
    pub async fn load_existing(&self, aggregate_id: AggregateId) -> Result<Option<A>> {
        let aggregate = self.load(aggregate_id).await?;
        Ok(aggregate.id().is_some().then_some(aggregate))
    }

    /// Executes a command at the current wall-clock time.
    pub async fn execute<C>(&self, command: &C) -> Result<CommandResult<A>>
    where
        C: Command<Aggregate = A>,
    {
        self.execute_at(command, CommandContext::new(Utc::now())).await
    }

    /// Executes a command within `ctx` and persists the resulting events.
    #[tracing::instrument(skip(self, command, ctx), fields(command = C::NAME, aggregate_id = %command.aggregate_id()))]
    pub async fn execute_at<C>(&self, command: &C, mut ctx: CommandContext) -> Result<CommandResult<A>>
    where
        C: Command<Aggregate = A>,
    {
        let aggregate_id = command.aggregate_id();
        let mut aggregate = self.load(aggregate_id).await?;
        let current_version = aggregate.version();
        let etag = command.etag().or_else(|| ctx.etag().cloned());

        if let Some(etag) = &etag
            && self.store.find_by_etag(aggregate_id, etag).await?.is_some()
        {
            tracing::debug!(%etag, "command already applied");
            return Ok(CommandResult {
                aggregate,
                events: vec![],
                scheduled: vec![],
                new_version: current_version,
            });
        }

        let rejected = |e| DomainError::rejected(A::aggregate_type(), C::NAME, e);
        command.validate(&aggregate).map_err(rejected)?;
        let events = command.execute(&aggregate, &mut ctx).map_err(rejected)?;
        let scheduled = ctx.into_scheduled();

        if events.is_empty() && scheduled.is_empty() {
            return Ok(CommandResult {
                aggregate,
                events,
                scheduled,
                new_version: current_version,
            });
        }

        let new_events =
            self.build_new_events(aggregate_id, current_version, etag, &events, &scheduled)?;
        let new_version = current_version + new_events.len() as i64;

        self.store.append(new_events).await.map_err(|e| {
            if e.is_concurrency_conflict() {
                DomainError::Concurrency {
                    aggregate_type: A::aggregate_type(),
                    aggregate_id,
                    expected_version: current_version,
                }
            } else {
                DomainError::EventStore(e)
            }
        })?;

        for event in &events {
            aggregate.apply(event.clone());
        }
        aggregate.set_version(new_version);
        metrics::counter!("domain_commands_applied_total", "command" => C::NAME).increment(1);

        Ok(CommandResult {
            aggregate,
            events,
            scheduled,
            new_version,
        })
    }

    /// Builds storable events: domain events first, then scheduling events.
    ///
    /// The command's etag is stamped on the first event only.
    fn build_new_events(
        &self,
        aggregate_id: AggregateId,
        current_version: i64,
        etag: Option<ETag>,
        events: &[A::Event],
        scheduled: &[CommandScheduled],
    ) -> Result<Vec<NewEvent>> {
        let mut new_events = Vec::with_capacity(events.len() + scheduled.len());
        let mut version = current_version;
        let mut etag = etag;

        let mut bodies = Vec::with_capacity(events.len() + scheduled.len());
        for event in events {
            bodies.push((event.event_type().to_string(), serde_json::to_string(event)?));
        }
        for command in scheduled {
            bodies.push((command.event_type(), serde_json::to_string(command)?));
        }

        for (event_type, body) in bodies {
            version += 1;
            new_events.push(
                NewEvent::builder()
                    .stream_name(A::aggregate_type())
                    .event_type(event_type)
                    .aggregate_id(aggregate_id)
                    .sequence_number(version)
                    .body_raw(body)
                    .maybe_etag(etag.take())
                    .build(),
            );
        }

        Ok(new_events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_store::{EventFilter, EventId, EventStoreExt, EventStream, InMemoryEventStore, StoredEvent};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    enum CounterEvent {
        Opened { id: AggregateId },
        Incremented { by: i32 },
    }

    impl DomainEvent for CounterEvent {
        fn event_type(&self) -> &'static str {
            match self {
                CounterEvent::Opened { .. } => "Opened",
                CounterEvent::Incremented { .. } => "Incremented",
            }
        }
    }

    #[derive(Debug, Default)]
    struct Counter {
        id: Option<AggregateId>,
        value: i32,
        version: i64,
    }

    #[derive(Debug, thiserror::Error)]
    enum CounterError {
        #[error("counter not opened")]
        NotOpened,
        #[error("invalid increment: {0}")]
        InvalidIncrement(i32),
    }

    impl Aggregate for Counter {
        type Event = CounterEvent;
        type Error = CounterError;

        fn aggregate_type() -> &'static str {
            "Counter"
        }

        fn id(&self) -> Option<AggregateId> {
            self.id
        }

        fn version(&self) -> i64 {
            self.version
        }

        fn set_version(&mut self, version: i64) {
            self.version = version;
        }

        fn apply(&mut self, event: Self::Event) {
            match event {
                CounterEvent::Opened { id } => self.id = Some(id),
                CounterEvent::Incremented { by } => self.value += by,
            }
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Open {
        id: AggregateId,
    }

    impl Command for Open {
        type Aggregate = Counter;
        const NAME: &'static str = "Open";

        fn aggregate_id(&self) -> AggregateId {
            self.id
        }

        fn execute(&self, _: &Counter, _: &mut CommandContext) -> std::result::Result<Vec<CounterEvent>, CounterError> {
            Ok(vec![CounterEvent::Opened { id: self.id }])
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Increment {
        id: AggregateId,
        by: i32,
        etag: Option<ETag>,
        again_in_days: Option<i64>,
    }

    impl Command for Increment {
        type Aggregate = Counter;
        const NAME: &'static str = "Increment";

        fn aggregate_id(&self) -> AggregateId {
            self.id
        }

        fn etag(&self) -> Option<ETag> {
            self.etag.clone()
        }

        fn validate(&self, counter: &Counter) -> std::result::Result<(), CounterError> {
            if counter.id.is_none() {
                return Err(CounterError::NotOpened);
            }
            if self.by <= 0 {
                return Err(CounterError::InvalidIncrement(self.by));
            }
            Ok(())
        }

        fn execute(&self, _: &Counter, ctx: &mut CommandContext) -> std::result::Result<Vec<CounterEvent>, CounterError> {
            if let Some(days) = self.again_in_days {
                let follow_up = Increment {
                    id: self.id,
                    by: self.by,
                    etag: None,
                    again_in_days: None,
                };
                let due = ctx.now() + chrono::Duration::days(days);
                ctx.schedule(&follow_up, Some(due))
                    .map_err(|_| CounterError::InvalidIncrement(self.by))?;
            }
            Ok(vec![CounterEvent::Incremented { by: self.by }])
        }
    }

    fn increment(id: AggregateId, by: i32) -> Increment {
        Increment {
            id,
            by,
            etag: None,
            again_in_days: None,
        }
    }

    #[tokio::test]
    async fn execute_creates_and_updates_aggregate() {
        let store = InMemoryEventStore::new();
        let handler: CommandHandler<_, Counter> = CommandHandler::new(store);
        let id = AggregateId::new();

        let opened = handler.execute(&Open { id }).await.unwrap();
        assert_eq!(opened.new_version, 1);
        assert_eq!(opened.aggregate.id(), Some(id));

        let result = handler.execute(&increment(id, 5)).await.unwrap();
        assert_eq!(result.new_version, 2);
        assert_eq!(result.aggregate.value, 5);

        let reloaded = handler.load(id).await.unwrap();
        assert_eq!(reloaded.value, 5);
        assert_eq!(reloaded.version(), 2);
    }

    #[tokio::test]
    async fn rejected_command_records_nothing() {
        let store = InMemoryEventStore::new();
        let handler: CommandHandler<_, Counter> = CommandHandler::new(store.clone());
        let id = AggregateId::new();

        let result = handler.execute(&increment(id, 1)).await;
        assert!(matches!(result, Err(DomainError::Rejected { command: "Increment", .. })));
        assert_eq!(store.event_count().await, 0);
    }

    #[tokio::test]
    async fn repeated_etag_is_a_no_op() {
        let store = InMemoryEventStore::new();
        let handler: CommandHandler<_, Counter> = CommandHandler::new(store.clone());
        let id = AggregateId::new();
        handler.execute(&Open { id }).await.unwrap();

        let mut command = increment(id, 3);
        command.etag = Some(ETag::new("inc-1"));

        let first = handler.execute(&command).await.unwrap();
        let second = handler.execute(&command).await.unwrap();

        assert!(!first.is_unchanged());
        assert!(second.is_unchanged());
        assert_eq!(second.aggregate.value, 3);
        assert_eq!(store.event_count().await, 2);
    }

    #[tokio::test]
    async fn context_etag_dedupes_commands_without_their_own() {
        let store = InMemoryEventStore::new();
        let handler: CommandHandler<_, Counter> = CommandHandler::new(store.clone());
        let id = AggregateId::new();
        handler.execute(&Open { id }).await.unwrap();
        let ctx = || CommandContext::new(Utc::now()).with_etag(Some(ETag::new("delivery-7")));

        let first = handler.execute_at(&increment(id, 4), ctx()).await.unwrap();
        let second = handler.execute_at(&increment(id, 4), ctx()).await.unwrap();

        assert!(!first.is_unchanged());
        assert!(second.is_unchanged());
        assert_eq!(handler.load(id).await.unwrap().value, 4);

        let mut own = increment(id, 1);
        own.etag = Some(ETag::new("own"));
        handler.execute_at(&own, ctx()).await.unwrap();
        assert!(store.find_by_etag(id, &ETag::new("own")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn scheduling_appends_prefixed_event_and_is_skipped_on_replay() {
        let store = InMemoryEventStore::new();
        let handler: CommandHandler<_, Counter> = CommandHandler::new(store.clone());
        let id = AggregateId::new();
        handler.execute(&Open { id }).await.unwrap();

        let now = Utc::now();
        let mut command = increment(id, 2);
        command.again_in_days = Some(10);
        command.etag = Some(ETag::new("with-follow-up"));
        let ctx = CommandContext::new(now).with_clock(Some("test".to_string()));
        let result = handler.execute_at(&command, ctx).await.unwrap();

        assert_eq!(result.scheduled.len(), 1);
        assert_eq!(result.new_version, 3);

        let events = store
            .collect_events(EventId::NONE, &EventFilter::everything())
            .await
            .unwrap();
        assert_eq!(events[1].etag, Some(ETag::new("with-follow-up")));
        assert_eq!(events[2].event_type, "Scheduled:Increment");
        assert_eq!(events[2].etag, None);

        let scheduled: CommandScheduled = events[2].decode().unwrap();
        assert_eq!(scheduled.clock.as_deref(), Some("test"));
        assert_eq!(scheduled.due_time, Some(now + chrono::Duration::days(10)));

        let reloaded = handler.load(id).await.unwrap();
        assert_eq!(reloaded.value, 2);
        assert_eq!(reloaded.version(), 3);
    }

    /// Store that lets another writer win every append.
    struct RacingStore {
        inner: InMemoryEventStore,
    }

    #[async_trait::async_trait]
    impl EventStore for RacingStore {
        async fn append(&self, events: Vec<NewEvent>) -> event_store::Result<Vec<StoredEvent>> {
            let first = &events[0];
            let rival = NewEvent::builder()
                .stream_name(first.stream_name.clone())
                .event_type("Incremented")
                .aggregate_id(first.aggregate_id)
                .sequence_number(first.sequence_number)
                .body(&CounterEvent::Incremented { by: 100 })
                .unwrap()
                .build();
            self.inner.append(vec![rival]).await?;
            self.inner.append(events).await
        }

        async fn read_events(&self, from: EventId, filter: &EventFilter, limit: u64) -> event_store::Result<EventStream> {
            self.inner.read_events(from, filter, limit).await
        }

        async fn count_matching(&self, from: EventId, filter: &EventFilter) -> event_store::Result<u64> {
            self.inner.count_matching(from, filter).await
        }

        async fn latest_event_id(&self) -> event_store::Result<EventId> {
            self.inner.latest_event_id().await
        }

        async fn events_for_aggregate(&self, stream_name: &str, aggregate_id: AggregateId) -> event_store::Result<Vec<StoredEvent>> {
            self.inner.events_for_aggregate(stream_name, aggregate_id).await
        }

        async fn find_by_etag(&self, aggregate_id: AggregateId, etag: &ETag) -> event_store::Result<Option<StoredEvent>> {
            self.inner.find_by_etag(aggregate_id, etag).await
        }

        async fn rename_event_type(&self, stream_name: &str, from: &str, to: &str) -> event_store::Result<u64> {
            self.inner.rename_event_type(stream_name, from, to).await
        }
    }

    #[tokio::test]
    async fn losing_a_race_surfaces_as_concurrency_error() {
        let inner = InMemoryEventStore::new();
        let id = AggregateId::new();
        CommandHandler::<_, Counter>::new(inner.clone())
            .execute(&Open { id })
            .await
            .unwrap();

        let handler: CommandHandler<_, Counter> = CommandHandler::new(RacingStore { inner: inner.clone() });
        let result = handler.execute(&increment(id, 1)).await;

        match result {
            Err(DomainError::Concurrency { expected_version, .. }) => assert_eq!(expected_version, 1),
            other => panic!("expected concurrency error, got {other:?}"),
        }
        assert_eq!(handler.load(id).await.unwrap().value, 100);
    }
}
