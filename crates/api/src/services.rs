//! Wiring of the event store, catchup and scheduler behind the HTTP surface.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{CancelOrder, ChargeCreditCard, PlaceOrder, ShipOrder};
use event_store::{EventStore, InMemoryEventStore, NamedLock};
use projections::{InMemoryReadModelStore, ReadModelCatchup, ReadModelStore, SensorSource, StoreSensors};
use scheduler::{
    AdvanceTo, AggregateCommandDeliverer, Clock, CommandScheduler, CommandSchedulerProjector, EventStoreETagChecker,
    InMemoryReservationService, InMemorySchedulerStore, PreconditionProjector, ReservationService,
    SchedulerAdvancedResult, SchedulerStore,
};

use crate::config::Config;

/// Aggregate streams whose etags release waiting commands.
const PRECONDITION_STREAMS: [&str; 1] = ["Order"];

/// Clock administration, independent of the scheduler's store.
#[async_trait]
pub trait ClockAdmin: Send + Sync {
    async fn create_clock(&self, name: &str, start_time: DateTime<Utc>) -> scheduler::Result<Clock>;

    async fn clock(&self, name: &str) -> scheduler::Result<Option<Clock>>;

    async fn advance_clock(&self, name: &str, to: AdvanceTo) -> scheduler::Result<SchedulerAdvancedResult>;
}

#[async_trait]
impl<T: SchedulerStore + 'static> ClockAdmin for CommandScheduler<T> {
    async fn create_clock(&self, name: &str, start_time: DateTime<Utc>) -> scheduler::Result<Clock> {
        CommandScheduler::create_clock(self, name, start_time).await
    }

    async fn clock(&self, name: &str) -> scheduler::Result<Option<Clock>> {
        CommandScheduler::clock(self, name).await
    }

    async fn advance_clock(&self, name: &str, to: AdvanceTo) -> scheduler::Result<SchedulerAdvancedResult> {
        CommandScheduler::advance_clock(self, name, to).await
    }
}

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub sensors: Arc<dyn SensorSource>,
    pub clocks: Arc<dyn ClockAdmin>,
}

/// Everything the server runs, over one set of backends.
pub struct Services<S, R: ReadModelStore, T> {
    pub event_store: S,
    pub scheduler: CommandScheduler<T>,
    pub catchup: ReadModelCatchup<S, R>,
    pub state: Arc<AppState>,
}

pub type InMemoryServices = Services<InMemoryEventStore, InMemoryReadModelStore, InMemorySchedulerStore>;

/// Builds the scheduler, its delivery registry for the order commands, and
/// a catchup feeding it from the event log.
pub fn build_services<S, R, T>(
    event_store: S,
    read_models: R,
    scheduler_store: T,
    reservations: Arc<dyn ReservationService>,
    config: &Config,
) -> projections::Result<Services<S, R, T>>
where
    S: EventStore + NamedLock + Clone + 'static,
    R: ReadModelStore + Clone + 'static,
    T: SchedulerStore + 'static,
{
    let deliverer = AggregateCommandDeliverer::new(event_store.clone())
        .register::<PlaceOrder>()
        .register::<ChargeCreditCard>()
        .register::<ShipOrder>()
        .register::<CancelOrder>();
    let scheduler = CommandScheduler::builder(
        scheduler_store,
        Arc::new(deliverer),
        Arc::new(EventStoreETagChecker::new(event_store.clone())),
    )
    .reservations(reservations)
    .default_clock(config.scheduler_default_clock.clone())
    .build();

    let catchup = ReadModelCatchup::builder(event_store.clone(), read_models.clone())
        .name("scheduler")
        .config(config.catchup_config())
        .projector(CommandSchedulerProjector::new(scheduler.clone()))
        .projector(PreconditionProjector::new(scheduler.clone(), PRECONDITION_STREAMS))
        .build()?;

    let state = Arc::new(AppState {
        sensors: Arc::new(StoreSensors::new(event_store.clone(), read_models)),
        clocks: Arc::new(scheduler.clone()),
    });

    Ok(Services {
        event_store,
        scheduler,
        catchup,
        state,
    })
}

/// [`build_services`] over fresh in-memory backends.
pub fn in_memory_services(config: &Config) -> projections::Result<InMemoryServices> {
    build_services(
        InMemoryEventStore::new(),
        InMemoryReadModelStore::new(),
        InMemorySchedulerStore::new(),
        Arc::new(InMemoryReservationService::new()),
        config,
    )
}
