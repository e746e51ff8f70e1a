//! PostgreSQL integration tests for the command scheduler.
//!
//! These tests use a shared PostgreSQL container.
//! Run with:
//!
//! ```bash
//! cargo test -p scheduler --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use common::AggregateId;
use domain::{
    AddItem, ChargeCreditCard, CommandContext, CommandHandler, CreateOrder, CustomerId, Money, Order, OrderItem,
    OrderState, PlaceOrder, ShipOrder,
};
use event_store::PostgresEventStore;
use projections::{PostgresReadModelStore, ReadModelCatchup};
use scheduler::{
    AdvanceTo, AggregateCommandDeliverer, Clock, CommandDeliverer, CommandScheduler, CommandSchedulerProjector,
    DeliveryFailure, EventStoreETagChecker, InsertOutcome, PostgresReservationService, PostgresSchedulerStore,
    PreconditionProjector, ReservationService, RetryDirective, ScheduleOutcome, ScheduleRequest, ScheduledCommand,
    SchedulerError, SchedulerStore,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();
            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();
            let connection_string = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let pool = PgPool::connect(&connection_string).await.unwrap();
            PostgresEventStore::new(pool.clone()).run_migrations().await.unwrap();
            pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// A pool over an emptied database.
async fn get_test_pool() -> PgPool {
    let info = get_container_info().await;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query(
        "TRUNCATE TABLE events, read_model_info, event_handling_errors, scheduled_commands, \
         command_errors, clocks, reserved_values RESTART IDENTITY",
    )
    .execute(&pool)
    .await
    .unwrap();

    pool
}

/// Postgres keeps microseconds; whole seconds compare cleanly after a round trip.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

#[derive(Clone, Default)]
struct CountingDeliverer {
    calls: Arc<AtomicUsize>,
    fail: bool,
}

#[async_trait]
impl CommandDeliverer for CountingDeliverer {
    async fn deliver(&self, _command: &ScheduledCommand, _now: DateTime<Utc>) -> Result<(), DeliveryFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        if self.fail {
            return Err(DeliveryFailure::new("declined", RetryDirective::Default));
        }
        Ok(())
    }
}

fn scheduler(
    pool: &PgPool,
    deliverer: &CountingDeliverer,
    seed: i64,
) -> CommandScheduler<PostgresSchedulerStore> {
    CommandScheduler::builder(
        PostgresSchedulerStore::new(pool.clone()),
        Arc::new(deliverer.clone()),
        Arc::new(EventStoreETagChecker::new(PostgresEventStore::new(pool.clone()))),
    )
    .reservations(Arc::new(PostgresReservationService::new(pool.clone())))
    .sequence_seed(seed)
    .build()
}

fn ship(order_id: AggregateId) -> ScheduleRequest {
    ScheduleRequest::for_command(&ShipOrder { order_id })
        .unwrap()
        .on_clock("c")
}

#[tokio::test]
#[serial]
async fn clocks_are_unique_and_monotonic() {
    let store = PostgresSchedulerStore::new(get_test_pool().await);
    let start = now();

    store.create_clock(&Clock::new("c", start)).await.unwrap();
    assert!(matches!(
        store.create_clock(&Clock::new("c", start)).await,
        Err(SchedulerError::ClockAlreadyExists(_))
    ));

    let later = start + Duration::hours(1);
    assert_eq!(store.set_clock_time("c", later).await.unwrap().utc_now, later);
    assert!(matches!(
        store.set_clock_time("c", start).await,
        Err(SchedulerError::ClockMovedBackward { .. })
    ));
    assert_eq!(store.clock("c").await.unwrap().unwrap().utc_now, later);
    assert!(matches!(
        store.set_clock_time("missing", later).await,
        Err(SchedulerError::ClockNotFound(_))
    ));

    let existing = store.get_or_create_clock("c", start).await.unwrap();
    assert_eq!(existing.utc_now, later);
}

#[tokio::test]
#[serial]
async fn commands_need_an_existing_clock() {
    let store = PostgresSchedulerStore::new(get_test_pool().await);
    let command = ScheduleRequest::for_command(&ShipOrder {
        order_id: AggregateId::new(),
    })
    .unwrap();
    let row = ScheduledCommand {
        aggregate_id: command.aggregate_id,
        sequence_number: 1,
        aggregate_type: command.aggregate_type,
        command_name: command.command_name,
        serialized_command: command.command.to_string(),
        created_time: now(),
        due_time: None,
        applied_time: None,
        final_attempt_time: None,
        attempts: 0,
        clock_name: "nowhere".to_string(),
        delivery_depends_on: None,
        row_version: 0,
    };
    assert!(matches!(
        store.insert_command(&row).await,
        Err(SchedulerError::ClockNotFound(_))
    ));

    store.create_clock(&Clock::new("nowhere", now())).await.unwrap();
    assert_eq!(store.insert_command(&row).await.unwrap(), InsertOutcome::Inserted);
    assert_eq!(store.insert_command(&row).await.unwrap(), InsertOutcome::Duplicate);
    assert_eq!(store.command(row.aggregate_id, 1).await.unwrap(), Some(row));
}

#[tokio::test]
#[serial]
async fn scheduled_commands_survive_and_deliver_on_advance() {
    let pool = get_test_pool().await;
    let deliverer = CountingDeliverer::default();
    let scheduler = scheduler(&pool, &deliverer, -1);
    let start = now();
    scheduler.create_clock("c", start).await.unwrap();

    let id = AggregateId::new();
    let request = ship(id).due_at(start + Duration::days(2)).idempotency_token("ship-1");
    let handle = scheduler.schedule(request.clone()).await.unwrap();
    assert_eq!(handle.outcome, ScheduleOutcome::Pending);
    assert_eq!(scheduler.schedule(request).await.unwrap().outcome, ScheduleOutcome::Duplicate);

    let result = scheduler.advance_clock("c", AdvanceTo::By(Duration::days(1))).await.unwrap();
    assert_eq!(result.delivered(), 0);

    let result = scheduler.advance_clock("c", AdvanceTo::By(Duration::days(1))).await.unwrap();
    assert_eq!(result.delivered(), 1);
    assert_eq!(deliverer.calls.load(Ordering::SeqCst), 1);

    let command = scheduler.command(id, -1).await.unwrap().unwrap();
    assert_eq!(command.applied_time, Some(start + Duration::days(2)));
    assert_eq!(command.attempts, 1);
}

#[tokio::test]
#[serial]
async fn failures_are_recorded_and_retried() {
    let pool = get_test_pool().await;
    let deliverer = CountingDeliverer {
        fail: true,
        ..Default::default()
    };
    let scheduler = scheduler(&pool, &deliverer, -1);
    let start = now();
    scheduler.create_clock("c", start).await.unwrap();
    let id = AggregateId::new();

    assert_eq!(scheduler.schedule(ship(id)).await.unwrap().outcome, ScheduleOutcome::Failed);
    let command = scheduler.command(id, -1).await.unwrap().unwrap();
    assert_eq!(command.due_time, Some(start + Duration::minutes(1)));
    assert!(command.is_pending());

    scheduler.advance_clock("c", AdvanceTo::By(Duration::minutes(1))).await.unwrap();
    let errors = scheduler.command_errors(id, -1).await.unwrap();
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[0].attempt, 1);
    assert_eq!(errors[1].attempt, 2);
    assert_eq!(errors[1].error, "declined");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn competing_schedulers_deliver_each_command_once() {
    let pool = get_test_pool().await;
    let deliverer = CountingDeliverer::default();
    let first = scheduler(&pool, &deliverer, -1);
    let second = scheduler(&pool, &deliverer, -1000);
    let start = now();
    first.create_clock("c", start).await.unwrap();

    for _ in 0..8 {
        first
            .schedule(ship(AggregateId::new()).due_at(start + Duration::minutes(5)))
            .await
            .unwrap();
    }

    let target = AdvanceTo::Time(start + Duration::hours(1));
    let (a, b) = tokio::join!(first.advance_clock("c", target), second.advance_clock("c", target));
    assert_eq!(a.unwrap().delivered() + b.unwrap().delivered(), 8);
    assert_eq!(deliverer.calls.load(Ordering::SeqCst), 8);
}

#[tokio::test]
#[serial]
async fn reservations_are_exclusive_until_expired() {
    let service = PostgresReservationService::new(get_test_pool().await);

    assert!(service.reserve("v", "s", "a", None).await.unwrap());
    assert!(service.reserve("v", "s", "a", None).await.unwrap());
    assert!(!service.reserve("v", "s", "b", None).await.unwrap());

    assert!(service.reserve("short", "s", "a", Some(Duration::seconds(-1))).await.unwrap());
    assert!(service.reserve("short", "s", "b", None).await.unwrap());

    let token = service.confirm("v", "s", "a").await.unwrap().unwrap();
    assert_eq!(service.confirm("v", "s", "a").await.unwrap(), Some(token));
    assert_eq!(service.confirm("v", "s", "b").await.unwrap(), None);

    let held = service.reserved_value("b", "s").await.unwrap().unwrap();
    assert_eq!(held.value, "short");
    assert!(service.cancel("short", "s", "b").await.unwrap());
    assert!(service.reserved_value("b", "s").await.unwrap().is_none());

    let values = vec!["v".to_string(), "w".to_string()];
    assert_eq!(
        service.reserve_any(&values, "s", "c", None).await.unwrap().as_deref(),
        Some("w")
    );
}

#[tokio::test]
#[serial]
async fn order_is_charged_and_shipped_through_the_catchup() {
    let pool = get_test_pool().await;
    let events = PostgresEventStore::new(pool.clone());
    let deliverer = AggregateCommandDeliverer::new(events.clone())
        .register::<ChargeCreditCard>()
        .register::<ShipOrder>();
    let scheduler = CommandScheduler::builder(
        PostgresSchedulerStore::new(pool.clone()),
        Arc::new(deliverer),
        Arc::new(EventStoreETagChecker::new(events.clone())),
    )
    .build();
    let start = now();
    scheduler.create_clock("test", start).await.unwrap();

    let handler: CommandHandler<_, Order> = CommandHandler::new(events.clone());
    let create = CreateOrder::for_customer(CustomerId::new());
    let order_id = create.order_id;
    let ctx = || CommandContext::new(start).with_clock(Some("test".to_string()));
    handler.execute_at(&create, ctx()).await.unwrap();
    handler
        .execute_at(&AddItem::new(order_id, OrderItem::new("SKU", 1, Money::from_cents(900))), ctx())
        .await
        .unwrap();
    handler.execute_at(&PlaceOrder::new(order_id, 10), ctx()).await.unwrap();

    let catchup = ReadModelCatchup::builder(events.clone(), PostgresReadModelStore::new(pool.clone()))
        .projector(CommandSchedulerProjector::new(scheduler.clone()))
        .projector(PreconditionProjector::new(scheduler.clone(), ["Order"]))
        .build()
        .unwrap();
    catchup.run().await.unwrap();

    let result = scheduler.advance_clock("test", AdvanceTo::By(Duration::days(9))).await.unwrap();
    assert_eq!(result.delivered(), 0);
    let result = scheduler.advance_clock("test", AdvanceTo::By(Duration::days(2))).await.unwrap();
    assert_eq!(result.delivered(), 1);
    assert_eq!(handler.load(order_id).await.unwrap().state(), OrderState::Paid);

    catchup.run().await.unwrap();
    assert_eq!(handler.load(order_id).await.unwrap().state(), OrderState::Shipped);
}
