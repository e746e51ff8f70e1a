//! Durable command scheduling against virtual clocks.
//!
//! - [`CommandScheduler`] stores scheduled commands and delivers them when
//!   due, retrying failures per [`RetryPolicy`]
//! - [`Clock`]s are named timelines advanced explicitly with
//!   [`CommandScheduler::advance_clock`]
//! - [`ETagChecker`] gates delivery on a precondition event
//! - [`CommandSchedulerProjector`] and [`PreconditionProjector`] feed the
//!   scheduler from the event log through the catchup
//! - [`ReservationService`] backs idempotency tokens

pub mod clock;
pub mod command;
pub mod delivery;
pub mod error;
pub mod etag;
pub mod memory;
pub mod postgres;
pub mod projectors;
pub mod reservation;
pub mod retry;
pub mod scheduler;
pub mod store;

pub use clock::{AdvanceTo, Clock, DEFAULT_CLOCK};
pub use command::{
    CommandDeliveryReport, CommandExecutionError, CommandFilter, ScheduleOutcome, ScheduleRequest, ScheduledCommand,
    ScheduledCommandHandle, SchedulerAdvancedResult,
};
pub use delivery::{AggregateCommandDeliverer, CommandDeliverer, DeliveryFailure, delivery_etag};
pub use error::{Result, SchedulerError};
pub use etag::{ETagChecker, EventStoreETagChecker};
pub use memory::InMemorySchedulerStore;
pub use postgres::PostgresSchedulerStore;
pub use projectors::{CommandSchedulerProjector, PreconditionProjector};
pub use reservation::{
    DEFAULT_LEASE, InMemoryReservationService, PostgresReservationService, ReservationService, ReservedValue,
};
pub use retry::{RetryDecision, RetryDirective, RetryPolicy};
pub use scheduler::{CommandScheduler, CommandSchedulerBuilder, IDEMPOTENCY_SCOPE};
pub use store::{InsertOutcome, SchedulerStore};
