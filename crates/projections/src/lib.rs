//! Read model catchup for the query side.
//!
//! This crate replays the event log to read model projectors:
//! - [`Projector`] declares its interests and handles events through a unit of work
//! - [`ReadModelStore`] keeps each read model's cursor, committed with its side effects
//! - [`ExclusiveCatchupQuery`] reads one batch under a named lock, surviving reader faults
//! - [`ReadModelCatchup`] runs batches, reports status and polls for new events
//! - [`catchup_sensor`] reports how far behind each read model is

pub mod bus;
pub mod catchup;
pub mod error;
pub mod exclusive_query;
pub mod memory;
pub mod postgres;
pub mod projector;
pub mod read_model_info;
pub mod sensor;
pub mod status;
pub mod store;

pub use bus::EventBus;
pub use catchup::{
    CatchupConfig, CatchupOutcome, PollingHandle, ReadModelCatchup, ReadModelCatchupBuilder,
};
pub use error::{ProjectionError, Result};
pub use exclusive_query::{ExclusiveCatchupQuery, LockedCatchup};
pub use memory::{InMemoryReadModelStore, InMemoryUnitOfWork};
pub use postgres::{PostgresReadModelStore, PostgresUnitOfWork};
pub use projector::{EventEnvelope, Projector, read_model_name};
pub use read_model_info::{EventHandlingError, ReadModelInfo};
pub use sensor::{CatchupSensorReport, ReadModelSensor, SensorSource, StoreSensors, catchup_sensor};
pub use status::ReadModelCatchupStatus;
pub use store::{ReadModelStore, UnitOfWork};
