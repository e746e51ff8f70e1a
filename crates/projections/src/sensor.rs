//! Read-only diagnostics over read model progress.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::EventId;
use event_store::EventStore;
use serde::Serialize;

use crate::Result;
use crate::read_model_info::ReadModelInfo;
use crate::store::ReadModelStore;

/// Diagnostic view of one read model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadModelSensor {
    pub current_as_of: EventId,
    pub initial_catchup_events: u64,
    /// Ids between the read model's cursor and the end of the log. Only some
    /// of them may match the read model's interests.
    pub events_remaining: u64,
    pub percentage_completed: f64,
    pub time_remaining_ms: Option<i64>,
    pub latency_ms: Option<i64>,
    pub last_updated: Option<DateTime<Utc>>,
    pub failed_on_event_id: Option<EventId>,
    pub error: Option<String>,
}

impl ReadModelSensor {
    fn new(info: &ReadModelInfo, latest: EventId, now: DateTime<Utc>) -> Self {
        Self {
            current_as_of: info.current_as_of_event_id,
            initial_catchup_events: info.initial_catchup_events,
            events_remaining: latest
                .as_u64()
                .saturating_sub(info.current_as_of_event_id.as_u64()),
            percentage_completed: info.percentage_completed(),
            time_remaining_ms: info.time_remaining_ms(now),
            latency_ms: info.latency_ms,
            last_updated: info.last_updated,
            failed_on_event_id: info.failed_on_event_id,
            error: info.error.clone(),
        }
    }
}

/// Where every read model stands relative to the log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatchupSensorReport {
    pub latest_event_id: EventId,
    pub read_models: BTreeMap<String, ReadModelSensor>,
}

impl CatchupSensorReport {
    /// True when no read model has a recorded failure.
    pub fn is_healthy(&self) -> bool {
        self.read_models.values().all(|r| r.error.is_none())
    }
}

/// Builds a [`CatchupSensorReport`] from the log and the progress rows.
pub async fn catchup_sensor<S, R>(event_store: &S, read_models: &R) -> Result<CatchupSensorReport>
where
    S: EventStore + ?Sized,
    R: ReadModelStore + ?Sized,
{
    let latest_event_id = event_store.latest_event_id().await?;
    let now = Utc::now();
    let read_models = read_models
        .all_progress()
        .await?
        .iter()
        .map(|info| (info.name.clone(), ReadModelSensor::new(info, latest_event_id, now)))
        .collect();

    Ok(CatchupSensorReport {
        latest_event_id,
        read_models,
    })
}

/// Something that can produce catchup diagnostics, whatever its backends.
#[async_trait]
pub trait SensorSource: Send + Sync {
    async fn catchup_report(&self) -> Result<CatchupSensorReport>;
}

/// [`SensorSource`] over an event store and a read model store.
#[derive(Clone)]
pub struct StoreSensors<S, R> {
    event_store: S,
    read_models: R,
}

impl<S, R> StoreSensors<S, R> {
    pub fn new(event_store: S, read_models: R) -> Self {
        Self {
            event_store,
            read_models,
        }
    }
}

#[async_trait]
impl<S, R> SensorSource for StoreSensors<S, R>
where
    S: EventStore,
    R: ReadModelStore,
{
    async fn catchup_report(&self) -> Result<CatchupSensorReport> {
        catchup_sensor(&self.event_store, &self.read_models).await
    }
}
