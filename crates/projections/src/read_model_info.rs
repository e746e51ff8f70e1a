//! Durable per-projector progress and handling error records.

use chrono::{DateTime, Utc};
use common::{AggregateId, EventId};
use event_store::StoredEvent;
use serde::{Deserialize, Serialize};

/// Progress of one read model through the event log.
///
/// `current_as_of_event_id` is the id of the last event offered to the read
/// model and only ever increases. The remaining fields are bookkeeping for
/// operators: how long the initial catchup took, how far the current batch
/// has come and how far behind the log the read model is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadModelInfo {
    pub name: String,
    pub current_as_of_event_id: EventId,
    pub initial_catchup_start_time: Option<DateTime<Utc>>,
    pub initial_catchup_end_time: Option<DateTime<Utc>>,
    pub initial_catchup_events: u64,
    pub batch_start_time: Option<DateTime<Utc>>,
    pub batch_total_events: u64,
    pub batch_remaining_events: u64,
    pub last_updated: Option<DateTime<Utc>>,
    pub latency_ms: Option<i64>,
    /// Last event a projector failed on. Sticky: later events handled
    /// successfully leave it in place, and only a newer failure replaces it.
    pub failed_on_event_id: Option<EventId>,
    pub error: Option<String>,
}

impl ReadModelInfo {
    /// A read model that has never seen an event.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            current_as_of_event_id: EventId::NONE,
            initial_catchup_start_time: None,
            initial_catchup_end_time: None,
            initial_catchup_events: 0,
            batch_start_time: None,
            batch_total_events: 0,
            batch_remaining_events: 0,
            last_updated: None,
            latency_ms: None,
            failed_on_event_id: None,
            error: None,
        }
    }

    /// True once the read model has been offered at least one event.
    pub fn has_progress(&self) -> bool {
        self.current_as_of_event_id > EventId::NONE
    }

    /// True while the first catchup of this read model has not finished.
    pub fn is_initial_catchup(&self) -> bool {
        self.initial_catchup_end_time.is_none()
    }

    /// Resets the batch counters at the start of a batch of `total` events.
    pub(crate) fn begin_batch(&mut self, total: u64, now: DateTime<Utc>) {
        self.batch_start_time = Some(now);
        self.batch_total_events = total;
        self.batch_remaining_events = total;
        if self.initial_catchup_start_time.is_none() {
            self.initial_catchup_start_time = Some(now);
            self.initial_catchup_events = total;
        }
    }

    /// Records that the event `event_id`, written at `written_at`, was offered
    /// to this read model.
    pub(crate) fn record_event(
        &mut self,
        event_id: EventId,
        written_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        self.current_as_of_event_id = self.current_as_of_event_id.max(event_id);
        self.batch_remaining_events = self.batch_remaining_events.saturating_sub(1);
        self.last_updated = Some(now);
        self.latency_ms = Some((now - written_at).num_milliseconds().max(0));
        if self.batch_remaining_events == 0 && self.initial_catchup_end_time.is_none() {
            self.initial_catchup_end_time = Some(now);
        }
    }

    /// Share of the current batch already processed, in percent.
    pub fn percentage_completed(&self) -> f64 {
        if self.batch_total_events == 0 {
            return 100.0;
        }
        let done = self.batch_total_events - self.batch_remaining_events.min(self.batch_total_events);
        done as f64 * 100.0 / self.batch_total_events as f64
    }

    /// Estimated time to finish the current batch, extrapolated from the
    /// rate so far. `None` until at least one event of the batch is done.
    pub fn time_remaining_ms(&self, now: DateTime<Utc>) -> Option<i64> {
        let started = self.batch_start_time?;
        let done = self
            .batch_total_events
            .saturating_sub(self.batch_remaining_events);
        if done == 0 {
            return None;
        }
        if self.batch_remaining_events == 0 {
            return Some(0);
        }
        let elapsed = (now - started).num_milliseconds().max(0) as f64;
        Some((elapsed / done as f64 * self.batch_remaining_events as f64) as i64)
    }
}

/// Diagnostic record of an event that could not be parsed or handled.
///
/// Append-only. `actor` names the read model (or catchup) that failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventHandlingError {
    pub id: Option<i64>,
    pub aggregate_id: AggregateId,
    pub sequence_number: i64,
    pub stream_name: String,
    pub event_type: String,
    pub serialized_event: String,
    pub error: String,
    pub actor: String,
    pub original_id: EventId,
    pub utc_time: DateTime<Utc>,
}

impl EventHandlingError {
    pub fn new(event: &StoredEvent, actor: impl Into<String>, error: impl ToString) -> Self {
        Self {
            id: None,
            aggregate_id: event.aggregate_id,
            sequence_number: event.sequence_number,
            stream_name: event.stream_name.clone(),
            event_type: event.event_type.clone(),
            serialized_event: event.body.clone(),
            error: error.to_string(),
            actor: actor.into(),
            original_id: event.id,
            utc_time: Utc::now(),
        }
    }
}
