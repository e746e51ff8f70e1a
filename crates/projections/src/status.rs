//! Catchup status reports.

use chrono::{DateTime, Utc};
use common::EventId;
use serde::{Deserialize, Serialize};

/// Progress of a catchup after one event, or at the edges of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadModelCatchupStatus {
    pub catchup_name: String,
    /// Size of the batch being processed.
    pub batch_count: u64,
    pub current_event_id: Option<EventId>,
    pub number_of_events_processed: u64,
    pub event_timestamp: Option<DateTime<Utc>>,
    pub latency_ms: Option<i64>,
    pub is_start_of_batch: bool,
    pub is_end_of_batch: bool,
}

impl ReadModelCatchupStatus {
    pub(crate) fn start_of_batch(catchup_name: &str, batch_count: u64) -> Self {
        Self {
            catchup_name: catchup_name.to_string(),
            batch_count,
            current_event_id: None,
            number_of_events_processed: 0,
            event_timestamp: None,
            latency_ms: None,
            is_start_of_batch: true,
            is_end_of_batch: false,
        }
    }

    /// Status of a batch that found nothing to do.
    pub(crate) fn empty_batch(catchup_name: &str) -> Self {
        Self {
            is_end_of_batch: true,
            ..Self::start_of_batch(catchup_name, 0)
        }
    }
}

impl std::fmt::Display for ReadModelCatchupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {}/{}",
            self.catchup_name, self.number_of_events_processed, self.batch_count
        )?;
        if let Some(id) = self.current_event_id {
            write!(f, " (event {id})")?;
        }
        if self.is_end_of_batch {
            f.write_str(" done")?;
        }
        Ok(())
    }
}
