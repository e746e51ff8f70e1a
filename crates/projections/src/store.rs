//! Storage for read model progress.

use async_trait::async_trait;
use common::EventId;

use crate::Result;
use crate::read_model_info::{EventHandlingError, ReadModelInfo};

/// One transaction against a read model store.
///
/// A projector writes its side effects through the unit of work and the
/// catchup records the projector's progress in the same unit. `commit`
/// persists both or neither; dropping a unit without committing discards it.
#[async_trait]
pub trait UnitOfWork: Send + Sized + 'static {
    /// Stages the progress row for the read model in `info`.
    async fn save_progress(&mut self, info: &ReadModelInfo) -> Result<()>;

    async fn commit(self) -> Result<()>;

    async fn rollback(self) -> Result<()>;
}

/// Durable progress rows and handling errors for read models.
#[async_trait]
pub trait ReadModelStore: Send + Sync {
    type UnitOfWork: UnitOfWork;

    /// Loads progress for `names`, creating empty rows for names not seen
    /// before. The result is in the order of `names`.
    async fn load_progress(&self, names: &[String]) -> Result<Vec<ReadModelInfo>>;

    /// All progress rows, ordered by name.
    async fn all_progress(&self) -> Result<Vec<ReadModelInfo>>;

    async fn begin(&self) -> Result<Self::UnitOfWork>;

    /// Appends a handling error in its own transaction.
    async fn record_handling_error(&self, error: EventHandlingError) -> Result<()>;

    /// Marks the read model `name` as having failed on `event_id` and moves
    /// its cursor up to that event, in its own transaction, so the event is
    /// not offered again.
    async fn record_failure(&self, name: &str, event_id: EventId, message: &str) -> Result<()>;

    /// All recorded handling errors, oldest first.
    async fn handling_errors(&self) -> Result<Vec<EventHandlingError>>;
}
