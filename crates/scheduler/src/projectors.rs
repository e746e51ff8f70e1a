//! Catchup projectors feeding the scheduler from the event log.

use async_trait::async_trait;
use common::Precondition;
use domain::{CommandScheduled, SCHEDULED_EVENT_PREFIX};
use event_store::Interest;
use projections::{EventEnvelope, Projector};

use crate::command::{CommandFilter, ScheduleRequest};
use crate::scheduler::CommandScheduler;
use crate::store::SchedulerStore;

/// Schedules the commands recorded by `Scheduled:<Command>` events.
///
/// The command is keyed by the scheduling event's aggregate and sequence
/// number, so replaying the log schedules nothing twice.
pub struct CommandSchedulerProjector<S> {
    scheduler: CommandScheduler<S>,
}

impl<S> CommandSchedulerProjector<S> {
    pub fn new(scheduler: CommandScheduler<S>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl<S, U> Projector<U> for CommandSchedulerProjector<S>
where
    S: SchedulerStore + 'static,
    U: Send + 'static,
{
    fn name(&self) -> Option<String> {
        Some("CommandScheduler".to_string())
    }

    fn interests(&self) -> Vec<Interest> {
        vec![Interest::any_stream_prefix(SCHEDULED_EVENT_PREFIX)]
    }

    async fn handle(&self, event: &EventEnvelope, _uow: &mut U) -> projections::Result<()> {
        let scheduled: CommandScheduled = event.decode()?;
        let request = ScheduleRequest::from_scheduled_event(
            event.stream_name.clone(),
            event.aggregate_id,
            event.sequence_number,
            scheduled,
        );
        let handle = self.scheduler.schedule(request).await?;
        tracing::debug!(
            aggregate_id = %event.aggregate_id,
            sequence_number = event.sequence_number,
            outcome = ?handle.outcome,
            "scheduled from event"
        );
        Ok(())
    }
}

/// Delivers commands waiting on an etag as soon as an event recording that
/// etag appears on one of the watched streams.
pub struct PreconditionProjector<S> {
    scheduler: CommandScheduler<S>,
    streams: Vec<String>,
}

impl<S> PreconditionProjector<S> {
    pub fn new(scheduler: CommandScheduler<S>, streams: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            scheduler,
            streams: streams.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl<S, U> Projector<U> for PreconditionProjector<S>
where
    S: SchedulerStore + 'static,
    U: Send + 'static,
{
    fn name(&self) -> Option<String> {
        Some("CommandPreconditions".to_string())
    }

    fn interests(&self) -> Vec<Interest> {
        self.streams.iter().map(Interest::stream).collect()
    }

    async fn handle(&self, event: &EventEnvelope, _uow: &mut U) -> projections::Result<()> {
        let Some(etag) = &event.etag else {
            return Ok(());
        };
        let filter = CommandFilter::pending()
            .depending_on(Precondition::new(event.aggregate_id, etag.clone()))
            .only_due();
        let result = self.scheduler.trigger(filter).await?;
        if result.delivered() + result.failed() > 0 {
            tracing::debug!(
                %etag,
                delivered = result.delivered(),
                failed = result.failed(),
                "precondition met"
            );
        }
        Ok(())
    }
}
