//! Scheduled commands and the requests, handles and filters around them.

use chrono::{DateTime, Utc};
use common::{AggregateId, Precondition};
use domain::{Aggregate, Command, CommandScheduled};
use serde::{Deserialize, Serialize};

use crate::clock::DEFAULT_CLOCK;

/// A command waiting for, or done with, delivery to its aggregate.
///
/// Keyed by `(aggregate_id, sequence_number)`. Scheduler-assigned sequence
/// numbers are negative; numbers taken from the scheduling event are not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledCommand {
    pub aggregate_id: AggregateId,
    pub sequence_number: i64,
    pub aggregate_type: String,
    pub command_name: String,
    pub serialized_command: String,
    pub created_time: DateTime<Utc>,
    /// `None` means as soon as possible.
    pub due_time: Option<DateTime<Utc>>,
    pub applied_time: Option<DateTime<Utc>>,
    pub final_attempt_time: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub clock_name: String,
    pub delivery_depends_on: Option<Precondition>,
    /// Bumped by every write; writers state the version they read.
    pub row_version: i64,
}

impl ScheduledCommand {
    /// Neither applied nor abandoned.
    pub fn is_pending(&self) -> bool {
        self.applied_time.is_none() && self.final_attempt_time.is_none()
    }

    pub fn is_applied(&self) -> bool {
        self.applied_time.is_some()
    }

    pub fn is_abandoned(&self) -> bool {
        self.final_attempt_time.is_some() && self.applied_time.is_none()
    }

    /// True when the command is due at `now` on its clock.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_time.is_none_or(|due| due <= now)
    }

    /// Delivery order within one clock: earliest due first, unscheduled
    /// (as soon as possible) before everything, then by sequence number.
    pub fn delivery_key(&self) -> (Option<DateTime<Utc>>, i64) {
        (self.due_time, self.sequence_number)
    }

    pub fn command_value(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_str(&self.serialized_command)
    }
}

/// One failed delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandExecutionError {
    pub aggregate_id: AggregateId,
    pub sequence_number: i64,
    pub error: String,
    pub attempt: i32,
    pub recorded_at: DateTime<Utc>,
}

/// A request to schedule one command.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleRequest {
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub command_name: String,
    pub command: serde_json::Value,
    /// Caller-assigned key. When `None` the scheduler assigns a negative one.
    pub sequence_number: Option<i64>,
    pub due_time: Option<DateTime<Utc>>,
    pub clock: Option<String>,
    pub delivery_depends_on: Option<Precondition>,
    /// When false and the command can be delivered at once, no row is kept
    /// for a successful delivery.
    pub durable: bool,
    /// Claimed through the reservation service; a second request with the
    /// same token is a duplicate.
    pub idempotency_token: Option<String>,
}

impl ScheduleRequest {
    /// A durable request for `command`, due as soon as possible on the
    /// default clock.
    pub fn for_command<C: Command>(command: &C) -> serde_json::Result<Self> {
        Ok(Self {
            aggregate_id: command.aggregate_id(),
            aggregate_type: C::Aggregate::aggregate_type().to_string(),
            command_name: C::NAME.to_string(),
            command: serde_json::to_value(command)?,
            sequence_number: None,
            due_time: None,
            clock: None,
            delivery_depends_on: None,
            durable: true,
            idempotency_token: None,
        })
    }

    /// The request recorded by a `Scheduled:<Command>` event at
    /// `sequence_number` of an aggregate's stream.
    pub fn from_scheduled_event(
        aggregate_type: impl Into<String>,
        aggregate_id: AggregateId,
        sequence_number: i64,
        scheduled: CommandScheduled,
    ) -> Self {
        Self {
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            command_name: scheduled.command_name,
            command: scheduled.command,
            sequence_number: Some(sequence_number),
            due_time: scheduled.due_time,
            clock: scheduled.clock,
            delivery_depends_on: scheduled.delivery_depends_on,
            durable: true,
            idempotency_token: None,
        }
    }

    pub fn due_at(mut self, due_time: DateTime<Utc>) -> Self {
        self.due_time = Some(due_time);
        self
    }

    pub fn on_clock(mut self, clock: impl Into<String>) -> Self {
        self.clock = Some(clock.into());
        self
    }

    pub fn with_sequence_number(mut self, sequence_number: i64) -> Self {
        self.sequence_number = Some(sequence_number);
        self
    }

    pub fn depends_on(mut self, precondition: Precondition) -> Self {
        self.delivery_depends_on = Some(precondition);
        self
    }

    pub fn non_durable(mut self) -> Self {
        self.durable = false;
        self
    }

    pub fn idempotency_token(mut self, token: impl Into<String>) -> Self {
        self.idempotency_token = Some(token.into());
        self
    }

    pub(crate) fn clock_name<'a>(&'a self, default_clock: &'a str) -> &'a str {
        self.clock.as_deref().unwrap_or(default_clock)
    }

    pub(crate) fn into_command(
        self,
        sequence_number: i64,
        clock_name: String,
        now: DateTime<Utc>,
    ) -> serde_json::Result<ScheduledCommand> {
        Ok(ScheduledCommand {
            aggregate_id: self.aggregate_id,
            sequence_number,
            aggregate_type: self.aggregate_type,
            command_name: self.command_name,
            serialized_command: serde_json::to_string(&self.command)?,
            created_time: now,
            due_time: self.due_time,
            applied_time: None,
            final_attempt_time: None,
            attempts: 0,
            clock_name,
            delivery_depends_on: self.delivery_depends_on,
            row_version: 0,
        })
    }
}

/// What scheduling did with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleOutcome {
    /// Stored and waiting for its clock or precondition.
    Pending,
    /// Delivered before `schedule` returned.
    Delivered,
    /// Immediate delivery failed; the command is stored for retry or was
    /// abandoned.
    Failed,
    /// The key or idempotency token was already taken. Nothing was done.
    Duplicate,
}

/// The caller's view of a scheduled command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledCommandHandle {
    pub aggregate_id: AggregateId,
    /// `None` for a duplicate idempotency token without a caller-assigned key.
    pub sequence_number: Option<i64>,
    pub command_name: String,
    pub clock_name: String,
    pub due_time: Option<DateTime<Utc>>,
    pub outcome: ScheduleOutcome,
}

/// Selects scheduled commands for [`trigger`](crate::CommandScheduler::trigger).
///
/// Only pending commands are ever selected. The empty filter selects every
/// pending command whether due or not.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandFilter {
    pub clock: Option<String>,
    pub aggregate_id: Option<AggregateId>,
    pub command_name: Option<String>,
    pub depends_on: Option<Precondition>,
    /// Skip commands not yet due on their own clock.
    pub only_due: bool,
}

impl CommandFilter {
    pub fn pending() -> Self {
        Self::default()
    }

    pub fn on_clock(mut self, clock: impl Into<String>) -> Self {
        self.clock = Some(clock.into());
        self
    }

    pub fn for_aggregate(mut self, aggregate_id: AggregateId) -> Self {
        self.aggregate_id = Some(aggregate_id);
        self
    }

    pub fn named(mut self, command_name: impl Into<String>) -> Self {
        self.command_name = Some(command_name.into());
        self
    }

    pub fn depending_on(mut self, precondition: Precondition) -> Self {
        self.depends_on = Some(precondition);
        self
    }

    pub fn only_due(mut self) -> Self {
        self.only_due = true;
        self
    }

    /// Matches everything but due-ness, which needs the command's clock.
    pub fn matches(&self, command: &ScheduledCommand) -> bool {
        command.is_pending()
            && self.clock.as_ref().is_none_or(|c| *c == command.clock_name)
            && self.aggregate_id.is_none_or(|id| id == command.aggregate_id)
            && self
                .command_name
                .as_ref()
                .is_none_or(|n| *n == command.command_name)
            && self
                .depends_on
                .as_ref()
                .is_none_or(|p| command.delivery_depends_on.as_ref() == Some(p))
    }
}

/// Outcome of one delivery, as reported by clock advances and triggers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDeliveryReport {
    pub aggregate_id: AggregateId,
    pub sequence_number: i64,
    pub command_name: String,
    pub attempts: i32,
    pub error: Option<String>,
    /// The command will not be retried.
    pub abandoned: bool,
    /// When it will be retried, if it failed and was not abandoned.
    pub retry_at: Option<DateTime<Utc>>,
}

/// Result of advancing a clock or triggering commands.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerAdvancedResult {
    pub successful_commands: Vec<CommandDeliveryReport>,
    pub failed_commands: Vec<CommandDeliveryReport>,
}

impl SchedulerAdvancedResult {
    pub fn delivered(&self) -> usize {
        self.successful_commands.len()
    }

    pub fn failed(&self) -> usize {
        self.failed_commands.len()
    }
}

pub(crate) fn default_clock_name() -> String {
    DEFAULT_CLOCK.to_string()
}
