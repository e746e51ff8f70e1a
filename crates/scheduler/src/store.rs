//! Storage for clocks, scheduled commands and their errors.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::AggregateId;

use crate::Result;
use crate::clock::Clock;
use crate::command::{CommandExecutionError, CommandFilter, ScheduledCommand};

/// Result of inserting a scheduled command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A command with the same key already exists. Nothing was written.
    Duplicate,
}

/// Durable state of the scheduler.
///
/// Command rows are written under optimistic concurrency: every state change
/// names the `row_version` the writer read and fails quietly (returning
/// `false` or `None`) when another writer got there first.
#[async_trait]
pub trait SchedulerStore: Send + Sync {
    /// Fails with `ClockAlreadyExists` if the name is taken.
    async fn create_clock(&self, clock: &Clock) -> Result<()>;

    async fn clock(&self, name: &str) -> Result<Option<Clock>>;

    /// Returns the named clock, creating it at `start_time` if missing.
    async fn get_or_create_clock(&self, name: &str, start_time: DateTime<Utc>) -> Result<Clock>;

    /// Moves the clock to `to` and returns it. Fails with
    /// `ClockMovedBackward` without changing anything when `to` is earlier
    /// than the clock's time, and with `ClockNotFound` for unknown clocks.
    async fn set_clock_time(&self, name: &str, to: DateTime<Utc>) -> Result<Clock>;

    async fn insert_command(&self, command: &ScheduledCommand) -> Result<InsertOutcome>;

    async fn command(&self, aggregate_id: AggregateId, sequence_number: i64) -> Result<Option<ScheduledCommand>>;

    /// Pending, unclaimed commands of `clock` due at `now`, in delivery order.
    async fn due_commands(&self, clock: &str, now: DateTime<Utc>) -> Result<Vec<ScheduledCommand>>;

    /// Pending, unclaimed commands matching `filter`, in delivery order.
    async fn matching_commands(&self, filter: &CommandFilter) -> Result<Vec<ScheduledCommand>>;

    /// Takes a pending command for delivery: bumps `attempts` and
    /// `row_version` and leases the row for `lease` of wall-clock time.
    /// `None` when the row changed since `command` was read or another
    /// process holds an unexpired lease.
    async fn claim(&self, command: &ScheduledCommand, lease: Duration) -> Result<Option<ScheduledCommand>>;

    /// Marks a claimed command applied at `at` and releases the lease.
    async fn mark_applied(&self, claimed: &ScheduledCommand, at: DateTime<Utc>) -> Result<bool>;

    /// Puts a claimed command back, due at `due_time`.
    async fn mark_retry(&self, claimed: &ScheduledCommand, due_time: DateTime<Utc>) -> Result<bool>;

    /// Marks a claimed command abandoned at `at`.
    async fn mark_abandoned(&self, claimed: &ScheduledCommand, at: DateTime<Utc>) -> Result<bool>;

    async fn record_error(&self, error: &CommandExecutionError) -> Result<()>;

    /// Errors recorded for one command, oldest first.
    async fn command_errors(&self, aggregate_id: AggregateId, sequence_number: i64) -> Result<Vec<CommandExecutionError>>;
}
