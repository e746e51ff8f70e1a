//! The command scheduler.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Duration, Utc};
use common::AggregateId;
use uuid::Uuid;

use crate::clock::{AdvanceTo, Clock};
use crate::command::{
    CommandDeliveryReport, CommandExecutionError, CommandFilter, ScheduleOutcome, ScheduleRequest, ScheduledCommand,
    ScheduledCommandHandle, SchedulerAdvancedResult, default_clock_name,
};
use crate::delivery::{CommandDeliverer, DeliveryFailure};
use crate::etag::ETagChecker;
use crate::reservation::{InMemoryReservationService, ReservationService};
use crate::retry::{RetryDecision, RetryDirective, RetryPolicy};
use crate::store::{InsertOutcome, SchedulerStore};
use crate::{Result, SchedulerError};

/// Reservation scope of idempotency tokens.
pub const IDEMPOTENCY_SCOPE: &str = "ScheduledCommand";

/// Tries at finding a free scheduler-assigned sequence number.
const MAX_RENUMBER_ATTEMPTS: u32 = 100;

/// Wall-clock time a delivering process holds a claimed command.
const DEFAULT_CLAIM_LEASE: Duration = Duration::minutes(1);

/// Builder for [`CommandScheduler`].
pub struct CommandSchedulerBuilder<S> {
    store: S,
    deliverer: Arc<dyn CommandDeliverer>,
    etags: Arc<dyn ETagChecker>,
    reservations: Option<Arc<dyn ReservationService>>,
    retry_policy: RetryPolicy,
    default_clock: String,
    sequence_seed: Option<i64>,
    claim_lease: Duration,
}

impl<S: SchedulerStore + 'static> CommandSchedulerBuilder<S> {
    /// Where idempotency tokens are reserved. In memory by default.
    pub fn reservations(mut self, reservations: Arc<dyn ReservationService>) -> Self {
        self.reservations = Some(reservations);
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Clock for requests that do not name one.
    pub fn default_clock(mut self, name: impl Into<String>) -> Self {
        self.default_clock = name.into();
        self
    }

    /// First scheduler-assigned sequence number; later ones count down from
    /// it. Must be negative. Defaults to the negated wall-clock time in
    /// microseconds, so separate processes rarely collide.
    pub fn sequence_seed(mut self, seed: i64) -> Self {
        self.sequence_seed = Some(seed);
        self
    }

    pub fn claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    /// # Panics
    ///
    /// Panics if the sequence seed is not negative.
    pub fn build(self) -> CommandScheduler<S> {
        let seed = self
            .sequence_seed
            .unwrap_or_else(|| -Utc::now().timestamp_micros());
        assert!(seed < 0, "scheduler-assigned sequence numbers must be negative");

        CommandScheduler {
            inner: Arc::new(Inner {
                store: self.store,
                deliverer: self.deliverer,
                etags: self.etags,
                reservations: self
                    .reservations
                    .unwrap_or_else(|| Arc::new(InMemoryReservationService::new())),
                retry_policy: self.retry_policy,
                default_clock: self.default_clock,
                next_sequence: AtomicI64::new(seed),
                claim_lease: self.claim_lease,
            }),
        }
    }
}

struct Inner<S> {
    store: S,
    deliverer: Arc<dyn CommandDeliverer>,
    etags: Arc<dyn ETagChecker>,
    reservations: Arc<dyn ReservationService>,
    retry_policy: RetryPolicy,
    default_clock: String,
    next_sequence: AtomicI64,
    claim_lease: Duration,
}

/// Schedules commands against aggregates and delivers them when due.
///
/// Commands are due against named clocks. A clock moves only when
/// [`advance_clock`](Self::advance_clock) is called, which delivers every
/// command that became due. Commands may also wait for a precondition: an
/// etag recorded on some aggregate. Delivery is claimed through the store's
/// optimistic concurrency, so competing schedulers deliver each command once.
pub struct CommandScheduler<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for CommandScheduler<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: SchedulerStore + 'static> CommandScheduler<S> {
    pub fn builder(
        store: S,
        deliverer: Arc<dyn CommandDeliverer>,
        etags: Arc<dyn ETagChecker>,
    ) -> CommandSchedulerBuilder<S> {
        CommandSchedulerBuilder {
            store,
            deliverer,
            etags,
            reservations: None,
            retry_policy: RetryPolicy::default(),
            default_clock: default_clock_name(),
            sequence_seed: None,
            claim_lease: DEFAULT_CLAIM_LEASE,
        }
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn default_clock(&self) -> &str {
        &self.inner.default_clock
    }

    /// Creates a clock standing at `start_time`.
    ///
    /// Fails with [`SchedulerError::ClockAlreadyExists`] if the name is taken.
    #[tracing::instrument(skip(self))]
    pub async fn create_clock(&self, name: &str, start_time: DateTime<Utc>) -> Result<Clock> {
        let clock = Clock::new(name, start_time);
        self.inner.store.create_clock(&clock).await?;
        tracing::info!(clock = name, %start_time, "clock created");
        Ok(clock)
    }

    pub async fn clock(&self, name: &str) -> Result<Option<Clock>> {
        self.inner.store.clock(name).await
    }

    pub async fn command(&self, aggregate_id: AggregateId, sequence_number: i64) -> Result<Option<ScheduledCommand>> {
        self.inner.store.command(aggregate_id, sequence_number).await
    }

    pub async fn command_errors(
        &self,
        aggregate_id: AggregateId,
        sequence_number: i64,
    ) -> Result<Vec<CommandExecutionError>> {
        self.inner.store.command_errors(aggregate_id, sequence_number).await
    }

    /// Schedules a command.
    ///
    /// The command is stored, then delivered at once if it is due on its
    /// clock and its precondition, if any, has been recorded. A request
    /// whose key or idempotency token was already used is a duplicate and
    /// does nothing. A clock the request names is created at the current
    /// wall-clock time if it does not exist yet.
    #[tracing::instrument(
        skip(self, request),
        fields(aggregate_id = %request.aggregate_id, command = %request.command_name)
    )]
    pub async fn schedule(&self, request: ScheduleRequest) -> Result<ScheduledCommandHandle> {
        let clock_name = request.clock_name(&self.inner.default_clock).to_string();
        let clock = self.inner.store.get_or_create_clock(&clock_name, Utc::now()).await?;

        let reservation = match request.idempotency_token.clone() {
            Some(token) => {
                let owner = Uuid::new_v4().to_string();
                if !self
                    .inner
                    .reservations
                    .reserve(&token, IDEMPOTENCY_SCOPE, &owner, None)
                    .await?
                {
                    tracing::debug!(%token, "idempotency token already used");
                    return Ok(duplicate_handle(&request, clock_name));
                }
                Some((token, owner))
            }
            None => None,
        };

        let result = if request.durable {
            self.schedule_durable(request, &clock).await
        } else {
            self.schedule_transient(request, &clock).await
        };

        if let Some((token, owner)) = reservation {
            let reservations = &self.inner.reservations;
            match &result {
                Ok(handle) if handle.outcome != ScheduleOutcome::Duplicate => {
                    reservations.confirm(&token, IDEMPOTENCY_SCOPE, &owner).await?;
                }
                _ => {
                    reservations.cancel(&token, IDEMPOTENCY_SCOPE, &owner).await?;
                }
            }
        }
        result
    }

    async fn schedule_durable(&self, request: ScheduleRequest, clock: &Clock) -> Result<ScheduledCommandHandle> {
        let Some(command) = self.insert(&request, clock).await? else {
            return Ok(duplicate_handle(&request, clock.name.clone()));
        };

        let outcome = if command.is_due(clock.utc_now) {
            match self.deliver(&command, clock.utc_now).await? {
                Some(report) if report.error.is_none() => ScheduleOutcome::Delivered,
                Some(_) => ScheduleOutcome::Failed,
                None => ScheduleOutcome::Pending,
            }
        } else {
            ScheduleOutcome::Pending
        };
        Ok(handle(&command, outcome))
    }

    /// Delivers without storing when possible. Only a failed delivery, or
    /// one that cannot happen yet, leaves a row behind.
    async fn schedule_transient(&self, request: ScheduleRequest, clock: &Clock) -> Result<ScheduledCommandHandle> {
        let sequence_number = match request.sequence_number {
            Some(n) => n,
            None => self.next_sequence_number(),
        };
        if request.sequence_number.is_some()
            && self
                .inner
                .store
                .command(request.aggregate_id, sequence_number)
                .await?
                .is_some()
        {
            return Ok(duplicate_handle(&request, clock.name.clone()));
        }
        let mut command = request
            .clone()
            .into_command(sequence_number, clock.name.clone(), clock.utc_now)?;

        if !self.is_deliverable(&command, clock.utc_now).await? {
            return self.schedule_durable(request, clock).await;
        }

        command.attempts = 1;
        let Err(failure) = self.inner.deliverer.deliver(&command, clock.utc_now).await else {
            metrics::counter!("scheduler_commands_delivered_total", "command" => command.command_name.clone())
                .increment(1);
            tracing::debug!(sequence_number, "delivered without storing");
            return Ok(handle(&command, ScheduleOutcome::Delivered));
        };

        let decision = self.decide(&failure, command.attempts, clock.utc_now);
        match decision {
            RetryDecision::RetryAt(at) => command.due_time = Some(at),
            RetryDecision::Abandon => command.final_attempt_time = Some(clock.utc_now),
        }
        if self.inner.store.insert_command(&command).await? == InsertOutcome::Duplicate {
            return Ok(duplicate_handle(&request, clock.name.clone()));
        }
        self.record_failure(&command, &failure, decision).await?;
        Ok(handle(&command, ScheduleOutcome::Failed))
    }

    /// Stores a new command. `None` when a caller-assigned key is taken.
    async fn insert(&self, request: &ScheduleRequest, clock: &Clock) -> Result<Option<ScheduledCommand>> {
        if let Some(sequence_number) = request.sequence_number {
            let command = request
                .clone()
                .into_command(sequence_number, clock.name.clone(), clock.utc_now)?;
            return Ok(match self.inner.store.insert_command(&command).await? {
                InsertOutcome::Inserted => Some(command),
                InsertOutcome::Duplicate => {
                    tracing::debug!(sequence_number, "command already scheduled");
                    None
                }
            });
        }

        for _ in 0..MAX_RENUMBER_ATTEMPTS {
            let command = request
                .clone()
                .into_command(self.next_sequence_number(), clock.name.clone(), clock.utc_now)?;
            match self.inner.store.insert_command(&command).await? {
                InsertOutcome::Inserted => return Ok(Some(command)),
                InsertOutcome::Duplicate => {
                    tracing::debug!(sequence_number = command.sequence_number, "sequence number taken, renumbering");
                }
            }
        }
        Err(SchedulerError::SequenceExhausted {
            aggregate_id: request.aggregate_id,
            attempts: MAX_RENUMBER_ATTEMPTS,
        })
    }

    fn next_sequence_number(&self) -> i64 {
        self.inner.next_sequence.fetch_sub(1, Ordering::Relaxed)
    }

    /// Moves a clock forward and delivers every command that is now due on it,
    /// earliest first.
    ///
    /// A backward move fails with [`SchedulerError::ClockMovedBackward`] and
    /// changes nothing.
    #[tracing::instrument(skip(self))]
    pub async fn advance_clock(&self, name: &str, to: AdvanceTo) -> Result<SchedulerAdvancedResult> {
        let current = self
            .inner
            .store
            .clock(name)
            .await?
            .ok_or_else(|| SchedulerError::ClockNotFound(name.to_string()))?;
        let target = to
            .resolve(current.utc_now)
            .ok_or_else(|| SchedulerError::ClockOutOfRange {
                clock: name.to_string(),
                current: current.utc_now,
            })?;
        let clock = self.inner.store.set_clock_time(name, target).await?;
        metrics::counter!("scheduler_clock_advances_total", "clock" => name.to_string()).increment(1);

        let due = self.inner.store.due_commands(name, clock.utc_now).await?;
        tracing::info!(clock = name, now = %clock.utc_now, due = due.len(), "clock advanced");

        let mut result = SchedulerAdvancedResult::default();
        for command in due {
            if let Some(report) = self.deliver(&command, clock.utc_now).await? {
                push_report(&mut result, report);
            }
        }
        Ok(result)
    }

    /// Delivers the pending commands selected by `filter`, each at the time
    /// of its own clock.
    #[tracing::instrument(skip(self))]
    pub async fn trigger(&self, filter: CommandFilter) -> Result<SchedulerAdvancedResult> {
        let commands = self.inner.store.matching_commands(&filter).await?;
        let mut clocks: HashMap<String, DateTime<Utc>> = HashMap::new();
        let mut result = SchedulerAdvancedResult::default();

        for command in commands {
            let now = match clocks.get(&command.clock_name) {
                Some(now) => *now,
                None => {
                    let now = match self.inner.store.clock(&command.clock_name).await? {
                        Some(clock) => clock.utc_now,
                        None => Utc::now(),
                    };
                    clocks.insert(command.clock_name.clone(), now);
                    now
                }
            };
            if filter.only_due && !command.is_due(now) {
                continue;
            }
            if let Some(report) = self.deliver(&command, now).await? {
                push_report(&mut result, report);
            }
        }
        Ok(result)
    }

    async fn is_deliverable(&self, command: &ScheduledCommand, now: DateTime<Utc>) -> Result<bool> {
        Ok(command.is_due(now) && self.precondition_met(command).await?)
    }

    async fn precondition_met(&self, command: &ScheduledCommand) -> Result<bool> {
        match &command.delivery_depends_on {
            Some(precondition) => self.inner.etags.has_been_recorded(precondition).await,
            None => Ok(true),
        }
    }

    /// Claims and delivers one command at clock time `now`.
    ///
    /// `None` when the command was skipped: its precondition is unmet or
    /// another process claimed it first. Neither counts as an attempt.
    #[tracing::instrument(
        skip(self, command),
        fields(aggregate_id = %command.aggregate_id, sequence_number = command.sequence_number, command = %command.command_name)
    )]
    async fn deliver(&self, command: &ScheduledCommand, now: DateTime<Utc>) -> Result<Option<CommandDeliveryReport>> {
        if !self.precondition_met(command).await? {
            tracing::debug!("precondition not yet recorded");
            return Ok(None);
        }
        let Some(claimed) = self.inner.store.claim(command, self.inner.claim_lease).await? else {
            tracing::debug!("claimed elsewhere");
            return Ok(None);
        };

        match self.inner.deliverer.deliver(&claimed, now).await {
            Ok(()) => {
                if !self.inner.store.mark_applied(&claimed, now).await? {
                    // The lease ran out and another delivery owns the row now
                    tracing::warn!("claim lost while delivering");
                    return Ok(None);
                }
                metrics::counter!("scheduler_commands_delivered_total", "command" => claimed.command_name.clone())
                    .increment(1);
                tracing::debug!(attempts = claimed.attempts, "delivered");
                Ok(Some(report(&claimed, None, None)))
            }
            Err(failure) => {
                let decision = self.decide(&failure, claimed.attempts, now);
                let written = match decision {
                    RetryDecision::RetryAt(at) => self.inner.store.mark_retry(&claimed, at).await?,
                    RetryDecision::Abandon => self.inner.store.mark_abandoned(&claimed, now).await?,
                };
                if !written {
                    tracing::warn!(error = %failure.error, "claim lost while delivering");
                    return Ok(None);
                }
                Ok(Some(self.record_failure(&claimed, &failure, decision).await?))
            }
        }
    }

    fn decide(&self, failure: &DeliveryFailure, attempts: i32, now: DateTime<Utc>) -> RetryDecision {
        let directive = if failure.concurrency {
            RetryDirective::After(Duration::zero())
        } else {
            failure.retry
        };
        self.inner.retry_policy.decide(directive, attempts, now)
    }

    async fn record_failure(
        &self,
        command: &ScheduledCommand,
        failure: &DeliveryFailure,
        decision: RetryDecision,
    ) -> Result<CommandDeliveryReport> {
        self.inner
            .store
            .record_error(&CommandExecutionError {
                aggregate_id: command.aggregate_id,
                sequence_number: command.sequence_number,
                error: failure.error.clone(),
                attempt: command.attempts,
                recorded_at: Utc::now(),
            })
            .await?;

        let name = command.command_name.clone();
        Ok(match decision {
            RetryDecision::RetryAt(at) => {
                metrics::counter!("scheduler_commands_failed_total", "command" => name).increment(1);
                tracing::warn!(error = %failure.error, attempts = command.attempts, retry_at = %at, "delivery failed");
                report(command, Some(failure.error.clone()), Some(at))
            }
            RetryDecision::Abandon => {
                metrics::counter!("scheduler_commands_abandoned_total", "command" => name).increment(1);
                tracing::warn!(error = %failure.error, attempts = command.attempts, "delivery failed, abandoning");
                CommandDeliveryReport {
                    abandoned: true,
                    ..report(command, Some(failure.error.clone()), None)
                }
            }
        })
    }
}

fn report(command: &ScheduledCommand, error: Option<String>, retry_at: Option<DateTime<Utc>>) -> CommandDeliveryReport {
    CommandDeliveryReport {
        aggregate_id: command.aggregate_id,
        sequence_number: command.sequence_number,
        command_name: command.command_name.clone(),
        attempts: command.attempts,
        error,
        abandoned: false,
        retry_at,
    }
}

fn push_report(result: &mut SchedulerAdvancedResult, report: CommandDeliveryReport) {
    if report.error.is_none() {
        result.successful_commands.push(report);
    } else {
        result.failed_commands.push(report);
    }
}

fn handle(command: &ScheduledCommand, outcome: ScheduleOutcome) -> ScheduledCommandHandle {
    ScheduledCommandHandle {
        aggregate_id: command.aggregate_id,
        sequence_number: Some(command.sequence_number),
        command_name: command.command_name.clone(),
        clock_name: command.clock_name.clone(),
        due_time: command.due_time,
        outcome,
    }
}

fn duplicate_handle(request: &ScheduleRequest, clock_name: String) -> ScheduledCommandHandle {
    ScheduledCommandHandle {
        aggregate_id: request.aggregate_id,
        sequence_number: request.sequence_number,
        command_name: request.command_name.clone(),
        clock_name,
        due_time: request.due_time,
        outcome: ScheduleOutcome::Duplicate,
    }
}
