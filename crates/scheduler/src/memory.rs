//! In-memory scheduler store.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::AggregateId;
use tokio::sync::RwLock;

use crate::clock::{Clock, lease_end};
use crate::command::{CommandExecutionError, CommandFilter, ScheduledCommand};
use crate::store::{InsertOutcome, SchedulerStore};
use crate::{Result, SchedulerError};

type CommandKey = (AggregateId, i64);

struct Row {
    command: ScheduledCommand,
    claimed_until: Option<DateTime<Utc>>,
}

impl Row {
    fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.command.is_pending() && self.claimed_until.is_none_or(|until| until <= now)
    }
}

#[derive(Default)]
struct State {
    clocks: BTreeMap<String, Clock>,
    commands: BTreeMap<CommandKey, Row>,
    errors: Vec<CommandExecutionError>,
}

impl State {
    /// Applies `change` to a claimed row if nobody wrote it since the claim.
    fn finish(&mut self, claimed: &ScheduledCommand, change: impl FnOnce(&mut ScheduledCommand)) -> bool {
        let key = (claimed.aggregate_id, claimed.sequence_number);
        match self.commands.get_mut(&key) {
            Some(row) if row.command.row_version == claimed.row_version => {
                change(&mut row.command);
                row.command.row_version += 1;
                row.claimed_until = None;
                true
            }
            _ => false,
        }
    }
}

/// Scheduler store kept in process memory. Clones share state.
#[derive(Clone, Default)]
pub struct InMemorySchedulerStore {
    state: Arc<RwLock<State>>,
}

impl InMemorySchedulerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored command, in key order.
    pub async fn commands(&self) -> Vec<ScheduledCommand> {
        self.state
            .read()
            .await
            .commands
            .values()
            .map(|row| row.command.clone())
            .collect()
    }
}

fn sorted(mut commands: Vec<ScheduledCommand>) -> Vec<ScheduledCommand> {
    commands.sort_by_key(ScheduledCommand::delivery_key);
    commands
}

#[async_trait]
impl SchedulerStore for InMemorySchedulerStore {
    async fn create_clock(&self, clock: &Clock) -> Result<()> {
        let mut state = self.state.write().await;
        if state.clocks.contains_key(&clock.name) {
            return Err(SchedulerError::ClockAlreadyExists(clock.name.clone()));
        }
        state.clocks.insert(clock.name.clone(), clock.clone());
        Ok(())
    }

    async fn clock(&self, name: &str) -> Result<Option<Clock>> {
        Ok(self.state.read().await.clocks.get(name).cloned())
    }

    async fn get_or_create_clock(&self, name: &str, start_time: DateTime<Utc>) -> Result<Clock> {
        let mut state = self.state.write().await;
        Ok(state
            .clocks
            .entry(name.to_string())
            .or_insert_with(|| Clock::new(name, start_time))
            .clone())
    }

    async fn set_clock_time(&self, name: &str, to: DateTime<Utc>) -> Result<Clock> {
        let mut state = self.state.write().await;
        let clock = state
            .clocks
            .get_mut(name)
            .ok_or_else(|| SchedulerError::ClockNotFound(name.to_string()))?;
        if to < clock.utc_now {
            return Err(SchedulerError::ClockMovedBackward {
                clock: name.to_string(),
                current: clock.utc_now,
                requested: to,
            });
        }
        clock.utc_now = to;
        Ok(clock.clone())
    }

    async fn insert_command(&self, command: &ScheduledCommand) -> Result<InsertOutcome> {
        let mut state = self.state.write().await;
        if !state.clocks.contains_key(&command.clock_name) {
            return Err(SchedulerError::ClockNotFound(command.clock_name.clone()));
        }
        let key = (command.aggregate_id, command.sequence_number);
        if state.commands.contains_key(&key) {
            return Ok(InsertOutcome::Duplicate);
        }
        state.commands.insert(
            key,
            Row {
                command: command.clone(),
                claimed_until: None,
            },
        );
        Ok(InsertOutcome::Inserted)
    }

    async fn command(&self, aggregate_id: AggregateId, sequence_number: i64) -> Result<Option<ScheduledCommand>> {
        Ok(self
            .state
            .read()
            .await
            .commands
            .get(&(aggregate_id, sequence_number))
            .map(|row| row.command.clone()))
    }

    async fn due_commands(&self, clock: &str, now: DateTime<Utc>) -> Result<Vec<ScheduledCommand>> {
        let wall = Utc::now();
        let state = self.state.read().await;
        Ok(sorted(
            state
                .commands
                .values()
                .filter(|row| {
                    row.is_available(wall) && row.command.clock_name == clock && row.command.is_due(now)
                })
                .map(|row| row.command.clone())
                .collect(),
        ))
    }

    async fn matching_commands(&self, filter: &CommandFilter) -> Result<Vec<ScheduledCommand>> {
        let wall = Utc::now();
        let state = self.state.read().await;
        Ok(sorted(
            state
                .commands
                .values()
                .filter(|row| row.is_available(wall) && filter.matches(&row.command))
                .map(|row| row.command.clone())
                .collect(),
        ))
    }

    async fn claim(&self, command: &ScheduledCommand, lease: Duration) -> Result<Option<ScheduledCommand>> {
        let wall = Utc::now();
        let mut state = self.state.write().await;
        let key = (command.aggregate_id, command.sequence_number);
        let Some(row) = state.commands.get_mut(&key) else {
            return Ok(None);
        };
        if row.command.row_version != command.row_version || !row.is_available(wall) {
            return Ok(None);
        }
        row.command.attempts += 1;
        row.command.row_version += 1;
        row.claimed_until = Some(lease_end(wall, lease));
        Ok(Some(row.command.clone()))
    }

    async fn mark_applied(&self, claimed: &ScheduledCommand, at: DateTime<Utc>) -> Result<bool> {
        Ok(self
            .state
            .write()
            .await
            .finish(claimed, |c| c.applied_time = Some(at)))
    }

    async fn mark_retry(&self, claimed: &ScheduledCommand, due_time: DateTime<Utc>) -> Result<bool> {
        Ok(self
            .state
            .write()
            .await
            .finish(claimed, |c| c.due_time = Some(due_time)))
    }

    async fn mark_abandoned(&self, claimed: &ScheduledCommand, at: DateTime<Utc>) -> Result<bool> {
        Ok(self
            .state
            .write()
            .await
            .finish(claimed, |c| c.final_attempt_time = Some(at)))
    }

    async fn record_error(&self, error: &CommandExecutionError) -> Result<()> {
        self.state.write().await.errors.push(error.clone());
        Ok(())
    }

    async fn command_errors(&self, aggregate_id: AggregateId, sequence_number: i64) -> Result<Vec<CommandExecutionError>> {
        Ok(self
            .state
            .read()
            .await
            .errors
            .iter()
            .filter(|e| e.aggregate_id == aggregate_id && e.sequence_number == sequence_number)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ScheduleRequest;
    use domain::ShipOrder;

    async fn store_with_command(due_time: Option<DateTime<Utc>>) -> (InMemorySchedulerStore, ScheduledCommand) {
        let store = InMemorySchedulerStore::new();
        let now = Utc::now();
        store.create_clock(&Clock::new("c", now)).await.unwrap();
        let mut request = ScheduleRequest::for_command(&ShipOrder {
            order_id: AggregateId::new(),
        })
        .unwrap();
        request.due_time = due_time;
        let command = request.into_command(-1, "c".to_string(), now).unwrap();
        assert_eq!(store.insert_command(&command).await.unwrap(), InsertOutcome::Inserted);
        (store, command)
    }

    #[tokio::test]
    async fn clocks_only_move_forward() {
        let store = InMemorySchedulerStore::new();
        let start = Utc::now();
        store.create_clock(&Clock::new("c", start)).await.unwrap();

        let err = store.set_clock_time("c", start - Duration::seconds(1)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::ClockMovedBackward { .. }));
        assert_eq!(store.clock("c").await.unwrap().unwrap().utc_now, start);

        let later = start + Duration::days(1);
        assert_eq!(store.set_clock_time("c", later).await.unwrap().utc_now, later);
        assert!(matches!(
            store.create_clock(&Clock::new("c", start)).await,
            Err(SchedulerError::ClockAlreadyExists(_))
        ));
        assert!(matches!(
            store.set_clock_time("missing", later).await,
            Err(SchedulerError::ClockNotFound(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_keys_are_reported() {
        let (store, command) = store_with_command(None).await;
        assert_eq!(store.insert_command(&command).await.unwrap(), InsertOutcome::Duplicate);
    }

    #[tokio::test]
    async fn only_one_claim_wins() {
        let (store, command) = store_with_command(None).await;
        let claimed = store.claim(&command, Duration::minutes(1)).await.unwrap().unwrap();
        assert_eq!(claimed.attempts, 1);

        assert!(store.claim(&command, Duration::minutes(1)).await.unwrap().is_none());
        assert!(store.claim(&claimed, Duration::minutes(1)).await.unwrap().is_none());
        assert!(store.due_commands("c", Utc::now()).await.unwrap().is_empty());

        assert!(store.mark_applied(&claimed, Utc::now()).await.unwrap());
        assert!(!store.mark_applied(&claimed, Utc::now()).await.unwrap());
        assert!(store.command(command.aggregate_id, -1).await.unwrap().unwrap().is_applied());
    }

    #[tokio::test]
    async fn expired_lease_can_be_reclaimed() {
        let (store, command) = store_with_command(None).await;
        let claimed = store.claim(&command, Duration::zero()).await.unwrap().unwrap();
        let again = store.claim(&claimed, Duration::minutes(1)).await.unwrap().unwrap();
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn retry_moves_the_due_time() {
        let now = Utc::now();
        let (store, command) = store_with_command(Some(now)).await;
        assert_eq!(store.due_commands("c", now).await.unwrap().len(), 1);

        let claimed = store.claim(&command, Duration::minutes(1)).await.unwrap().unwrap();
        assert!(store.mark_retry(&claimed, now + Duration::minutes(1)).await.unwrap());
        assert!(store.due_commands("c", now).await.unwrap().is_empty());
        assert_eq!(
            store.due_commands("c", now + Duration::minutes(1)).await.unwrap().len(),
            1
        );
    }
}
