//! PostgreSQL scheduler store.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::{AggregateId, ETag, Precondition};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::clock::Clock;
use crate::command::{CommandExecutionError, CommandFilter, ScheduledCommand};
use crate::store::{InsertOutcome, SchedulerStore};
use crate::{Result, SchedulerError};

const COMMAND_COLUMNS: &str = "aggregate_id, sequence_number, aggregate_type, command_name, \
    serialized_command, created_time, due_time, applied_time, final_attempt_time, attempts, \
    clock_name, depends_on_aggregate_id, depends_on_etag, row_version";

const PENDING: &str = "applied_time IS NULL AND final_attempt_time IS NULL \
    AND (claimed_until IS NULL OR claimed_until <= NOW())";

const DELIVERY_ORDER: &str = "ORDER BY due_time ASC NULLS FIRST, sequence_number ASC";

/// Scheduler store over the `clocks`, `scheduled_commands` and
/// `command_errors` tables.
#[derive(Clone)]
pub struct PostgresSchedulerStore {
    pool: PgPool,
}

impl PostgresSchedulerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_clock(row: PgRow) -> Result<Clock> {
        Ok(Clock {
            name: row.try_get("name")?,
            utc_now: row.try_get("utc_now")?,
            start_time: row.try_get("start_time")?,
        })
    }

    fn row_to_command(row: PgRow) -> Result<ScheduledCommand> {
        let depends_on_id: Option<Uuid> = row.try_get("depends_on_aggregate_id")?;
        let depends_on_etag: Option<String> = row.try_get("depends_on_etag")?;
        let delivery_depends_on = match (depends_on_id, depends_on_etag) {
            (Some(id), Some(etag)) => Some(Precondition::new(AggregateId::from_uuid(id), ETag::new(etag))),
            _ => None,
        };
        Ok(ScheduledCommand {
            aggregate_id: AggregateId::from_uuid(row.try_get("aggregate_id")?),
            sequence_number: row.try_get("sequence_number")?,
            aggregate_type: row.try_get("aggregate_type")?,
            command_name: row.try_get("command_name")?,
            serialized_command: row.try_get("serialized_command")?,
            created_time: row.try_get("created_time")?,
            due_time: row.try_get("due_time")?,
            applied_time: row.try_get("applied_time")?,
            final_attempt_time: row.try_get("final_attempt_time")?,
            attempts: row.try_get("attempts")?,
            clock_name: row.try_get("clock_name")?,
            delivery_depends_on,
            row_version: row.try_get("row_version")?,
        })
    }

    /// Runs a conditional update of a claimed row. `set` is the SQL assignment
    /// list, binding the new value as `$4`.
    async fn finish(&self, claimed: &ScheduledCommand, set: &str, value: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE scheduled_commands
            SET {set}, row_version = row_version + 1, claimed_until = NULL
            WHERE aggregate_id = $1 AND sequence_number = $2 AND row_version = $3
            "#
        ))
        .bind(claimed.aggregate_id.as_uuid())
        .bind(claimed.sequence_number)
        .bind(claimed.row_version)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl SchedulerStore for PostgresSchedulerStore {
    async fn create_clock(&self, clock: &Clock) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO clocks (name, utc_now, start_time) VALUES ($1, $2, $3) ON CONFLICT (name) DO NOTHING",
        )
        .bind(&clock.name)
        .bind(clock.utc_now)
        .bind(clock.start_time)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(SchedulerError::ClockAlreadyExists(clock.name.clone()));
        }
        Ok(())
    }

    async fn clock(&self, name: &str) -> Result<Option<Clock>> {
        sqlx::query("SELECT name, utc_now, start_time FROM clocks WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .map(Self::row_to_clock)
            .transpose()
    }

    async fn get_or_create_clock(&self, name: &str, start_time: DateTime<Utc>) -> Result<Clock> {
        sqlx::query(
            "INSERT INTO clocks (name, utc_now, start_time) VALUES ($1, $2, $2) ON CONFLICT (name) DO NOTHING",
        )
        .bind(name)
        .bind(start_time)
        .execute(&self.pool)
        .await?;
        self.clock(name)
            .await?
            .ok_or_else(|| SchedulerError::ClockNotFound(name.to_string()))
    }

    async fn set_clock_time(&self, name: &str, to: DateTime<Utc>) -> Result<Clock> {
        let updated = sqlx::query(
            "UPDATE clocks SET utc_now = $2 WHERE name = $1 AND utc_now <= $2 RETURNING name, utc_now, start_time",
        )
        .bind(name)
        .bind(to)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = updated {
            return Self::row_to_clock(row);
        }
        match self.clock(name).await? {
            Some(clock) => Err(SchedulerError::ClockMovedBackward {
                clock: name.to_string(),
                current: clock.utc_now,
                requested: to,
            }),
            None => Err(SchedulerError::ClockNotFound(name.to_string())),
        }
    }

    async fn insert_command(&self, command: &ScheduledCommand) -> Result<InsertOutcome> {
        let (depends_on_id, depends_on_etag) = match &command.delivery_depends_on {
            Some(p) => (Some(p.aggregate_id.as_uuid()), Some(p.etag.as_str().to_string())),
            None => (None, None),
        };
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO scheduled_commands ({COMMAND_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (aggregate_id, sequence_number) DO NOTHING
            "#
        ))
        .bind(command.aggregate_id.as_uuid())
        .bind(command.sequence_number)
        .bind(&command.aggregate_type)
        .bind(&command.command_name)
        .bind(&command.serialized_command)
        .bind(command.created_time)
        .bind(command.due_time)
        .bind(command.applied_time)
        .bind(command.final_attempt_time)
        .bind(command.attempts)
        .bind(&command.clock_name)
        .bind(depends_on_id)
        .bind(depends_on_etag)
        .bind(command.row_version)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db) = &e
                && db.is_foreign_key_violation()
            {
                return SchedulerError::ClockNotFound(command.clock_name.clone());
            }
            SchedulerError::Database(e)
        })?;
        Ok(if result.rows_affected() == 1 {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::Duplicate
        })
    }

    async fn command(&self, aggregate_id: AggregateId, sequence_number: i64) -> Result<Option<ScheduledCommand>> {
        sqlx::query(&format!(
            "SELECT {COMMAND_COLUMNS} FROM scheduled_commands WHERE aggregate_id = $1 AND sequence_number = $2"
        ))
        .bind(aggregate_id.as_uuid())
        .bind(sequence_number)
        .fetch_optional(&self.pool)
        .await?
        .map(Self::row_to_command)
        .transpose()
    }

    async fn due_commands(&self, clock: &str, now: DateTime<Utc>) -> Result<Vec<ScheduledCommand>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COMMAND_COLUMNS} FROM scheduled_commands
            WHERE clock_name = $1 AND (due_time IS NULL OR due_time <= $2) AND {PENDING}
            {DELIVERY_ORDER}
            "#
        ))
        .bind(clock)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::row_to_command).collect()
    }

    async fn matching_commands(&self, filter: &CommandFilter) -> Result<Vec<ScheduledCommand>> {
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
            "SELECT {COMMAND_COLUMNS} FROM scheduled_commands WHERE {PENDING}"
        ));
        if let Some(clock) = &filter.clock {
            qb.push(" AND clock_name = ").push_bind(clock.clone());
        }
        if let Some(id) = filter.aggregate_id {
            qb.push(" AND aggregate_id = ").push_bind(id.as_uuid());
        }
        if let Some(name) = &filter.command_name {
            qb.push(" AND command_name = ").push_bind(name.clone());
        }
        if let Some(p) = &filter.depends_on {
            qb.push(" AND depends_on_aggregate_id = ")
                .push_bind(p.aggregate_id.as_uuid())
                .push(" AND depends_on_etag = ")
                .push_bind(p.etag.as_str().to_string());
        }
        qb.push(" ").push(DELIVERY_ORDER);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_command).collect()
    }

    async fn claim(&self, command: &ScheduledCommand, lease: Duration) -> Result<Option<ScheduledCommand>> {
        sqlx::query(&format!(
            r#"
            UPDATE scheduled_commands
            SET attempts = attempts + 1,
                row_version = row_version + 1,
                claimed_until = NOW() + make_interval(secs => $4)
            WHERE aggregate_id = $1 AND sequence_number = $2 AND row_version = $3 AND {PENDING}
            RETURNING {COMMAND_COLUMNS}
            "#
        ))
        .bind(command.aggregate_id.as_uuid())
        .bind(command.sequence_number)
        .bind(command.row_version)
        .bind(lease.num_milliseconds() as f64 / 1000.0)
        .fetch_optional(&self.pool)
        .await?
        .map(Self::row_to_command)
        .transpose()
    }

    async fn mark_applied(&self, claimed: &ScheduledCommand, at: DateTime<Utc>) -> Result<bool> {
        self.finish(claimed, "applied_time = $4", at).await
    }

    async fn mark_retry(&self, claimed: &ScheduledCommand, due_time: DateTime<Utc>) -> Result<bool> {
        self.finish(claimed, "due_time = $4", due_time).await
    }

    async fn mark_abandoned(&self, claimed: &ScheduledCommand, at: DateTime<Utc>) -> Result<bool> {
        self.finish(claimed, "final_attempt_time = $4", at).await
    }

    async fn record_error(&self, error: &CommandExecutionError) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO command_errors (aggregate_id, sequence_number, error, attempt, recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(error.aggregate_id.as_uuid())
        .bind(error.sequence_number)
        .bind(&error.error)
        .bind(error.attempt)
        .bind(error.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn command_errors(&self, aggregate_id: AggregateId, sequence_number: i64) -> Result<Vec<CommandExecutionError>> {
        let rows = sqlx::query(
            r#"
            SELECT aggregate_id, sequence_number, error, attempt, recorded_at
            FROM command_errors
            WHERE aggregate_id = $1 AND sequence_number = $2
            ORDER BY id ASC
            "#,
        )
        .bind(aggregate_id.as_uuid())
        .bind(sequence_number)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| -> Result<CommandExecutionError> {
                Ok(CommandExecutionError {
                    aggregate_id: AggregateId::from_uuid(row.try_get("aggregate_id")?),
                    sequence_number: row.try_get("sequence_number")?,
                    error: row.try_get("error")?,
                    attempt: row.try_get("attempt")?,
                    recorded_at: row.try_get("recorded_at")?,
                })
            })
            .collect()
    }
}
