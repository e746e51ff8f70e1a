//! PostgreSQL read model store.

use async_trait::async_trait;
use common::{AggregateId, EventId};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::read_model_info::{EventHandlingError, ReadModelInfo};
use crate::store::{ReadModelStore, UnitOfWork};
use crate::Result;

const INFO_COLUMNS: &str = "name, current_as_of_event_id, initial_catchup_start_time, \
    initial_catchup_end_time, initial_catchup_events, batch_start_time, batch_total_events, \
    batch_remaining_events, last_updated, latency_ms, failed_on_event_id, error";

/// Read model store over the `read_model_info` and `event_handling_errors`
/// tables.
///
/// Projectors writing through a [`PostgresUnitOfWork`] share its transaction,
/// so their rows commit atomically with their progress.
#[derive(Clone)]
pub struct PostgresReadModelStore {
    pool: PgPool,
}

impl PostgresReadModelStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_info(row: PgRow) -> Result<ReadModelInfo> {
        let failed_on: Option<i64> = row.try_get("failed_on_event_id")?;
        Ok(ReadModelInfo {
            name: row.try_get("name")?,
            current_as_of_event_id: EventId::new(row.try_get::<i64, _>("current_as_of_event_id")? as u64),
            initial_catchup_start_time: row.try_get("initial_catchup_start_time")?,
            initial_catchup_end_time: row.try_get("initial_catchup_end_time")?,
            initial_catchup_events: row.try_get::<i64, _>("initial_catchup_events")? as u64,
            batch_start_time: row.try_get("batch_start_time")?,
            batch_total_events: row.try_get::<i64, _>("batch_total_events")? as u64,
            batch_remaining_events: row.try_get::<i64, _>("batch_remaining_events")? as u64,
            last_updated: row.try_get("last_updated")?,
            latency_ms: row.try_get("latency_ms")?,
            failed_on_event_id: failed_on.map(|id| EventId::new(id as u64)),
            error: row.try_get("error")?,
        })
    }

    fn row_to_error(row: PgRow) -> Result<EventHandlingError> {
        Ok(EventHandlingError {
            id: Some(row.try_get("id")?),
            aggregate_id: AggregateId::from_uuid(row.try_get::<Uuid, _>("aggregate_id")?),
            sequence_number: row.try_get("sequence_number")?,
            stream_name: row.try_get("stream_name")?,
            event_type: row.try_get("event_type")?,
            serialized_event: row.try_get("serialized_event")?,
            error: row.try_get("error")?,
            actor: row.try_get("actor")?,
            original_id: EventId::new(row.try_get::<i64, _>("original_id")? as u64),
            utc_time: row.try_get("utc_time")?,
        })
    }
}

#[async_trait]
impl ReadModelStore for PostgresReadModelStore {
    type UnitOfWork = PostgresUnitOfWork;

    async fn load_progress(&self, names: &[String]) -> Result<Vec<ReadModelInfo>> {
        sqlx::query(
            "INSERT INTO read_model_info (name) SELECT UNNEST($1::text[]) ON CONFLICT (name) DO NOTHING",
        )
        .bind(names)
        .execute(&self.pool)
        .await?;

        let rows = sqlx::query(&format!(
            "SELECT {INFO_COLUMNS} FROM read_model_info WHERE name = ANY($1)"
        ))
        .bind(names)
        .fetch_all(&self.pool)
        .await?;

        let mut loaded = rows
            .into_iter()
            .map(Self::row_to_info)
            .collect::<Result<Vec<_>>>()?;

        Ok(names
            .iter()
            .map(|name| {
                loaded
                    .iter()
                    .position(|info| &info.name == name)
                    .map(|i| loaded.swap_remove(i))
                    .unwrap_or_else(|| ReadModelInfo::new(name.clone()))
            })
            .collect())
    }

    async fn all_progress(&self) -> Result<Vec<ReadModelInfo>> {
        let rows = sqlx::query(&format!(
            "SELECT {INFO_COLUMNS} FROM read_model_info ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::row_to_info).collect()
    }

    async fn begin(&self) -> Result<PostgresUnitOfWork> {
        Ok(PostgresUnitOfWork {
            tx: self.pool.begin().await?,
        })
    }

    async fn record_handling_error(&self, error: EventHandlingError) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO event_handling_errors
                (aggregate_id, sequence_number, stream_name, event_type, serialized_event, error, actor, original_id, utc_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(error.aggregate_id.as_uuid())
        .bind(error.sequence_number)
        .bind(&error.stream_name)
        .bind(&error.event_type)
        .bind(&error.serialized_event)
        .bind(&error.error)
        .bind(&error.actor)
        .bind(error.original_id.as_u64() as i64)
        .bind(error.utc_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_failure(&self, name: &str, event_id: EventId, message: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO read_model_info (name, current_as_of_event_id, failed_on_event_id, error, last_updated)
            VALUES ($1, $2, $2, $3, NOW())
            ON CONFLICT (name) DO UPDATE
            SET current_as_of_event_id = GREATEST(read_model_info.current_as_of_event_id, EXCLUDED.current_as_of_event_id),
                failed_on_event_id = EXCLUDED.failed_on_event_id,
                error = EXCLUDED.error,
                last_updated = EXCLUDED.last_updated
            "#,
        )
        .bind(name)
        .bind(event_id.as_u64() as i64)
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn handling_errors(&self) -> Result<Vec<EventHandlingError>> {
        let rows = sqlx::query(
            r#"
            SELECT id, aggregate_id, sequence_number, stream_name, event_type, serialized_event,
                   error, actor, original_id, utc_time
            FROM event_handling_errors
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::row_to_error).collect()
    }
}

/// A database transaction shared by a projector and its progress row.
pub struct PostgresUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

impl PostgresUnitOfWork {
    /// The connection projectors run their statements on.
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut *self.tx
    }
}

#[async_trait]
impl UnitOfWork for PostgresUnitOfWork {
    async fn save_progress(&mut self, info: &ReadModelInfo) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO read_model_info (
                name, current_as_of_event_id, initial_catchup_start_time, initial_catchup_end_time,
                initial_catchup_events, batch_start_time, batch_total_events, batch_remaining_events,
                last_updated, latency_ms, failed_on_event_id, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (name) DO UPDATE SET
                current_as_of_event_id = GREATEST(read_model_info.current_as_of_event_id, EXCLUDED.current_as_of_event_id),
                initial_catchup_start_time = EXCLUDED.initial_catchup_start_time,
                initial_catchup_end_time = EXCLUDED.initial_catchup_end_time,
                initial_catchup_events = EXCLUDED.initial_catchup_events,
                batch_start_time = EXCLUDED.batch_start_time,
                batch_total_events = EXCLUDED.batch_total_events,
                batch_remaining_events = EXCLUDED.batch_remaining_events,
                last_updated = EXCLUDED.last_updated,
                latency_ms = EXCLUDED.latency_ms,
                failed_on_event_id = EXCLUDED.failed_on_event_id,
                error = EXCLUDED.error
            "#,
        )
        .bind(&info.name)
        .bind(info.current_as_of_event_id.as_u64() as i64)
        .bind(info.initial_catchup_start_time)
        .bind(info.initial_catchup_end_time)
        .bind(info.initial_catchup_events as i64)
        .bind(info.batch_start_time)
        .bind(info.batch_total_events as i64)
        .bind(info.batch_remaining_events as i64)
        .bind(info.last_updated)
        .bind(info.latency_ms)
        .bind(info.failed_on_event_id.map(|id| id.as_u64() as i64))
        .bind(&info.error)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
