use std::time::Duration;

use async_trait::async_trait;
use futures_util::{TryStreamExt, stream};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, postgres::PgRow};
use tokio::time::Instant;
use uuid::Uuid;

use crate::{
    AggregateId, ETag, EventFilter, EventId, EventStoreError, LockGuard, NamedLock, NewEvent,
    Result, StoredEvent,
    store::{EventStore, EventStream, validate_new_events},
};

/// Advisory lock key serializing appends so ids become visible in order.
///
/// Without it, a reader could observe id N+1 committed before id N and move
/// its cursor past N forever.
const APPEND_LOCK_KEY: i64 = 0x6576_656e_7473;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long a successful liveness probe of a lock session is trusted.
const LOCK_PROBE_INTERVAL: Duration = Duration::from_secs(1);

const DEFAULT_PAGE_SIZE: u64 = 1_000;

const EVENT_COLUMNS: &str =
    "id, stream_name, event_type, aggregate_id, sequence_number, body, timestamp, etag";

/// PostgreSQL-backed event store implementation.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    page_size: u64,
}

impl PostgresEventStore {
    /// Creates a new PostgreSQL event store.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Sets how many rows each round trip of a lazy read fetches.
    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_event(row: PgRow) -> Result<StoredEvent> {
        let etag: Option<String> = row.try_get("etag")?;
        Ok(StoredEvent {
            id: EventId::new(row.try_get::<i64, _>("id")? as u64),
            stream_name: row.try_get("stream_name")?,
            event_type: row.try_get("event_type")?,
            aggregate_id: AggregateId::from_uuid(row.try_get::<Uuid, _>("aggregate_id")?),
            sequence_number: row.try_get("sequence_number")?,
            body: row.try_get("body")?,
            timestamp: row.try_get("timestamp")?,
            etag: etag.map(ETag::new),
        })
    }
}

struct PageCursor {
    pool: PgPool,
    filter: EventFilter,
    next_id: EventId,
    remaining: u64,
    page_size: u64,
}

async fn fetch_page(mut cursor: PageCursor) -> Result<Option<(Vec<StoredEvent>, PageCursor)>> {
    if cursor.remaining == 0 {
        return Ok(None);
    }
    let take = cursor.remaining.min(cursor.page_size);

    let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {EVENT_COLUMNS} FROM events WHERE id >= "));
    qb.push_bind(cursor.next_id.as_u64() as i64);
    qb.push(" AND ");
    cursor.filter.push_sql(&mut qb);
    qb.push(" ORDER BY id ASC LIMIT ");
    qb.push_bind(take as i64);

    let rows = qb.build().fetch_all(&cursor.pool).await?;
    if rows.is_empty() {
        return Ok(None);
    }
    let events = rows
        .into_iter()
        .map(PostgresEventStore::row_to_event)
        .collect::<Result<Vec<_>>>()?;

    if let Some(last) = events.last() {
        cursor.next_id = last.id.next();
    }
    cursor.remaining = cursor.remaining.saturating_sub(events.len() as u64);
    if (events.len() as u64) < take {
        cursor.remaining = 0;
    }
    Ok(Some((events, cursor)))
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[tracing::instrument(skip(self, events), fields(count = events.len()))]
    async fn append(&self, events: Vec<NewEvent>) -> Result<Vec<StoredEvent>> {
        validate_new_events(&events).map_err(EventStoreError::InvalidAppend)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(APPEND_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let mut stored = Vec::with_capacity(events.len());
        for event in events {
            let id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO events (stream_name, event_type, aggregate_id, sequence_number, body, timestamp, etag)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                RETURNING id
                "#,
            )
            .bind(&event.stream_name)
            .bind(&event.event_type)
            .bind(event.aggregate_id.as_uuid())
            .bind(event.sequence_number)
            .bind(&event.body)
            .bind(event.timestamp)
            .bind(event.etag.as_ref().map(ETag::as_str))
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                // A unique violation means another writer took this sequence number
                if let sqlx::Error::Database(ref db_err) = e
                    && db_err.constraint() == Some("unique_stream_aggregate_sequence")
                {
                    return EventStoreError::ConcurrencyConflict {
                        stream_name: event.stream_name.clone(),
                        aggregate_id: event.aggregate_id,
                        sequence_number: event.sequence_number,
                    };
                }
                EventStoreError::Database(e)
            })?;

            stored.push(event.into_stored(EventId::new(id as u64)));
        }

        tx.commit().await?;

        metrics::counter!("event_store_events_appended_total").increment(stored.len() as u64);
        Ok(stored)
    }

    async fn read_events(
        &self,
        from: EventId,
        filter: &EventFilter,
        limit: u64,
    ) -> Result<EventStream> {
        let cursor = PageCursor {
            pool: self.pool.clone(),
            filter: filter.clone(),
            next_id: from,
            remaining: limit,
            page_size: self.page_size,
        };

        let events = stream::try_unfold(cursor, fetch_page)
            .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, EventStoreError>)))
            .try_flatten();

        Ok(Box::pin(events))
    }

    async fn count_matching(&self, from: EventId, filter: &EventFilter) -> Result<u64> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM events WHERE id >= ");
        qb.push_bind(from.as_u64() as i64);
        qb.push(" AND ");
        filter.push_sql(&mut qb);

        let count: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    async fn latest_event_id(&self) -> Result<EventId> {
        let id: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(EventId::new(id as u64))
    }

    async fn events_for_aggregate(
        &self,
        stream_name: &str,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE stream_name = $1 AND aggregate_id = $2 ORDER BY sequence_number ASC"
        ))
        .bind(stream_name)
        .bind(aggregate_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn find_by_etag(
        &self,
        aggregate_id: AggregateId,
        etag: &ETag,
    ) -> Result<Option<StoredEvent>> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE aggregate_id = $1 AND etag = $2 ORDER BY id ASC LIMIT 1"
        ))
        .bind(aggregate_id.as_uuid())
        .bind(etag.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_event).transpose()
    }

    async fn rename_event_type(&self, stream_name: &str, from: &str, to: &str) -> Result<u64> {
        let result =
            sqlx::query("UPDATE events SET event_type = $3 WHERE stream_name = $1 AND event_type = $2")
                .bind(stream_name)
                .bind(from)
                .bind(to)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}

/// Session-level advisory lock held on a dedicated pooled connection.
///
/// The lock lives as long as the connection's session, so a guard that is
/// dropped without `release` closes its connection instead of returning a
/// still-locked session to the pool.
pub struct PostgresLockGuard {
    name: String,
    conn: Option<PoolConnection<Postgres>>,
    last_probe: Instant,
}

// The lock name is hashed into the two-int4 advisory key space.
const TRY_LOCK_SQL: &str = r#"
    SELECT pg_try_advisory_lock(
        ('x' || substr(md5($1), 1, 8))::bit(32)::int,
        ('x' || substr(md5($1), 9, 8))::bit(32)::int
    )
"#;

const UNLOCK_SQL: &str = r#"
    SELECT pg_advisory_unlock(
        ('x' || substr(md5($1), 1, 8))::bit(32)::int,
        ('x' || substr(md5($1), 9, 8))::bit(32)::int
    )
"#;

#[async_trait]
impl NamedLock for PostgresEventStore {
    type Guard = PostgresLockGuard;

    async fn acquire(&self, name: &str, timeout: Duration) -> Result<Option<PostgresLockGuard>> {
        let deadline = Instant::now() + timeout;
        // A saturated pool counts against the same deadline as a held lock
        let Ok(conn) = tokio::time::timeout_at(deadline, self.pool.acquire()).await else {
            tracing::debug!(lock = name, "timed out waiting for a connection to lock with");
            return Ok(None);
        };
        let mut conn = conn?;

        loop {
            let acquired: bool = sqlx::query_scalar(TRY_LOCK_SQL)
                .bind(name)
                .fetch_one(&mut *conn)
                .await?;
            if acquired {
                return Ok(Some(PostgresLockGuard {
                    name: name.to_string(),
                    conn: Some(conn),
                    last_probe: Instant::now(),
                }));
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(lock = name, "timed out waiting for advisory lock");
                return Ok(None);
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}

#[async_trait]
impl LockGuard for PostgresLockGuard {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_held(&mut self) -> bool {
        let Some(conn) = self.conn.as_mut() else {
            return false;
        };
        if self.last_probe.elapsed() < LOCK_PROBE_INTERVAL {
            return true;
        }
        // The advisory lock lives exactly as long as this session
        let alive = sqlx::query("SELECT 1").execute(&mut **conn).await.is_ok();
        if alive {
            self.last_probe = Instant::now();
        } else if let Some(mut conn) = self.conn.take() {
            conn.close_on_drop();
        }
        alive
    }

    async fn release(mut self) {
        if let Some(mut conn) = self.conn.take() {
            let unlocked = sqlx::query_scalar::<_, bool>(UNLOCK_SQL)
                .bind(&self.name)
                .fetch_one(&mut *conn)
                .await;
            if let Err(e) = unlocked {
                tracing::warn!(lock = %self.name, error = %e, "failed to release advisory lock");
                conn.close_on_drop();
            }
        }
    }
}

impl Drop for PostgresLockGuard {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close_on_drop();
        }
    }
}
