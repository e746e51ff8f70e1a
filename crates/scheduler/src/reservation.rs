//! Exclusive claims on values within a scope.
//!
//! A reservation is held by an owner token until it is confirmed, cancelled
//! or its lease runs out. An expired, unconfirmed reservation can be taken
//! over by anyone. The scheduler reserves idempotency tokens here.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row, postgres::PgRow};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::Result;
use crate::clock::lease_end;

/// Lease used when a caller does not ask for one.
pub const DEFAULT_LEASE: Duration = Duration::minutes(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedValue {
    pub value: String,
    pub scope: String,
    pub owner_token: String,
    /// Set once the owner confirms. Confirmed reservations never expire.
    pub confirmation_token: Option<String>,
    pub expiration: Option<DateTime<Utc>>,
}

impl ReservedValue {
    fn is_reclaimable(&self, now: DateTime<Utc>) -> bool {
        self.confirmation_token.is_none() && self.expiration.is_some_and(|at| at <= now)
    }
}

#[async_trait]
pub trait ReservationService: Send + Sync {
    /// Claims `value` in `scope` for `owner`. True if the owner now holds it,
    /// including when it already did.
    async fn reserve(&self, value: &str, scope: &str, owner: &str, lease: Option<Duration>) -> Result<bool>;

    /// Makes the owner's reservation permanent and returns its confirmation
    /// token. `None` if the owner does not hold it.
    async fn confirm(&self, value: &str, scope: &str, owner: &str) -> Result<Option<String>>;

    /// Releases the owner's reservation. False if the owner does not hold it.
    async fn cancel(&self, value: &str, scope: &str, owner: &str) -> Result<bool>;

    /// Reserves the first free value of `values`, or returns the one the
    /// owner already holds among them.
    async fn reserve_any(
        &self,
        values: &[String],
        scope: &str,
        owner: &str,
        lease: Option<Duration>,
    ) -> Result<Option<String>> {
        if let Some(held) = self.reserved_value(owner, scope).await?
            && values.contains(&held.value)
        {
            return Ok(Some(held.value));
        }
        for value in values {
            if self.reserve(value, scope, owner, lease).await? {
                return Ok(Some(value.clone()));
            }
        }
        Ok(None)
    }

    /// A value held by `owner` in `scope`, if any.
    async fn reserved_value(&self, owner: &str, scope: &str) -> Result<Option<ReservedValue>>;
}

type ReservationKey = (String, String);

/// Reservations kept in process memory. Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryReservationService {
    values: Arc<RwLock<BTreeMap<ReservationKey, ReservedValue>>>,
}

impl InMemoryReservationService {
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(value: &str, scope: &str) -> ReservationKey {
    (value.to_string(), scope.to_string())
}

#[async_trait]
impl ReservationService for InMemoryReservationService {
    async fn reserve(&self, value: &str, scope: &str, owner: &str, lease: Option<Duration>) -> Result<bool> {
        let now = Utc::now();
        let expiration = lease_end(now, lease.unwrap_or(DEFAULT_LEASE));
        let mut values = self.values.write().await;

        if let Some(existing) = values.get_mut(&key(value, scope)) {
            if existing.owner_token == owner {
                if existing.confirmation_token.is_none() {
                    existing.expiration = Some(expiration);
                }
                return Ok(true);
            }
            if !existing.is_reclaimable(now) {
                return Ok(false);
            }
        }

        values.insert(
            key(value, scope),
            ReservedValue {
                value: value.to_string(),
                scope: scope.to_string(),
                owner_token: owner.to_string(),
                confirmation_token: None,
                expiration: Some(expiration),
            },
        );
        Ok(true)
    }

    async fn confirm(&self, value: &str, scope: &str, owner: &str) -> Result<Option<String>> {
        let mut values = self.values.write().await;
        let Some(existing) = values.get_mut(&key(value, scope)) else {
            return Ok(None);
        };
        if existing.owner_token != owner {
            return Ok(None);
        }
        existing.expiration = None;
        Ok(Some(
            existing
                .confirmation_token
                .get_or_insert_with(|| Uuid::new_v4().to_string())
                .clone(),
        ))
    }

    async fn cancel(&self, value: &str, scope: &str, owner: &str) -> Result<bool> {
        let mut values = self.values.write().await;
        match values.get(&key(value, scope)) {
            Some(existing) if existing.owner_token == owner => {
                values.remove(&key(value, scope));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reserved_value(&self, owner: &str, scope: &str) -> Result<Option<ReservedValue>> {
        Ok(self
            .values
            .read()
            .await
            .values()
            .find(|r| r.owner_token == owner && r.scope == scope)
            .cloned())
    }
}

/// Reservations in the `reserved_values` table.
#[derive(Clone)]
pub struct PostgresReservationService {
    pool: PgPool,
}

impl PostgresReservationService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_reserved_value(row: PgRow) -> Result<ReservedValue> {
        Ok(ReservedValue {
            value: row.try_get("value")?,
            scope: row.try_get("scope")?,
            owner_token: row.try_get("owner_token")?,
            confirmation_token: row.try_get("confirmation_token")?,
            expiration: row.try_get("expiration")?,
        })
    }
}

#[async_trait]
impl ReservationService for PostgresReservationService {
    async fn reserve(&self, value: &str, scope: &str, owner: &str, lease: Option<Duration>) -> Result<bool> {
        let expiration = lease_end(Utc::now(), lease.unwrap_or(DEFAULT_LEASE));
        let row = sqlx::query(
            r#"
            INSERT INTO reserved_values (value, scope, owner_token, expiration)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (value, scope) DO UPDATE
            SET owner_token = EXCLUDED.owner_token,
                expiration = CASE
                    WHEN reserved_values.confirmation_token IS NULL THEN EXCLUDED.expiration
                    ELSE reserved_values.expiration
                END
            WHERE reserved_values.owner_token = EXCLUDED.owner_token
               OR (reserved_values.confirmation_token IS NULL AND reserved_values.expiration <= NOW())
            RETURNING value
            "#,
        )
        .bind(value)
        .bind(scope)
        .bind(owner)
        .bind(expiration)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn confirm(&self, value: &str, scope: &str, owner: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            r#"
            UPDATE reserved_values
            SET confirmation_token = COALESCE(confirmation_token, $4), expiration = NULL
            WHERE value = $1 AND scope = $2 AND owner_token = $3
            RETURNING confirmation_token
            "#,
        )
        .bind(value)
        .bind(scope)
        .bind(owner)
        .bind(Uuid::new_v4().to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.try_get("confirmation_token")).transpose()?)
    }

    async fn cancel(&self, value: &str, scope: &str, owner: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM reserved_values WHERE value = $1 AND scope = $2 AND owner_token = $3")
            .bind(value)
            .bind(scope)
            .bind(owner)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn reserved_value(&self, owner: &str, scope: &str) -> Result<Option<ReservedValue>> {
        sqlx::query(
            r#"
            SELECT value, scope, owner_token, confirmation_token, expiration
            FROM reserved_values
            WHERE owner_token = $1 AND scope = $2
            ORDER BY value
            LIMIT 1
            "#,
        )
        .bind(owner)
        .bind(scope)
        .fetch_optional(&self.pool)
        .await?
        .map(Self::row_to_reserved_value)
        .transpose()
    }
}
