//! Named distributed locks.
//!
//! A catchup (or any other exclusive worker) takes a named lock before it
//! reads progress and streams events, so only one process advances a given
//! catchup at a time. Acquisition is bounded by a timeout; contention is
//! reported as `None`, never as an error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::Result;

/// Proof of ownership of a named lock. Dropping the guard releases the lock.
#[async_trait]
pub trait LockGuard: Send + Sync + Sized + 'static {
    /// The name of the held lock.
    fn name(&self) -> &str;

    /// Checks that the lock is still held by this guard.
    ///
    /// Returns false after an external release or when the session that
    /// owned the lock has gone away.
    async fn is_held(&mut self) -> bool;

    /// Releases the lock.
    async fn release(self);
}

/// A named mutual-exclusion primitive shared between processes.
#[async_trait]
pub trait NamedLock: Send + Sync {
    type Guard: LockGuard;

    /// Waits up to `timeout` for the lock named `name`.
    ///
    /// Returns `None` if another owner still holds it when the timeout expires.
    async fn acquire(&self, name: &str, timeout: Duration) -> Result<Option<Self::Guard>>;
}

#[derive(Default)]
struct LockTable {
    holders: Mutex<HashMap<String, u64>>,
    next_token: AtomicU64,
    released: Notify,
}

impl LockTable {
    fn holders(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.holders.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_take(&self, name: &str) -> Option<u64> {
        let mut holders = self.holders();
        if holders.contains_key(name) {
            return None;
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        holders.insert(name.to_string(), token);
        Some(token)
    }

    fn release(&self, name: &str, token: u64) {
        let mut holders = self.holders();
        if holders.get(name) == Some(&token) {
            holders.remove(name);
        }
        drop(holders);
        self.released.notify_waiters();
    }
}

/// Process-local lock table for tests and single-node deployments.
///
/// Clones share the same table, so two catchups built over clones of one
/// in-memory store contend exactly like two processes sharing a database.
#[derive(Clone, Default)]
pub struct InMemoryNamedLock {
    table: Arc<LockTable>,
}

impl InMemoryNamedLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if anyone currently holds `name`.
    pub fn is_locked(&self, name: &str) -> bool {
        self.table.holders().contains_key(name)
    }

    /// Releases `name` regardless of owner, as an operator or a lost
    /// database session would. The former owner's guard reports
    /// `is_held() == false` afterwards.
    pub fn force_release(&self, name: &str) {
        self.table.holders().remove(name);
        self.table.released.notify_waiters();
    }
}

#[async_trait]
impl NamedLock for InMemoryNamedLock {
    type Guard = InMemoryLockGuard;

    async fn acquire(&self, name: &str, timeout: Duration) -> Result<Option<InMemoryLockGuard>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.table.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(token) = self.table.try_take(name) {
                return Ok(Some(InMemoryLockGuard {
                    table: Arc::clone(&self.table),
                    name: name.to_string(),
                    token,
                    released: false,
                }));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                tracing::debug!(lock = name, "timed out waiting for lock");
                return Ok(None);
            }
        }
    }
}

/// Guard for [`InMemoryNamedLock`].
pub struct InMemoryLockGuard {
    table: Arc<LockTable>,
    name: String,
    token: u64,
    released: bool,
}

#[async_trait]
impl LockGuard for InMemoryLockGuard {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_held(&mut self) -> bool {
        !self.released && self.table.holders().get(&self.name) == Some(&self.token)
    }

    async fn release(mut self) {
        self.table.release(&self.name, self.token);
        self.released = true;
    }
}

impl Drop for InMemoryLockGuard {
    fn drop(&mut self) {
        if !self.released {
            self.table.release(&self.name, self.token);
        }
    }
}
