//! State store: persisted tickets and backfills, pool queries and leased locks.
//!
//! Two backends implement [`StateStore`]: [`memory::InMemoryStateStore`] for a
//! single process and tests, and [`redis::RedisStateStore`] for deployments
//! where several backend workers share the same state.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::models::{Assignment, Backfill, BackfillRecord, Pool, Ticket};

pub use self::memory::InMemoryStateStore;
pub use self::redis::RedisStateStore;

/// Errors that can occur with state store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Timed out acquiring lock: {0}")]
    LockTimeout(String),

    #[error("Operation canceled")]
    Canceled,

    #[error("Lock not held: {0}")]
    LockNotHeld(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether the operation may succeed if retried later in the cycle
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::StoreUnavailable(_) | StoreError::LockTimeout(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        StoreError::StoreUnavailable(err.to_string())
    }
}

/// Lazy, single-pass sequence of pool query results
pub type EntityStream<T> = BoxStream<'static, Result<T, StoreError>>;

/// Read-modify-write step applied to a backfill under its lock
pub type BackfillMutation = Box<dyn FnOnce(&mut BackfillRecord) + Send>;

/// Persistence and coordination contract shared by all backends
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist a ticket under a freshly assigned id
    async fn create_ticket(&self, ticket: Ticket) -> Result<Ticket, StoreError>;

    async fn get_ticket(&self, id: &str) -> Result<Ticket, StoreError>;

    async fn delete_ticket(&self, id: &str) -> Result<(), StoreError>;

    /// Write an assignment once; `Ok(true)` when this call wrote it
    ///
    /// Writing the same assignment again is a no-op returning `Ok(false)`, a
    /// different one is a `Conflict`. Assigned tickets drop out of every pool.
    async fn assign_ticket(&self, id: &str, assignment: &Assignment) -> Result<bool, StoreError>;

    /// Persist a backfill with generation 1 and the given tickets associated
    ///
    /// `assignment` is where tickets joining the backfill are sent.
    async fn create_backfill(
        &self,
        backfill: Backfill,
        ticket_ids: Vec<String>,
        assignment: Option<Assignment>,
    ) -> Result<Backfill, StoreError>;

    async fn get_backfill(&self, id: &str) -> Result<BackfillRecord, StoreError>;

    /// Apply `mutation` to the stored record and bump its generation
    ///
    /// `guard` must be a live lease on [`backfill_lock_key`] of `id`,
    /// otherwise the call fails with `LockNotHeld` and nothing is written.
    async fn update_backfill(
        &self,
        guard: &LockGuard,
        id: &str,
        mutation: BackfillMutation,
    ) -> Result<BackfillRecord, StoreError>;

    async fn delete_backfill(&self, id: &str) -> Result<(), StoreError>;

    async fn query_pool_tickets(&self, pool: &Pool) -> Result<EntityStream<Ticket>, StoreError>;

    async fn query_pool_backfills(&self, pool: &Pool) -> Result<EntityStream<Backfill>, StoreError>;

    /// Try once to take the lease on `key`; returns the lease token on success
    async fn try_lock(&self, key: &str, lease: Duration) -> Result<Option<u64>, StoreError>;

    /// Release the lease if `token` still owns it
    async fn unlock(&self, key: &str, token: u64) -> Result<bool, StoreError>;

    async fn lock_held(&self, key: &str, token: u64) -> Result<bool, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

/// Lock key guarding a backfill
pub fn backfill_lock_key(backfill_id: &str) -> String {
    format!("backfill:{}", backfill_id)
}

/// Lease timing for distributed locks
#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    /// Lease length; an abandoned lock frees itself after this long
    pub lease: Duration,
    pub acquire_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(10),
            acquire_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
        }
    }
}

/// Handle on a single lock key
#[derive(Clone)]
pub struct Mutex {
    store: Arc<dyn StateStore>,
    key: String,
    options: LockOptions,
}

impl Mutex {
    pub fn new(store: Arc<dyn StateStore>, key: impl Into<String>, options: LockOptions) -> Self {
        Self {
            store,
            key: key.into(),
            options,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Block until the lease is acquired, the acquire timeout passes or `cancel` fires
    pub async fn lock(&self, cancel: &CancellationToken) -> Result<LockGuard, StoreError> {
        let deadline = Instant::now() + self.options.acquire_timeout;

        loop {
            if cancel.is_cancelled() {
                return Err(StoreError::Canceled);
            }

            if let Some(token) = self.store.try_lock(&self.key, self.options.lease).await? {
                tracing::trace!("Acquired lock {} (token {})", self.key, token);
                return Ok(LockGuard {
                    store: self.store.clone(),
                    key: self.key.clone(),
                    token,
                    released: false,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(StoreError::LockTimeout(self.key.clone()));
            }

            let wait = self.options.poll_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Err(StoreError::Canceled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

/// A held lease
///
/// Call [`LockGuard::unlock`] on every path that can. A guard dropped while
/// still armed schedules a release on the current runtime; the lease expiry
/// covers the case where no runtime is left to run it.
pub struct LockGuard {
    store: Arc<dyn StateStore>,
    key: String,
    token: u64,
    released: bool,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    /// Release the lease; `false` if it had already expired or been taken over
    pub async fn unlock(mut self) -> Result<bool, StoreError> {
        self.released = true;
        let held = self.store.unlock(&self.key, self.token).await?;
        if !held {
            tracing::warn!("Lock {} expired before release (token {})", self.key, self.token);
        }
        Ok(held)
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("token", &self.token)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let token = self.token;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.unlock(&key, token).await {
                        tracing::warn!("Failed to release dropped lock {}: {}", key, e);
                    }
                });
            }
            Err(_) => {
                tracing::warn!("Lock {} dropped outside a runtime, waiting for lease expiry", key);
            }
        }
    }
}
