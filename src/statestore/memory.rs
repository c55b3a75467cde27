use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::{
    backfill_lock_key, BackfillMutation, EntityStream, LockGuard, StateStore, StoreError,
};
use crate::core::filters::{pool_matches_backfill, pool_matches_ticket};
use crate::models::{Assignment, Backfill, BackfillRecord, Pool, Ticket};

#[derive(Debug, Clone, Copy)]
struct Lease {
    token: u64,
    expires_at: Instant,
}

/// In-process state store
///
/// Locks are leases with expiry exactly like the Redis backend, so code
/// written against this store behaves the same once pointed at Redis.
pub struct InMemoryStateStore {
    tickets: Arc<DashMap<String, Ticket>>,
    backfills: Arc<DashMap<String, BackfillRecord>>,
    locks: DashMap<String, Lease>,
    next_token: AtomicU64,
}

impl InMemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tickets: Arc::new(DashMap::new()),
            backfills: Arc::new(DashMap::new()),
            locks: DashMap::new(),
            next_token: AtomicU64::new(1),
        }
    }

    /// Number of stored tickets, assigned or not
    pub fn ticket_count(&self) -> usize {
        self.tickets.len()
    }

    pub fn backfill_count(&self) -> usize {
        self.backfills.len()
    }

    fn lease_is_live(&self, key: &str, token: u64) -> bool {
        self.locks
            .get(key)
            .map(|lease| lease.token == token && lease.expires_at > Instant::now())
            .unwrap_or(false)
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn create_ticket(&self, mut ticket: Ticket) -> Result<Ticket, StoreError> {
        ticket.id = uuid::Uuid::new_v4().to_string();
        ticket.assignment = None;
        ticket.create_time = Utc::now();
        self.tickets.insert(ticket.id.clone(), ticket.clone());
        tracing::trace!("Created ticket {}", ticket.id);
        Ok(ticket)
    }

    async fn get_ticket(&self, id: &str) -> Result<Ticket, StoreError> {
        self.tickets
            .get(id)
            .map(|t| t.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("ticket {}", id)))
    }

    async fn delete_ticket(&self, id: &str) -> Result<(), StoreError> {
        self.tickets
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("ticket {}", id)))
    }

    async fn assign_ticket(&self, id: &str, assignment: &Assignment) -> Result<bool, StoreError> {
        let mut ticket = self
            .tickets
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("ticket {}", id)))?;

        if let Some(existing) = &ticket.assignment {
            if existing == assignment {
                return Ok(false);
            }
            return Err(StoreError::Conflict(format!(
                "ticket {} already assigned to {}",
                id, existing.connection
            )));
        }

        ticket.assignment = Some(assignment.clone());
        Ok(true)
    }

    async fn create_backfill(
        &self,
        mut backfill: Backfill,
        ticket_ids: Vec<String>,
        assignment: Option<Assignment>,
    ) -> Result<Backfill, StoreError> {
        backfill.id = uuid::Uuid::new_v4().to_string();
        backfill.generation = 1;
        backfill.create_time = Utc::now();
        let record = BackfillRecord {
            backfill: backfill.clone(),
            ticket_ids,
            last_acknowledged: None,
            assignment,
        };
        self.backfills.insert(backfill.id.clone(), record);
        tracing::trace!("Created backfill {}", backfill.id);
        Ok(backfill)
    }

    async fn get_backfill(&self, id: &str) -> Result<BackfillRecord, StoreError> {
        self.backfills
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("backfill {}", id)))
    }

    async fn update_backfill(
        &self,
        guard: &LockGuard,
        id: &str,
        mutation: BackfillMutation,
    ) -> Result<BackfillRecord, StoreError> {
        let key = backfill_lock_key(id);
        if guard.key() != key {
            return Err(StoreError::LockNotHeld(key));
        }

        // Holding the lease entry until the write lands keeps `try_lock` from
        // handing an expired lease to someone else in between
        let lease = self
            .locks
            .get(&key)
            .filter(|lease| lease.token == guard.token() && lease.expires_at > Instant::now())
            .ok_or_else(|| StoreError::LockNotHeld(key.clone()))?;

        let mut record = self
            .backfills
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("backfill {}", id)))?;

        let generation = record.backfill.generation;
        let mut updated = record.value().clone();
        mutation(&mut updated);
        updated.backfill.id = id.to_string();
        updated.backfill.generation = generation + 1;

        if lease.expires_at <= Instant::now() {
            return Err(StoreError::LockNotHeld(key));
        }
        *record = updated.clone();
        drop(record);
        drop(lease);

        Ok(updated)
    }

    async fn delete_backfill(&self, id: &str) -> Result<(), StoreError> {
        self.backfills
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("backfill {}", id)))
    }

    async fn query_pool_tickets(&self, pool: &Pool) -> Result<EntityStream<Ticket>, StoreError> {
        // Snapshot ids only; records are read as the stream is consumed
        let ids: Vec<String> = self.tickets.iter().map(|e| e.key().clone()).collect();
        let tickets = self.tickets.clone();
        let pool = pool.clone();

        let stream = futures::stream::iter(ids).filter_map(move |id| {
            let found = tickets
                .get(&id)
                .map(|t| t.value().clone())
                .filter(|t| pool_matches_ticket(&pool, t));
            futures::future::ready(found.map(Ok))
        });

        Ok(stream.boxed())
    }

    async fn query_pool_backfills(&self, pool: &Pool) -> Result<EntityStream<Backfill>, StoreError> {
        let ids: Vec<String> = self.backfills.iter().map(|e| e.key().clone()).collect();
        let backfills = self.backfills.clone();
        let pool = pool.clone();

        let stream = futures::stream::iter(ids).filter_map(move |id| {
            let found = backfills
                .get(&id)
                .map(|r| r.backfill.clone())
                .filter(|b| pool_matches_backfill(&pool, b));
            futures::future::ready(found.map(Ok))
        });

        Ok(stream.boxed())
    }

    async fn try_lock(&self, key: &str, lease: Duration) -> Result<Option<u64>, StoreError> {
        let now = Instant::now();
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let granted = Lease {
            token,
            expires_at: now + lease,
        };

        match self.locks.entry(key.to_string()) {
            Entry::Occupied(mut held) => {
                if held.get().expires_at > now {
                    return Ok(None);
                }
                held.insert(granted);
            }
            Entry::Vacant(slot) => {
                slot.insert(granted);
            }
        }

        Ok(Some(token))
    }

    async fn unlock(&self, key: &str, token: u64) -> Result<bool, StoreError> {
        let now = Instant::now();
        let removed = self
            .locks
            .remove_if(key, |_, lease| lease.token == token);

        Ok(matches!(removed, Some((_, lease)) if lease.expires_at > now))
    }

    async fn lock_held(&self, key: &str, token: u64) -> Result<bool, StoreError> {
        Ok(self.lease_is_live(key, token))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
