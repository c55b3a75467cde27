//! Redis backend.
//!
//! Key layout (all keys carry the configured prefix):
//! ```text
//! ticket:{id}          JSON ticket, without its assignment
//! assignment:{id}      JSON assignment, written once
//! allTickets           set of unassigned ticket ids (pool index)
//! backfill:{id}        JSON BackfillRecord
//! allBackfills         set of backfill ids
//! lock:{key}           lease token, SET NX PX
//! lockToken            counter handing out lease tokens
//! ```
//! Every write that depends on a lease or on existing state goes through a
//! Lua script so that check and write are atomic on the server.

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client, Script};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::time::Duration;

use super::{
    backfill_lock_key, BackfillMutation, EntityStream, LockGuard, StateStore, StoreError,
};
use crate::core::filters::{pool_matches_backfill, pool_matches_ticket};
use crate::core::retry::{retry, RetryConfig};
use crate::models::{Assignment, Backfill, BackfillRecord, Pool, Ticket};

const ALL_TICKETS: &str = "allTickets";
const ALL_BACKFILLS: &str = "allBackfills";
const LOCK_TOKEN: &str = "lockToken";

// KEYS: lock; ARGV: token
const UNLOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

// KEYS: ticket, assignment, index; ARGV: assignment json, ticket id
const ASSIGN_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
local current = redis.call('GET', KEYS[2])
if current then
    if current == ARGV[1] then
        return 2
    end
    return -1
end
redis.call('SET', KEYS[2], ARGV[1])
redis.call('SREM', KEYS[3], ARGV[2])
return 1
"#;

// KEYS: lock, backfill; ARGV: token, expected generation, new record json
const UPDATE_BACKFILL_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
    return -1
end
local current = redis.call('GET', KEYS[2])
if not current then
    return 0
end
local generation = cjson.decode(current)['backfill']['generation']
if tonumber(generation) ~= tonumber(ARGV[2]) then
    return -2
end
redis.call('SET', KEYS[2], ARGV[3])
return 1
"#;

/// Redis-backed state store shared by every backend worker
pub struct RedisStateStore {
    connection: ConnectionManager,
    prefix: String,
    page_size: usize,
    unlock_script: Script,
    assign_script: Script,
    update_script: Script,
}

impl RedisStateStore {
    /// Connect, retrying briefly so a store that is still starting up is tolerated
    pub async fn new(redis_url: &str, prefix: &str, page_size: usize) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let connection = retry(
            "redis_connect",
            &RetryConfig::startup(),
            &tokio_util::sync::CancellationToken::new(),
            || {
                let client = client.clone();
                async move { ConnectionManager::new(client).await.map_err(StoreError::from) }
            },
        )
        .await?;

        tracing::info!("Connected to Redis state store (prefix: '{}')", prefix);

        Ok(Self {
            connection,
            prefix: prefix.to_string(),
            page_size: page_size.max(1),
            unlock_script: Script::new(UNLOCK_SCRIPT),
            assign_script: Script::new(ASSIGN_SCRIPT),
            update_script: Script::new(UPDATE_BACKFILL_SCRIPT),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn ticket_key(&self, id: &str) -> String {
        self.key(&format!("ticket:{}", id))
    }

    fn assignment_key(&self, id: &str) -> String {
        self.key(&format!("assignment:{}", id))
    }

    fn backfill_key(&self, id: &str) -> String {
        self.key(&format!("backfill:{}", id))
    }

    fn lock_key(&self, key: &str) -> String {
        self.key(&format!("lock:{}", key))
    }

    /// Lazily walk an index set page by page, resolving each page with `load`
    fn scan_index<T, F, Fut>(&self, index: &str, load: F) -> EntityStream<T>
    where
        T: Send + 'static,
        F: Fn(ConnectionManager, Vec<String>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Vec<T>, StoreError>> + Send + 'static,
    {
        struct Scan {
            connection: ConnectionManager,
            cursor: u64,
            done: bool,
        }

        let index = self.key(index);
        let page_size = self.page_size;
        let start = Scan {
            connection: self.connection.clone(),
            cursor: 0,
            done: false,
        };

        let pages = stream::unfold(start, move |mut scan| {
            let index = index.clone();
            let page = if scan.done {
                None
            } else {
                Some(async move {
                    let result: Result<(u64, Vec<String>), _> = ::redis::cmd("SSCAN")
                        .arg(&index)
                        .arg(scan.cursor)
                        .arg("COUNT")
                        .arg(page_size)
                        .query_async(&mut scan.connection)
                        .await;
                    match result {
                        Ok((cursor, ids)) => {
                            scan.cursor = cursor;
                            scan.done = cursor == 0;
                            (Ok(ids), scan)
                        }
                        Err(e) => {
                            scan.done = true;
                            (Err(StoreError::from(e)), scan)
                        }
                    }
                })
            };
            async move {
                match page {
                    Some(fut) => Some(fut.await),
                    None => None,
                }
            }
        });

        let load = std::sync::Arc::new(load);
        let connection = self.connection.clone();
        pages
            .then(move |page| {
                let load = load.clone();
                let connection = connection.clone();
                async move {
                    match page {
                        Ok(ids) if ids.is_empty() => Ok(Vec::new()),
                        Ok(ids) => load(connection, ids).await,
                        Err(e) => Err(e),
                    }
                }
            })
            .flat_map(|page| match page {
                Ok(items) => stream::iter(items.into_iter().map(Ok)).left_stream(),
                Err(e) => stream::once(futures::future::ready(Err(e))).right_stream(),
            })
            .boxed()
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn create_ticket(&self, mut ticket: Ticket) -> Result<Ticket, StoreError> {
        ticket.id = uuid::Uuid::new_v4().to_string();
        ticket.assignment = None;
        ticket.create_time = Utc::now();
        let json = serde_json::to_string(&ticket)?;

        let mut conn = self.connection.clone();
        let _: () = ::redis::pipe()
            .atomic()
            .set(self.ticket_key(&ticket.id), json)
            .ignore()
            .sadd(self.key(ALL_TICKETS), &ticket.id)
            .ignore()
            .query_async(&mut conn)
            .await?;

        tracing::trace!("Created ticket {}", ticket.id);
        Ok(ticket)
    }

    async fn get_ticket(&self, id: &str) -> Result<Ticket, StoreError> {
        let mut conn = self.connection.clone();
        let (ticket, assignment): (Option<String>, Option<String>) = ::redis::pipe()
            .get(self.ticket_key(id))
            .get(self.assignment_key(id))
            .query_async(&mut conn)
            .await?;

        let json = ticket.ok_or_else(|| StoreError::NotFound(format!("ticket {}", id)))?;
        let mut ticket: Ticket = serde_json::from_str(&json)?;
        ticket.assignment = assignment.map(|a| serde_json::from_str(&a)).transpose()?;
        Ok(ticket)
    }

    async fn delete_ticket(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let (removed, _, _): (u64, u64, u64) = ::redis::pipe()
            .atomic()
            .del(self.ticket_key(id))
            .del(self.assignment_key(id))
            .srem(self.key(ALL_TICKETS), id)
            .query_async(&mut conn)
            .await?;

        if removed == 0 {
            return Err(StoreError::NotFound(format!("ticket {}", id)));
        }
        Ok(())
    }

    async fn assign_ticket(&self, id: &str, assignment: &Assignment) -> Result<bool, StoreError> {
        let json = serde_json::to_string(assignment)?;
        let mut conn = self.connection.clone();
        let outcome: i64 = self
            .assign_script
            .key(self.ticket_key(id))
            .key(self.assignment_key(id))
            .key(self.key(ALL_TICKETS))
            .arg(json)
            .arg(id)
            .invoke_async(&mut conn)
            .await?;

        match outcome {
            0 => Err(StoreError::NotFound(format!("ticket {}", id))),
            -1 => Err(StoreError::Conflict(format!(
                "ticket {} already has a different assignment",
                id
            ))),
            // 2: the same assignment was already there
            written => Ok(written == 1),
        }
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
        let json = serde_json::to_string(&record)?;

        let mut conn = self.connection.clone();
        let _: () = ::redis::pipe()
            .atomic()
            .set(self.backfill_key(&backfill.id), json)
            .ignore()
            .sadd(self.key(ALL_BACKFILLS), &backfill.id)
            .ignore()
            .query_async(&mut conn)
            .await?;

        tracing::trace!("Created backfill {}", backfill.id);
        Ok(backfill)
    }

    async fn get_backfill(&self, id: &str) -> Result<BackfillRecord, StoreError> {
        let mut conn = self.connection.clone();
        let json: Option<String> = conn.get(self.backfill_key(id)).await?;
        let json = json.ok_or_else(|| StoreError::NotFound(format!("backfill {}", id)))?;
        Ok(serde_json::from_str(&json)?)
    }

    async fn update_backfill(
        &self,
        guard: &LockGuard,
        id: &str,
        mutation: BackfillMutation,
    ) -> Result<BackfillRecord, StoreError> {
        let lock = backfill_lock_key(id);
        if guard.key() != lock {
            return Err(StoreError::LockNotHeld(lock));
        }

        let current = self.get_backfill(id).await?;
        let generation = current.backfill.generation;
        let mut updated = current;
        mutation(&mut updated);
        updated.backfill.id = id.to_string();
        updated.backfill.generation = generation + 1;
        let json = serde_json::to_string(&updated)?;

        let mut conn = self.connection.clone();
        let outcome: i64 = self
            .update_script
            .key(self.lock_key(&lock))
            .key(self.backfill_key(id))
            .arg(guard.token())
            .arg(generation)
            .arg(json)
            .invoke_async(&mut conn)
            .await?;

        match outcome {
            1 => Ok(updated),
            0 => Err(StoreError::NotFound(format!("backfill {}", id))),
            -2 => Err(StoreError::Conflict(format!(
                "backfill {} changed while locked (expected generation {})",
                id, generation
            ))),
            _ => Err(StoreError::LockNotHeld(lock)),
        }
    }

    async fn delete_backfill(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let (removed, _): (u64, u64) = ::redis::pipe()
            .atomic()
            .del(self.backfill_key(id))
            .srem(self.key(ALL_BACKFILLS), id)
            .query_async(&mut conn)
            .await?;

        if removed == 0 {
            return Err(StoreError::NotFound(format!("backfill {}", id)));
        }
        Ok(())
    }

    async fn query_pool_tickets(&self, pool: &Pool) -> Result<EntityStream<Ticket>, StoreError> {
        let pool = pool.clone();
        let prefix = self.prefix.clone();

        Ok(self.scan_index(ALL_TICKETS, move |mut conn, ids| {
            let pool = pool.clone();
            let ticket_keys: Vec<String> =
                ids.iter().map(|id| format!("{}ticket:{}", prefix, id)).collect();
            let assignment_keys: Vec<String> =
                ids.iter().map(|id| format!("{}assignment:{}", prefix, id)).collect();
            async move {
                let (tickets, assignments): (Vec<Option<String>>, Vec<Option<String>>) =
                    ::redis::pipe()
                        .cmd("MGET")
                        .arg(ticket_keys)
                        .cmd("MGET")
                        .arg(assignment_keys)
                        .query_async(&mut conn)
                        .await?;

                let mut found = Vec::with_capacity(tickets.len());
                // Deleted between SSCAN and MGET, or assigned meanwhile: skip
                for (ticket, assignment) in tickets.into_iter().zip(assignments) {
                    if let (Some(json), None) = (ticket, assignment) {
                        let ticket: Ticket = serde_json::from_str(&json)?;
                        if pool_matches_ticket(&pool, &ticket) {
                            found.push(ticket);
                        }
                    }
                }
                Ok::<_, StoreError>(found)
            }
        }))
    }

    async fn query_pool_backfills(&self, pool: &Pool) -> Result<EntityStream<Backfill>, StoreError> {
        let pool = pool.clone();
        let prefix = self.prefix.clone();

        Ok(self.scan_index(ALL_BACKFILLS, move |mut conn, ids| {
            let pool = pool.clone();
            let keys: Vec<String> = ids.iter().map(|id| format!("{}backfill:{}", prefix, id)).collect();
            async move {
                let records: Vec<Option<String>> =
                    ::redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;

                let mut found = Vec::with_capacity(records.len());
                for json in records.into_iter().flatten() {
                    let record: BackfillRecord = serde_json::from_str(&json)?;
                    if pool_matches_backfill(&pool, &record.backfill) {
                        found.push(record.backfill);
                    }
                }
                Ok::<_, StoreError>(found)
            }
        }))
    }

    async fn try_lock(&self, key: &str, lease: Duration) -> Result<Option<u64>, StoreError> {
        let mut conn = self.connection.clone();
        let token: u64 = conn.incr(self.key(LOCK_TOKEN), 1u64).await?;
        let lease_ms = lease.as_millis().max(1) as u64;

        let granted: Option<String> = ::redis::cmd("SET")
            .arg(self.lock_key(key))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(lease_ms)
            .query_async(&mut conn)
            .await?;

        Ok(granted.map(|_| token))
    }

    async fn unlock(&self, key: &str, token: u64) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let removed: i64 = self
            .unlock_script
            .key(self.lock_key(key))
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn lock_held(&self, key: &str, token: u64) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let current: Option<u64> = conn.get(self.lock_key(key)).await?;
        Ok(current == Some(token))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
