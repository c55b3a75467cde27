use futures::future::try_join_all;
use futures::TryStreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use validator::Validate;

use crate::core::error::PipelineError;
use crate::core::retry::{retry, RetryConfig};
use crate::models::{Backfill, MatchProfile, Pool, Ticket};
use crate::statestore::{StateStore, StoreError};

/// Entities selected by each pool of a profile, keyed by pool name
#[derive(Debug, Clone, Default)]
pub struct PoolContents {
    pub tickets: HashMap<String, Vec<Ticket>>,
    pub backfills: HashMap<String, Vec<Backfill>>,
}

impl PoolContents {
    pub fn ticket_count(&self) -> usize {
        self.tickets.values().map(Vec::len).sum()
    }

    pub fn backfill_count(&self) -> usize {
        self.backfills.values().map(Vec::len).sum()
    }
}

/// Read-only pool retrieval for match profiles
///
/// Pools are queried concurrently and independently. The first failing pool
/// fails the whole profile; partial results are never returned.
#[derive(Clone)]
pub struct PoolQuery {
    store: Arc<dyn StateStore>,
    retry: RetryConfig,
}

impl PoolQuery {
    pub fn new(store: Arc<dyn StateStore>, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    pub async fn query_pools(
        &self,
        profile: &MatchProfile,
        cancel: &CancellationToken,
    ) -> Result<PoolContents, PipelineError> {
        profile
            .validate()
            .map_err(|e| PipelineError::InvalidProfile(format!("{}: {}", profile.name, e)))?;

        let queries = profile.pools.iter().map(|pool| self.query_pool(pool, cancel));

        let results = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipelineError::Canceled),
            results = try_join_all(queries) => results?,
        };

        let mut contents = PoolContents::default();
        for (name, tickets, backfills) in results {
            contents.tickets.insert(name.clone(), tickets);
            contents.backfills.insert(name, backfills);
        }

        tracing::debug!(
            "Profile {} pooled {} tickets and {} backfills across {} pools",
            profile.name,
            contents.ticket_count(),
            contents.backfill_count(),
            profile.pools.len()
        );

        Ok(contents)
    }

    async fn query_pool(
        &self,
        pool: &Pool,
        cancel: &CancellationToken,
    ) -> Result<(String, Vec<Ticket>, Vec<Backfill>), PipelineError> {
        let tickets = retry("query_pool_tickets", &self.retry, cancel, || async {
            let stream = self.store.query_pool_tickets(pool).await?;
            stream.try_collect::<Vec<_>>().await
        });
        let backfills = retry("query_pool_backfills", &self.retry, cancel, || async {
            let stream = self.store.query_pool_backfills(pool).await?;
            stream.try_collect::<Vec<_>>().await
        });

        let (tickets, backfills) = futures::try_join!(tickets, backfills).map_err(|e| match e {
            StoreError::Canceled => PipelineError::Canceled,
            other => PipelineError::Store(other),
        })?;

        tracing::trace!(
            "Pool {} matched {} tickets, {} backfills",
            pool.name,
            tickets.len(),
            backfills.len()
        );

        Ok((pool.name.clone(), tickets, backfills))
    }
}
