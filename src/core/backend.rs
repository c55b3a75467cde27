//! Backend orchestrator: one matchmaking cycle is
//! `Querying -> Matching -> Evaluating -> Applying -> Done`, with `Failed`
//! reachable from every phase.
//!
//! Failures are isolated at the narrowest scope that makes sense. A failing
//! pool query or match function fails its profile, a failing store write fails
//! its match, and only an evaluator abort or the cycle deadline fails the
//! cycle.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::error::PipelineError;
use crate::core::evaluator::{evaluate_proposals, Evaluator};
use crate::core::mmf::{MatchFunction, MatchFunctionRunner};
use crate::core::query::PoolQuery;
use crate::core::retry::{retry, RetryConfig};
use crate::models::{Assignment, Backfill, BackfillRecord, Match, MatchProfile};
use crate::statestore::{
    backfill_lock_key, BackfillMutation, LockGuard, LockOptions, Mutex, StateStore, StoreError,
};

/// Decides whether an acknowledged backfill should be deleted
pub type DeletePredicate = Arc<dyn Fn(&BackfillRecord) -> bool + Send + Sync>;

/// Tunables of the orchestrator, fixed at construction
#[derive(Clone)]
pub struct BackendOptions {
    pub assign_tickets: bool,
    pub acknowledge_backfills: bool,
    pub delete_backfills: bool,
    /// Delete tickets once their match has been applied
    pub delete_tickets: bool,
    pub cycle_deadline: Duration,
    /// Profiles matched, and matches applied, at the same time
    pub parallelism: usize,
    pub proposal_buffer: usize,
    /// Connection written into assignments; `{match_id}` is substituted
    pub assignment_connection: String,
    pub lock: LockOptions,
    pub retry: RetryConfig,
    pub delete_predicate: DeletePredicate,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            assign_tickets: true,
            acknowledge_backfills: true,
            delete_backfills: false,
            delete_tickets: false,
            cycle_deadline: Duration::from_secs(10),
            parallelism: 8,
            proposal_buffer: 64,
            assignment_connection: "server://{match_id}".to_string(),
            lock: LockOptions::default(),
            retry: RetryConfig::default(),
            delete_predicate: Arc::new(|_: &BackfillRecord| false),
        }
    }
}

impl fmt::Debug for BackendOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendOptions")
            .field("assign_tickets", &self.assign_tickets)
            .field("acknowledge_backfills", &self.acknowledge_backfills)
            .field("delete_backfills", &self.delete_backfills)
            .field("delete_tickets", &self.delete_tickets)
            .field("cycle_deadline", &self.cycle_deadline)
            .field("parallelism", &self.parallelism)
            .field("proposal_buffer", &self.proposal_buffer)
            .field("assignment_connection", &self.assignment_connection)
            .field("lock", &self.lock)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CyclePhase {
    Querying,
    Matching,
    Evaluating,
    Applying,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProfileOutcome {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileReport {
    pub name: String,
    pub outcome: ProfileOutcome,
    pub proposals: usize,
    pub error: Option<String>,
}

/// Aggregate result of one cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub cycle_id: String,
    pub phase: CyclePhase,
    pub profiles: Vec<ProfileReport>,
    pub profiles_succeeded: usize,
    pub profiles_failed: usize,
    pub matches_proposed: usize,
    pub matches_accepted: usize,
    pub matches_applied: usize,
    pub matches_failed: usize,
    pub tickets_assigned: usize,
    pub tickets_deleted: usize,
    pub backfills_created: usize,
    pub backfills_acknowledged: usize,
    pub backfills_deleted: usize,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl CycleReport {
    fn new() -> Self {
        Self {
            cycle_id: uuid::Uuid::new_v4().to_string(),
            phase: CyclePhase::Querying,
            profiles: Vec::new(),
            profiles_succeeded: 0,
            profiles_failed: 0,
            matches_proposed: 0,
            matches_accepted: 0,
            matches_applied: 0,
            matches_failed: 0,
            tickets_assigned: 0,
            tickets_deleted: 0,
            backfills_created: 0,
            backfills_acknowledged: 0,
            backfills_deleted: 0,
            error: None,
            elapsed_ms: 0,
        }
    }

    fn fail(&mut self, err: &PipelineError) {
        warn!("Cycle {} failed during {:?}: {}", self.cycle_id, self.phase, err);
        self.phase = CyclePhase::Failed;
        self.error = Some(err.to_string());
    }

    fn add(&mut self, counts: &ApplyCounts) {
        self.tickets_assigned += counts.tickets_assigned;
        self.tickets_deleted += counts.tickets_deleted;
        self.backfills_created += counts.backfills_created;
        self.backfills_acknowledged += counts.backfills_acknowledged;
        self.backfills_deleted += counts.backfills_deleted;
    }
}

#[derive(Debug, Default)]
struct ApplyCounts {
    tickets_assigned: usize,
    tickets_deleted: usize,
    backfills_created: usize,
    backfills_acknowledged: usize,
    backfills_deleted: usize,
}

/// Drives matchmaking cycles against a state store
#[derive(Clone)]
pub struct Backend {
    store: Arc<dyn StateStore>,
    query: PoolQuery,
    runner: MatchFunctionRunner,
    match_function: Arc<dyn MatchFunction>,
    evaluator: Arc<dyn Evaluator>,
    options: Arc<BackendOptions>,
}

impl Backend {
    pub fn new(
        store: Arc<dyn StateStore>,
        match_function: Arc<dyn MatchFunction>,
        evaluator: Arc<dyn Evaluator>,
        options: BackendOptions,
    ) -> Self {
        Self {
            query: PoolQuery::new(store.clone(), options.retry),
            runner: MatchFunctionRunner::new(options.proposal_buffer),
            store,
            match_function,
            evaluator,
            options: Arc::new(options),
        }
    }

    pub fn options(&self) -> &BackendOptions {
        &self.options
    }

    /// Run one cycle over `profiles`
    ///
    /// Never returns an error: failures are reported in the [`CycleReport`].
    pub async fn run_cycle(&self, profiles: &[MatchProfile], cancel: &CancellationToken) -> CycleReport {
        let started = Instant::now();
        let mut report = CycleReport::new();
        let token = cancel.child_token();
        let expired = arm_deadline(token.clone(), started + self.options.cycle_deadline);

        debug!("Cycle {} starting with {} profiles", report.cycle_id, profiles.len());

        self.run_phases(profiles, &token, &expired, &mut report).await;

        // Stops the deadline watcher and any match function still running
        token.cancel();

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            "Cycle {} {:?}: profiles {}/{} ok, {} proposed, {} accepted, {} applied, {} failed in {}ms",
            report.cycle_id,
            report.phase,
            report.profiles_succeeded,
            report.profiles.len(),
            report.matches_proposed,
            report.matches_accepted,
            report.matches_applied,
            report.matches_failed,
            report.elapsed_ms
        );
        report
    }

    async fn run_phases(
        &self,
        profiles: &[MatchProfile],
        token: &CancellationToken,
        expired: &AtomicBool,
        report: &mut CycleReport,
    ) {
        let interrupted = || {
            if expired.load(Ordering::SeqCst) {
                PipelineError::DeadlineExceeded
            } else {
                PipelineError::Canceled
            }
        };

        // Querying and Matching run per profile, profiles side by side
        let parallelism = self.options.parallelism.max(1);
        let profile_runs: Vec<_> = profiles
            .iter()
            .map(|profile| self.run_profile(profile, token))
            .collect();
        let per_profile = stream::iter(profile_runs)
            .buffered(parallelism)
            .collect::<Vec<_>>();

        let outcomes = tokio::select! {
            biased;
            _ = token.cancelled() => return report.fail(&interrupted()),
            outcomes = per_profile => outcomes,
        };

        report.phase = CyclePhase::Matching;
        let mut proposals = Vec::new();
        for (profile_report, matches) in outcomes {
            match profile_report.outcome {
                ProfileOutcome::Succeeded => report.profiles_succeeded += 1,
                ProfileOutcome::Failed => report.profiles_failed += 1,
            }
            report.profiles.push(profile_report);
            proposals.extend(matches);
        }
        report.matches_proposed = proposals.len();

        report.phase = CyclePhase::Evaluating;
        let accepted = tokio::select! {
            biased;
            _ = token.cancelled() => return report.fail(&interrupted()),
            accepted = evaluate_proposals(self.evaluator.as_ref(), proposals) => accepted,
        };
        let accepted = match accepted {
            Ok(accepted) => accepted,
            Err(err) => return report.fail(&err),
        };
        report.matches_accepted = accepted.len();

        report.phase = CyclePhase::Applying;
        let applies: Vec<_> = accepted
            .iter()
            .map(|proposal| self.apply_match(proposal, token))
            .collect();
        let outcomes = stream::iter(applies)
            .buffer_unordered(parallelism)
            .collect::<Vec<_>>()
            .await;

        for (counts, result) in outcomes {
            report.add(&counts);
            match result {
                Ok(()) => report.matches_applied += 1,
                Err(_) => report.matches_failed += 1,
            }
        }

        if expired.load(Ordering::SeqCst) {
            return report.fail(&PipelineError::DeadlineExceeded);
        }
        report.phase = CyclePhase::Done;
    }

    /// Query then match for one profile; a failure only fails this profile
    async fn run_profile(
        &self,
        profile: &MatchProfile,
        token: &CancellationToken,
    ) -> (ProfileReport, Vec<Match>) {
        let result = async {
            let pools = self.query.query_pools(profile, token).await?;
            self.runner
                .run(self.match_function.clone(), profile.clone(), pools, token.clone())
                .collect()
                .await
        }
        .await;

        match result {
            Ok(matches) => {
                debug!("Profile {} proposed {} matches", profile.name, matches.len());
                let report = ProfileReport {
                    name: profile.name.clone(),
                    outcome: ProfileOutcome::Succeeded,
                    proposals: matches.len(),
                    error: None,
                };
                (report, matches)
            }
            Err(err) => {
                // Cancellation is reported once, on the cycle
                if err.is_cycle_fatal() {
                    debug!("Profile {} interrupted: {}", profile.name, err);
                } else {
                    warn!("Profile {} failed: {}", profile.name, err);
                }
                let report = ProfileReport {
                    name: profile.name.clone(),
                    outcome: ProfileOutcome::Failed,
                    proposals: 0,
                    error: Some(err.to_string()),
                };
                (report, Vec::new())
            }
        }
    }

    async fn apply_match(
        &self,
        proposal: &Match,
        token: &CancellationToken,
    ) -> (ApplyCounts, Result<(), PipelineError>) {
        let mut counts = ApplyCounts::default();
        let result = self.try_apply(proposal, token, &mut counts).await;
        if let Err(err) = &result {
            warn!("Failed to apply match {}: {}", proposal.match_id, err);
        }
        (counts, result)
    }

    async fn try_apply(
        &self,
        proposal: &Match,
        token: &CancellationToken,
        counts: &mut ApplyCounts,
    ) -> Result<(), PipelineError> {
        match &proposal.backfill {
            // Tickets joining a running game go to that game's server
            Some(backfill) if !backfill.id.is_empty() => {
                if self.options.acknowledge_backfills {
                    self.acknowledge_backfill(proposal, backfill, token, counts).await?;
                } else if self.options.assign_tickets {
                    let assignment = self.backfill_assignment(proposal, backfill, token).await?;
                    self.assign_match_tickets(proposal, &assignment, token, counts).await?;
                }
            }
            backfill => {
                let assignment = self.assignment_for(&proposal.match_id);
                if self.options.assign_tickets {
                    self.assign_match_tickets(proposal, &assignment, token, counts).await?;
                }
                if self.options.acknowledge_backfills {
                    if let Some(backfill) = backfill {
                        self.create_backfill(proposal, backfill, assignment, token).await?;
                        counts.backfills_created += 1;
                    }
                }
            }
        }

        if self.options.delete_tickets {
            for id in proposal.ticket_ids() {
                let deleted = retry("delete_ticket", &self.options.retry, token, || {
                    self.store.delete_ticket(id)
                })
                .await;
                match deleted {
                    Ok(()) => counts.tickets_deleted += 1,
                    Err(StoreError::NotFound(_)) => debug!("Ticket {} already deleted", id),
                    Err(err) => return Err(pipeline_error(err)),
                }
            }
        }

        Ok(())
    }

    fn assignment_for(&self, game_id: &str) -> Assignment {
        Assignment {
            connection: self.options.assignment_connection.replace("{match_id}", game_id),
            extensions: BTreeMap::new(),
        }
    }

    /// Assignment recorded on the backfill, or one derived from its id for
    /// backfills created outside the pipeline
    fn stored_assignment(&self, record: &BackfillRecord) -> Assignment {
        record
            .assignment
            .clone()
            .unwrap_or_else(|| self.assignment_for(&record.backfill.id))
    }

    async fn backfill_assignment(
        &self,
        proposal: &Match,
        backfill: &Backfill,
        token: &CancellationToken,
    ) -> Result<Assignment, PipelineError> {
        let record = retry("get_backfill", &self.options.retry, token, || {
            self.store.get_backfill(&backfill.id)
        })
        .await;

        match record {
            Ok(record) => Ok(self.stored_assignment(&record)),
            Err(StoreError::NotFound(_)) => {
                debug!("Backfill {} is gone, match {} gets its own server", backfill.id, proposal.match_id);
                Ok(self.assignment_for(&proposal.match_id))
            }
            Err(err) => Err(pipeline_error(err)),
        }
    }

    async fn assign_match_tickets(
        &self,
        proposal: &Match,
        assignment: &Assignment,
        token: &CancellationToken,
        counts: &mut ApplyCounts,
    ) -> Result<(), PipelineError> {
        for id in proposal.ticket_ids() {
            if self.assign(id, assignment, token).await? {
                counts.tickets_assigned += 1;
            }
        }
        Ok(())
    }

    /// `Ok(true)` only when this call wrote the assignment; a ticket that is
    /// gone or already carries the same assignment gives `Ok(false)`
    async fn assign(
        &self,
        ticket_id: &str,
        assignment: &Assignment,
        token: &CancellationToken,
    ) -> Result<bool, PipelineError> {
        let assigned = retry("assign_ticket", &self.options.retry, token, || {
            self.store.assign_ticket(ticket_id, assignment)
        })
        .await;

        match assigned {
            Ok(written) => Ok(written),
            Err(StoreError::NotFound(_)) => {
                debug!("Ticket {} deleted before assignment, skipping", ticket_id);
                Ok(false)
            }
            Err(err) => Err(pipeline_error(err)),
        }
    }

    async fn create_backfill(
        &self,
        proposal: &Match,
        backfill: &Backfill,
        assignment: Assignment,
        token: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let ticket_ids: Vec<String> = proposal.ticket_ids().map(str::to_string).collect();
        let created = retry("create_backfill", &self.options.retry, token, || {
            self.store
                .create_backfill(backfill.clone(), ticket_ids.clone(), Some(assignment.clone()))
        })
        .await
        .map_err(pipeline_error)?;

        debug!("Created backfill {} for match {}", created.id, proposal.match_id);
        Ok(())
    }

    /// Lock, acknowledge, maybe delete, unlock
    async fn acknowledge_backfill(
        &self,
        proposal: &Match,
        backfill: &Backfill,
        token: &CancellationToken,
        counts: &mut ApplyCounts,
    ) -> Result<(), PipelineError> {
        let mutex = Mutex::new(self.store.clone(), backfill_lock_key(&backfill.id), self.options.lock);
        let guard = retry("lock_backfill", &self.options.retry, token, || mutex.lock(token))
            .await
            .map_err(pipeline_error)?;

        let result = self.acknowledge_locked(&guard, proposal, backfill, token, counts).await;

        if let Err(err) = guard.unlock().await {
            warn!("Failed to release lock on backfill {}: {}", backfill.id, err);
        }
        result
    }

    /// Acknowledging is where a backfill's tickets get their assignment: the
    /// ones associated earlier and the ones this match adds, whether or not
    /// `assign_tickets` is set
    async fn acknowledge_locked(
        &self,
        guard: &LockGuard,
        proposal: &Match,
        backfill: &Backfill,
        token: &CancellationToken,
        counts: &mut ApplyCounts,
    ) -> Result<(), PipelineError> {
        let id = backfill.id.as_str();
        let record = match retry("get_backfill", &self.options.retry, token, || {
            self.store.get_backfill(id)
        })
        .await
        {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => {
                debug!("Backfill {} deleted before acknowledgement, skipping", id);
                return Ok(());
            }
            Err(err) => return Err(pipeline_error(err)),
        };

        if record.backfill.generation != backfill.generation {
            return Err(PipelineError::Store(StoreError::Conflict(format!(
                "backfill {} is at generation {}, proposal was made against {}",
                id, record.backfill.generation, backfill.generation
            ))));
        }

        let assignment = self.stored_assignment(&record);
        self.assign_match_tickets(proposal, &assignment, token, counts).await?;

        for ticket_id in &record.ticket_ids {
            match self.assign(ticket_id, &assignment, token).await {
                Ok(true) => counts.tickets_assigned += 1,
                Ok(false) => {}
                Err(PipelineError::Store(StoreError::Conflict(_))) => {
                    debug!("Pending ticket {} of backfill {} went to another game", ticket_id, id);
                }
                Err(err) => return Err(err),
            }
        }

        let search_fields = backfill.search_fields.clone();
        let extensions = backfill.extensions.clone();
        let updated = retry("update_backfill", &self.options.retry, token, || {
            let search_fields = search_fields.clone();
            let extensions = extensions.clone();
            let assignment = assignment.clone();
            let mutation: BackfillMutation = Box::new(move |record: &mut BackfillRecord| {
                record.backfill.search_fields = search_fields;
                record.backfill.extensions = extensions;
                record.ticket_ids.clear();
                record.last_acknowledged = Some(Utc::now());
                record.assignment = Some(assignment);
            });
            self.store.update_backfill(guard, id, mutation)
        })
        .await
        .map_err(pipeline_error)?;
        counts.backfills_acknowledged += 1;

        // Acknowledgement is persisted before the predicate sees the record
        if self.options.delete_backfills && (self.options.delete_predicate)(&updated) {
            let deleted = retry("delete_backfill", &self.options.retry, token, || {
                self.store.delete_backfill(id)
            })
            .await;
            match deleted {
                Ok(()) => {
                    debug!("Deleted backfill {} at generation {}", id, updated.backfill.generation);
                    counts.backfills_deleted += 1;
                }
                Err(StoreError::NotFound(_)) => {}
                Err(err) => return Err(pipeline_error(err)),
            }
        }

        Ok(())
    }

    /// Launch a cycle every `interval` until `shutdown` fires
    ///
    /// At most `max_concurrent_cycles` cycles are in flight; a tick that finds
    /// no free slot is skipped. In-flight cycles are cancelled and awaited on
    /// shutdown.
    pub async fn run_forever(
        &self,
        profiles: Arc<Vec<MatchProfile>>,
        interval: Duration,
        max_concurrent_cycles: usize,
        shutdown: CancellationToken,
    ) {
        let slots = max_concurrent_cycles.max(1);
        let semaphore = Arc::new(Semaphore::new(slots));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Backend loop started: {} profiles every {:?}, up to {} concurrent cycles",
            profiles.len(),
            interval,
            slots
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let permit = match semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    debug!("All {} cycle slots busy, skipping tick", slots);
                    continue;
                }
            };

            let backend = self.clone();
            let profiles = profiles.clone();
            let token = shutdown.child_token();
            tokio::spawn(async move {
                backend.run_cycle(&profiles, &token).await;
                drop(permit);
            });
        }

        // Wait for in-flight cycles to wind down
        if semaphore.acquire_many(slots as u32).await.is_err() {
            warn!("Cycle semaphore closed during shutdown");
        }
        info!("Backend loop stopped");
    }
}

fn pipeline_error(err: StoreError) -> PipelineError {
    match err {
        StoreError::Canceled => PipelineError::Canceled,
        other => PipelineError::Store(other),
    }
}

/// Cancel `token` at `deadline`; the returned flag records that it did
fn arm_deadline(token: CancellationToken, deadline: Instant) -> Arc<AtomicBool> {
    let expired = Arc::new(AtomicBool::new(false));
    let flag = expired.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep_until(deadline) => {
                flag.store(true, Ordering::SeqCst);
                token.cancel();
            }
        }
    });
    expired
}
