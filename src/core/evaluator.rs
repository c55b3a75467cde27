use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::core::error::PipelineError;
use crate::models::Match;

/// Conflict resolution policy over all proposals of a cycle
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Return the accepted subset; an `Err` aborts the whole cycle
    async fn evaluate(&self, proposals: Vec<Match>) -> Result<Vec<Match>, String>;
}

/// Highest score wins, ties broken by ascending match id
///
/// The result does not depend on the order proposals were submitted in.
#[derive(Debug, Clone, Default)]
pub struct GreedyEvaluator;

#[async_trait]
impl Evaluator for GreedyEvaluator {
    async fn evaluate(&self, proposals: Vec<Match>) -> Result<Vec<Match>, String> {
        Ok(greedy_select(proposals))
    }
}

/// Order proposals by score (descending) then match id and keep every
/// proposal that does not reuse a ticket or backfill already taken
pub fn greedy_select(mut proposals: Vec<Match>) -> Vec<Match> {
    proposals.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.match_id.cmp(&b.match_id))
    });

    let mut claims = Claims::default();
    proposals
        .into_iter()
        .filter(|proposal| claims.try_claim(proposal))
        .collect()
}

#[derive(Default)]
struct Claims {
    tickets: HashSet<String>,
    backfills: HashSet<String>,
}

impl Claims {
    /// Claim every entity of `proposal`, or nothing if any is already taken
    fn try_claim(&mut self, proposal: &Match) -> bool {
        let mut local = HashSet::new();
        for id in proposal.ticket_ids() {
            if self.tickets.contains(id) || !local.insert(id) {
                return false;
            }
        }
        if let Some(backfill) = proposal.backfill_id() {
            if self.backfills.contains(backfill) {
                return false;
            }
        }

        self.tickets.extend(local.into_iter().map(str::to_string));
        if let Some(backfill) = proposal.backfill_id() {
            self.backfills.insert(backfill.to_string());
        }
        true
    }
}

/// Submissions sharing one match id
struct Submitted {
    count: usize,
    remaining: Vec<Match>,
}

impl Submitted {
    /// The submission `candidate` stands for, consumed so it is accepted once
    ///
    /// An exact copy wins. A modified copy is only traced back when its id
    /// was submitted once; otherwise there is no telling which one it means.
    fn take(&mut self, candidate: &Match) -> Option<Match> {
        if let Some(position) = self.remaining.iter().position(|m| m == candidate) {
            return Some(self.remaining.remove(position));
        }
        if self.count == 1 && !self.remaining.is_empty() {
            return Some(self.remaining.remove(0));
        }
        None
    }
}

/// Run `evaluator` and enforce mutual exclusivity on its answer
///
/// Only proposals that were actually submitted can be accepted, each once,
/// and always in their submitted form. A policy that returns overlapping
/// matches gets the later overlaps dropped. Match ids need not be unique:
/// two profiles proposing `"m1"` are two proposals.
pub async fn evaluate_proposals(
    evaluator: &dyn Evaluator,
    proposals: Vec<Match>,
) -> Result<Vec<Match>, PipelineError> {
    if proposals.is_empty() {
        return Ok(Vec::new());
    }

    let mut submitted: HashMap<String, Submitted> = HashMap::new();
    for proposal in &proposals {
        let entry = submitted
            .entry(proposal.match_id.clone())
            .or_insert_with(|| Submitted {
                count: 0,
                remaining: Vec::new(),
            });
        entry.count += 1;
        entry.remaining.push(proposal.clone());
    }
    let proposed = proposals.len();

    let returned = evaluator
        .evaluate(proposals)
        .await
        .map_err(PipelineError::EvaluationAborted)?;

    let mut claims = Claims::default();
    let mut accepted = Vec::with_capacity(returned.len());

    for candidate in returned {
        let original = match submitted.get_mut(&candidate.match_id) {
            Some(entry) => match entry.take(&candidate) {
                Some(original) => original,
                None => {
                    debug!("Evaluator repeated or altered match {}, dropping", candidate.match_id);
                    continue;
                }
            },
            None => {
                warn!("Evaluator returned unknown match {}, dropping", candidate.match_id);
                continue;
            }
        };

        if !claims.try_claim(&original) {
            warn!("Evaluator accepted overlapping match {}, dropping", original.match_id);
            continue;
        }

        accepted.push(original);
    }

    debug!("Evaluator accepted {} of {} proposals", accepted.len(), proposed);
    Ok(accepted)
}
