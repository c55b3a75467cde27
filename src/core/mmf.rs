//! Match function execution.
//!
//! A match function is an untrusted, pluggable capability: the runner only
//! knows its signature. Proposals flow back over a bounded channel, one at a
//! time and in the order the function produced them.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::error::PipelineError;
use crate::core::query::PoolContents;
use crate::models::{Match, MatchProfile};

/// Input handed to a match function for one profile
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub profile: MatchProfile,
    pub pools: PoolContents,
}

/// Sending half of the proposal stream
#[derive(Clone)]
pub struct ProposalSender {
    tx: mpsc::Sender<Match>,
}

impl ProposalSender {
    /// Send one proposal, waiting while the consumer is behind
    ///
    /// Fails once the runner stopped listening (cancellation or deadline).
    pub async fn send(&self, proposal: Match) -> Result<(), String> {
        self.tx
            .send(proposal)
            .await
            .map_err(|_| "proposal stream closed by the caller".to_string())
    }
}

/// Custom matchmaking logic for a profile
#[async_trait]
pub trait MatchFunction: Send + Sync {
    fn name(&self) -> &str;

    /// Stream zero or more proposals; an `Err` is reported verbatim
    async fn run(&self, request: RunRequest, proposals: ProposalSender) -> Result<(), String>;
}

type PoolMatchFn =
    dyn Fn(&MatchProfile, &PoolContents) -> Result<Vec<Match>, String> + Send + Sync;

/// Adapts a plain function over pooled entities into a streaming [`MatchFunction`]
pub struct PoolMatchFunction {
    name: String,
    func: Arc<PoolMatchFn>,
}

impl PoolMatchFunction {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&MatchProfile, &PoolContents) -> Result<Vec<Match>, String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }
}

#[async_trait]
impl MatchFunction for PoolMatchFunction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, request: RunRequest, proposals: ProposalSender) -> Result<(), String> {
        let matches = (self.func)(&request.profile, &request.pools)?;

        tracing::trace!(
            "Match function {} produced {} proposals for {}",
            self.name,
            matches.len(),
            request.profile.name
        );

        for proposal in matches {
            proposals.send(proposal).await?;
        }
        Ok(())
    }
}

enum Event {
    Proposal(Match),
    Failed(String),
}

/// Receiving half: proposals as they are produced, then end-of-stream
pub struct ProposalStream {
    profile: String,
    function: String,
    rx: mpsc::Receiver<Event>,
    finished: bool,
}

impl ProposalStream {
    /// Next proposal, `None` at end of stream
    ///
    /// A function failure is yielded once as `MatchFunctionFailed`, after
    /// which the stream is finished.
    pub async fn next(&mut self) -> Option<Result<Match, PipelineError>> {
        if self.finished {
            return None;
        }

        match self.rx.recv().await {
            Some(Event::Proposal(mut proposal)) => {
                if proposal.match_id.is_empty() {
                    proposal.match_id = format!("{}-{}", self.profile, uuid::Uuid::new_v4());
                }
                if proposal.match_profile.is_empty() {
                    proposal.match_profile = self.profile.clone();
                }
                if proposal.match_function.is_empty() {
                    proposal.match_function = self.function.clone();
                }
                Some(Ok(proposal))
            }
            Some(Event::Failed(message)) => {
                self.finished = true;
                Some(Err(PipelineError::MatchFunctionFailed {
                    profile: self.profile.clone(),
                    message,
                }))
            }
            None => {
                self.finished = true;
                None
            }
        }
    }

    /// Drain the stream, failing on the first error
    pub async fn collect(mut self) -> Result<Vec<Match>, PipelineError> {
        let mut proposals = Vec::new();
        while let Some(next) = self.next().await {
            proposals.push(next?);
        }
        Ok(proposals)
    }
}

/// Runs match functions on the runtime, one task per profile
#[derive(Debug, Clone)]
pub struct MatchFunctionRunner {
    buffer: usize,
}

impl MatchFunctionRunner {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
        }
    }

    /// Start `mmf` for `profile`; the function is aborted when `cancel` fires
    pub fn run(
        &self,
        mmf: Arc<dyn MatchFunction>,
        profile: MatchProfile,
        pools: PoolContents,
        cancel: CancellationToken,
    ) -> ProposalStream {
        let (event_tx, event_rx) = mpsc::channel(self.buffer);
        let (proposal_tx, mut proposal_rx) = mpsc::channel::<Match>(self.buffer);

        let profile_name = profile.name.clone();
        let function_name = mmf.name().to_string();
        let request = RunRequest { profile, pools };
        let task_profile = profile_name.clone();

        tokio::spawn(async move {
            let sender = ProposalSender { tx: proposal_tx };
            let run = mmf.run(request, sender);
            tokio::pin!(run);

            // Forward proposals while the function runs so the consumer sees
            // them as soon as they are produced
            let outcome = loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break Err("canceled".to_string()),
                    Some(proposal) = proposal_rx.recv() => {
                        if event_tx.send(Event::Proposal(proposal)).await.is_err() {
                            return;
                        }
                    }
                    result = &mut run => break result,
                }
            };

            // The function's sender is gone now; flush what it left behind
            if outcome.is_ok() {
                while let Ok(proposal) = proposal_rx.try_recv() {
                    if event_tx.send(Event::Proposal(proposal)).await.is_err() {
                        return;
                    }
                }
            }

            if let Err(message) = outcome {
                tracing::warn!("Match function failed for profile {}: {}", task_profile, message);
                let _ = event_tx.send(Event::Failed(message)).await;
            }
        });

        ProposalStream {
            profile: profile_name,
            function: function_name,
            rx: event_rx,
            finished: false,
        }
    }
}
