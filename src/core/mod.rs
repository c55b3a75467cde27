// Matchmaking pipeline exports
pub mod backend;
pub mod error;
pub mod evaluator;
pub mod filters;
pub mod mmf;
pub mod query;
pub mod retry;
pub mod scenarios;

pub use backend::{Backend, BackendOptions, CyclePhase, CycleReport, ProfileOutcome, ProfileReport};
pub use error::PipelineError;
pub use evaluator::{evaluate_proposals, Evaluator, GreedyEvaluator};
pub use filters::{pool_matches_backfill, pool_matches_ticket};
pub use mmf::{MatchFunction, MatchFunctionRunner, PoolMatchFunction, ProposalSender, RunRequest};
pub use query::{PoolContents, PoolQuery};
pub use retry::{retry, RetryConfig};
