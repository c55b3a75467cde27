use thiserror::Error;

use crate::statestore::StoreError;

/// Errors raised while running the matchmaking pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Match function failed for profile {profile}: {message}")]
    MatchFunctionFailed { profile: String, message: String },

    #[error("Evaluation aborted: {0}")]
    EvaluationAborted(String),

    #[error("Cycle deadline exceeded")]
    DeadlineExceeded,

    #[error("Operation canceled")]
    Canceled,

    #[error("Invalid match profile: {0}")]
    InvalidProfile(String),
}

impl PipelineError {
    /// Errors that end the whole cycle rather than a single profile or match
    pub fn is_cycle_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::EvaluationAborted(_) | PipelineError::DeadlineExceeded | PipelineError::Canceled
        )
    }
}
