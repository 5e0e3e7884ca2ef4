//! Shared error types for Guildhall
//!
//! One error enum for the whole crate, split along the taxonomy the
//! marketplace actually needs: validation errors are surfaced to the
//! caller and never retried; ledger errors are either transient
//! (retried by the setup helpers) or swallowed into degraded mode.

use thiserror::Error;

use crate::model::{AgentId, JobId, PredictionId};

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, GuildError>;

/// Error types for marketplace operations
#[derive(Debug, Error)]
pub enum GuildError {
    /// Referenced job does not exist
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// Referenced agent does not exist
    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    /// Referenced prediction market does not exist
    #[error("Prediction not found: {0}")]
    PredictionNotFound(PredictionId),

    /// Referenced forum post does not exist
    #[error("Forum post not found: {0}")]
    PostNotFound(String),

    /// Job is not accepting the requested transition
    #[error("Job {job} is not in the {expected} state")]
    InvalidJobState { job: JobId, expected: &'static str },

    /// An agent may bid on a given job at most once
    #[error("Agent {agent} already bid on job {job}")]
    AlreadyBid { job: JobId, agent: AgentId },

    /// Assignment requires at least one bid
    #[error("Job {0} has no bids")]
    NoBids(JobId),

    /// Only the assigned agent may submit a result
    #[error("Agent {agent} is not assigned to job {job}")]
    NotAssignedAgent { job: JobId, agent: AgentId },

    /// Prediction market no longer accepts bets
    #[error("Prediction {0} is closed")]
    PredictionClosed(PredictionId),

    /// An agent may bet on a given prediction at most once
    #[error("Agent {agent} already bet on prediction {prediction}")]
    DuplicateBet {
        prediction: PredictionId,
        agent: AgentId,
    },

    /// An agent may upvote a given post at most once
    #[error("Agent {agent} already upvoted post {post}")]
    DuplicateUpvote { post: String, agent: AgentId },

    /// Commerce document failed schema validation
    #[error("Invalid {kind} document: missing fields {missing:?}")]
    InvalidDocument {
        kind: &'static str,
        missing: Vec<&'static str>,
    },

    /// Generic request validation failure
    #[error("Validation error: {0}")]
    Validation(String),

    /// Ledger submission or query failed
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Ledger cannot be reached; reconstruction is not possible
    #[error("Ledger unavailable: {0}")]
    LedgerUnavailable(String),

    /// Internal invariant violation
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GuildError {
    /// True for errors the caller caused; these are never retried.
    pub fn is_validation(&self) -> bool {
        !matches!(
            self,
            GuildError::Ledger(_) | GuildError::LedgerUnavailable(_) | GuildError::Internal(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobId;

    #[test]
    fn test_validation_classification() {
        let job = JobId::new();
        assert!(GuildError::NoBids(job).is_validation());
        assert!(!GuildError::Ledger("rpc timeout".into()).is_validation());
        assert!(!GuildError::LedgerUnavailable("no endpoint".into()).is_validation());
    }
}
