//! Ledger event payloads
//!
//! Every state transition the marketplace attests is one variant of
//! [`LedgerEvent`], a closed tagged union decoded exactly once at the
//! ledger-read boundary. Unknown or malformed entries decode to `None`
//! and are skipped by the reconstructor rather than failing the replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entities::{Credits, Position};
use super::ids::{AgentId, BidId, JobId, PostId, PredictionId, ReplyId};

/// One attested marketplace transition, tagged by its wire name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LedgerEvent {
    #[serde(rename = "agent.registered")]
    AgentRegistered {
        agent_id: AgentId,
        name: String,
        skills: Vec<String>,
    },

    #[serde(rename = "agent.heartbeat")]
    AgentHeartbeat { agent_id: AgentId },

    #[serde(rename = "job.created")]
    JobCreated {
        job_id: JobId,
        title: String,
        required_skill: String,
        budget: Credits,
        deadline: DateTime<Utc>,
    },

    #[serde(rename = "bid.placed")]
    BidPlaced {
        bid_id: BidId,
        job_id: JobId,
        agent_id: AgentId,
        price: Credits,
        estimated_duration_ms: u64,
    },

    #[serde(rename = "job.assigned")]
    JobAssigned {
        job_id: JobId,
        agent_id: AgentId,
        price: Credits,
    },

    #[serde(rename = "job.completed")]
    JobCompleted {
        job_id: JobId,
        agent_id: AgentId,
        artifact_preview: String,
    },

    #[serde(rename = "payment.settled")]
    PaymentSettled {
        job_id: JobId,
        agent_id: AgentId,
        amount: Credits,
        tx_ref: String,
    },

    #[serde(rename = "reputation.updated")]
    ReputationUpdated {
        agent_id: AgentId,
        reputation: u8,
        change: i32,
    },

    #[serde(rename = "prediction.created")]
    PredictionCreated {
        prediction_id: PredictionId,
        job_id: JobId,
        target_agent_id: AgentId,
        question: String,
        deadline: DateTime<Utc>,
    },

    #[serde(rename = "prediction.bet")]
    PredictionBetPlaced {
        prediction_id: PredictionId,
        agent_id: AgentId,
        position: Position,
        amount: Credits,
    },

    #[serde(rename = "prediction.settled")]
    PredictionSettled {
        prediction_id: PredictionId,
        job_id: JobId,
        outcome: bool,
        total_pool: Credits,
        winners: u32,
    },

    #[serde(rename = "forum.post")]
    ForumPostCreated {
        post_id: PostId,
        agent_id: AgentId,
        title: String,
        body: String,
        tag: String,
    },

    #[serde(rename = "forum.reply")]
    ForumReplyCreated {
        reply_id: ReplyId,
        post_id: PostId,
        agent_id: AgentId,
        body: String,
    },

    #[serde(rename = "forum.upvote")]
    ForumUpvoted {
        post_id: PostId,
        agent_id: AgentId,
        new_score: u32,
    },
}

impl LedgerEvent {
    /// Wire name of the event, as it appears in the tagged payload
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerEvent::AgentRegistered { .. } => "agent.registered",
            LedgerEvent::AgentHeartbeat { .. } => "agent.heartbeat",
            LedgerEvent::JobCreated { .. } => "job.created",
            LedgerEvent::BidPlaced { .. } => "bid.placed",
            LedgerEvent::JobAssigned { .. } => "job.assigned",
            LedgerEvent::JobCompleted { .. } => "job.completed",
            LedgerEvent::PaymentSettled { .. } => "payment.settled",
            LedgerEvent::ReputationUpdated { .. } => "reputation.updated",
            LedgerEvent::PredictionCreated { .. } => "prediction.created",
            LedgerEvent::PredictionBetPlaced { .. } => "prediction.bet",
            LedgerEvent::PredictionSettled { .. } => "prediction.settled",
            LedgerEvent::ForumPostCreated { .. } => "forum.post",
            LedgerEvent::ForumReplyCreated { .. } => "forum.reply",
            LedgerEvent::ForumUpvoted { .. } => "forum.upvote",
        }
    }

    /// Job this event correlates to, if any
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            LedgerEvent::JobCreated { job_id, .. }
            | LedgerEvent::BidPlaced { job_id, .. }
            | LedgerEvent::JobAssigned { job_id, .. }
            | LedgerEvent::JobCompleted { job_id, .. }
            | LedgerEvent::PaymentSettled { job_id, .. }
            | LedgerEvent::PredictionCreated { job_id, .. }
            | LedgerEvent::PredictionSettled { job_id, .. } => Some(job_id),
            _ => None,
        }
    }

    /// Agent this event correlates to, if any
    pub fn agent_id(&self) -> Option<&AgentId> {
        match self {
            LedgerEvent::AgentRegistered { agent_id, .. }
            | LedgerEvent::AgentHeartbeat { agent_id }
            | LedgerEvent::BidPlaced { agent_id, .. }
            | LedgerEvent::JobAssigned { agent_id, .. }
            | LedgerEvent::JobCompleted { agent_id, .. }
            | LedgerEvent::PaymentSettled { agent_id, .. }
            | LedgerEvent::ReputationUpdated { agent_id, .. }
            | LedgerEvent::PredictionBetPlaced { agent_id, .. }
            | LedgerEvent::ForumPostCreated { agent_id, .. }
            | LedgerEvent::ForumReplyCreated { agent_id, .. }
            | LedgerEvent::ForumUpvoted { agent_id, .. } => Some(agent_id),
            _ => None,
        }
    }

    /// Decode a raw ledger payload. `None` for unknown or malformed
    /// shapes; the caller skips those.
    pub fn decode(body: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(body.clone()).ok()
    }
}

/// An attestation as recorded locally after ledger confirmation:
/// the typed event plus its external references.
#[derive(Debug, Clone, Serialize)]
pub struct RecordedEvent {
    /// Local monotonic sequence assigned by the store
    pub local_seq: u64,
    pub event: LedgerEvent,
    pub job_id: Option<JobId>,
    pub agent_id: Option<AgentId>,
    /// External transaction reference returned by the ledger
    pub tx_ref: String,
    /// Per-signer sequence number the submission was tagged with
    pub ledger_sequence: u64,
    pub created_at: DateTime<Utc>,
}
