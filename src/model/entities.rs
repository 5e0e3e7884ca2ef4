//! Marketplace entities
//!
//! The mutable rows held by the projection store. History is append-only:
//! jobs, bids, bets and transfers are never deleted, agents are never
//! removed once registered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::ids::{
    AgentId, BetId, BidId, JobId, PostId, PredictionId, ReplyId, TransferId,
};
use crate::commerce::{Invoice, Quote, Receipt};

/// Reputation a freshly registered agent starts with
pub const STARTING_REPUTATION: u8 = 50;

/// Flat reputation gain for completing a job
pub const COMPLETION_REPUTATION_GAIN: i32 = 10;

/// Extra reputation for finishing before the deadline
pub const DEADLINE_BONUS: i32 = 5;

/// Reputation gain for a correct prediction
pub const PREDICTION_REPUTATION_GAIN: i32 = 3;

// ============================================================================
// Money
// ============================================================================

/// Fixed-point currency amount in minor units (2 decimals).
///
/// All arithmetic stays in minor units; the ledger payload carries the
/// raw integer, display formats as `major.minor`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Credits(pub u64);

impl Credits {
    pub const ZERO: Credits = Credits(0);

    /// From whole currency units
    pub fn from_major(units: u64) -> Self {
        Credits(units * 100)
    }

    /// Raw minor units (what goes into ledger payloads)
    pub fn minor(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn saturating_add(self, other: Credits) -> Credits {
        Credits(self.0.saturating_add(other.0))
    }

    /// Pro-rata share: `self / pool * total`, truncating to minor units.
    ///
    /// Returns `self` unchanged when the pool is empty (refund rule).
    pub fn pro_rata(self, pool: Credits, total: Credits) -> Credits {
        if pool.is_zero() {
            return self;
        }
        let share = (self.0 as u128) * (total.0 as u128) / (pool.0 as u128);
        Credits(share as u64)
    }
}

impl fmt::Display for Credits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

impl std::iter::Sum for Credits {
    fn sum<I: Iterator<Item = Credits>>(iter: I) -> Self {
        iter.fold(Credits::ZERO, Credits::saturating_add)
    }
}

// ============================================================================
// Agents
// ============================================================================

/// Agent lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Inactive,
}

/// A registered marketplace participant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    /// Unordered skill set; bids are matched against a job's required skill
    pub skills: BTreeSet<String>,
    /// Bounded 0-100
    pub reputation: u8,
    pub completions: u32,
    pub failures: u32,
    pub time_bonuses: u32,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(id: AgentId, name: String, skills: BTreeSet<String>) -> Self {
        Self {
            id,
            name,
            skills,
            reputation: STARTING_REPUTATION,
            completions: 0,
            failures: 0,
            time_bonuses: 0,
            last_heartbeat: Some(Utc::now()),
            status: AgentStatus::Active,
            created_at: Utc::now(),
        }
    }

    /// Apply a reputation delta, clamped to [0, 100]
    pub fn apply_reputation(&mut self, change: i32) {
        let next = i32::from(self.reputation) + change;
        self.reputation = next.clamp(0, 100) as u8;
    }

    /// Derived display badge, never stored
    pub fn badge(&self) -> Badge {
        if self.completions < 3 {
            Badge::New
        } else if self.reputation < 30 {
            Badge::Risky
        } else if self.time_bonuses >= 3 {
            Badge::Fast
        } else if self.reputation >= 80 {
            Badge::Reliable
        } else {
            Badge::Active
        }
    }
}

/// Reputation badge derived from an agent's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Badge {
    New,
    Risky,
    Fast,
    Reliable,
    Active,
}

// ============================================================================
// Jobs
// ============================================================================

/// Job state machine: `open -> assigned -> completed -> settled`, with
/// the watchdog reverting `assigned -> open`. `Failed` is a reserved
/// terminal no transition currently produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Open,
    Assigned,
    Completed,
    Settled,
    Failed,
}

impl JobStatus {
    /// Final states; prediction markets settle once the job gets here
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Settled | JobStatus::Failed)
    }

    /// Terminal AND the work actually got done
    pub fn is_successful(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Settled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Open => "open",
            JobStatus::Assigned => "assigned",
            JobStatus::Completed => "completed",
            JobStatus::Settled => "settled",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A unit of work posted to the marketplace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub title: String,
    pub description: String,
    pub required_skill: String,
    pub budget: Credits,
    pub currency: String,
    pub status: JobStatus,
    pub creator: AgentId,
    pub assigned_agent: Option<AgentId>,
    pub result_artifact: Option<String>,
    pub deadline: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Bids
// ============================================================================

/// A sealed offer to perform a job. Immutable once placed; unique per
/// (job, agent) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bid {
    pub id: BidId,
    pub job_id: JobId,
    pub agent_id: AgentId,
    pub price: Credits,
    pub currency: String,
    /// Signed quote document accompanying the bid, when the agent sent one
    pub quote: Option<Quote>,
    pub estimated_duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Prediction markets
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionStatus {
    Open,
    Settled,
}

/// Which side of the market a bet is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Yes,
    No,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Position::Yes => "yes",
            Position::No => "no",
        })
    }
}

/// Derived yes/no market on a job outcome, created when the job is
/// assigned. At most one active market per job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub id: PredictionId,
    pub job_id: JobId,
    pub target_agent: AgentId,
    pub question: String,
    pub deadline: DateTime<Utc>,
    pub status: PredictionStatus,
    pub outcome: Option<bool>,
    pub yes_pool: Credits,
    pub no_pool: Credits,
    pub creator: AgentId,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl Prediction {
    pub fn total_pool(&self) -> Credits {
        self.yes_pool.saturating_add(self.no_pool)
    }

    pub fn pool_for(&self, position: Position) -> Credits {
        match position {
            Position::Yes => self.yes_pool,
            Position::No => self.no_pool,
        }
    }
}

/// A stake on one side of a prediction market. Immutable; unique per
/// (prediction, agent) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionBet {
    pub id: BetId,
    pub prediction_id: PredictionId,
    pub agent_id: AgentId,
    pub position: Position,
    pub amount: Credits,
    pub created_at: DateTime<Utc>,
}

/// Payout computed for one winning bettor at settlement
#[derive(Debug, Clone, Serialize)]
pub struct Payout {
    pub agent_id: AgentId,
    pub amount: Credits,
}

// ============================================================================
// Settlement
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Completed,
}

/// Record of a completed job payment, with the generated commerce
/// documents embedded. At most one per job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub job_id: JobId,
    pub from_agent: AgentId,
    pub to_agent: AgentId,
    pub amount: Credits,
    pub token_ref: String,
    pub tx_ref: String,
    pub invoice: Option<Invoice>,
    pub receipt: Option<Receipt>,
    pub status: TransferStatus,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Forum
// ============================================================================

/// A message-board post by an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForumPost {
    pub id: PostId,
    pub agent_id: AgentId,
    pub title: String,
    pub body: String,
    pub tag: String,
    pub upvotes: u32,
    pub reply_count: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForumReply {
    pub id: ReplyId,
    pub post_id: PostId,
    pub agent_id: AgentId,
    pub body: String,
    pub created_at: DateTime<Utc>,
}
