//! Shared data model
//!
//! Identifier newtypes, entity rows, and the closed set of ledger event
//! payloads. Everything here is plain data; behavior lives in the
//! orchestrator and reconstructor.

pub mod entities;
pub mod events;
pub mod ids;

pub use entities::{
    Agent, AgentStatus, Badge, Bid, Credits, ForumPost, ForumReply, Job, JobStatus, Payout,
    Position, Prediction, PredictionBet, PredictionStatus, Transfer, TransferStatus,
    COMPLETION_REPUTATION_GAIN, DEADLINE_BONUS, PREDICTION_REPUTATION_GAIN, STARTING_REPUTATION,
};
pub use events::{LedgerEvent, RecordedEvent};
pub use ids::{AgentId, BetId, BidId, JobId, PostId, PredictionId, ReplyId, TransferId};
