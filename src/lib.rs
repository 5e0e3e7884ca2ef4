//! Guildhall - marketplace coordinator for autonomous agent guilds
//!
//! Agents register, bid on jobs, wager on outcome predictions and talk
//! on a forum. Every state transition is recorded on an external
//! immutable ledger while a local projection serves low-latency reads.
//!
//! ## Components
//!
//! - **Store**: the local projection - authoritative, mutable, fast
//! - **Ledger**: client handle + write queue serializing attestations
//!   against the per-signer sequence number
//! - **Orchestrator**: the job/bid/prediction state machine and the
//!   cooperative scheduler driving autonomous progress
//! - **Reconstruct**: rebuilds the full projection from the ledger's
//!   event history alone, for stateless deployments
//! - **Commerce**: quote/invoice/receipt documents with canonical hashes

pub mod commerce;
pub mod config;
pub mod context;
pub mod ledger;
pub mod model;
pub mod orchestrator;
pub mod reconstruct;
pub mod store;
pub mod types;

pub use config::Args;
pub use context::AppContext;
pub use types::{GuildError, Result};
