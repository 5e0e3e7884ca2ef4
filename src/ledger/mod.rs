//! Ledger integration
//!
//! The client handle (live RPC or degraded mock) and the write queue
//! that serializes attestations against the per-signer sequence number.

pub mod client;
pub mod queue;

pub use client::{LedgerClient, LedgerMode, MockLedger, RawLogEntry, RpcLedger};
pub use queue::{ensure_channel, ensure_token, with_retry, AttestationFailure, ErrorSink, WriteQueue};
