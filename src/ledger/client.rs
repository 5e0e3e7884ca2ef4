//! Ledger client handle
//!
//! One trait covers everything the marketplace asks of the external
//! ledger: sequence lookup, attestation submission, token transfer,
//! first-use resource creation, and the bounded event-log query the
//! reconstructor replays. `RpcLedger` talks to a real endpoint;
//! `MockLedger` is the degraded mode used when the process starts
//! without credentials, handing out synthetic references and keeping an
//! in-memory log so reconstruction still works.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tracing::{debug, warn};

use crate::model::{AgentId, Credits, JobId, LedgerEvent};
use crate::types::{GuildError, Result};

/// Operating mode of the ledger handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerMode {
    /// Credentialed, talking to a real endpoint
    Live,
    /// Degraded: synthetic references, in-memory log
    Mock,
}

/// One raw entry from the ledger's event log, not yet decoded
#[derive(Debug, Clone)]
pub struct RawLogEntry {
    pub tx_ref: String,
    pub block_number: u64,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    /// Tagged payload; decoded into a `LedgerEvent` at the read boundary
    pub body: Value,
}

/// Everything the marketplace asks of the external ledger
#[async_trait]
pub trait LedgerClient: Send + Sync {
    fn mode(&self) -> LedgerMode;

    /// Fetch the next per-signer sequence number fresh from the ledger
    async fn next_sequence(&self) -> Result<u64>;

    /// Submit one attestation tagged with a sequence number and await
    /// confirmation; returns the transaction reference
    async fn submit(&self, event: &LedgerEvent, sequence: u64) -> Result<String>;

    /// Move settlement tokens to an agent; returns the transaction reference
    async fn transfer_token(
        &self,
        token_ref: &str,
        to: &AgentId,
        amount: Credits,
        job_id: &JobId,
    ) -> Result<String>;

    /// First-use creation of the attestation channel
    async fn create_channel(&self) -> Result<String>;

    /// First-use creation of the settlement token
    async fn create_token(&self) -> Result<String>;

    /// Height of the ledger, upper bound for lookback queries
    async fn latest_block(&self) -> Result<u64>;

    /// Event log slice for a bounded block range
    async fn query_events(&self, from_block: u64, to_block: u64) -> Result<Vec<RawLogEntry>>;
}

// ============================================================================
// RPC implementation
// ============================================================================

/// Ledger client over a JSON envelope RPC endpoint
pub struct RpcLedger {
    http: reqwest::Client,
    endpoint: String,
    network_id: String,
    operator_id: String,
    contract_address: Option<String>,
}

impl RpcLedger {
    pub fn new(
        endpoint: &str,
        network_id: &str,
        operator_id: &str,
        contract_address: Option<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.to_string(),
            network_id: network_id.to_string(),
            operator_id: operator_id.to_string(),
            contract_address,
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({
            "method": method,
            "network": self.network_id,
            "operator": self.operator_id,
            "contract": self.contract_address,
            "params": params,
        });

        let response = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| GuildError::LedgerUnavailable(format!("{}: {}", method, e)))?;

        if !response.status().is_success() {
            return Err(GuildError::Ledger(format!(
                "{} returned HTTP {}",
                method,
                response.status()
            )));
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| GuildError::Ledger(format!("{}: invalid response: {}", method, e)))?;

        if let Some(err) = value.get("error") {
            return Err(GuildError::Ledger(format!("{}: {}", method, err)));
        }

        Ok(value.get("result").cloned().unwrap_or(Value::Null))
    }

    fn str_field(value: &Value, field: &str) -> Result<String> {
        value
            .get(field)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| GuildError::Ledger(format!("missing '{}' in ledger response", field)))
    }

    fn u64_field(value: &Value, field: &str) -> Result<u64> {
        value
            .get(field)
            .and_then(Value::as_u64)
            .ok_or_else(|| GuildError::Ledger(format!("missing '{}' in ledger response", field)))
    }
}

#[async_trait]
impl LedgerClient for RpcLedger {
    fn mode(&self) -> LedgerMode {
        LedgerMode::Live
    }

    async fn next_sequence(&self) -> Result<u64> {
        let result = self.call("sequence.next", json!({})).await?;
        Self::u64_field(&result, "sequence")
    }

    async fn submit(&self, event: &LedgerEvent, sequence: u64) -> Result<String> {
        let payload = serde_json::to_value(event)
            .map_err(|e| GuildError::Internal(format!("event serialization: {}", e)))?;
        let result = self
            .call(
                "attestation.submit",
                json!({ "sequence": sequence, "event": payload }),
            )
            .await?;
        let tx_ref = Self::str_field(&result, "tx_ref")?;
        debug!(kind = event.kind(), sequence, tx_ref = %tx_ref, "Attestation confirmed");
        Ok(tx_ref)
    }

    async fn transfer_token(
        &self,
        token_ref: &str,
        to: &AgentId,
        amount: Credits,
        job_id: &JobId,
    ) -> Result<String> {
        let result = self
            .call(
                "token.transfer",
                json!({
                    "token": token_ref,
                    "to": to,
                    "amount": amount.minor(),
                    "memo": job_id,
                }),
            )
            .await?;
        Self::str_field(&result, "tx_ref")
    }

    async fn create_channel(&self) -> Result<String> {
        let result = self
            .call("channel.create", json!({ "memo": "guildhall marketplace events" }))
            .await?;
        Self::str_field(&result, "channel_id")
    }

    async fn create_token(&self) -> Result<String> {
        let result = self
            .call(
                "token.create",
                json!({
                    "name": "Guildhall Credits",
                    "symbol": "GUILD",
                    "decimals": 2,
                    "initial_supply": 1_000_000u64,
                }),
            )
            .await?;
        Self::str_field(&result, "token_id")
    }

    async fn latest_block(&self) -> Result<u64> {
        let result = self.call("block.latest", json!({})).await?;
        Self::u64_field(&result, "block_number")
    }

    async fn query_events(&self, from_block: u64, to_block: u64) -> Result<Vec<RawLogEntry>> {
        let result = self
            .call(
                "events.query",
                json!({ "from_block": from_block, "to_block": to_block }),
            )
            .await?;

        let entries = result
            .get("events")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut parsed = Vec::with_capacity(entries.len());
        for entry in entries {
            // Entries missing envelope fields are dropped here; payloads
            // that fail typed decoding are dropped later by the
            // reconstructor. Either way a bad entry never aborts a query.
            let tx_ref = match entry.get("tx_ref").and_then(Value::as_str) {
                Some(t) => t.to_string(),
                None => continue,
            };
            let block_number = entry.get("block_number").and_then(Value::as_u64).unwrap_or(0);
            let sequence = entry.get("sequence").and_then(Value::as_u64).unwrap_or(0);
            let timestamp = entry
                .get("timestamp")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<DateTime<Utc>>().ok())
                .unwrap_or_else(Utc::now);
            let body = entry.get("event").cloned().unwrap_or(Value::Null);
            parsed.push(RawLogEntry {
                tx_ref,
                block_number,
                sequence,
                timestamp,
                body,
            });
        }
        Ok(parsed)
    }
}

// ============================================================================
// Mock implementation (degraded mode)
// ============================================================================

/// Degraded-mode ledger: every call succeeds locally with a synthetic
/// reference. Keeps an append-only in-memory log so the reconstructor
/// (and tests) can replay what was "attested".
pub struct MockLedger {
    sequence: AtomicU64,
    block: AtomicU64,
    log: RwLock<Vec<RawLogEntry>>,
    sequence_fetches: AtomicU64,
    query_count: AtomicU64,
    /// Remaining submissions to fail, for fault-injection in tests
    fail_submissions: AtomicU64,
}

impl MockLedger {
    pub fn new() -> Self {
        Self {
            sequence: AtomicU64::new(0),
            block: AtomicU64::new(0),
            log: RwLock::new(Vec::new()),
            sequence_fetches: AtomicU64::new(0),
            query_count: AtomicU64::new(0),
            fail_submissions: AtomicU64::new(0),
        }
    }

    /// Number of times `next_sequence` was called
    pub fn sequence_fetch_count(&self) -> u64 {
        self.sequence_fetches.load(Ordering::Relaxed)
    }

    /// Make the next `count` submissions fail with a transient error
    pub fn fail_next_submissions(&self, count: u64) {
        self.fail_submissions.store(count, Ordering::Relaxed);
    }

    pub fn log_len(&self) -> usize {
        self.log.read().expect("mock log lock poisoned").len()
    }

    /// Number of `query_events` calls served
    pub fn query_count(&self) -> u64 {
        self.query_count.load(Ordering::Relaxed)
    }

    /// Append an arbitrary raw entry, bypassing submission. Lets tests
    /// seed out-of-order, unknown or malformed log shapes.
    pub fn append_raw(&self, entry: RawLogEntry) {
        let block = self.block.load(Ordering::Relaxed).max(entry.block_number);
        self.block.store(block, Ordering::Relaxed);
        self.log
            .write()
            .expect("mock log lock poisoned")
            .push(entry);
    }
}

impl Default for MockLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    fn mode(&self) -> LedgerMode {
        LedgerMode::Mock
    }

    async fn next_sequence(&self) -> Result<u64> {
        self.sequence_fetches.fetch_add(1, Ordering::Relaxed);
        Ok(self.sequence.load(Ordering::Relaxed))
    }

    async fn submit(&self, event: &LedgerEvent, sequence: u64) -> Result<String> {
        let remaining = self.fail_submissions.load(Ordering::Relaxed);
        if remaining > 0 {
            self.fail_submissions.store(remaining - 1, Ordering::Relaxed);
            return Err(GuildError::Ledger("injected submission failure".into()));
        }

        let block = self.block.fetch_add(1, Ordering::Relaxed) + 1;
        self.sequence.store(sequence + 1, Ordering::Relaxed);
        let tx_ref = format!("mock-tx-{}-{}", block, sequence);

        let body = serde_json::to_value(event)
            .map_err(|e| GuildError::Internal(format!("event serialization: {}", e)))?;
        self.log
            .write()
            .expect("mock log lock poisoned")
            .push(RawLogEntry {
                tx_ref: tx_ref.clone(),
                block_number: block,
                sequence,
                timestamp: Utc::now(),
                body,
            });

        Ok(tx_ref)
    }

    async fn transfer_token(
        &self,
        _token_ref: &str,
        to: &AgentId,
        amount: Credits,
        job_id: &JobId,
    ) -> Result<String> {
        let n = self.block.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            to = %to.short(),
            %amount,
            job = %job_id.short(),
            "Mock token transfer (no ledger credentials)"
        );
        Ok(format!("mock-pay-{}", n))
    }

    async fn create_channel(&self) -> Result<String> {
        Ok("mock-channel-0".to_string())
    }

    async fn create_token(&self) -> Result<String> {
        Ok("mock-token-0".to_string())
    }

    async fn latest_block(&self) -> Result<u64> {
        Ok(self.block.load(Ordering::Relaxed))
    }

    async fn query_events(&self, from_block: u64, to_block: u64) -> Result<Vec<RawLogEntry>> {
        self.query_count.fetch_add(1, Ordering::Relaxed);
        let log = self.log.read().expect("mock log lock poisoned");
        Ok(log
            .iter()
            .filter(|e| e.block_number >= from_block && e.block_number <= to_block)
            .cloned()
            .collect())
    }
}
