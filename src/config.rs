//! Configuration for Guildhall
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::time::Duration;

/// Guildhall - marketplace coordinator for autonomous agent guilds
#[derive(Parser, Debug, Clone)]
#[command(name = "guildhall")]
#[command(about = "Coordinates agent jobs, bids and prediction markets with ledger attestation")]
pub struct Args {
    /// Ledger RPC endpoint URL
    #[arg(long, env = "LEDGER_RPC_URL", default_value = "https://testnet.ledger.invalid/rpc")]
    pub ledger_url: String,

    /// Network identifier passed with every ledger call
    #[arg(long, env = "LEDGER_NETWORK_ID", default_value = "testnet")]
    pub network_id: String,

    /// Operator (signing) account identifier
    #[arg(long, env = "OPERATOR_ID")]
    pub operator_id: Option<String>,

    /// Operator signing credential. Absent -> degraded (mock) mode
    #[arg(long, env = "OPERATOR_KEY")]
    pub operator_key: Option<String>,

    /// Deployed attestation contract/program address
    #[arg(long, env = "CONTRACT_ADDRESS")]
    pub contract_address: Option<String>,

    /// Pre-created attestation channel id (skips first-use creation)
    #[arg(long, env = "CHANNEL_ID")]
    pub channel_id: Option<String>,

    /// Pre-created settlement token id (skips first-use creation)
    #[arg(long, env = "TOKEN_ID")]
    pub token_id: Option<String>,

    /// Seconds between scheduler ticks
    #[arg(long, env = "SCHEDULER_INTERVAL_SECS", default_value = "8")]
    pub scheduler_interval_secs: u64,

    /// Seconds an assigned job may sit without a result before the
    /// watchdog reclaims it
    #[arg(long, env = "WATCHDOG_STALENESS_SECS", default_value = "300")]
    pub watchdog_staleness_secs: u64,

    /// Keep at least this many jobs open; the scheduler tops up below it
    #[arg(long, env = "OPEN_JOBS_LOW_WATER", default_value = "3")]
    pub open_jobs_low_water: usize,

    /// Jobs created per top-up batch
    #[arg(long, env = "JOB_BATCH_SIZE", default_value = "2")]
    pub job_batch_size: usize,

    /// How many recent blocks the reconstructor scans
    #[arg(long, env = "LOOKBACK_BLOCKS", default_value = "10000")]
    pub lookback_blocks: u64,

    /// Seconds a reconstructed projection stays cached
    #[arg(long, env = "RECONSTRUCT_CACHE_TTL_SECS", default_value = "8")]
    pub reconstruct_cache_ttl_secs: u64,

    /// Milliseconds between write-queue drains, letting the ledger's
    /// view of the sequence number propagate
    #[arg(long, env = "DRAIN_DELAY_MS", default_value = "300")]
    pub drain_delay_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// True when the ledger write path can actually sign transactions.
    /// Without credentials every component degrades to mock mode.
    pub fn has_credentials(&self) -> bool {
        self.operator_id.is_some() && self.operator_key.is_some()
    }

    pub fn watchdog_staleness(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.watchdog_staleness_secs as i64)
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_secs)
    }

    pub fn reconstruct_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.reconstruct_cache_ttl_secs)
    }

    pub fn drain_delay(&self) -> Duration {
        Duration::from_millis(self.drain_delay_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.operator_key.is_some() && self.operator_id.is_none() {
            return Err("OPERATOR_ID is required when OPERATOR_KEY is set".to_string());
        }

        if self.watchdog_staleness_secs == 0 {
            return Err("WATCHDOG_STALENESS_SECS must be positive".to_string());
        }

        if self.scheduler_interval_secs == 0 {
            return Err("SCHEDULER_INTERVAL_SECS must be positive".to_string());
        }

        if self.lookback_blocks == 0 {
            return Err("LOOKBACK_BLOCKS must be positive".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args::parse_from(["guildhall"])
    }

    #[test]
    fn test_defaults() {
        let args = base_args();
        assert_eq!(args.watchdog_staleness_secs, 300);
        assert_eq!(args.open_jobs_low_water, 3);
        assert_eq!(args.drain_delay_ms, 300);
        assert!(!args.has_credentials());
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_key_without_operator_rejected() {
        let mut args = base_args();
        args.operator_key = Some("302e0201...".to_string());
        assert!(args.validate().is_err());
        args.operator_id = Some("0.0.1001".to_string());
        assert!(args.validate().is_ok());
        assert!(args.has_credentials());
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let mut args = base_args();
        args.watchdog_staleness_secs = 0;
        assert!(args.validate().is_err());

        let mut args = base_args();
        args.lookback_blocks = 0;
        assert!(args.validate().is_err());
    }
}
