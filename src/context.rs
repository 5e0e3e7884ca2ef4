//! Long-lived application context
//!
//! One explicit object owns every shared component (store, ledger
//! handle, write queue, marketplace, reconstructor), constructed once at
//! startup and passed by reference. There are no module-level globals;
//! teardown aborts the background tasks it spawned.

use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Args;
use crate::ledger::{
    ensure_channel, ensure_token, ErrorSink, LedgerClient, LedgerMode, MockLedger, RpcLedger,
    WriteQueue,
};
use crate::orchestrator::scheduler::{spawn_scheduler, SchedulerConfig};
use crate::orchestrator::Marketplace;
use crate::reconstruct::Reconstructor;
use crate::store::{MarketMetrics, ProjectionStore};

/// Snapshot of process health for status reporting
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusReport {
    /// "live" or "mock"
    pub ledger_mode: &'static str,
    pub channel_id: Option<String>,
    pub token_id: Option<String>,
    /// Confirmed attestations over the process lifetime
    pub attestations_confirmed: u64,
    /// Attestations dropped after submission failures
    pub attestations_dropped: u64,
    pub metrics: MarketMetrics,
    pub uptime_seconds: u64,
}

/// Owns all long-lived components and their background tasks
pub struct AppContext {
    pub args: Args,
    pub store: Arc<ProjectionStore>,
    pub ledger: Arc<dyn LedgerClient>,
    pub queue: WriteQueue,
    pub errors: ErrorSink,
    pub marketplace: Arc<Marketplace>,
    pub reconstructor: Arc<Reconstructor>,
    handles: Vec<JoinHandle<()>>,
    started_at: Instant,
}

impl AppContext {
    /// Wire every component. Selects the live RPC ledger when
    /// credentials are configured, the mock otherwise; first-use ledger
    /// resources are ensured here so repeated boots converge.
    pub async fn init(args: Args) -> Self {
        let store = Arc::new(ProjectionStore::new());

        let ledger: Arc<dyn LedgerClient> = if args.has_credentials() {
            info!(url = %args.ledger_url, network = %args.network_id, "Ledger client initialized");
            Arc::new(RpcLedger::new(
                &args.ledger_url,
                &args.network_id,
                args.operator_id.as_deref().unwrap_or_default(),
                args.contract_address.clone(),
            ))
        } else {
            warn!("No ledger credentials found - running in MOCK mode");
            Arc::new(MockLedger::new())
        };

        match ensure_channel(&args, &store, ledger.as_ref()).await {
            Some(id) => info!(channel_id = %id, "Attestation channel ready"),
            None => warn!("Attestation channel unavailable, continuing without"),
        }
        match ensure_token(&args, &store, ledger.as_ref()).await {
            Some(id) => info!(token_id = %id, "Settlement token ready"),
            None => warn!("Settlement token unavailable, continuing without"),
        }

        let (errors, sink_handle) = ErrorSink::spawn();
        let (queue, queue_handle) = WriteQueue::start(
            Arc::clone(&ledger),
            Arc::clone(&store),
            args.drain_delay(),
            errors.clone(),
        );

        let marketplace = Arc::new(Marketplace::new(
            Arc::clone(&store),
            queue.clone(),
            Arc::clone(&ledger),
            args.clone(),
        ));

        let reconstructor = Arc::new(Reconstructor::new(
            Arc::clone(&ledger),
            args.lookback_blocks,
            args.reconstruct_cache_ttl(),
        ));

        Self {
            args,
            store,
            ledger,
            queue,
            errors,
            marketplace,
            reconstructor,
            handles: vec![sink_handle, queue_handle],
            started_at: Instant::now(),
        }
    }

    /// Start the autonomous scheduler loop
    pub fn start_scheduler(&mut self) {
        let config = SchedulerConfig {
            interval: self.args.scheduler_interval(),
            open_jobs_low_water: self.args.open_jobs_low_water,
            batch_size: self.args.job_batch_size,
            staleness: self.args.watchdog_staleness(),
            ..SchedulerConfig::default()
        };
        let handle = spawn_scheduler(Arc::clone(&self.marketplace), config);
        self.handles.push(handle);
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            ledger_mode: match self.ledger.mode() {
                LedgerMode::Live => "live",
                LedgerMode::Mock => "mock",
            },
            channel_id: self.store.config_get("channel_id"),
            token_id: self.store.config_get("token_id"),
            attestations_confirmed: self.queue.submitted_count(),
            attestations_dropped: self.errors.failure_count(),
            metrics: self.store.metrics(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// Abort background tasks. Queued attestations that have not drained
    /// are dropped, consistent with their best-effort contract.
    pub fn shutdown(&self) {
        for handle in &self.handles {
            handle.abort();
        }
        info!("Context shut down ({} background tasks stopped)", self.handles.len());
    }
}
