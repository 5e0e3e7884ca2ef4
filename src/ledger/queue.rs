//! Ledger write queue
//!
//! Serializes every outbound attestation against the ledger's per-signer
//! sequence number. `enqueue` appends to an in-process FIFO and returns
//! immediately; a single drain task submits strictly one transaction at
//! a time, because concurrent submission under one signing identity
//! collides on the sequence number.
//!
//! A failed submission may or may not have consumed its number, so the
//! cached sequence is reset to `Unknown` and re-fetched before the next
//! submission. Failed items are dropped, not requeued: attestation is
//! best-effort and never on the local-correctness path. Failures are
//! routed to a supervised error sink instead of being swallowed.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::client::LedgerClient;
use crate::config::Args;
use crate::model::LedgerEvent;
use crate::store::ProjectionStore;
use crate::types::Result;

/// Bounded retries for one-shot setup calls
const MAX_SETUP_RETRIES: u32 = 2;

/// Base delay between setup retries; grows linearly per attempt
const RETRY_BASE_DELAY: Duration = Duration::from_millis(1500);

/// Capacity of the failure-report channel
const ERROR_SINK_CAPACITY: usize = 64;

/// Cached per-signer sequence number. `Unknown` forces a fresh fetch
/// before the next submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SequenceState {
    Unknown,
    Cached(u64),
}

/// A dropped attestation, reported to the supervised sink
#[derive(Debug)]
pub struct AttestationFailure {
    pub kind: &'static str,
    pub error: String,
}

/// Supervised failure channel. Reports never block the drain loop: when
/// the sink is saturated the failure is logged directly instead.
#[derive(Clone)]
pub struct ErrorSink {
    tx: mpsc::Sender<AttestationFailure>,
    count: Arc<AtomicU64>,
}

impl ErrorSink {
    /// Spawn the sink drain task and return the reporting handle
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<AttestationFailure>(ERROR_SINK_CAPACITY);
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);

        let handle = tokio::spawn(async move {
            while let Some(failure) = rx.recv().await {
                counter.fetch_add(1, Ordering::Relaxed);
                warn!(
                    kind = failure.kind,
                    error = %failure.error,
                    "Attestation dropped"
                );
            }
        });

        (Self { tx, count }, handle)
    }

    pub fn report(&self, kind: &'static str, error: String) {
        if let Err(e) = self.tx.try_send(AttestationFailure { kind, error }) {
            // Sink saturated or gone; the report still lands in the log
            warn!(kind, "Attestation dropped (error sink unavailable: {})", e);
            self.count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Lifetime count of reported failures
    pub fn failure_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Handle for enqueueing attestations. Cloneable; all clones feed the
/// same drain task.
#[derive(Clone)]
pub struct WriteQueue {
    tx: mpsc::UnboundedSender<LedgerEvent>,
    submitted: Arc<AtomicU64>,
    errors: ErrorSink,
}

impl WriteQueue {
    /// Start the drain task and return the queue handle
    pub fn start(
        ledger: Arc<dyn LedgerClient>,
        store: Arc<ProjectionStore>,
        drain_delay: Duration,
        errors: ErrorSink,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let submitted = Arc::new(AtomicU64::new(0));

        let handle = tokio::spawn(drain_loop(
            rx,
            ledger,
            store,
            drain_delay,
            Arc::clone(&submitted),
            errors.clone(),
        ));

        info!("Ledger write queue started");
        (
            Self {
                tx,
                submitted,
                errors,
            },
            handle,
        )
    }

    /// Append an attestation to the FIFO. Returns immediately; the
    /// caller never observes ledger latency or failure here.
    pub fn enqueue(&self, event: LedgerEvent) {
        let kind = event.kind();
        if self.tx.send(event).is_err() {
            // Drain task gone; only possible during shutdown
            self.errors.report(kind, "write queue closed".to_string());
        }
    }

    /// Lifetime count of confirmed submissions
    pub fn submitted_count(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }
}

/// Single consumer of the FIFO. Never more than one submission in
/// flight system-wide.
async fn drain_loop(
    mut rx: mpsc::UnboundedReceiver<LedgerEvent>,
    ledger: Arc<dyn LedgerClient>,
    store: Arc<ProjectionStore>,
    drain_delay: Duration,
    submitted: Arc<AtomicU64>,
    errors: ErrorSink,
) {
    let mut sequence = SequenceState::Unknown;

    while let Some(event) = rx.recv().await {
        let kind = event.kind();

        let seq = match sequence {
            SequenceState::Cached(n) => n,
            SequenceState::Unknown => match ledger.next_sequence().await {
                Ok(n) => {
                    debug!(sequence = n, "Fetched fresh sequence number");
                    n
                }
                Err(e) => {
                    errors.report(kind, format!("sequence fetch failed: {}", e));
                    continue;
                }
            },
        };

        // Reserve the number before submitting
        sequence = SequenceState::Cached(seq + 1);

        match ledger.submit(&event, seq).await {
            Ok(tx_ref) => {
                // Record before bumping the counter: observers treat the
                // counter as "confirmed AND recorded"
                store.record_event(event, tx_ref.clone(), seq);
                let total = submitted.fetch_add(1, Ordering::Relaxed) + 1;
                info!(
                    kind,
                    sequence = seq,
                    tx_ref = %tx_ref,
                    total,
                    "Attestation confirmed"
                );
            }
            Err(e) => {
                // The failed submission may or may not have consumed the
                // number; force a fresh fetch and drop the item.
                sequence = SequenceState::Unknown;
                errors.report(kind, e.to_string());
            }
        }

        // Let the ledger's view of the sequence number propagate
        tokio::time::sleep(drain_delay).await;
    }

    debug!("Write queue drain loop stopped");
}

/// Bounded retry with linearly increasing backoff for one-shot setup
/// calls. Exhausted retries return `None` so callers degrade instead of
/// propagating an error.
pub async fn with_retry<T, F, Fut>(
    label: &str,
    attempts: u32,
    base_delay: Duration,
    f: F,
) -> Option<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for attempt in 0..=attempts {
        match f().await {
            Ok(value) => return Some(value),
            Err(e) => {
                if attempt < attempts {
                    warn!(
                        label,
                        attempt = attempt + 1,
                        error = %e,
                        "Setup call failed, retrying"
                    );
                    tokio::time::sleep(base_delay * (attempt + 1)).await;
                } else {
                    warn!(
                        label,
                        attempts = attempts + 1,
                        error = %e,
                        "Setup call failed after all retries"
                    );
                }
            }
        }
    }
    None
}

/// Idempotent first-use creation of the attestation channel:
/// env override, then persisted config, then create-and-persist.
pub async fn ensure_channel(
    args: &Args,
    store: &ProjectionStore,
    ledger: &dyn LedgerClient,
) -> Option<String> {
    if let Some(id) = &args.channel_id {
        store.config_set("channel_id", id);
        return Some(id.clone());
    }

    if let Some(id) = store.config_get("channel_id") {
        return Some(id);
    }

    let created = with_retry("channel.create", MAX_SETUP_RETRIES, RETRY_BASE_DELAY, || {
        ledger.create_channel()
    })
    .await?;

    store.config_set("channel_id", &created);
    info!(channel_id = %created, "Created attestation channel");
    Some(created)
}

/// Idempotent first-use creation of the settlement token, same
/// resolution order as the channel.
pub async fn ensure_token(
    args: &Args,
    store: &ProjectionStore,
    ledger: &dyn LedgerClient,
) -> Option<String> {
    if let Some(id) = &args.token_id {
        store.config_set("token_id", id);
        return Some(id.clone());
    }

    if let Some(id) = store.config_get("token_id") {
        return Some(id);
    }

    let created = with_retry("token.create", MAX_SETUP_RETRIES, RETRY_BASE_DELAY, || {
        ledger.create_token()
    })
    .await?;

    store.config_set("token_id", &created);
    info!(token_id = %created, "Created settlement token");
    Some(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::client::MockLedger;
    use crate::model::AgentId;
    use crate::types::GuildError;
    use clap::Parser;
    use std::sync::atomic::AtomicU32;

    fn heartbeat(agent: &str) -> LedgerEvent {
        LedgerEvent::AgentHeartbeat {
            agent_id: AgentId::from(agent),
        }
    }

    async fn drain_until(queue: &WriteQueue, expected: u64) {
        for _ in 0..200 {
            if queue.submitted_count() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "queue never reached {} submissions (got {})",
            expected,
            queue.submitted_count()
        );
    }

    #[tokio::test]
    async fn test_drain_submits_in_order_and_records() {
        let ledger = Arc::new(MockLedger::new());
        let store = Arc::new(ProjectionStore::new());
        let (errors, _sink) = ErrorSink::spawn();
        let (queue, _handle) = WriteQueue::start(
            Arc::clone(&ledger) as Arc<dyn LedgerClient>,
            Arc::clone(&store),
            Duration::from_millis(1),
            errors,
        );

        queue.enqueue(heartbeat("a1"));
        queue.enqueue(heartbeat("a2"));
        queue.enqueue(heartbeat("a3"));
        drain_until(&queue, 3).await;

        assert_eq!(store.event_count(), 3);
        // One fresh fetch; the cache covered the rest
        assert_eq!(ledger.sequence_fetch_count(), 1);
        assert_eq!(ledger.log_len(), 3);
    }

    #[tokio::test]
    async fn test_failure_resets_sequence_cache() {
        let ledger = Arc::new(MockLedger::new());
        let store = Arc::new(ProjectionStore::new());
        let (errors, _sink) = ErrorSink::spawn();
        let (queue, _handle) = WriteQueue::start(
            Arc::clone(&ledger) as Arc<dyn LedgerClient>,
            Arc::clone(&store),
            Duration::from_millis(1),
            errors.clone(),
        );

        ledger.fail_next_submissions(1);
        queue.enqueue(heartbeat("a1")); // dropped
        queue.enqueue(heartbeat("a2")); // lands
        drain_until(&queue, 1).await;

        assert_eq!(queue.submitted_count(), 1);
        // Initial fetch + re-fetch after the failure
        assert_eq!(ledger.sequence_fetch_count(), 2);
        assert_eq!(store.event_count(), 1);

        // The dropped item was reported, not retried (the sink task
        // counts asynchronously)
        for _ in 0..200 {
            if errors.failure_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(errors.failure_count(), 1);
    }

    #[tokio::test]
    async fn test_with_retry_returns_absence_after_exhaustion() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Option<u64> = with_retry("always-fails", 2, Duration::from_millis(1), || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::Relaxed);
                Err(GuildError::Ledger("rpc timeout".into()))
            }
        })
        .await;

        assert!(result.is_none());
        assert_eq!(calls.load(Ordering::Relaxed), 3); // initial + 2 retries
    }

    #[tokio::test]
    async fn test_with_retry_stops_on_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = with_retry("flaky", 2, Duration::from_millis(1), || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::Relaxed) == 0 {
                    Err(GuildError::Ledger("rpc timeout".into()))
                } else {
                    Ok(42u64)
                }
            }
        })
        .await;

        assert_eq!(result, Some(42));
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_ensure_token_converges() {
        let args = Args::parse_from(["guildhall"]);
        let store = ProjectionStore::new();
        let ledger = MockLedger::new();

        let first = ensure_token(&args, &store, &ledger).await.unwrap();
        let second = ensure_token(&args, &store, &ledger).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.config_get("token_id").as_deref(), Some(first.as_str()));
    }

    #[tokio::test]
    async fn test_ensure_channel_env_override_wins() {
        let mut args = Args::parse_from(["guildhall"]);
        args.channel_id = Some("0.0.7777".to_string());
        let store = ProjectionStore::new();
        let ledger = MockLedger::new();

        let id = ensure_channel(&args, &store, &ledger).await.unwrap();
        assert_eq!(id, "0.0.7777");
        assert_eq!(store.config_get("channel_id").as_deref(), Some("0.0.7777"));
    }
}
