//! Event reconstructor
//!
//! Rebuilds the whole marketplace projection from nothing but the
//! ledger's event log: the read path for deployments with no local
//! store, and a trust-verification path everywhere else.
//!
//! One bounded query fetches the recent lookback window; entries are
//! decoded into typed events (unknown or malformed shapes are skipped),
//! sorted chronologically by (block, sequence), and folded through
//! per-entity reducers. The result is cached for a short TTL so bursts
//! of reads don't hammer the ledger.
//!
//! Any I/O failure yields `LedgerUnavailable` rather than a partial
//! projection; callers fall back to a secondary data source.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::ledger::{LedgerClient, RawLogEntry};
use crate::model::{
    Agent, AgentId, AgentStatus, BetId, Bid, ForumPost, Job, JobId, JobStatus, LedgerEvent,
    PostId, Prediction, PredictionBet, PredictionId, PredictionStatus, Transfer, TransferId,
    TransferStatus, STARTING_REPUTATION,
};
use crate::store::MarketMetrics;
use crate::types::{GuildError, Result};
use std::collections::BTreeSet;
use std::collections::HashMap;

/// A full marketplace view derived purely from ledger events
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Projection {
    /// Agents, highest reputation first
    pub agents: Vec<Agent>,
    /// Jobs, newest first
    pub jobs: Vec<Job>,
    /// Bids, cheapest first
    pub bids: Vec<Bid>,
    /// Markets, newest first
    pub predictions: Vec<Prediction>,
    pub bets: Vec<PredictionBet>,
    /// Posts, newest first
    pub posts: Vec<ForumPost>,
    pub transfers: Vec<Transfer>,
    pub metrics: MarketMetrics,
}

/// Cache hit/miss counters
#[derive(Debug, Clone, Default)]
pub struct ReconstructStats {
    pub hits: u64,
    pub misses: u64,
}

struct CacheEntry {
    projection: Arc<Projection>,
    cached_at: Instant,
}

/// Derives projections from the ledger's event log with a bounded
/// lookback window and a short-TTL cache
pub struct Reconstructor {
    ledger: Arc<dyn LedgerClient>,
    lookback_blocks: u64,
    cache_ttl: Duration,
    cache: RwLock<Option<CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Reconstructor {
    pub fn new(ledger: Arc<dyn LedgerClient>, lookback_blocks: u64, cache_ttl: Duration) -> Self {
        Self {
            ledger,
            lookback_blocks,
            cache_ttl,
            cache: RwLock::new(None),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Rebuild (or serve the cached) projection from ledger history
    pub async fn reconstruct(&self) -> Result<Arc<Projection>> {
        if let Some(entry) = &*self.cache.read().await {
            if entry.cached_at.elapsed() < self.cache_ttl {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Reconstruction cache hit");
                return Ok(Arc::clone(&entry.projection));
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let latest = self
            .ledger
            .latest_block()
            .await
            .map_err(|e| GuildError::LedgerUnavailable(e.to_string()))?;
        let from = latest.saturating_sub(self.lookback_blocks);
        let entries = self
            .ledger
            .query_events(from, latest)
            .await
            .map_err(|e| GuildError::LedgerUnavailable(e.to_string()))?;

        let scanned = entries.len();
        let projection = Arc::new(reduce(entries));
        info!(
            from_block = from,
            to_block = latest,
            scanned,
            agents = projection.agents.len(),
            jobs = projection.jobs.len(),
            "Projection reconstructed from ledger"
        );

        *self.cache.write().await = Some(CacheEntry {
            projection: Arc::clone(&projection),
            cached_at: Instant::now(),
        });
        Ok(projection)
    }

    pub fn stats(&self) -> ReconstructStats {
        ReconstructStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Fold raw log entries into a projection.
///
/// Entries that fail typed decoding are skipped. Events are applied in
/// chronological (block, sequence) order; a later-stage event for an
/// entity the window never seeded is ignored, since its creation fell
/// outside the lookback.
fn reduce(entries: Vec<RawLogEntry>) -> Projection {
    let mut events: Vec<(RawLogEntry, LedgerEvent)> = entries
        .into_iter()
        .filter_map(|entry| {
            let event = LedgerEvent::decode(&entry.body)?;
            Some((entry, event))
        })
        .collect();
    events.sort_by_key(|(entry, _)| (entry.block_number, entry.sequence));
    let decoded_count = events.len();

    let mut agents: HashMap<AgentId, Agent> = HashMap::new();
    let mut jobs: HashMap<JobId, Job> = HashMap::new();
    let mut bids: Vec<Bid> = Vec::new();
    let mut predictions: HashMap<PredictionId, Prediction> = HashMap::new();
    let mut bets: Vec<PredictionBet> = Vec::new();
    let mut posts: HashMap<PostId, ForumPost> = HashMap::new();
    let mut transfers: Vec<Transfer> = Vec::new();

    for (entry, event) in events {
        match event {
            LedgerEvent::AgentRegistered {
                agent_id,
                name,
                skills,
            } => {
                let skills: BTreeSet<String> = skills.into_iter().collect();
                agents.insert(
                    agent_id.clone(),
                    Agent {
                        id: agent_id,
                        name,
                        skills,
                        reputation: STARTING_REPUTATION,
                        completions: 0,
                        failures: 0,
                        time_bonuses: 0,
                        last_heartbeat: Some(entry.timestamp),
                        status: AgentStatus::Active,
                        created_at: entry.timestamp,
                    },
                );
            }

            LedgerEvent::AgentHeartbeat { agent_id } => {
                if let Some(agent) = agents.get_mut(&agent_id) {
                    agent.last_heartbeat = Some(entry.timestamp);
                }
            }

            LedgerEvent::ReputationUpdated {
                agent_id,
                reputation,
                ..
            } => {
                if let Some(agent) = agents.get_mut(&agent_id) {
                    agent.reputation = reputation.min(100);
                }
            }

            LedgerEvent::JobCreated {
                job_id,
                title,
                required_skill,
                budget,
                deadline,
            } => {
                jobs.insert(
                    job_id.clone(),
                    Job {
                        id: job_id,
                        description: format!("Autonomous job: {}", title),
                        title,
                        required_skill,
                        budget,
                        currency: "GUILD".to_string(),
                        status: JobStatus::Open,
                        creator: AgentId::from("system"),
                        assigned_agent: None,
                        result_artifact: None,
                        deadline,
                        created_at: entry.timestamp,
                        assigned_at: None,
                        completed_at: None,
                    },
                );
            }

            LedgerEvent::BidPlaced {
                bid_id,
                job_id,
                agent_id,
                price,
                estimated_duration_ms,
            } => {
                bids.push(Bid {
                    id: bid_id,
                    job_id,
                    agent_id,
                    price,
                    currency: "GUILD".to_string(),
                    quote: None,
                    estimated_duration_ms,
                    created_at: entry.timestamp,
                });
            }

            LedgerEvent::JobAssigned {
                job_id, agent_id, ..
            } => {
                if let Some(job) = jobs.get_mut(&job_id) {
                    job.status = JobStatus::Assigned;
                    job.assigned_agent = Some(agent_id);
                    job.assigned_at = Some(entry.timestamp);
                }
            }

            LedgerEvent::JobCompleted {
                job_id,
                agent_id,
                artifact_preview,
            } => {
                if let Some(job) = jobs.get_mut(&job_id) {
                    job.status = JobStatus::Completed;
                    job.result_artifact = Some(artifact_preview);
                    job.completed_at = Some(entry.timestamp);
                }
                if let Some(agent) = agents.get_mut(&agent_id) {
                    agent.completions += 1;
                }
            }

            LedgerEvent::PaymentSettled {
                job_id,
                agent_id,
                amount,
                tx_ref,
            } => {
                if let Some(job) = jobs.get_mut(&job_id) {
                    job.status = JobStatus::Settled;
                }
                transfers.push(Transfer {
                    id: TransferId::from(format!("txfr-{}", entry.tx_ref)),
                    job_id,
                    from_agent: AgentId::from("system"),
                    to_agent: agent_id,
                    amount,
                    token_ref: "GUILD".to_string(),
                    tx_ref,
                    invoice: None,
                    receipt: None,
                    status: TransferStatus::Completed,
                    created_at: entry.timestamp,
                });
            }

            LedgerEvent::PredictionCreated {
                prediction_id,
                job_id,
                target_agent_id,
                question,
                deadline,
            } => {
                predictions.insert(
                    prediction_id.clone(),
                    Prediction {
                        id: prediction_id,
                        job_id,
                        target_agent: target_agent_id,
                        question,
                        deadline,
                        status: PredictionStatus::Open,
                        outcome: None,
                        yes_pool: Default::default(),
                        no_pool: Default::default(),
                        creator: AgentId::from("system"),
                        created_at: entry.timestamp,
                        settled_at: None,
                    },
                );
            }

            LedgerEvent::PredictionBetPlaced {
                prediction_id,
                agent_id,
                position,
                amount,
            } => {
                // Pools are accumulated from bet events, never taken
                // from any single "total" field
                if let Some(prediction) = predictions.get_mut(&prediction_id) {
                    match position {
                        crate::model::Position::Yes => {
                            prediction.yes_pool = prediction.yes_pool.saturating_add(amount)
                        }
                        crate::model::Position::No => {
                            prediction.no_pool = prediction.no_pool.saturating_add(amount)
                        }
                    }
                }
                bets.push(PredictionBet {
                    id: BetId::from(format!("bet-{}", entry.tx_ref)),
                    prediction_id,
                    agent_id,
                    position,
                    amount,
                    created_at: entry.timestamp,
                });
            }

            LedgerEvent::PredictionSettled {
                prediction_id,
                outcome,
                ..
            } => {
                if let Some(prediction) = predictions.get_mut(&prediction_id) {
                    prediction.status = PredictionStatus::Settled;
                    prediction.outcome = Some(outcome);
                    prediction.settled_at = Some(entry.timestamp);
                }
            }

            LedgerEvent::ForumPostCreated {
                post_id,
                agent_id,
                title,
                body,
                tag,
            } => {
                posts.insert(
                    post_id.clone(),
                    ForumPost {
                        id: post_id,
                        agent_id,
                        title,
                        body,
                        tag,
                        upvotes: 0,
                        reply_count: 0,
                        created_at: entry.timestamp,
                    },
                );
            }

            LedgerEvent::ForumReplyCreated { post_id, .. } => {
                if let Some(post) = posts.get_mut(&post_id) {
                    post.reply_count += 1;
                }
            }

            LedgerEvent::ForumUpvoted {
                post_id, new_score, ..
            } => {
                if let Some(post) = posts.get_mut(&post_id) {
                    post.upvotes = new_score;
                }
            }
        }
    }

    // Presentation ordering
    let mut agents: Vec<Agent> = agents.into_values().collect();
    agents.sort_by(|a, b| b.reputation.cmp(&a.reputation).then(a.id.0.cmp(&b.id.0)));

    let mut jobs: Vec<Job> = jobs.into_values().collect();
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.0.cmp(&b.id.0)));

    bids.sort_by(|a, b| a.price.cmp(&b.price).then(a.id.0.cmp(&b.id.0)));

    let mut predictions: Vec<Prediction> = predictions.into_values().collect();
    predictions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.0.cmp(&b.id.0)));

    let mut posts: Vec<ForumPost> = posts.into_values().collect();
    posts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.0.cmp(&b.id.0)));

    transfers.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.0.cmp(&b.id.0)));

    let metrics = MarketMetrics {
        agents: agents.len(),
        jobs: jobs.len(),
        open_jobs: jobs.iter().filter(|j| j.status == JobStatus::Open).count(),
        bids: bids.len(),
        completions: jobs.iter().filter(|j| j.status.is_successful()).count(),
        failures: jobs.iter().filter(|j| j.status == JobStatus::Failed).count(),
        transfers: transfers.len(),
        events: decoded_count,
    };

    Projection {
        agents,
        jobs,
        bids,
        predictions,
        bets,
        posts,
        transfers,
        metrics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MockLedger;
    use crate::model::{BidId, Credits, Position};
    use chrono::Utc;
    use serde_json::json;

    async fn seed_lifecycle(ledger: &MockLedger) {
        let events = vec![
            LedgerEvent::AgentRegistered {
                agent_id: AgentId::from("worker"),
                name: "Worker".into(),
                skills: vec!["summarize".into()],
            },
            LedgerEvent::JobCreated {
                job_id: JobId::from("job-1"),
                title: "Summarize recent trends".into(),
                required_skill: "summarize".into(),
                budget: Credits::from_major(50),
                deadline: Utc::now(),
            },
            LedgerEvent::BidPlaced {
                bid_id: BidId::from("bid-1"),
                job_id: JobId::from("job-1"),
                agent_id: AgentId::from("worker"),
                price: Credits::from_major(45),
                estimated_duration_ms: 60_000,
            },
            LedgerEvent::JobAssigned {
                job_id: JobId::from("job-1"),
                agent_id: AgentId::from("worker"),
                price: Credits::from_major(45),
            },
            LedgerEvent::PredictionCreated {
                prediction_id: crate::model::PredictionId::from("pred-1"),
                job_id: JobId::from("job-1"),
                target_agent_id: AgentId::from("worker"),
                question: "Will worker finish?".into(),
                deadline: Utc::now(),
            },
            LedgerEvent::PredictionBetPlaced {
                prediction_id: crate::model::PredictionId::from("pred-1"),
                agent_id: AgentId::from("bettor"),
                position: Position::Yes,
                amount: Credits::from_major(30),
            },
            LedgerEvent::JobCompleted {
                job_id: JobId::from("job-1"),
                agent_id: AgentId::from("worker"),
                artifact_preview: "done".into(),
            },
            LedgerEvent::ReputationUpdated {
                agent_id: AgentId::from("worker"),
                reputation: 65,
                change: 15,
            },
            LedgerEvent::PaymentSettled {
                job_id: JobId::from("job-1"),
                agent_id: AgentId::from("worker"),
                amount: Credits::from_major(45),
                tx_ref: "tx-pay".into(),
            },
        ];
        for (i, event) in events.into_iter().enumerate() {
            ledger.submit(&event, i as u64).await.unwrap();
        }
    }

    fn reconstructor(ledger: Arc<MockLedger>, ttl: Duration) -> Reconstructor {
        Reconstructor::new(ledger as Arc<dyn LedgerClient>, 10_000, ttl)
    }

    #[tokio::test]
    async fn test_full_lifecycle_reconstruction() {
        let ledger = Arc::new(MockLedger::new());
        seed_lifecycle(&ledger).await;
        let recon = reconstructor(Arc::clone(&ledger), Duration::from_secs(8));

        let projection = recon.reconstruct().await.unwrap();
        assert_eq!(projection.agents.len(), 1);
        let worker = &projection.agents[0];
        assert_eq!(worker.reputation, 65);
        assert_eq!(worker.completions, 1);

        assert_eq!(projection.jobs.len(), 1);
        let job = &projection.jobs[0];
        assert_eq!(job.status, JobStatus::Settled);
        assert_eq!(job.assigned_agent, Some(AgentId::from("worker")));

        assert_eq!(projection.bids.len(), 1);
        assert_eq!(projection.transfers.len(), 1);

        let prediction = &projection.predictions[0];
        assert_eq!(prediction.yes_pool, Credits::from_major(30));
        assert_eq!(prediction.no_pool, Credits::ZERO);

        assert_eq!(projection.metrics.completions, 1);
        assert_eq!(projection.metrics.open_jobs, 0);
    }

    #[tokio::test]
    async fn test_reconstruction_is_idempotent() {
        let ledger = Arc::new(MockLedger::new());
        seed_lifecycle(&ledger).await;
        // Zero TTL forces a fresh replay on each call
        let recon = reconstructor(Arc::clone(&ledger), Duration::ZERO);

        let first = recon.reconstruct().await.unwrap();
        let second = recon.reconstruct().await.unwrap();
        assert_eq!(
            serde_json::to_value(&*first).unwrap(),
            serde_json::to_value(&*second).unwrap()
        );
    }

    #[tokio::test]
    async fn test_malformed_events_are_skipped() {
        let with_noise = Arc::new(MockLedger::new());
        seed_lifecycle(&with_noise).await;
        with_noise.append_raw(RawLogEntry {
            tx_ref: "tx-junk".into(),
            block_number: 999,
            sequence: 999,
            timestamp: Utc::now(),
            body: json!({ "type": "job.exploded", "who": "knows" }),
        });
        with_noise.append_raw(RawLogEntry {
            tx_ref: "tx-junk2".into(),
            block_number: 1000,
            sequence: 1000,
            timestamp: Utc::now(),
            body: json!(null),
        });

        let clean = Arc::new(MockLedger::new());
        seed_lifecycle(&clean).await;

        let noisy = reconstructor(with_noise, Duration::ZERO)
            .reconstruct()
            .await
            .unwrap();
        let baseline = reconstructor(clean, Duration::ZERO)
            .reconstruct()
            .await
            .unwrap();
        assert_eq!(
            serde_json::to_value(&*noisy).unwrap(),
            serde_json::to_value(&*baseline).unwrap()
        );
    }

    #[tokio::test]
    async fn test_events_applied_in_block_order() {
        let ledger = Arc::new(MockLedger::new());
        // Inserted out of order: assignment first, creation second
        ledger.append_raw(RawLogEntry {
            tx_ref: "tx-2".into(),
            block_number: 2,
            sequence: 1,
            timestamp: Utc::now(),
            body: serde_json::to_value(LedgerEvent::JobAssigned {
                job_id: JobId::from("job-1"),
                agent_id: AgentId::from("worker"),
                price: Credits::from_major(45),
            })
            .unwrap(),
        });
        ledger.append_raw(RawLogEntry {
            tx_ref: "tx-1".into(),
            block_number: 1,
            sequence: 0,
            timestamp: Utc::now(),
            body: serde_json::to_value(LedgerEvent::JobCreated {
                job_id: JobId::from("job-1"),
                title: "T".into(),
                required_skill: "s".into(),
                budget: Credits::from_major(50),
                deadline: Utc::now(),
            })
            .unwrap(),
        });

        let projection = reconstructor(ledger, Duration::ZERO)
            .reconstruct()
            .await
            .unwrap();
        assert_eq!(projection.jobs.len(), 1);
        assert_eq!(projection.jobs[0].status, JobStatus::Assigned);
    }

    #[tokio::test]
    async fn test_unseeded_entities_are_ignored() {
        let ledger = Arc::new(MockLedger::new());
        // Completion for a job whose creation fell outside the window
        ledger
            .submit(
                &LedgerEvent::JobCompleted {
                    job_id: JobId::from("ancient-job"),
                    agent_id: AgentId::from("ghost"),
                    artifact_preview: "done".into(),
                },
                0,
            )
            .await
            .unwrap();

        let projection = reconstructor(ledger, Duration::ZERO)
            .reconstruct()
            .await
            .unwrap();
        assert!(projection.jobs.is_empty());
        assert!(projection.agents.is_empty());
    }

    #[tokio::test]
    async fn test_cache_absorbs_repeated_reads() {
        let ledger = Arc::new(MockLedger::new());
        seed_lifecycle(&ledger).await;
        let recon = reconstructor(Arc::clone(&ledger), Duration::from_secs(30));

        recon.reconstruct().await.unwrap();
        recon.reconstruct().await.unwrap();
        recon.reconstruct().await.unwrap();

        assert_eq!(ledger.query_count(), 1);
        let stats = recon.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
    }
}
