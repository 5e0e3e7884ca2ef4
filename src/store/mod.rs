//! Local projection store
//!
//! The authoritative low-latency view of marketplace state. Typed
//! in-memory maps keyed by domain id newtypes; every mutation goes
//! through a per-key entry lock, so writes to the same row are
//! serialized while unrelated rows proceed concurrently.
//!
//! The store knows nothing about the ledger. History durability comes
//! from the attestation log; a process that loses this store can rebuild
//! a best-effort view through the reconstructor.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tracing::debug;

use crate::model::{
    Agent, AgentId, BetId, Bid, BidId, ForumPost, ForumReply, Job, JobId, JobStatus, LedgerEvent,
    PostId, Prediction, PredictionBet, PredictionId, RecordedEvent, ReplyId, Transfer, TransferId,
};

/// Count snapshot across the projection, for status reporting
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MarketMetrics {
    pub agents: usize,
    pub jobs: usize,
    pub open_jobs: usize,
    pub bids: usize,
    pub completions: usize,
    pub failures: usize,
    pub transfers: usize,
    pub events: usize,
}

/// In-memory projection of all marketplace entities
pub struct ProjectionStore {
    agents: DashMap<AgentId, Agent>,
    jobs: DashMap<JobId, Job>,

    bids: DashMap<BidId, Bid>,
    /// (job, agent) -> bid; enforces one bid per pair
    bid_index: DashMap<(JobId, AgentId), BidId>,

    predictions: DashMap<PredictionId, Prediction>,
    /// job -> its single active market
    prediction_by_job: DashMap<JobId, PredictionId>,

    bets: DashMap<BetId, PredictionBet>,
    /// (prediction, agent) -> bet; enforces one bet per pair
    bet_index: DashMap<(PredictionId, AgentId), BetId>,

    transfers: DashMap<TransferId, Transfer>,
    /// job -> its single settlement
    transfer_by_job: DashMap<JobId, TransferId>,

    posts: DashMap<PostId, ForumPost>,
    replies: DashMap<ReplyId, ForumReply>,
    /// (post, agent) upvote dedup set
    upvote_index: DashMap<(PostId, AgentId), ()>,

    /// Append-only local attestation feed
    events: RwLock<Vec<RecordedEvent>>,
    event_seq: AtomicU64,

    /// Persisted configuration (channel id, token id, ...)
    config: DashMap<String, String>,
}

impl ProjectionStore {
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
            jobs: DashMap::new(),
            bids: DashMap::new(),
            bid_index: DashMap::new(),
            predictions: DashMap::new(),
            prediction_by_job: DashMap::new(),
            bets: DashMap::new(),
            bet_index: DashMap::new(),
            transfers: DashMap::new(),
            transfer_by_job: DashMap::new(),
            posts: DashMap::new(),
            replies: DashMap::new(),
            upvote_index: DashMap::new(),
            events: RwLock::new(Vec::new()),
            event_seq: AtomicU64::new(0),
            config: DashMap::new(),
        }
    }

    // ========================================================================
    // Agents
    // ========================================================================

    pub fn insert_agent(&self, agent: Agent) {
        self.agents.insert(agent.id.clone(), agent);
    }

    pub fn agent(&self, id: &AgentId) -> Option<Agent> {
        self.agents.get(id).map(|a| a.clone())
    }

    pub fn agent_exists(&self, id: &AgentId) -> bool {
        self.agents.contains_key(id)
    }

    /// Mutate a single agent row under its entry lock
    pub fn with_agent_mut<R>(&self, id: &AgentId, f: impl FnOnce(&mut Agent) -> R) -> Option<R> {
        self.agents.get_mut(id).map(|mut a| f(&mut a))
    }

    /// All agents, highest reputation first
    pub fn agents_by_reputation(&self) -> Vec<Agent> {
        let mut all: Vec<Agent> = self.agents.iter().map(|a| a.clone()).collect();
        all.sort_by(|a, b| b.reputation.cmp(&a.reputation));
        all
    }

    // ========================================================================
    // Jobs
    // ========================================================================

    pub fn insert_job(&self, job: Job) {
        self.jobs.insert(job.id.clone(), job);
    }

    pub fn job(&self, id: &JobId) -> Option<Job> {
        self.jobs.get(id).map(|j| j.clone())
    }

    pub fn with_job_mut<R>(&self, id: &JobId, f: impl FnOnce(&mut Job) -> R) -> Option<R> {
        self.jobs.get_mut(id).map(|mut j| f(&mut j))
    }

    pub fn jobs_with_status(&self, status: JobStatus) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|j| j.status == status)
            .map(|j| j.clone())
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    pub fn open_job_count(&self) -> usize {
        self.jobs.iter().filter(|j| j.status == JobStatus::Open).count()
    }

    /// All jobs, newest first
    pub fn jobs_snapshot(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.iter().map(|j| j.clone()).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    // ========================================================================
    // Bids
    // ========================================================================

    /// Insert a bid, enforcing the one-bid-per-(job, agent) invariant.
    /// Returns false when the pair already has a bid.
    pub fn try_insert_bid(&self, bid: Bid) -> bool {
        use dashmap::mapref::entry::Entry;

        let key = (bid.job_id.clone(), bid.agent_id.clone());
        match self.bid_index.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(bid.id.clone());
                self.bids.insert(bid.id.clone(), bid);
                true
            }
        }
    }

    /// Bids for a job, cheapest first
    pub fn bids_for_job(&self, job_id: &JobId) -> Vec<Bid> {
        let mut bids: Vec<Bid> = self
            .bids
            .iter()
            .filter(|b| &b.job_id == job_id)
            .map(|b| b.clone())
            .collect();
        bids.sort_by(|a, b| a.price.cmp(&b.price));
        bids
    }

    pub fn bid_for(&self, job_id: &JobId, agent_id: &AgentId) -> Option<Bid> {
        let key = (job_id.clone(), agent_id.clone());
        let bid_id = self.bid_index.get(&key)?.clone();
        self.bids.get(&bid_id).map(|b| b.clone())
    }

    pub fn bid_count(&self) -> usize {
        self.bids.len()
    }

    // ========================================================================
    // Predictions
    // ========================================================================

    /// Insert a market, enforcing at most one per job.
    /// Returns false when the job already has one.
    pub fn try_insert_prediction(&self, prediction: Prediction) -> bool {
        use dashmap::mapref::entry::Entry;

        match self.prediction_by_job.entry(prediction.job_id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(prediction.id.clone());
                self.predictions.insert(prediction.id.clone(), prediction);
                true
            }
        }
    }

    pub fn prediction(&self, id: &PredictionId) -> Option<Prediction> {
        self.predictions.get(id).map(|p| p.clone())
    }

    pub fn prediction_for_job(&self, job_id: &JobId) -> Option<Prediction> {
        let id = self.prediction_by_job.get(job_id)?.clone();
        self.prediction(&id)
    }

    pub fn with_prediction_mut<R>(
        &self,
        id: &PredictionId,
        f: impl FnOnce(&mut Prediction) -> R,
    ) -> Option<R> {
        self.predictions.get_mut(id).map(|mut p| f(&mut p))
    }

    pub fn open_predictions(&self) -> Vec<Prediction> {
        self.predictions
            .iter()
            .filter(|p| p.status == crate::model::PredictionStatus::Open)
            .map(|p| p.clone())
            .collect()
    }

    pub fn predictions_snapshot(&self) -> Vec<Prediction> {
        let mut all: Vec<Prediction> = self.predictions.iter().map(|p| p.clone()).collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    // ========================================================================
    // Bets
    // ========================================================================

    /// Insert a bet, enforcing one per (prediction, agent) pair
    pub fn try_insert_bet(&self, bet: PredictionBet) -> bool {
        use dashmap::mapref::entry::Entry;

        let key = (bet.prediction_id.clone(), bet.agent_id.clone());
        match self.bet_index.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(bet.id.clone());
                self.bets.insert(bet.id.clone(), bet);
                true
            }
        }
    }

    pub fn bets_for_prediction(&self, prediction_id: &PredictionId) -> Vec<PredictionBet> {
        self.bets
            .iter()
            .filter(|b| &b.prediction_id == prediction_id)
            .map(|b| b.clone())
            .collect()
    }

    // ========================================================================
    // Transfers
    // ========================================================================

    /// Record a settlement, enforcing at most one per job
    pub fn try_insert_transfer(&self, transfer: Transfer) -> bool {
        use dashmap::mapref::entry::Entry;

        match self.transfer_by_job.entry(transfer.job_id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(transfer.id.clone());
                self.transfers.insert(transfer.id.clone(), transfer);
                true
            }
        }
    }

    pub fn transfer_for_job(&self, job_id: &JobId) -> Option<Transfer> {
        let id = self.transfer_by_job.get(job_id)?.clone();
        self.transfers.get(&id).map(|t| t.clone())
    }

    pub fn transfers_snapshot(&self) -> Vec<Transfer> {
        let mut all: Vec<Transfer> = self.transfers.iter().map(|t| t.clone()).collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    // ========================================================================
    // Forum
    // ========================================================================

    pub fn insert_post(&self, post: ForumPost) {
        self.posts.insert(post.id.clone(), post);
    }

    pub fn post(&self, id: &PostId) -> Option<ForumPost> {
        self.posts.get(id).map(|p| p.clone())
    }

    pub fn post_exists(&self, id: &PostId) -> bool {
        self.posts.contains_key(id)
    }

    pub fn with_post_mut<R>(&self, id: &PostId, f: impl FnOnce(&mut ForumPost) -> R) -> Option<R> {
        self.posts.get_mut(id).map(|mut p| f(&mut p))
    }

    pub fn insert_reply(&self, reply: ForumReply) {
        self.replies.insert(reply.id.clone(), reply);
    }

    /// Record an upvote; false when the agent already upvoted this post
    pub fn try_insert_upvote(&self, post_id: &PostId, agent_id: &AgentId) -> bool {
        use dashmap::mapref::entry::Entry;

        match self.upvote_index.entry((post_id.clone(), agent_id.clone())) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(());
                true
            }
        }
    }

    /// Posts newest first, optionally filtered by tag
    pub fn posts_snapshot(&self, tag: Option<&str>) -> Vec<ForumPost> {
        let mut posts: Vec<ForumPost> = self
            .posts
            .iter()
            .filter(|p| tag.map_or(true, |t| p.tag == t))
            .map(|p| p.clone())
            .collect();
        posts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        posts
    }

    pub fn replies_for_post(&self, post_id: &PostId) -> Vec<ForumReply> {
        let mut replies: Vec<ForumReply> = self
            .replies
            .iter()
            .filter(|r| &r.post_id == post_id)
            .map(|r| r.clone())
            .collect();
        replies.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        replies
    }

    // ========================================================================
    // Attestation feed
    // ========================================================================

    /// Append a confirmed attestation to the local feed
    pub fn record_event(&self, event: LedgerEvent, tx_ref: String, ledger_sequence: u64) -> u64 {
        let local_seq = self.event_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let recorded = RecordedEvent {
            local_seq,
            job_id: event.job_id().cloned(),
            agent_id: event.agent_id().cloned(),
            tx_ref,
            ledger_sequence,
            created_at: Utc::now(),
            event,
        };
        debug!(seq = local_seq, "Recorded attestation");
        self.events
            .write()
            .expect("event feed lock poisoned")
            .push(recorded);
        local_seq
    }

    /// Recent attestations, newest first, optionally filtered by
    /// job and/or agent correlation
    pub fn events_snapshot(
        &self,
        job_id: Option<&JobId>,
        agent_id: Option<&AgentId>,
        limit: usize,
    ) -> Vec<RecordedEvent> {
        let events = self.events.read().expect("event feed lock poisoned");
        events
            .iter()
            .rev()
            .filter(|e| job_id.map_or(true, |j| e.job_id.as_ref() == Some(j)))
            .filter(|e| agent_id.map_or(true, |a| e.agent_id.as_ref() == Some(a)))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn event_count(&self) -> usize {
        self.events.read().expect("event feed lock poisoned").len()
    }

    // ========================================================================
    // Config + metrics
    // ========================================================================

    pub fn config_get(&self, key: &str) -> Option<String> {
        self.config.get(key).map(|v| v.clone())
    }

    pub fn config_set(&self, key: &str, value: &str) {
        self.config.insert(key.to_string(), value.to_string());
    }

    pub fn metrics(&self) -> MarketMetrics {
        let mut completions = 0;
        let mut failures = 0;
        let mut open_jobs = 0;
        for job in self.jobs.iter() {
            match job.status {
                JobStatus::Completed | JobStatus::Settled => completions += 1,
                JobStatus::Failed => failures += 1,
                JobStatus::Open => open_jobs += 1,
                JobStatus::Assigned => {}
            }
        }
        MarketMetrics {
            agents: self.agents.len(),
            jobs: self.jobs.len(),
            open_jobs,
            bids: self.bids.len(),
            completions,
            failures,
            transfers: self.transfers.len(),
            events: self.event_count(),
        }
    }
}

impl Default for ProjectionStore {
    fn default() -> Self {
        Self::new()
    }
}
