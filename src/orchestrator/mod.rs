//! Lifecycle orchestrator
//!
//! The marketplace state machine. Every operation mutates the local
//! projection synchronously (read-your-writes), then enqueues the
//! matching attestation on the write queue. The caller never waits on
//! the ledger; illegal transitions come back as typed errors.
//!
//! Job state machine:
//!
//! ```text
//!   open ──assign──► assigned ──result──► completed ──settle──► settled
//!     ▲                  │
//!     └────watchdog──────┘
//! ```
//!
//! A prediction market rides along 1:1 with each assignment and settles
//! when its job reaches a terminal state.

pub mod scheduler;

use chrono::{Duration, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::commerce::{self, InvoiceParams, Quote, ReceiptParams};
use crate::config::Args;
use crate::ledger::{ensure_token, with_retry, LedgerClient, WriteQueue};
use crate::model::{
    Agent, AgentId, AgentStatus, BetId, Bid, BidId, Credits, ForumPost, ForumReply, Job, JobId,
    JobStatus, LedgerEvent, Payout, Position, PostId, Prediction, PredictionBet, PredictionId,
    PredictionStatus, ReplyId, Transfer, TransferId, TransferStatus, COMPLETION_REPUTATION_GAIN,
    DEADLINE_BONUS, PREDICTION_REPUTATION_GAIN,
};
use crate::store::ProjectionStore;
use crate::types::{GuildError, Result};

/// Default job lifetime when a creator supplies no deadline
const DEFAULT_JOB_DEADLINE_SECS: i64 = 600;

/// Default stake when a bettor supplies no amount
const DEFAULT_BET_STAKE: Credits = Credits(1000);

/// Registration request
#[derive(Debug, Clone, Default)]
pub struct RegisterAgent {
    /// Caller-supplied identity; generated when absent
    pub id: Option<AgentId>,
    pub name: Option<String>,
    pub skills: Vec<String>,
}

/// Whether a registration created or refreshed the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered(AgentId),
    Refreshed(AgentId),
}

impl RegisterOutcome {
    pub fn agent_id(&self) -> &AgentId {
        match self {
            RegisterOutcome::Registered(id) | RegisterOutcome::Refreshed(id) => id,
        }
    }
}

/// Job creation request
#[derive(Debug, Clone)]
pub struct CreateJob {
    pub title: String,
    pub description: String,
    pub required_skill: String,
    pub budget: Credits,
    pub currency: Option<String>,
    pub creator: Option<AgentId>,
    pub deadline: Option<chrono::DateTime<Utc>>,
}

/// Bid placement request
#[derive(Debug, Clone)]
pub struct PlaceBid {
    pub job_id: JobId,
    pub agent_id: AgentId,
    pub price: Credits,
    pub currency: Option<String>,
    pub quote: Option<Quote>,
    pub estimated_duration_ms: Option<u64>,
}

/// Result of an assignment decision
#[derive(Debug, Clone)]
pub struct Assignment {
    pub job_id: JobId,
    pub agent_id: AgentId,
    pub price: Credits,
}

/// The marketplace state machine over the local projection
pub struct Marketplace {
    store: Arc<ProjectionStore>,
    queue: WriteQueue,
    ledger: Arc<dyn LedgerClient>,
    args: Args,
}

impl Marketplace {
    pub fn new(
        store: Arc<ProjectionStore>,
        queue: WriteQueue,
        ledger: Arc<dyn LedgerClient>,
        args: Args,
    ) -> Self {
        Self {
            store,
            queue,
            ledger,
            args,
        }
    }

    pub fn store(&self) -> &ProjectionStore {
        &self.store
    }

    // ========================================================================
    // Agents
    // ========================================================================

    /// Register an agent. Idempotent: re-registration refreshes status,
    /// heartbeat and skills on the existing row, never duplicates it.
    pub fn register_agent(&self, req: RegisterAgent) -> RegisterOutcome {
        let agent_id = req.id.unwrap_or_default();
        let skills: BTreeSet<String> = req.skills.into_iter().collect();

        if self.store.agent_exists(&agent_id) {
            self.store.with_agent_mut(&agent_id, |agent| {
                agent.status = AgentStatus::Active;
                agent.last_heartbeat = Some(Utc::now());
                agent.skills = skills.clone();
            });
            debug!(agent = %agent_id.short(), "Agent re-registered");
            return RegisterOutcome::Refreshed(agent_id);
        }

        let name = req.name.unwrap_or_else(|| format!("Agent-{}", agent_id.short()));
        let agent = Agent::new(agent_id.clone(), name.clone(), skills.clone());
        self.store.insert_agent(agent);

        self.queue.enqueue(LedgerEvent::AgentRegistered {
            agent_id: agent_id.clone(),
            name,
            skills: skills.into_iter().collect(),
        });

        info!(agent = %agent_id.short(), "Agent registered");
        RegisterOutcome::Registered(agent_id)
    }

    /// Refresh an agent's liveness timestamp
    pub fn heartbeat(&self, agent_id: &AgentId) -> Result<()> {
        self.store
            .with_agent_mut(agent_id, |agent| {
                agent.last_heartbeat = Some(Utc::now());
                agent.status = AgentStatus::Active;
            })
            .ok_or_else(|| GuildError::AgentNotFound(agent_id.clone()))?;

        self.queue.enqueue(LedgerEvent::AgentHeartbeat {
            agent_id: agent_id.clone(),
        });
        Ok(())
    }

    // ========================================================================
    // Jobs
    // ========================================================================

    pub fn create_job(&self, req: CreateJob) -> Job {
        let job = Job {
            id: JobId::new(),
            title: req.title,
            description: req.description,
            required_skill: req.required_skill,
            budget: req.budget,
            currency: req.currency.unwrap_or_else(|| "GUILD".to_string()),
            status: JobStatus::Open,
            creator: req.creator.unwrap_or_else(|| AgentId::from("system")),
            assigned_agent: None,
            result_artifact: None,
            deadline: req
                .deadline
                .unwrap_or_else(|| Utc::now() + Duration::seconds(DEFAULT_JOB_DEADLINE_SECS)),
            created_at: Utc::now(),
            assigned_at: None,
            completed_at: None,
        };

        self.store.insert_job(job.clone());
        self.queue.enqueue(LedgerEvent::JobCreated {
            job_id: job.id.clone(),
            title: job.title.clone(),
            required_skill: job.required_skill.clone(),
            budget: job.budget,
            deadline: job.deadline,
        });

        info!(job = %job.id.short(), title = %job.title, "Job created");
        job
    }

    // ========================================================================
    // Bids
    // ========================================================================

    pub fn place_bid(&self, req: PlaceBid) -> Result<Bid> {
        if let Some(ref quote) = req.quote {
            commerce::validate_quote(quote)?;
        }

        let job = self
            .store
            .job(&req.job_id)
            .ok_or_else(|| GuildError::JobNotFound(req.job_id.clone()))?;
        if job.status != JobStatus::Open {
            return Err(GuildError::InvalidJobState {
                job: req.job_id,
                expected: "open",
            });
        }

        let bid = Bid {
            id: BidId::new(),
            job_id: req.job_id.clone(),
            agent_id: req.agent_id.clone(),
            price: req.price,
            currency: req.currency.unwrap_or_else(|| "GUILD".to_string()),
            quote: req.quote,
            estimated_duration_ms: req.estimated_duration_ms.unwrap_or(60_000),
            created_at: Utc::now(),
        };

        if !self.store.try_insert_bid(bid.clone()) {
            return Err(GuildError::AlreadyBid {
                job: req.job_id,
                agent: req.agent_id,
            });
        }

        self.queue.enqueue(LedgerEvent::BidPlaced {
            bid_id: bid.id.clone(),
            job_id: bid.job_id.clone(),
            agent_id: bid.agent_id.clone(),
            price: bid.price,
            estimated_duration_ms: bid.estimated_duration_ms,
        });

        debug!(job = %bid.job_id.short(), agent = %bid.agent_id.short(), price = %bid.price, "Bid placed");
        Ok(bid)
    }

    // ========================================================================
    // Assignment
    // ========================================================================

    /// Pick the winning bid for an open job and assign it.
    ///
    /// Winner rule: lowest price, ties broken by higher agent
    /// reputation. Requires at least one bid.
    pub fn assign_job(&self, job_id: &JobId) -> Result<Assignment> {
        let job = self
            .store
            .job(job_id)
            .ok_or_else(|| GuildError::JobNotFound(job_id.clone()))?;
        if job.status != JobStatus::Open {
            return Err(GuildError::InvalidJobState {
                job: job_id.clone(),
                expected: "open",
            });
        }

        let mut candidates: Vec<(Bid, u8)> = self
            .store
            .bids_for_job(job_id)
            .into_iter()
            .map(|bid| {
                let reputation = self
                    .store
                    .agent(&bid.agent_id)
                    .map(|a| a.reputation)
                    .unwrap_or(0);
                (bid, reputation)
            })
            .collect();
        candidates.sort_by(|(a, rep_a), (b, rep_b)| a.price.cmp(&b.price).then(rep_b.cmp(rep_a)));

        let (winner, _) = candidates
            .into_iter()
            .next()
            .ok_or_else(|| GuildError::NoBids(job_id.clone()))?;

        self.store
            .with_job_mut(job_id, |job| {
                if job.status != JobStatus::Open {
                    return Err(GuildError::InvalidJobState {
                        job: job.id.clone(),
                        expected: "open",
                    });
                }
                job.status = JobStatus::Assigned;
                job.assigned_agent = Some(winner.agent_id.clone());
                job.assigned_at = Some(Utc::now());
                Ok(())
            })
            .ok_or_else(|| GuildError::JobNotFound(job_id.clone()))??;

        self.queue.enqueue(LedgerEvent::JobAssigned {
            job_id: job_id.clone(),
            agent_id: winner.agent_id.clone(),
            price: winner.price,
        });

        info!(
            job = %job_id.short(),
            agent = %winner.agent_id.short(),
            price = %winner.price,
            "Job assigned"
        );
        Ok(Assignment {
            job_id: job_id.clone(),
            agent_id: winner.agent_id,
            price: winner.price,
        })
    }

    // ========================================================================
    // Completion
    // ========================================================================

    /// Accept a result for an assigned job. Only the assigned agent may
    /// submit; completion grants the flat reputation gain plus the
    /// deadline-beat bonus, clamped to 100.
    pub fn submit_result(
        &self,
        job_id: &JobId,
        agent_id: &AgentId,
        artifact: Option<String>,
    ) -> Result<()> {
        let job = self
            .store
            .job(job_id)
            .ok_or_else(|| GuildError::JobNotFound(job_id.clone()))?;
        if job.status != JobStatus::Assigned {
            return Err(GuildError::InvalidJobState {
                job: job_id.clone(),
                expected: "assigned",
            });
        }
        if job.assigned_agent.as_ref() != Some(agent_id) {
            return Err(GuildError::NotAssignedAgent {
                job: job_id.clone(),
                agent: agent_id.clone(),
            });
        }

        let artifact = artifact.unwrap_or_else(|| "Task completed".to_string());
        let completed_at = Utc::now();
        let beat_deadline = completed_at < job.deadline;

        self.store.with_job_mut(job_id, |job| {
            job.status = JobStatus::Completed;
            job.result_artifact = Some(artifact.clone());
            job.completed_at = Some(completed_at);
        });

        let bonus = if beat_deadline { DEADLINE_BONUS } else { 0 };
        let change = COMPLETION_REPUTATION_GAIN + bonus;
        let new_reputation = self
            .store
            .with_agent_mut(agent_id, |agent| {
                agent.completions += 1;
                if beat_deadline {
                    agent.time_bonuses += 1;
                }
                agent.apply_reputation(change);
                agent.reputation
            })
            .unwrap_or(0);

        let preview: String = artifact.chars().take(200).collect();
        self.queue.enqueue(LedgerEvent::JobCompleted {
            job_id: job_id.clone(),
            agent_id: agent_id.clone(),
            artifact_preview: preview,
        });
        self.queue.enqueue(LedgerEvent::ReputationUpdated {
            agent_id: agent_id.clone(),
            reputation: new_reputation,
            change,
        });

        info!(
            job = %job_id.short(),
            agent = %agent_id.short(),
            beat_deadline,
            reputation = new_reputation,
            "Job completed"
        );
        Ok(())
    }

    // ========================================================================
    // Settlement
    // ========================================================================

    /// Pay out a completed job. Idempotent: a job that already carries a
    /// settlement record is simply marked settled again and returned.
    ///
    /// Payment amount comes from the winning bid, falling back to the
    /// job budget when no bid is found.
    pub async fn settle_job(&self, job_id: &JobId) -> Result<Transfer> {
        let job = self
            .store
            .job(job_id)
            .ok_or_else(|| GuildError::JobNotFound(job_id.clone()))?;

        if let Some(existing) = self.store.transfer_for_job(job_id) {
            self.store.with_job_mut(job_id, |job| {
                job.status = JobStatus::Settled;
            });
            debug!(job = %job_id.short(), "Settlement already recorded");
            return Ok(existing);
        }

        if job.status != JobStatus::Completed {
            return Err(GuildError::InvalidJobState {
                job: job_id.clone(),
                expected: "completed",
            });
        }

        let payee = job.assigned_agent.clone().ok_or_else(|| {
            GuildError::Internal(format!("completed job {} has no assignee", job_id))
        })?;
        let amount = self
            .store
            .bid_for(job_id, &payee)
            .map(|bid| bid.price)
            .unwrap_or(job.budget);

        let invoice = commerce::build_invoice(InvoiceParams {
            job_id: job_id.clone(),
            buyer_agent_id: job.creator.clone(),
            seller_agent_id: payee.clone(),
            price: amount,
            currency: job.currency.clone(),
            description: job.title.clone(),
        });

        let token_ref = ensure_token(&self.args, &self.store, self.ledger.as_ref())
            .await
            .unwrap_or_else(|| "token-unavailable".to_string());

        // Transfer through the ledger handle; degrade to a synthetic
        // reference so settlement never fails the local path.
        let tx_ref = with_retry(
            "token.transfer",
            2,
            std::time::Duration::from_millis(1500),
            || self.ledger.transfer_token(&token_ref, &payee, amount, job_id),
        )
        .await
        .unwrap_or_else(|| format!("mock-pay-{}", TransferId::new().short()));

        let receipt = commerce::build_receipt(ReceiptParams {
            job_id: job_id.clone(),
            buyer_agent_id: job.creator.clone(),
            seller_agent_id: payee.clone(),
            price: amount,
            currency: job.currency.clone(),
            invoice_id: invoice.message_id.clone(),
            payment_tx_ref: tx_ref.clone(),
            // Fire-and-forget attestation: the sequence is not known at
            // receipt time
            ledger_sequence: 0,
        });

        let transfer = Transfer {
            id: TransferId::new(),
            job_id: job_id.clone(),
            from_agent: job.creator.clone(),
            to_agent: payee.clone(),
            amount,
            token_ref,
            tx_ref: tx_ref.clone(),
            invoice: Some(invoice),
            receipt: Some(receipt),
            status: TransferStatus::Completed,
            created_at: Utc::now(),
        };

        if !self.store.try_insert_transfer(transfer.clone()) {
            // Lost a race to another settle call; the existing record wins
            let existing = self
                .store
                .transfer_for_job(job_id)
                .ok_or_else(|| GuildError::Internal("settlement record vanished".into()))?;
            self.store.with_job_mut(job_id, |job| {
                job.status = JobStatus::Settled;
            });
            return Ok(existing);
        }

        self.store.with_job_mut(job_id, |job| {
            job.status = JobStatus::Settled;
        });

        self.queue.enqueue(LedgerEvent::PaymentSettled {
            job_id: job_id.clone(),
            agent_id: payee.clone(),
            amount,
            tx_ref,
        });

        info!(
            job = %job_id.short(),
            agent = %payee.short(),
            %amount,
            "Job settled"
        );
        Ok(transfer)
    }

    // ========================================================================
    // Watchdog
    // ========================================================================

    /// Reclaim jobs stuck in `assigned` past the staleness window:
    /// assignment cleared, status reverted to `open`.
    pub fn reclaim_stale_jobs(&self, staleness: Duration) -> Vec<JobId> {
        let cutoff = Utc::now() - staleness;
        let mut reclaimed = Vec::new();

        for job in self.store.jobs_with_status(JobStatus::Assigned) {
            let stale = job.assigned_at.map_or(true, |at| at < cutoff);
            if !stale {
                continue;
            }
            self.store.with_job_mut(&job.id, |job| {
                job.status = JobStatus::Open;
                job.assigned_agent = None;
                job.assigned_at = None;
            });
            info!(job = %job.id.short(), "Watchdog reclaimed stuck job");
            reclaimed.push(job.id);
        }
        reclaimed
    }

    // ========================================================================
    // Prediction markets
    // ========================================================================

    /// Create the prediction market for an assigned job, if it does not
    /// already have one.
    pub fn ensure_prediction(&self, job_id: &JobId) -> Result<Option<Prediction>> {
        let job = self
            .store
            .job(job_id)
            .ok_or_else(|| GuildError::JobNotFound(job_id.clone()))?;
        let Some(target) = job.assigned_agent.clone() else {
            return Ok(None);
        };
        if self.store.prediction_for_job(job_id).is_some() {
            return Ok(None);
        }

        let prediction = Prediction {
            id: PredictionId::new(),
            job_id: job_id.clone(),
            target_agent: target.clone(),
            question: format!(
                "Will {} complete \"{}\" before deadline?",
                target.short(),
                job.title
            ),
            deadline: job.deadline,
            status: PredictionStatus::Open,
            outcome: None,
            yes_pool: Credits::ZERO,
            no_pool: Credits::ZERO,
            creator: AgentId::from("system"),
            created_at: Utc::now(),
            settled_at: None,
        };

        if !self.store.try_insert_prediction(prediction.clone()) {
            return Ok(None);
        }

        self.queue.enqueue(LedgerEvent::PredictionCreated {
            prediction_id: prediction.id.clone(),
            job_id: job_id.clone(),
            target_agent_id: target,
            question: prediction.question.clone(),
            deadline: prediction.deadline,
        });

        info!(prediction = %prediction.id, question = %prediction.question, "Prediction market created");
        Ok(Some(prediction))
    }

    /// Stake on one side of an open market. One bet per (market, agent).
    pub fn place_bet(
        &self,
        prediction_id: &PredictionId,
        agent_id: &AgentId,
        position: Position,
        amount: Option<Credits>,
    ) -> Result<PredictionBet> {
        let prediction = self
            .store
            .prediction(prediction_id)
            .ok_or_else(|| GuildError::PredictionNotFound(prediction_id.clone()))?;
        if prediction.status != PredictionStatus::Open {
            return Err(GuildError::PredictionClosed(prediction_id.clone()));
        }

        let amount = amount.unwrap_or(DEFAULT_BET_STAKE);
        let bet = PredictionBet {
            id: BetId::new(),
            prediction_id: prediction_id.clone(),
            agent_id: agent_id.clone(),
            position,
            amount,
            created_at: Utc::now(),
        };

        if !self.store.try_insert_bet(bet.clone()) {
            return Err(GuildError::DuplicateBet {
                prediction: prediction_id.clone(),
                agent: agent_id.clone(),
            });
        }

        self.store
            .with_prediction_mut(prediction_id, |p| match position {
                Position::Yes => p.yes_pool = p.yes_pool.saturating_add(amount),
                Position::No => p.no_pool = p.no_pool.saturating_add(amount),
            });

        self.queue.enqueue(LedgerEvent::PredictionBetPlaced {
            prediction_id: prediction_id.clone(),
            agent_id: agent_id.clone(),
            position,
            amount,
        });

        debug!(prediction = %prediction_id, agent = %agent_id.short(), %position, %amount, "Bet placed");
        Ok(bet)
    }

    /// Settle an open market with the given outcome.
    ///
    /// Each winning bettor receives a pro-rata share of the total pool
    /// (their full stake back when the winning pool is empty) and a
    /// small flat reputation bonus.
    pub fn settle_prediction(
        &self,
        prediction_id: &PredictionId,
        outcome: bool,
    ) -> Result<Vec<Payout>> {
        let prediction = self
            .store
            .prediction(prediction_id)
            .ok_or_else(|| GuildError::PredictionNotFound(prediction_id.clone()))?;
        if prediction.status != PredictionStatus::Open {
            return Err(GuildError::PredictionClosed(prediction_id.clone()));
        }

        self.store.with_prediction_mut(prediction_id, |p| {
            p.status = PredictionStatus::Settled;
            p.outcome = Some(outcome);
            p.settled_at = Some(Utc::now());
        });

        let win_position = if outcome { Position::Yes } else { Position::No };
        let total_pool = prediction.total_pool();
        let winning_pool = prediction.pool_for(win_position);

        let mut payouts = Vec::new();
        for bet in self.store.bets_for_prediction(prediction_id) {
            if bet.position != win_position {
                continue;
            }
            let amount = bet.amount.pro_rata(winning_pool, total_pool);
            self.store.with_agent_mut(&bet.agent_id, |agent| {
                agent.apply_reputation(PREDICTION_REPUTATION_GAIN);
            });
            payouts.push(Payout {
                agent_id: bet.agent_id,
                amount,
            });
        }

        self.queue.enqueue(LedgerEvent::PredictionSettled {
            prediction_id: prediction_id.clone(),
            job_id: prediction.job_id.clone(),
            outcome,
            total_pool,
            winners: payouts.len() as u32,
        });

        info!(
            prediction = %prediction_id,
            outcome,
            total_pool = %total_pool,
            winners = payouts.len(),
            "Prediction settled"
        );
        Ok(payouts)
    }

    // ========================================================================
    // Forum
    // ========================================================================

    pub fn create_post(
        &self,
        agent_id: &AgentId,
        title: &str,
        body: &str,
        tag: Option<&str>,
    ) -> Result<ForumPost> {
        if title.is_empty() || body.is_empty() {
            return Err(GuildError::Validation(
                "title and body are required".to_string(),
            ));
        }
        if !self.store.agent_exists(agent_id) {
            return Err(GuildError::AgentNotFound(agent_id.clone()));
        }

        let post = ForumPost {
            id: PostId::new(),
            agent_id: agent_id.clone(),
            title: title.to_string(),
            body: body.to_string(),
            tag: tag.unwrap_or("general").to_string(),
            upvotes: 0,
            reply_count: 0,
            created_at: Utc::now(),
        };
        self.store.insert_post(post.clone());

        self.queue.enqueue(LedgerEvent::ForumPostCreated {
            post_id: post.id.clone(),
            agent_id: agent_id.clone(),
            title: post.title.clone(),
            body: post.body.clone(),
            tag: post.tag.clone(),
        });

        Ok(post)
    }

    pub fn create_reply(
        &self,
        post_id: &PostId,
        agent_id: &AgentId,
        body: &str,
    ) -> Result<ForumReply> {
        if body.is_empty() {
            return Err(GuildError::Validation("body is required".to_string()));
        }
        if !self.store.post_exists(post_id) {
            return Err(GuildError::PostNotFound(post_id.to_string()));
        }

        let reply = ForumReply {
            id: ReplyId::new(),
            post_id: post_id.clone(),
            agent_id: agent_id.clone(),
            body: body.to_string(),
            created_at: Utc::now(),
        };
        self.store.insert_reply(reply.clone());
        self.store.with_post_mut(post_id, |post| {
            post.reply_count += 1;
        });

        self.queue.enqueue(LedgerEvent::ForumReplyCreated {
            reply_id: reply.id.clone(),
            post_id: post_id.clone(),
            agent_id: agent_id.clone(),
            body: reply.body.clone(),
        });

        Ok(reply)
    }

    /// Upvote a post. One upvote per (post, agent); returns the new score.
    pub fn upvote_post(&self, post_id: &PostId, agent_id: &AgentId) -> Result<u32> {
        if !self.store.post_exists(post_id) {
            return Err(GuildError::PostNotFound(post_id.to_string()));
        }
        if !self.store.try_insert_upvote(post_id, agent_id) {
            return Err(GuildError::DuplicateUpvote {
                post: post_id.to_string(),
                agent: agent_id.clone(),
            });
        }

        let new_score = self
            .store
            .with_post_mut(post_id, |post| {
                post.upvotes += 1;
                post.upvotes
            })
            .unwrap_or(1);

        self.queue.enqueue(LedgerEvent::ForumUpvoted {
            post_id: post_id.clone(),
            agent_id: agent_id.clone(),
            new_score,
        });

        Ok(new_score)
    }
}
