//! Cooperative scheduler
//!
//! A single timer loop drives autonomous marketplace progress: job
//! top-up, auto-assignment, auto-settlement, prediction market upkeep
//! and the stuck-job watchdog. One tick runs at a time; every step is
//! idempotency-checked against the store, so a tick that overlaps work
//! done by request handlers changes nothing it shouldn't. Step errors
//! are logged and never halt subsequent ticks.

use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{CreateJob, Marketplace};
use crate::model::{Credits, JobStatus};

/// Fixed templates the scheduler draws autonomous jobs from
const JOB_TEMPLATES: &[(&str, &str, u64)] = &[
    ("Summarize recent DeFi trends", "summarize", 50),
    ("Generate QA report on smart contracts", "qa-report", 75),
    ("Write market analysis memo", "market-memo", 60),
    ("Analyze token price movements", "summarize", 45),
    ("Audit agent communication logs", "qa-report", 80),
    ("Draft partnership proposal", "market-memo", 90),
    ("Summarize governance proposals", "summarize", 55),
    ("Generate security assessment", "qa-report", 100),
    ("Write weekly ecosystem update", "market-memo", 70),
];

/// Scheduler tuning
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Pause between ticks
    pub interval: Duration,
    /// Top up open jobs when the count drops below this
    pub open_jobs_low_water: usize,
    /// Jobs created per top-up
    pub batch_size: usize,
    /// Jobs created on the very first tick
    pub initial_batch: usize,
    /// How long an assignment may sit before the watchdog reclaims it
    pub staleness: chrono::Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(8),
            open_jobs_low_water: 3,
            batch_size: 2,
            initial_batch: 3,
            staleness: chrono::Duration::minutes(5),
        }
    }
}

/// Spawn the scheduler loop
pub fn spawn_scheduler(market: Arc<Marketplace>, config: SchedulerConfig) -> JoinHandle<()> {
    info!(
        interval_secs = config.interval.as_secs(),
        low_water = config.open_jobs_low_water,
        "Scheduler started"
    );
    tokio::spawn(run_loop(market, config))
}

async fn run_loop(market: Arc<Marketplace>, config: SchedulerConfig) {
    // Seed the marketplace so the first agents have something to bid on
    create_job_batch(&market, config.initial_batch);

    loop {
        tokio::time::sleep(config.interval).await;
        tick(&market, &config).await;
    }
}

/// One full pass over the marketplace. Public for tests; each step is
/// independent and safe to rerun.
pub async fn tick(market: &Marketplace, config: &SchedulerConfig) {
    top_up_jobs(market, config);
    auto_assign(market);
    auto_settle(market).await;
    ensure_predictions(market);
    settle_due_predictions(market);

    let reclaimed = market.reclaim_stale_jobs(config.staleness);
    if !reclaimed.is_empty() {
        info!(count = reclaimed.len(), "Watchdog reclaimed stuck jobs");
    }
}

fn top_up_jobs(market: &Marketplace, config: &SchedulerConfig) {
    let open = market.store().open_job_count();
    if open < config.open_jobs_low_water {
        create_job_batch(market, config.batch_size);
    }
}

fn create_job_batch(market: &Marketplace, count: usize) {
    let mut rng = rand::thread_rng();
    for _ in 0..count {
        let (title, skill, budget) = JOB_TEMPLATES
            .choose(&mut rng)
            .copied()
            .unwrap_or(JOB_TEMPLATES[0]);
        let job = market.create_job(CreateJob {
            title: title.to_string(),
            description: format!("Autonomous job: {}", title),
            required_skill: skill.to_string(),
            budget: Credits::from_major(budget),
            currency: None,
            creator: None,
            deadline: None,
        });
        debug!(job = %job.id.short(), title, "Scheduler created job");
    }
}

/// Assign every open job that has accumulated at least one bid, then
/// stand up its prediction market right away.
fn auto_assign(market: &Marketplace) {
    for job in market.store().jobs_with_status(JobStatus::Open) {
        if market.store().bids_for_job(&job.id).is_empty() {
            continue;
        }
        match market.assign_job(&job.id) {
            Ok(assignment) => {
                debug!(
                    job = %assignment.job_id.short(),
                    agent = %assignment.agent_id.short(),
                    "Scheduler assigned job"
                );
                if let Err(e) = market.ensure_prediction(&job.id) {
                    error!(job = %job.id.short(), error = %e, "Prediction creation failed");
                }
            }
            Err(e) => error!(job = %job.id.short(), error = %e, "Auto-assign failed"),
        }
    }
}

/// Settle every completed job lacking a settlement record
async fn auto_settle(market: &Marketplace) {
    for job in market.store().jobs_with_status(JobStatus::Completed) {
        if let Err(e) = market.settle_job(&job.id).await {
            error!(job = %job.id.short(), error = %e, "Auto-settle failed");
        }
    }
}

/// Create markets for assigned jobs that slipped past auto-assign
/// (e.g. jobs assigned through the request path)
fn ensure_predictions(market: &Marketplace) {
    for job in market.store().jobs_with_status(JobStatus::Assigned) {
        if let Err(e) = market.ensure_prediction(&job.id) {
            error!(job = %job.id.short(), error = %e, "Prediction creation failed");
        }
    }
}

/// Settle markets whose job has reached a terminal state; outcome is
/// whether the job finished successfully
fn settle_due_predictions(market: &Marketplace) {
    for prediction in market.store().open_predictions() {
        let Some(job) = market.store().job(&prediction.job_id) else {
            continue;
        };
        if !job.status.is_terminal() {
            continue;
        }
        match market.settle_prediction(&prediction.id, job.status.is_successful()) {
            Ok(payouts) => debug!(
                prediction = %prediction.id,
                winners = payouts.len(),
                "Scheduler settled prediction"
            ),
            Err(e) => error!(prediction = %prediction.id, error = %e, "Prediction settle failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Args;
    use crate::ledger::{ErrorSink, LedgerClient, MockLedger, WriteQueue};
    use crate::model::{AgentId, Credits, Position, PredictionStatus};
    use crate::orchestrator::{PlaceBid, RegisterAgent};
    use crate::store::ProjectionStore;
    use clap::Parser;

    fn market() -> Arc<Marketplace> {
        let store = Arc::new(ProjectionStore::new());
        let ledger = Arc::new(MockLedger::new());
        let (errors, _sink) = ErrorSink::spawn();
        let (queue, _handle) = WriteQueue::start(
            Arc::clone(&ledger) as Arc<dyn LedgerClient>,
            Arc::clone(&store),
            Duration::from_millis(1),
            errors,
        );
        let args = Args::parse_from(["guildhall"]);
        Arc::new(Marketplace::new(store, queue, ledger as _, args))
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_millis(10),
            ..SchedulerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_tick_tops_up_open_jobs() {
        let m = market();
        assert_eq!(m.store().open_job_count(), 0);

        tick(&m, &config()).await;
        assert_eq!(m.store().open_job_count(), 2);

        // Above the low-water mark after two more, no further top-up
        tick(&m, &config()).await;
        tick(&m, &config()).await;
        let count = m.store().open_job_count();
        tick(&m, &config()).await;
        assert_eq!(m.store().open_job_count(), count);
    }

    #[tokio::test]
    async fn test_tick_drives_job_to_settled() {
        let m = market();
        let agent = m
            .register_agent(RegisterAgent {
                id: Some(AgentId::from("worker")),
                name: None,
                skills: vec!["summarize".into()],
            })
            .agent_id()
            .clone();

        tick(&m, &config()).await;
        let job = m.store().jobs_with_status(JobStatus::Open).pop().unwrap();
        m.place_bid(PlaceBid {
            job_id: job.id.clone(),
            agent_id: agent.clone(),
            price: Credits::from_major(40),
            currency: None,
            quote: None,
            estimated_duration_ms: None,
        })
        .unwrap();

        // Assigns and creates the market
        tick(&m, &config()).await;
        let assigned = m.store().job(&job.id).unwrap();
        assert_eq!(assigned.status, JobStatus::Assigned);
        let prediction = m.store().prediction_for_job(&job.id).unwrap();
        assert_eq!(prediction.status, PredictionStatus::Open);

        m.submit_result(&job.id, &agent, Some("done".into())).unwrap();

        // Settles the job and the market
        tick(&m, &config()).await;
        assert_eq!(m.store().job(&job.id).unwrap().status, JobStatus::Settled);
        let settled = m.store().prediction_for_job(&job.id).unwrap();
        assert_eq!(settled.status, PredictionStatus::Settled);
        assert_eq!(settled.outcome, Some(true));
        assert!(m.store().transfer_for_job(&job.id).is_some());
    }

    #[tokio::test]
    async fn test_prediction_settles_yes_for_successful_job() {
        let m = market();
        let worker = m
            .register_agent(RegisterAgent {
                id: Some(AgentId::from("worker")),
                name: None,
                skills: vec![],
            })
            .agent_id()
            .clone();
        let bettor = m
            .register_agent(RegisterAgent {
                id: Some(AgentId::from("bettor")),
                name: None,
                skills: vec![],
            })
            .agent_id()
            .clone();

        tick(&m, &config()).await;
        let job = m.store().jobs_with_status(JobStatus::Open).pop().unwrap();
        m.place_bid(PlaceBid {
            job_id: job.id.clone(),
            agent_id: worker.clone(),
            price: Credits::from_major(40),
            currency: None,
            quote: None,
            estimated_duration_ms: None,
        })
        .unwrap();
        tick(&m, &config()).await;

        let prediction = m.store().prediction_for_job(&job.id).unwrap();
        m.place_bet(&prediction.id, &bettor, Position::Yes, None).unwrap();

        m.submit_result(&job.id, &worker, None).unwrap();
        tick(&m, &config()).await;

        // Correct bettor got the reputation bump
        let agent = m.store().agent(&bettor).unwrap();
        assert_eq!(agent.reputation, 53);
    }
}
