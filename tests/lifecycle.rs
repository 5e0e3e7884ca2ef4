//! End-to-end lifecycle tests over the mock ledger
//!
//! Drives the full marketplace flow through the context object, waits
//! for the write queue to drain, then verifies that reconstructing the
//! projection from the ledger's event log agrees with the local store.

use std::time::Duration;

use clap::Parser;
use guildhall::model::{Credits, JobStatus, Position, PredictionStatus};
use guildhall::orchestrator::{CreateJob, PlaceBid, RegisterAgent};
use guildhall::{AppContext, Args};

async fn drain_queue(ctx: &AppContext, expected: u64) {
    for _ in 0..400 {
        if ctx.queue.submitted_count() >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "write queue drained only {} of {} attestations",
        ctx.queue.submitted_count(),
        expected
    );
}

fn test_args() -> Args {
    let mut args = Args::parse_from(["guildhall"]);
    args.drain_delay_ms = 1;
    args.reconstruct_cache_ttl_secs = 0;
    args
}

#[tokio::test]
async fn full_lifecycle_reaches_settlement_and_reconstructs() {
    let ctx = AppContext::init(test_args()).await;
    let market = &ctx.marketplace;

    // Three agents: one worker, two bettors
    let worker = market
        .register_agent(RegisterAgent {
            id: Some("worker-1".into()),
            name: Some("Worker".into()),
            skills: vec!["summarize".into()],
        })
        .agent_id()
        .clone();
    let optimist = market
        .register_agent(RegisterAgent {
            id: Some("optimist".into()),
            name: Some("Optimist".into()),
            skills: vec![],
        })
        .agent_id()
        .clone();
    let pessimist = market
        .register_agent(RegisterAgent {
            id: Some("pessimist".into()),
            name: Some("Pessimist".into()),
            skills: vec![],
        })
        .agent_id()
        .clone();

    // Job, bid, assignment, market
    let job = market.create_job(CreateJob {
        title: "Summarize recent trends".into(),
        description: "integration".into(),
        required_skill: "summarize".into(),
        budget: Credits::from_major(100),
        currency: None,
        creator: None,
        deadline: None,
    });
    market
        .place_bid(PlaceBid {
            job_id: job.id.clone(),
            agent_id: worker.clone(),
            price: Credits::from_major(45),
            currency: None,
            quote: None,
            estimated_duration_ms: None,
        })
        .unwrap();
    market.assign_job(&job.id).unwrap();
    let prediction = market.ensure_prediction(&job.id).unwrap().unwrap();

    market
        .place_bet(
            &prediction.id,
            &optimist,
            Position::Yes,
            Some(Credits::from_major(30)),
        )
        .unwrap();
    market
        .place_bet(
            &prediction.id,
            &pessimist,
            Position::No,
            Some(Credits::from_major(10)),
        )
        .unwrap();

    // Completion and settlement
    market
        .submit_result(&job.id, &worker, Some("All done".into()))
        .unwrap();
    let transfer = market.settle_job(&job.id).await.unwrap();
    assert_eq!(transfer.amount, Credits::from_major(45));

    let payouts = market.settle_prediction(&prediction.id, true).unwrap();
    assert_eq!(payouts.len(), 1);
    assert_eq!(payouts[0].amount, Credits::from_major(40));

    // Local store state
    let store = &ctx.store;
    assert_eq!(store.job(&job.id).unwrap().status, JobStatus::Settled);
    let worker_row = store.agent(&worker).unwrap();
    assert_eq!(worker_row.reputation, 65); // 50 + 10 + 5
    assert_eq!(worker_row.completions, 1);

    // 3 registrations + job.created + bid.placed + job.assigned
    // + prediction.created + 2 bets + job.completed + reputation.updated
    // + payment.settled + prediction.settled = 13 attestations
    drain_queue(&ctx, 13).await;
    assert_eq!(store.event_count(), 13);

    // Reconstruction from the ledger log alone agrees with the store
    let projection = ctx.reconstructor.reconstruct().await.unwrap();
    assert_eq!(projection.agents.len(), 3);
    assert_eq!(projection.jobs.len(), 1);
    assert_eq!(projection.jobs[0].status, JobStatus::Settled);
    assert_eq!(projection.jobs[0].assigned_agent, Some(worker.clone()));

    let rebuilt_worker = projection
        .agents
        .iter()
        .find(|a| a.id == worker)
        .expect("worker missing from reconstruction");
    assert_eq!(rebuilt_worker.reputation, 65);
    assert_eq!(rebuilt_worker.completions, 1);

    let rebuilt_market = &projection.predictions[0];
    assert_eq!(rebuilt_market.status, PredictionStatus::Settled);
    assert_eq!(rebuilt_market.outcome, Some(true));
    assert_eq!(rebuilt_market.yes_pool, Credits::from_major(30));
    assert_eq!(rebuilt_market.no_pool, Credits::from_major(10));

    assert_eq!(projection.transfers.len(), 1);
    assert_eq!(projection.transfers[0].amount, Credits::from_major(45));

    ctx.shutdown();
}

#[tokio::test]
async fn status_report_tracks_queue_and_mode() {
    let ctx = AppContext::init(test_args()).await;

    let agent = ctx
        .marketplace
        .register_agent(RegisterAgent {
            id: Some("solo".into()),
            name: None,
            skills: vec![],
        })
        .agent_id()
        .clone();
    ctx.marketplace.heartbeat(&agent).unwrap();
    drain_queue(&ctx, 1).await;

    let status = ctx.status();
    assert_eq!(status.ledger_mode, "mock");
    assert_eq!(status.metrics.agents, 1);
    assert!(status.attestations_confirmed >= 1);
    assert_eq!(status.attestations_dropped, 0);
    assert_eq!(status.channel_id.as_deref(), Some("mock-channel-0"));
    assert_eq!(status.token_id.as_deref(), Some("mock-token-0"));

    ctx.shutdown();
}

#[tokio::test]
async fn events_feed_is_queryable_by_correlation() {
    let ctx = AppContext::init(test_args()).await;
    let market = &ctx.marketplace;

    let worker = market
        .register_agent(RegisterAgent {
            id: Some("feed-worker".into()),
            name: None,
            skills: vec![],
        })
        .agent_id()
        .clone();
    let job = market.create_job(CreateJob {
        title: "Audit agent communication logs".into(),
        description: "integration".into(),
        required_skill: "qa-report".into(),
        budget: Credits::from_major(80),
        currency: None,
        creator: None,
        deadline: None,
    });
    market
        .place_bid(PlaceBid {
            job_id: job.id.clone(),
            agent_id: worker.clone(),
            price: Credits::from_major(60),
            currency: None,
            quote: None,
            estimated_duration_ms: None,
        })
        .unwrap();
    market.assign_job(&job.id).unwrap();

    // registration + job.created + bid.placed + job.assigned
    drain_queue(&ctx, 4).await;

    let for_job = ctx.store.events_snapshot(Some(&job.id), None, 50);
    assert_eq!(for_job.len(), 3); // created, bid, assigned
    let for_worker = ctx.store.events_snapshot(None, Some(&worker), 50);
    assert_eq!(for_worker.len(), 3); // registered, bid, assigned
    // Newest first
    assert_eq!(for_job[0].event.kind(), "job.assigned");

    ctx.shutdown();
}
