//! Guildhall - marketplace coordinator for autonomous agent guilds

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use guildhall::{Args, AppContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing/logging
    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("guildhall={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Validate configuration
    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    // Print startup banner
    info!("======================================");
    info!("  Guildhall - Agent Marketplace");
    info!("======================================");
    info!("Build: {} ({})", env!("GIT_COMMIT_SHORT"), env!("BUILD_TIMESTAMP"));
    info!("Ledger: {}", args.ledger_url);
    info!("Network: {}", args.network_id);
    info!(
        "Mode: {}",
        if args.has_credentials() { "LIVE" } else { "MOCK (no credentials)" }
    );
    info!("Scheduler interval: {}s", args.scheduler_interval_secs);
    info!("Watchdog staleness: {}s", args.watchdog_staleness_secs);
    info!("Lookback: {} blocks", args.lookback_blocks);
    info!("======================================");

    // Wire components and start background work
    let mut ctx = AppContext::init(args).await;
    ctx.start_scheduler();

    let status = ctx.status();
    info!(
        ledger_mode = status.ledger_mode,
        channel_id = ?status.channel_id,
        token_id = ?status.token_id,
        "Guildhall running"
    );

    // Run until interrupted
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    ctx.shutdown();

    Ok(())
}
