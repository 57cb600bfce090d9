//! Perpbot - multi-bot perpetual swap trading service
//!
//! The binary wires the pieces together:
//! 1. Loads process settings (file + PERPBOT_* environment)
//! 2. Seeds configured bots into the store
//! 3. Runs the scheduler until Ctrl-C, then winds every bot down

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use perpbot::provider::{HttpMarketData, PaperExecution, RateLimiter};
use perpbot::scheduler::BotScheduler;
use perpbot::settings::Settings;
use perpbot::store::{MemoryStore, PersistenceStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    info!("Starting perpbot...");

    let settings = Settings::load()?;
    info!(
        market = %settings.market_base_url,
        bots = settings.bots.len(),
        "settings loaded"
    );

    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let limiter = RateLimiter::new(settings.max_concurrent_requests);
    let market = Arc::new(HttpMarketData::new(&settings.market_base_url, 0, limiter)?);
    let venue = Arc::new(PaperExecution::new());

    let scheduler = Arc::new(
        BotScheduler::new(store.clone(), market, venue, settings.advisor_url.clone())
            .with_reconcile_interval(std::time::Duration::from_secs(
                settings.reconcile_interval_secs,
            )),
    );

    // Seed and start the bots from settings.
    for config in &settings.bots {
        let bot_id = config.id;
        store.upsert_bot(config.clone()).await?;
        if let Err(e) = scheduler.start_bot(bot_id).await {
            warn!(bot = %bot_id, error = %e, "failed to start bot");
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_task = tokio::spawn(scheduler.clone().run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping bots...");
    let _ = shutdown_tx.send(true);
    scheduler_task.await?;

    info!("perpbot stopped");
    Ok(())
}
