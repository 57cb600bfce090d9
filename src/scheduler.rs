//! Bot scheduler
//!
//! Supervises one orchestrator task per active bot. A reconciliation loop
//! compares the desired statuses in the store with the tasks actually
//! running and starts or stops bots to close the gap, so a status change
//! from any code path converges within one interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{BotConfig, BotStatus};
use crate::confluence::SignalGenerator;
use crate::decision::build_provider;
use crate::error::{EngineError, ExecutionError};
use crate::execution::ExecutionEngine;
use crate::orchestrator::CycleOrchestrator;
use crate::provider::{MarketDataProvider, OrderExecutionProvider};
use crate::store::{BotHealth, PersistenceStore};

/// How often the reconciliation loop runs.
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 5;

struct BotHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct BotScheduler {
    store: Arc<dyn PersistenceStore>,
    market: Arc<dyn MarketDataProvider>,
    venue: Arc<dyn OrderExecutionProvider>,
    advisor_url: Option<String>,
    running: Mutex<HashMap<Uuid, BotHandle>>,
    reconcile_interval: Duration,
}

impl BotScheduler {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        market: Arc<dyn MarketDataProvider>,
        venue: Arc<dyn OrderExecutionProvider>,
        advisor_url: Option<String>,
    ) -> Self {
        Self {
            store,
            market,
            venue,
            advisor_url,
            running: Mutex::new(HashMap::new()),
            reconcile_interval: Duration::from_secs(DEFAULT_RECONCILE_INTERVAL_SECS),
        }
    }

    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    /// Start a bot. A no-op if its task is already running.
    pub async fn start_bot(&self, bot_id: Uuid) -> Result<(), EngineError> {
        let mut running = self.running.lock().await;
        if let Some(handle) = running.get(&bot_id) {
            if !handle.task.is_finished() {
                debug!(bot = %bot_id, "already running");
                return Ok(());
            }
            running.remove(&bot_id);
        }

        let config = self
            .store
            .load_config(bot_id)
            .await?
            .ok_or(EngineError::Execution(ExecutionError::BotNotFound(bot_id)))?;

        self.store.set_status(bot_id, BotStatus::Active).await?;
        let handle = self.spawn_orchestrator(config)?;
        running.insert(bot_id, handle);
        info!(bot = %bot_id, "bot started");
        Ok(())
    }

    /// Stop a bot and wait for its task to finish closing out. Safe to call
    /// for a bot that is not running.
    pub async fn stop_bot(&self, bot_id: Uuid) -> Result<(), EngineError> {
        let handle = self.running.lock().await.remove(&bot_id);
        match handle {
            Some(handle) => {
                let _ = handle.shutdown.send(true);
                if let Err(e) = handle.task.await {
                    warn!(bot = %bot_id, error = %e, "bot task join failed");
                }
                info!(bot = %bot_id, "bot stopped");
            }
            None => {
                // No task; just make sure the desired state agrees.
                if self.store.status(bot_id).await? == Some(BotStatus::Active) {
                    self.store.set_status(bot_id, BotStatus::Stopped).await?;
                }
            }
        }
        Ok(())
    }

    /// Persisted status plus the latest runtime health.
    pub async fn get_bot_status(
        &self,
        bot_id: Uuid,
    ) -> Result<(Option<BotStatus>, Option<BotHealth>), EngineError> {
        let status = self.store.status(bot_id).await?;
        let health = self.store.health(bot_id).await?;
        Ok((status, health))
    }

    /// Run the reconciliation loop until `shutdown` flips, then wind down
    /// every bot.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.reconcile_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.reconcile().await {
                        warn!(error = %e, "reconciliation pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.shutdown_all().await;
    }

    /// One reconciliation pass: start Active bots without a task, stop
    /// running bots no longer marked Active.
    async fn reconcile(&self) -> Result<(), EngineError> {
        let statuses = self.store.list_statuses().await?;
        let mut to_stop = Vec::new();

        {
            let mut running = self.running.lock().await;

            // Drop handles whose tasks already ended (fatal errors).
            running.retain(|bot_id, handle| {
                if handle.task.is_finished() {
                    debug!(bot = %bot_id, "reaping finished bot task");
                    false
                } else {
                    true
                }
            });

            for (bot_id, status) in &statuses {
                let is_running = running.contains_key(bot_id);
                match status {
                    BotStatus::Active if !is_running => {
                        let Some(config) = self.store.load_config(*bot_id).await? else {
                            warn!(bot = %bot_id, "active bot has no config");
                            continue;
                        };
                        info!(bot = %bot_id, "reconciler starting bot");
                        running.insert(*bot_id, self.spawn_orchestrator(config)?);
                    }
                    BotStatus::Stopped | BotStatus::Failed if is_running => {
                        info!(bot = %bot_id, status = %status, "reconciler stopping bot");
                        if let Some(handle) = running.remove(bot_id) {
                            let _ = handle.shutdown.send(true);
                            to_stop.push((*bot_id, handle.task));
                        }
                    }
                    _ => {}
                }
            }
        }

        for (bot_id, task) in to_stop {
            if let Err(e) = task.await {
                warn!(bot = %bot_id, error = %e, "bot task join failed");
            }
        }
        Ok(())
    }

    fn spawn_orchestrator(&self, config: BotConfig) -> Result<BotHandle, EngineError> {
        let bot_id = config.id;
        let decider = build_provider(&config, SignalGenerator::new(), self.advisor_url.clone())?;
        let execution = ExecutionEngine::new(self.store.clone(), self.venue.clone());
        let (shutdown, rx) = watch::channel(false);

        let orchestrator = CycleOrchestrator::new(
            config,
            self.store.clone(),
            self.market.clone(),
            decider,
            execution,
            rx,
        );
        let task = tokio::spawn(async move {
            if let Err(e) = orchestrator.run().await {
                error!(bot = %bot_id, error = %e, "bot loop ended with error");
            }
        });
        Ok(BotHandle { shutdown, task })
    }

    async fn shutdown_all(&self) {
        let handles: Vec<(Uuid, BotHandle)> =
            self.running.lock().await.drain().collect();
        if handles.is_empty() {
            return;
        }
        info!(bots = handles.len(), "shutting down all bots");
        for (_, handle) in &handles {
            let _ = handle.shutdown.send(true);
        }
        for (bot_id, handle) in handles {
            if let Err(e) = handle.task.await {
                warn!(bot = %bot_id, error = %e, "bot task join failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal::Decimal;

    use crate::market::{Candle, Ticker, Timeframe};
    use crate::provider::PaperExecution;
    use crate::store::MemoryStore;

    /// Quiet market: ticker exists, no history, so bots idle.
    struct QuietMarket;

    #[async_trait]
    impl MarketDataProvider for QuietMarket {
        async fn fetch_ticker(&self, symbol: &str) -> Result<Option<Ticker>, EngineError> {
            Ok(Some(Ticker {
                symbol: symbol.to_string(),
                price: Decimal::from(50_000),
                change_24h_pct: None,
                volume_24h: None,
                timestamp: Utc::now(),
            }))
        }

        async fn fetch_ohlcv(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            _limit: usize,
        ) -> Result<Option<Vec<Candle>>, EngineError> {
            Ok(None)
        }
    }

    async fn scheduler_with_bot() -> (Arc<BotScheduler>, Arc<MemoryStore>, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let config = BotConfig::paper("sched-test", vec!["BTC-PERP".into()]);
        let bot_id = config.id;
        store.upsert_bot(config).await.unwrap();

        let scheduler = Arc::new(BotScheduler::new(
            store.clone(),
            Arc::new(QuietMarket),
            Arc::new(PaperExecution::with_rates(Decimal::ZERO, 0)),
            None,
        ));
        (scheduler, store, bot_id)
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (scheduler, store, bot_id) = scheduler_with_bot().await;

        scheduler.start_bot(bot_id).await.unwrap();
        scheduler.start_bot(bot_id).await.unwrap();

        assert_eq!(scheduler.running.lock().await.len(), 1);
        assert_eq!(store.status(bot_id).await.unwrap(), Some(BotStatus::Active));

        scheduler.stop_bot(bot_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_safe_when_not_running() {
        let (scheduler, store, bot_id) = scheduler_with_bot().await;

        scheduler.start_bot(bot_id).await.unwrap();
        scheduler.stop_bot(bot_id).await.unwrap();
        scheduler.stop_bot(bot_id).await.unwrap();

        assert!(scheduler.running.lock().await.is_empty());
        assert_eq!(store.status(bot_id).await.unwrap(), Some(BotStatus::Stopped));
    }

    #[tokio::test]
    async fn test_start_unknown_bot_fails() {
        let (scheduler, _, _) = scheduler_with_bot().await;
        let err = scheduler.start_bot(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Execution(ExecutionError::BotNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reconciler_starts_active_and_stops_inactive() {
        let (scheduler, store, bot_id) = scheduler_with_bot().await;

        store.set_status(bot_id, BotStatus::Active).await.unwrap();
        scheduler.reconcile().await.unwrap();
        assert_eq!(scheduler.running.lock().await.len(), 1);

        store.set_status(bot_id, BotStatus::Stopped).await.unwrap();
        scheduler.reconcile().await.unwrap();
        assert!(scheduler.running.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_get_bot_status_returns_status_and_health() {
        let (scheduler, _, bot_id) = scheduler_with_bot().await;
        let (status, health) = scheduler.get_bot_status(bot_id).await.unwrap();
        assert_eq!(status, Some(BotStatus::Stopped));
        assert!(health.is_some());
    }
}
