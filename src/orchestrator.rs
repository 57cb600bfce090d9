//! Cycle orchestrator
//!
//! Drives one bot through its trading loop: fetch market data, settle exits
//! first, then run the decision provider, validate and execute entries, and
//! persist an equity snapshot. One orchestrator per bot, cancelled through
//! a watch channel owned by the scheduler.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{BotConfig, BotStatus};
use crate::confluence::SignalGenerator;
use crate::decision::{DecisionProvider, OpenPositionBrief, PortfolioContext};
use crate::error::EngineError;
use crate::execution::ExecutionEngine;
use crate::indicators::IndicatorEngine;
use crate::ledger::{EquitySnapshot, Position};
use crate::market::MarketSnapshot;
use crate::provider::MarketDataProvider;
use crate::risk::RiskValidator;
use crate::signal::SignalKind;
use crate::store::{BotHealth, PersistenceStore};

/// Delay before retrying after a non-fatal cycle error.
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 10;

/// Candles requested per timeframe; comfortably above the minimum history
/// the indicator engine needs.
const ENTRY_CANDLE_LIMIT: usize = 300;
const REGIME_CANDLE_LIMIT: usize = 250;

/// Where a bot currently is in its loop. Persisted in `BotHealth`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Idle,
    FetchingData,
    CheckingExits,
    GeneratingSignals,
    Validating,
    Executing,
    RecordingEquity,
    Sleeping,
    Stopped,
}

/// What one cycle actually did; returned for observability and tests.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub snapshots: usize,
    pub exits: usize,
    pub entries: usize,
    pub rejections: usize,
}

pub struct CycleOrchestrator {
    config: BotConfig,
    store: Arc<dyn PersistenceStore>,
    market: Arc<dyn MarketDataProvider>,
    decider: Arc<dyn DecisionProvider>,
    execution: ExecutionEngine,
    // Exit conditions are always checked deterministically, whatever the
    // decision mode.
    generator: SignalGenerator,
    shutdown: watch::Receiver<bool>,
    retry_delay: Duration,
}

impl CycleOrchestrator {
    pub fn new(
        config: BotConfig,
        store: Arc<dyn PersistenceStore>,
        market: Arc<dyn MarketDataProvider>,
        decider: Arc<dyn DecisionProvider>,
        execution: ExecutionEngine,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            store,
            market,
            decider,
            execution,
            generator: SignalGenerator::new(),
            shutdown,
            retry_delay: Duration::from_secs(DEFAULT_RETRY_DELAY_SECS),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Run the loop until shutdown is signalled or a fatal error occurs.
    pub async fn run(mut self) -> Result<(), EngineError> {
        let bot_id = self.config.id;
        info!(bot = %bot_id, name = %self.config.name, "bot loop starting");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let delay = match self.run_cycle().await {
                Ok(report) => {
                    debug!(
                        bot = %bot_id,
                        snapshots = report.snapshots,
                        exits = report.exits,
                        entries = report.entries,
                        rejections = report.rejections,
                        "cycle complete"
                    );
                    Duration::from_secs(self.config.cycle_interval_secs)
                }
                Err(e) if e.is_fatal() => {
                    error!(bot = %bot_id, error = %e, "fatal error, stopping bot");
                    let _ = self.store.set_status(bot_id, BotStatus::Failed).await;
                    self.record_error(&e).await;
                    self.set_phase(CyclePhase::Stopped).await;
                    return Err(e);
                }
                Err(e) => {
                    warn!(bot = %bot_id, error = %e, "cycle failed, retrying");
                    self.record_error(&e).await;
                    self.retry_delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.wind_down().await;
        let _ = self.store.set_status(bot_id, BotStatus::Stopped).await;
        self.set_phase(CyclePhase::Stopped).await;
        info!(bot = %bot_id, "bot loop stopped");
        Ok(())
    }

    /// One full cycle. Split out from `run` so it can be driven directly.
    ///
    /// A stop request aborts the cycle at the next suspension point or phase
    /// boundary; only an open or close already handed to the execution
    /// engine runs to completion.
    pub async fn run_cycle(&self) -> Result<CycleReport, EngineError> {
        let bot_id = self.config.id;
        let mut report = CycleReport::default();

        self.set_phase(CyclePhase::FetchingData).await;
        let snapshots = tokio::select! {
            snapshots = self.fetch_snapshots() => snapshots,
            _ = Self::stopped(self.shutdown.clone()) => {
                debug!(bot = %bot_id, "stop requested during fetch, aborting cycle");
                return Ok(report);
            }
        };
        report.snapshots = snapshots.len();
        if snapshots.is_empty() {
            debug!(bot = %bot_id, "no market data this cycle");
            self.record_equity_and_health(&[], CyclePhase::Sleeping).await?;
            return Ok(report);
        }

        self.set_phase(CyclePhase::CheckingExits).await;
        report.exits = self.settle_exits(&snapshots).await?;
        if self.stop_requested() {
            return Ok(report);
        }

        self.set_phase(CyclePhase::GeneratingSignals).await;
        let ledger = self.require_ledger().await?;
        let open_positions = self.store.open_positions(bot_id).await?;
        let context = self.portfolio_context(&ledger.cash, &open_positions, &snapshots);
        let decisions = tokio::select! {
            decisions = self.decider.decide(&snapshots, &context, &self.config) => decisions?,
            _ = Self::stopped(self.shutdown.clone()) => {
                debug!(bot = %bot_id, "stop requested during decide, aborting cycle");
                return Ok(report);
            }
        };

        self.set_phase(CyclePhase::Validating).await;
        let mut trades_today = self.store.entry_trades_today(bot_id).await?;
        for snapshot in &snapshots {
            if self.stop_requested() {
                debug!(bot = %bot_id, "stop requested, skipping remaining decisions");
                return Ok(report);
            }
            let Some(signal) = decisions.get(&snapshot.symbol) else {
                continue;
            };
            if signal.is_entry() {
                let ledger = self.require_ledger().await?;
                let open = self.store.open_positions(bot_id).await?;
                match RiskValidator::validate(signal, &ledger, &open, trades_today, &self.config)
                {
                    Ok(order) => {
                        self.set_phase(CyclePhase::Executing).await;
                        match self.execution.open(bot_id, &order, snapshot.price).await {
                            Ok(_) => {
                                trades_today += 1;
                                report.entries += 1;
                            }
                            Err(e @ EngineError::Execution(_)) => {
                                error!(
                                    bot = %bot_id,
                                    symbol = %snapshot.symbol,
                                    error = %e,
                                    "entry execution failed, decision abandoned"
                                );
                                self.record_error(&e).await;
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    Err(reason) => {
                        let rejection = EngineError::Rejected(reason);
                        debug!(
                            bot = %bot_id,
                            symbol = %snapshot.symbol,
                            %rejection,
                            "entry rejected"
                        );
                        report.rejections += 1;
                        self.record_rejection(&rejection.to_string()).await;
                    }
                }
            } else if signal.kind == SignalKind::Close {
                let open = self.store.open_positions(bot_id).await?;
                if let Some(position) = open.iter().find(|p| p.symbol == snapshot.symbol) {
                    self.set_phase(CyclePhase::Executing).await;
                    match self.execution.close(position, snapshot.price, &signal.reasoning).await
                    {
                        Ok(_) => report.exits += 1,
                        Err(e @ EngineError::Execution(_)) => {
                            error!(
                                bot = %bot_id,
                                symbol = %snapshot.symbol,
                                error = %e,
                                "close execution failed, decision abandoned"
                            );
                            self.record_error(&e).await;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        self.set_phase(CyclePhase::RecordingEquity).await;
        self.record_equity_and_health(&snapshots, CyclePhase::Sleeping).await?;
        Ok(report)
    }

    fn stop_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once a stop is signalled. A dropped sender counts as a stop.
    async fn stopped(mut shutdown: watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                return;
            }
        }
    }

    /// Build one snapshot per symbol. Per-symbol failures are logged and the
    /// symbol is skipped for this cycle.
    async fn fetch_snapshots(&self) -> Vec<MarketSnapshot> {
        let mut snapshots = Vec::with_capacity(self.config.symbols.len());
        for symbol in &self.config.symbols {
            match self.fetch_snapshot(symbol).await {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e @ EngineError::DataUnavailable(_)) => {
                    debug!(%symbol, error = %e, "skipping symbol this cycle")
                }
                Err(e) => warn!(%symbol, error = %e, "market data fetch failed"),
            }
        }
        snapshots
    }

    async fn fetch_snapshot(&self, symbol: &str) -> Result<MarketSnapshot, EngineError> {
        let ticker = self
            .market
            .fetch_ticker(symbol)
            .await?
            .ok_or_else(|| EngineError::DataUnavailable(format!("no ticker for {symbol}")))?;

        let entry = self
            .market
            .fetch_ohlcv(symbol, self.config.entry_timeframe, ENTRY_CANDLE_LIMIT)
            .await?
            .unwrap_or_default();
        let regime = self
            .market
            .fetch_ohlcv(symbol, self.config.regime_timeframe, REGIME_CANDLE_LIMIT)
            .await?
            .unwrap_or_default();

        let mut snapshot = MarketSnapshot::new(symbol, ticker.price)
            .with_candles(self.config.entry_timeframe, entry)
            .with_candles(self.config.regime_timeframe, regime);

        // Too little history means no indicators; the snapshot still carries
        // the price so exits keep working.
        if let Some((set, flags)) = IndicatorEngine::compute(
            snapshot.candles(self.config.entry_timeframe),
            snapshot.candles(self.config.regime_timeframe),
        ) {
            snapshot.indicators = Some(set);
            snapshot.flags = Some(flags);
        }
        if !snapshot.has_indicators() {
            debug!(%symbol, "insufficient history, entries disabled this cycle");
        }
        Ok(snapshot)
    }

    /// Close every open position whose exit condition fired, before any
    /// entry work happens.
    async fn settle_exits(&self, snapshots: &[MarketSnapshot]) -> Result<usize, EngineError> {
        let mut closed = 0;
        for position in self.store.open_positions(self.config.id).await? {
            let Some(snapshot) = snapshots.iter().find(|s| s.symbol == position.symbol) else {
                continue;
            };
            let price = snapshot.price;

            let reason = if position.stop_hit(price) {
                Some(format!("stop loss hit at {price}"))
            } else if position.target_hit(price) {
                Some(format!("take profit hit at {price}"))
            } else {
                snapshot
                    .indicators
                    .as_ref()
                    .and_then(|set| self.generator.exit_reason(set, position.side))
            };

            if let Some(reason) = reason {
                info!(
                    bot = %self.config.id,
                    symbol = %position.symbol,
                    %price,
                    %reason,
                    "exit condition met"
                );
                match self.execution.close(&position, price, &reason).await {
                    Ok(_) => closed += 1,
                    Err(e @ EngineError::Execution(_)) => {
                        error!(
                            bot = %self.config.id,
                            symbol = %position.symbol,
                            error = %e,
                            "exit execution failed, retrying next cycle"
                        );
                        self.record_error(&e).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(closed)
    }

    fn portfolio_context(
        &self,
        cash: &Decimal,
        open_positions: &[Position],
        snapshots: &[MarketSnapshot],
    ) -> PortfolioContext {
        let briefs: Vec<OpenPositionBrief> = open_positions
            .iter()
            .map(|p| {
                let price = snapshots
                    .iter()
                    .find(|s| s.symbol == p.symbol)
                    .map(|s| s.price)
                    .unwrap_or(p.current_price);
                OpenPositionBrief {
                    symbol: p.symbol.clone(),
                    side: p.side,
                    entry_price: p.entry_price,
                    quantity: p.quantity,
                    unrealized_pnl: p.unrealized_pnl(price),
                }
            })
            .collect();
        let equity = *cash
            + open_positions.iter().map(|p| p.margin).sum::<Decimal>()
            + briefs.iter().map(|b| b.unrealized_pnl).sum::<Decimal>();
        PortfolioContext {
            bot_id: self.config.id,
            cash: *cash,
            equity,
            open_positions: briefs,
        }
    }

    async fn require_ledger(&self) -> Result<crate::ledger::CapitalLedger, EngineError> {
        self.store
            .ledger(self.config.id)
            .await?
            .ok_or_else(|| EngineError::Fatal(format!("ledger missing for bot {}", self.config.id)))
    }

    /// Persist an equity snapshot and refresh health in one step.
    async fn record_equity_and_health(
        &self,
        snapshots: &[MarketSnapshot],
        phase: CyclePhase,
    ) -> Result<(), EngineError> {
        let bot_id = self.config.id;
        let ledger = self.require_ledger().await?;
        let open_positions = self.store.open_positions(bot_id).await?;

        let unrealized: Decimal = open_positions
            .iter()
            .map(|p| {
                let price = snapshots
                    .iter()
                    .find(|s| s.symbol == p.symbol)
                    .map(|s| s.price)
                    .unwrap_or(p.current_price);
                p.unrealized_pnl(price)
            })
            .sum();
        let committed: Decimal = open_positions.iter().map(|p| p.margin).sum();
        let equity = ledger.cash + committed + unrealized;

        self.store
            .record_equity(EquitySnapshot {
                bot_id,
                timestamp: Utc::now(),
                equity,
                cash: ledger.cash,
                unrealized_pnl: unrealized,
            })
            .await?;

        let mut health = self.current_health().await;
        health.phase = phase;
        health.trades_today = self.store.entry_trades_today(bot_id).await?;
        health.open_positions = open_positions.len();
        health.equity = equity;
        health.updated_at = Utc::now();
        self.store.update_health(health).await
    }

    /// Best-effort close of all open positions during shutdown. Failures are
    /// logged, never propagated.
    async fn wind_down(&self) {
        let positions = match self.store.open_positions(self.config.id).await {
            Ok(positions) => positions,
            Err(e) => {
                warn!(bot = %self.config.id, error = %e, "could not list positions at shutdown");
                return;
            }
        };
        for position in positions {
            let price = match self.market.fetch_ticker(&position.symbol).await {
                Ok(Some(ticker)) => ticker.price,
                _ => position.current_price,
            };
            match self.execution.close(&position, price, "bot stopped").await {
                Ok(trade) => info!(
                    bot = %self.config.id,
                    symbol = %position.symbol,
                    pnl = %trade.realized_pnl,
                    "position closed at shutdown"
                ),
                Err(e) => warn!(
                    bot = %self.config.id,
                    symbol = %position.symbol,
                    error = %e,
                    "failed to close position at shutdown"
                ),
            }
        }
    }

    async fn current_health(&self) -> BotHealth {
        match self.store.health(self.config.id).await {
            Ok(Some(health)) => health,
            _ => BotHealth::new(self.config.id),
        }
    }

    async fn set_phase(&self, phase: CyclePhase) {
        let mut health = self.current_health().await;
        health.phase = phase;
        health.updated_at = Utc::now();
        if let Err(e) = self.store.update_health(health).await {
            warn!(bot = %self.config.id, error = %e, "health update failed");
        }
    }

    async fn record_error(&self, error: &EngineError) {
        let mut health = self.current_health().await;
        health.last_error = Some(error.to_string());
        health.updated_at = Utc::now();
        let _ = self.store.update_health(health).await;
    }

    async fn record_rejection(&self, reason: &str) {
        let mut health = self.current_health().await;
        health.last_rejection = Some(reason.to_string());
        health.updated_at = Utc::now();
        let _ = self.store.update_health(health).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use crate::config::BotConfig;
    use crate::error::ExecutionError;
    use crate::ledger::Side;
    use crate::market::{Candle, Ticker, Timeframe};
    use crate::provider::{Fill, OrderExecutionProvider, PaperExecution};
    use crate::signal::Signal;
    use crate::store::MemoryStore;

    /// Market stub with a scripted price; no candle history.
    struct PricedMarket {
        price: Mutex<Option<Decimal>>,
    }

    impl PricedMarket {
        fn new(price: Option<Decimal>) -> Self {
            Self { price: Mutex::new(price) }
        }
    }

    #[async_trait]
    impl MarketDataProvider for PricedMarket {
        async fn fetch_ticker(&self, symbol: &str) -> Result<Option<Ticker>, EngineError> {
            Ok(self.price.lock().await.map(|price| Ticker {
                symbol: symbol.to_string(),
                price,
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

    /// Decision stub that returns fixed signals.
    struct Scripted {
        signals: HashMap<String, Signal>,
    }

    #[async_trait]
    impl DecisionProvider for Scripted {
        async fn decide(
            &self,
            _snapshots: &[MarketSnapshot],
            _context: &PortfolioContext,
            _config: &BotConfig,
        ) -> Result<HashMap<String, Signal>, EngineError> {
            Ok(self.signals.clone())
        }
    }

    async fn setup(
        price: Option<Decimal>,
        signals: HashMap<String, Signal>,
    ) -> (CycleOrchestrator, Arc<MemoryStore>, BotConfig, watch::Sender<bool>) {
        let store = Arc::new(MemoryStore::new());
        let config = BotConfig::paper("orch-test", vec!["BTC-PERP".into()]);
        store.upsert_bot(config.clone()).await.unwrap();

        let venue = Arc::new(PaperExecution::with_rates(Decimal::ZERO, 0));
        let execution = ExecutionEngine::new(store.clone(), venue);
        let market = Arc::new(PricedMarket::new(price));
        let (tx, rx) = watch::channel(false);
        let orchestrator = CycleOrchestrator::new(
            config.clone(),
            store.clone(),
            market,
            Arc::new(Scripted { signals }),
            execution,
            rx,
        );
        (orchestrator, store, config, tx)
    }

    fn entry_signal() -> Signal {
        Signal::entry("BTC-PERP", Side::Long, 0.85, "scripted entry")
            .with_prices(Decimal::from(50_000), Decimal::from(49_000), Decimal::from(52_000))
            .with_size(Decimal::new(10, 2), Decimal::from(5))
    }

    #[tokio::test]
    async fn test_no_data_cycle_skips_to_sleep() {
        let (orchestrator, store, config, _tx) = setup(None, HashMap::new()).await;
        let report = orchestrator.run_cycle().await.unwrap();

        assert_eq!(report.snapshots, 0);
        assert_eq!(report.entries, 0);
        let health = store.health(config.id).await.unwrap().unwrap();
        assert_eq!(health.phase, CyclePhase::Sleeping);
        // Equity still recorded on an empty cycle.
        assert_eq!(health.equity, Decimal::from(10_000));
    }

    #[tokio::test]
    async fn test_scripted_entry_is_validated_and_executed() {
        let signals = HashMap::from([("BTC-PERP".to_string(), entry_signal())]);
        let (orchestrator, store, config, _tx) = setup(Some(Decimal::from(50_000)), signals).await;

        let report = orchestrator.run_cycle().await.unwrap();
        assert_eq!(report.entries, 1);
        assert_eq!(report.rejections, 0);

        let positions = store.open_positions(config.id).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].margin, Decimal::from(1_000));
        assert_eq!(store.ledger(config.id).await.unwrap().unwrap().cash, Decimal::from(9_000));
    }

    #[tokio::test]
    async fn test_second_entry_same_symbol_rejected_not_duplicated() {
        let signals = HashMap::from([("BTC-PERP".to_string(), entry_signal())]);
        let (orchestrator, store, config, _tx) = setup(Some(Decimal::from(50_000)), signals).await;

        orchestrator.run_cycle().await.unwrap();
        let report = orchestrator.run_cycle().await.unwrap();

        // Same signal again; pyramiding needs profit, price has not moved.
        assert_eq!(report.entries, 0);
        assert_eq!(report.rejections, 1);
        assert_eq!(store.open_positions(config.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_hit_closes_before_entry_work() {
        let signals = HashMap::from([("BTC-PERP".to_string(), entry_signal())]);
        let (orchestrator, store, config, _tx) = setup(Some(Decimal::from(50_000)), signals).await;
        orchestrator.run_cycle().await.unwrap();

        // Price gaps through the stop.
        {
            let market = PricedMarket::new(Some(Decimal::from(48_500)));
            let venue = Arc::new(PaperExecution::with_rates(Decimal::ZERO, 0));
            let execution = ExecutionEngine::new(store.clone(), venue);
            let (_tx, rx) = watch::channel(false);
            let orchestrator = CycleOrchestrator::new(
                config.clone(),
                store.clone(),
                Arc::new(market),
                Arc::new(Scripted { signals: HashMap::new() }),
                execution,
                rx,
            );
            let report = orchestrator.run_cycle().await.unwrap();
            assert_eq!(report.exits, 1);
        }

        assert!(store.open_positions(config.id).await.unwrap().is_empty());
        // 0.1 BTC, entry 50000, exit 48500: loss 150
        assert_eq!(store.ledger(config.id).await.unwrap().unwrap().cash, Decimal::from(9_850));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_and_closes_positions() {
        let signals = HashMap::from([("BTC-PERP".to_string(), entry_signal())]);
        let (orchestrator, store, config, _tx) = setup(Some(Decimal::from(50_000)), signals).await;
        orchestrator.run_cycle().await.unwrap();
        assert_eq!(store.open_positions(config.id).await.unwrap().len(), 1);

        let venue = Arc::new(PaperExecution::with_rates(Decimal::ZERO, 0));
        let execution = ExecutionEngine::new(store.clone(), venue);
        let (tx, rx) = watch::channel(false);
        let orchestrator = CycleOrchestrator::new(
            config.clone(),
            store.clone(),
            Arc::new(PricedMarket::new(Some(Decimal::from(50_000)))),
            Arc::new(Scripted { signals: HashMap::new() }),
            execution,
            rx,
        );

        let handle = tokio::spawn(orchestrator.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert!(store.open_positions(config.id).await.unwrap().is_empty());
        assert_eq!(store.status(config.id).await.unwrap(), Some(BotStatus::Stopped));
        let health = store.health(config.id).await.unwrap().unwrap();
        assert_eq!(health.phase, CyclePhase::Stopped);
    }

    /// Market stub whose ticker fetch suspends long enough for a stop to
    /// land mid-cycle.
    struct SlowMarket {
        delay: Duration,
    }

    #[async_trait]
    impl MarketDataProvider for SlowMarket {
        async fn fetch_ticker(&self, symbol: &str) -> Result<Option<Ticker>, EngineError> {
            tokio::time::sleep(self.delay).await;
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

    #[tokio::test]
    async fn test_stop_during_fetch_aborts_before_any_entry() {
        let store = Arc::new(MemoryStore::new());
        let config = BotConfig::paper("orch-test", vec!["BTC-PERP".into()]);
        store.upsert_bot(config.clone()).await.unwrap();

        // The scripted entry would open if the cycle ran to completion.
        let signals = HashMap::from([("BTC-PERP".to_string(), entry_signal())]);
        let venue = Arc::new(PaperExecution::with_rates(Decimal::ZERO, 0));
        let (tx, rx) = watch::channel(false);
        let orchestrator = CycleOrchestrator::new(
            config.clone(),
            store.clone(),
            Arc::new(SlowMarket { delay: Duration::from_millis(300) }),
            Arc::new(Scripted { signals }),
            ExecutionEngine::new(store.clone(), venue),
            rx,
        );

        let handle = tokio::spawn(orchestrator.run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        // Stop landed while the fetch was suspended: the cycle aborted and
        // no trade was ever executed.
        assert!(store.trades(config.id).await.unwrap().is_empty());
        assert!(store.open_positions(config.id).await.unwrap().is_empty());
        assert_eq!(store.status(config.id).await.unwrap(), Some(BotStatus::Stopped));
    }

    /// Venue that rejects one symbol and fills the rest normally.
    struct FlakyVenue {
        failing: String,
        inner: PaperExecution,
    }

    #[async_trait]
    impl OrderExecutionProvider for FlakyVenue {
        async fn open(
            &self,
            symbol: &str,
            side: Side,
            quantity: Decimal,
            market_price: Decimal,
        ) -> Result<Fill, EngineError> {
            if symbol == self.failing {
                return Err(EngineError::Execution(ExecutionError::InsufficientData(
                    format!("venue rejected {symbol}"),
                )));
            }
            self.inner.open(symbol, side, quantity, market_price).await
        }

        async fn close(
            &self,
            symbol: &str,
            side: Side,
            quantity: Decimal,
            market_price: Decimal,
        ) -> Result<Fill, EngineError> {
            if symbol == self.failing {
                return Err(EngineError::Execution(ExecutionError::InsufficientData(
                    format!("venue rejected {symbol}"),
                )));
            }
            self.inner.close(symbol, side, quantity, market_price).await
        }
    }

    #[tokio::test]
    async fn test_failed_execution_abandons_only_that_decision() {
        let store = Arc::new(MemoryStore::new());
        let config =
            BotConfig::paper("orch-test", vec!["BTC-PERP".into(), "ETH-PERP".into()]);
        store.upsert_bot(config.clone()).await.unwrap();

        let eth_entry = {
            let mut signal = entry_signal();
            signal.symbol = "ETH-PERP".into();
            signal
        };
        let signals = HashMap::from([
            ("BTC-PERP".to_string(), entry_signal()),
            ("ETH-PERP".to_string(), eth_entry),
        ]);

        let venue = Arc::new(FlakyVenue {
            failing: "BTC-PERP".into(),
            inner: PaperExecution::with_rates(Decimal::ZERO, 0),
        });
        let (_tx, rx) = watch::channel(false);
        let orchestrator = CycleOrchestrator::new(
            config.clone(),
            store.clone(),
            Arc::new(PricedMarket::new(Some(Decimal::from(50_000)))),
            Arc::new(Scripted { signals }),
            ExecutionEngine::new(store.clone(), venue),
            rx,
        );

        // The cycle completes: the failed BTC entry is abandoned, the ETH
        // entry still executes, and equity is still recorded.
        let report = orchestrator.run_cycle().await.unwrap();
        assert_eq!(report.entries, 1);

        let positions = store.open_positions(config.id).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].symbol, "ETH-PERP");

        let health = store.health(config.id).await.unwrap().unwrap();
        assert_eq!(health.phase, CyclePhase::Sleeping);
        assert!(health.last_error.as_deref().unwrap_or("").contains("venue rejected"));
    }
}
