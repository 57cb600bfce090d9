//! Integration tests for perpbot

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use tokio::sync::watch;
    use uuid::Uuid;

    use crate::config::BotConfig;
    use crate::decision::{DecisionProvider, DeterministicConfluence, PortfolioContext};
    use crate::error::{EngineError, ExecutionError};
    use crate::execution::ExecutionEngine;
    use crate::ledger::{Position, PositionStatus, Side};
    use crate::market::{Candle, MarketSnapshot, Ticker, Timeframe};
    use crate::orchestrator::{CycleOrchestrator, CyclePhase};
    use crate::provider::{MarketDataProvider, PaperExecution};
    use crate::risk::{ApprovedOrder, RejectReason, RiskValidator};
    use crate::signal::Signal;
    use crate::store::{MemoryStore, PersistenceStore};
    use crate::SignalGenerator;

    /// Market stub serving a fixed ticker price and an optional synthetic
    /// candle history.
    struct StubMarket {
        price: Decimal,
        candles: bool,
    }

    #[async_trait]
    impl MarketDataProvider for StubMarket {
        async fn fetch_ticker(&self, symbol: &str) -> Result<Option<Ticker>, EngineError> {
            Ok(Some(Ticker {
                symbol: symbol.to_string(),
                price: self.price,
                change_24h_pct: None,
                volume_24h: None,
                timestamp: Utc::now(),
            }))
        }

        async fn fetch_ohlcv(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            limit: usize,
        ) -> Result<Option<Vec<Candle>>, EngineError> {
            if !self.candles {
                return Ok(None);
            }
            Ok(Some(uptrend(limit)))
        }
    }

    struct ScriptedDecisions {
        signals: HashMap<String, Signal>,
    }

    #[async_trait]
    impl DecisionProvider for ScriptedDecisions {
        async fn decide(
            &self,
            _snapshots: &[MarketSnapshot],
            _context: &PortfolioContext,
            _config: &BotConfig,
        ) -> Result<HashMap<String, Signal>, EngineError> {
            Ok(self.signals.clone())
        }
    }

    /// Gently rising series: close climbs one cent per candle.
    fn uptrend(len: usize) -> Vec<Candle> {
        (0..len)
            .map(|i| {
                let close = Decimal::from(5_000_000 + i as i64) / Decimal::from(100);
                Candle {
                    timestamp: Utc::now(),
                    open: close - Decimal::new(1, 2),
                    high: close + Decimal::new(5, 2),
                    low: close - Decimal::new(5, 2),
                    close,
                    volume: Decimal::from(1_000),
                }
            })
            .collect()
    }

    async fn seeded_store() -> (Arc<MemoryStore>, BotConfig) {
        let store = Arc::new(MemoryStore::new());
        let config = BotConfig::paper("itest", vec!["BTC-PERP".into()]);
        store.upsert_bot(config.clone()).await.unwrap();
        (store, config)
    }

    fn long_order(margin: i64) -> ApprovedOrder {
        ApprovedOrder {
            symbol: "BTC-PERP".into(),
            side: Side::Long,
            margin: Decimal::from(margin),
            size_fraction: Decimal::new(10, 2),
            leverage: Decimal::from(5),
            entry_price: Decimal::from(50_000),
            stop_loss: Decimal::from(49_000),
            take_profit: Decimal::from(52_000),
            add_on_to: None,
            reasoning: "integration".into(),
        }
    }

    fn long_signal(size_pct: i64) -> Signal {
        Signal::entry("BTC-PERP", Side::Long, 0.85, "integration")
            .with_prices(Decimal::from(50_000), Decimal::from(49_000), Decimal::from(52_000))
            .with_size(Decimal::new(size_pct, 2), Decimal::from(5))
    }

    fn open_position(symbol: &str, margin: i64) -> Position {
        Position {
            id: Uuid::new_v4(),
            bot_id: Uuid::new_v4(),
            symbol: symbol.into(),
            side: Side::Long,
            quantity: Decimal::new(1, 1),
            leverage: Decimal::from(5),
            entry_price: Decimal::from(50_000),
            current_price: Decimal::from(50_000),
            stop_loss: Decimal::from(49_000),
            take_profit: Decimal::from(52_000),
            margin: Decimal::from(margin),
            entry_count: 1,
            status: PositionStatus::Open,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    #[tokio::test]
    async fn test_paper_round_trip_with_fees() {
        // 0.04% taker fee both ways: open fee 2.00, close fee 2.04
        let (store, config) = seeded_store().await;
        let venue = Arc::new(PaperExecution::with_rates(Decimal::new(4, 4), 0));
        let engine = ExecutionEngine::new(store.clone(), venue);

        let position =
            engine.open(config.id, &long_order(1_000), Decimal::from(50_000)).await.unwrap();
        assert_eq!(position.quantity, Decimal::new(1, 1));
        assert_eq!(
            store.ledger(config.id).await.unwrap().unwrap().cash,
            Decimal::from(8_998)
        );

        let trade = engine.close(&position, Decimal::from(51_000), "target").await.unwrap();
        assert_eq!(trade.realized_pnl, Decimal::from(100));
        assert_eq!(trade.fee, Decimal::new(204, 2));
        assert_eq!(
            store.ledger(config.id).await.unwrap().unwrap().cash,
            Decimal::new(1_009_596, 2)
        );
    }

    #[tokio::test]
    async fn test_concurrent_close_credits_exactly_once() {
        let (store, config) = seeded_store().await;
        let venue = Arc::new(PaperExecution::with_rates(Decimal::ZERO, 0));
        let engine = Arc::new(ExecutionEngine::new(store.clone(), venue));

        let position =
            engine.open(config.id, &long_order(1_000), Decimal::from(50_000)).await.unwrap();

        let a = {
            let engine = engine.clone();
            let position = position.clone();
            tokio::spawn(
                async move { engine.close(&position, Decimal::from(51_000), "race a").await },
            )
        };
        let b = {
            let engine = engine.clone();
            let position = position.clone();
            tokio::spawn(
                async move { engine.close(&position, Decimal::from(51_000), "race b").await },
            )
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let already_closed = results
            .iter()
            .filter(|r| {
                matches!(
                    r,
                    Err(EngineError::Execution(ExecutionError::AlreadyClosed(_)))
                )
            })
            .count();
        assert_eq!(ok, 1);
        assert_eq!(already_closed, 1);
        assert_eq!(
            store.ledger(config.id).await.unwrap().unwrap().cash,
            Decimal::from(10_100)
        );
    }

    #[tokio::test]
    async fn test_exposure_cap_blocks_fourth_position() {
        let (store, config) = seeded_store().await;

        // Three positions already committed at 10% each; capital is
        // cash (7000) + committed margin (3000) = 10000, cap is 30%.
        let mut ledger = store.ledger(config.id).await.unwrap().unwrap();
        ledger.cash = Decimal::from(7_000);
        let open = vec![
            open_position("ETH-PERP", 1_000),
            open_position("SOL-PERP", 1_000),
            open_position("AVAX-PERP", 1_000),
        ];

        let err = RiskValidator::validate(&long_signal(10), &ledger, &open, 3, &config)
            .unwrap_err();
        assert!(matches!(err, RejectReason::ExposureLimit { .. }));
    }

    #[tokio::test]
    async fn test_daily_cap_gates_before_anything_else() {
        let (store, config) = seeded_store().await;
        let ledger = store.ledger(config.id).await.unwrap().unwrap();

        let err = RiskValidator::validate(
            &long_signal(10),
            &ledger,
            &[],
            config.risk.max_trades_per_day,
            &config,
        )
        .unwrap_err();
        assert!(matches!(err, RejectReason::DailyTradeLimit { .. }));
    }

    #[tokio::test]
    async fn test_drawdown_floor_blocks_entries() {
        let (store, config) = seeded_store().await;
        let mut ledger = store.ledger(config.id).await.unwrap().unwrap();
        // 25% down from initial capital, floor is 20%.
        ledger.cash = Decimal::from(7_500);

        let err =
            RiskValidator::validate(&long_signal(10), &ledger, &[], 0, &config).unwrap_err();
        assert!(matches!(err, RejectReason::DrawdownLimit { .. }));
    }

    #[tokio::test]
    async fn test_take_profit_exit_settles_before_entries() {
        let (store, config) = seeded_store().await;
        let venue = Arc::new(PaperExecution::with_rates(Decimal::ZERO, 0));
        let engine = ExecutionEngine::new(store.clone(), venue.clone());
        engine.open(config.id, &long_order(1_000), Decimal::from(50_000)).await.unwrap();

        // Next cycle the price is through the target; the book is settled
        // before any entry work runs.
        let (_tx, rx) = watch::channel(false);
        let orchestrator = CycleOrchestrator::new(
            config.clone(),
            store.clone(),
            Arc::new(StubMarket { price: Decimal::from(52_500), candles: false }),
            Arc::new(ScriptedDecisions { signals: HashMap::new() }),
            ExecutionEngine::new(store.clone(), venue),
            rx,
        );
        let report = orchestrator.run_cycle().await.unwrap();

        assert_eq!(report.exits, 1);
        assert!(store.open_positions(config.id).await.unwrap().is_empty());
        // 0.1 @ entry 50000, exit 52500: +250
        assert_eq!(
            store.ledger(config.id).await.unwrap().unwrap().cash,
            Decimal::from(10_250)
        );
    }

    #[tokio::test]
    async fn test_full_cycle_with_history_records_equity() {
        let (store, config) = seeded_store().await;
        let venue = Arc::new(PaperExecution::with_rates(Decimal::ZERO, 0));

        let (_tx, rx) = watch::channel(false);
        let orchestrator = CycleOrchestrator::new(
            config.clone(),
            store.clone(),
            Arc::new(StubMarket { price: Decimal::from(50_002), candles: true }),
            Arc::new(DeterministicConfluence::new(SignalGenerator::new())),
            ExecutionEngine::new(store.clone(), venue),
            rx,
        );
        let report = orchestrator.run_cycle().await.unwrap();

        assert_eq!(report.snapshots, 1);
        let health = store.health(config.id).await.unwrap().unwrap();
        assert_eq!(health.phase, CyclePhase::Sleeping);
        assert!(health.equity > Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_validated_entry_flows_through_orchestrator() {
        let (store, config) = seeded_store().await;
        let venue = Arc::new(PaperExecution::with_rates(Decimal::ZERO, 0));
        let signals = HashMap::from([("BTC-PERP".to_string(), long_signal(10))]);

        let (_tx, rx) = watch::channel(false);
        let orchestrator = CycleOrchestrator::new(
            config.clone(),
            store.clone(),
            Arc::new(StubMarket { price: Decimal::from(50_000), candles: false }),
            Arc::new(ScriptedDecisions { signals }),
            ExecutionEngine::new(store.clone(), venue),
            rx,
        );
        let report = orchestrator.run_cycle().await.unwrap();

        assert_eq!(report.entries, 1);
        let positions = store.open_positions(config.id).await.unwrap();
        assert_eq!(positions.len(), 1);
        // capital 10000 x 0.10 = 1000 margin, x5 leverage = 5000 notional
        assert_eq!(positions[0].margin, Decimal::from(1_000));
        assert_eq!(positions[0].notional(), Decimal::from(5_000));

        // An oversized follow-up is rejected, not shrunk.
        let (_tx, rx) = watch::channel(false);
        let signals = HashMap::from([("ETH-PERP".to_string(), {
            let mut signal = long_signal(35);
            signal.symbol = "ETH-PERP".into();
            signal
        })]);
        let mut eth_config = config.clone();
        eth_config.symbols = vec!["ETH-PERP".into()];
        let orchestrator = CycleOrchestrator::new(
            eth_config,
            store.clone(),
            Arc::new(StubMarket { price: Decimal::from(3_000), candles: false }),
            Arc::new(ScriptedDecisions { signals }),
            ExecutionEngine::new(
                store.clone(),
                Arc::new(PaperExecution::with_rates(Decimal::ZERO, 0)),
            ),
            rx,
        );
        let report = orchestrator.run_cycle().await.unwrap();
        assert_eq!(report.entries, 0);
        assert_eq!(report.rejections, 1);
        let health = store.health(config.id).await.unwrap().unwrap();
        assert!(health.last_rejection.is_some());
    }
}
