//! Persistence seam - store trait and the in-memory implementation
//!
//! The store owns the state that survives restarts: bot config/status,
//! positions, trades, ledgers and equity history. Open/Close mutations go
//! through atomic transactions serialized per bot; operations for different
//! bots never block each other.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::config::{BotConfig, BotStatus};
use crate::error::{EngineError, ExecutionError};
use crate::ledger::{CapitalLedger, EquitySnapshot, Position, Trade};
use crate::orchestrator::CyclePhase;

/// Runtime health of a bot, queryable without inspecting logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotHealth {
    pub bot_id: Uuid,
    pub phase: CyclePhase,
    pub last_error: Option<String>,
    pub last_rejection: Option<String>,
    pub trades_today: u32,
    pub open_positions: usize,
    pub equity: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl BotHealth {
    pub fn new(bot_id: Uuid) -> Self {
        Self {
            bot_id,
            phase: CyclePhase::Idle,
            last_error: None,
            last_rejection: None,
            trades_today: 0,
            open_positions: 0,
            equity: Decimal::ZERO,
            updated_at: Utc::now(),
        }
    }
}

/// One atomic position-open (or pyramid merge) against the ledger.
#[derive(Debug, Clone)]
pub struct OpenTransaction {
    pub bot_id: Uuid,
    /// New position, or the merged replacement carrying an existing id.
    pub position: Position,
    pub trade: Trade,
    /// Negative: margin plus entry fee leaving cash.
    pub cash_delta: Decimal,
}

/// One atomic position-close against the ledger.
#[derive(Debug, Clone)]
pub struct CloseTransaction {
    pub bot_id: Uuid,
    pub position_id: Uuid,
    pub exit_price: Decimal,
    pub trade: Trade,
    /// Margin plus realized PnL minus exit fee returning to cash.
    pub cash_delta: Decimal,
    pub closed_at: DateTime<Utc>,
}

/// Minimum persistence contract for the trading core.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn upsert_bot(&self, config: BotConfig) -> Result<(), EngineError>;
    async fn load_config(&self, bot_id: Uuid) -> Result<Option<BotConfig>, EngineError>;
    async fn list_statuses(&self) -> Result<Vec<(Uuid, BotStatus)>, EngineError>;
    async fn status(&self, bot_id: Uuid) -> Result<Option<BotStatus>, EngineError>;
    async fn set_status(&self, bot_id: Uuid, status: BotStatus) -> Result<(), EngineError>;

    async fn ledger(&self, bot_id: Uuid) -> Result<Option<CapitalLedger>, EngineError>;
    async fn open_positions(&self, bot_id: Uuid) -> Result<Vec<Position>, EngineError>;
    async fn trades(&self, bot_id: Uuid) -> Result<Vec<Trade>, EngineError>;
    /// Entry trades executed since UTC midnight.
    async fn entry_trades_today(&self, bot_id: Uuid) -> Result<u32, EngineError>;

    /// Atomically apply one open (or pyramid merge): debit cash, upsert the
    /// position, append the trade. All-or-nothing.
    async fn apply_open(&self, tx: OpenTransaction) -> Result<(), EngineError>;
    /// Atomically apply one close: credit cash, mark the position closed,
    /// append the trade. Fails with `AlreadyClosed` on a non-open position.
    async fn apply_close(&self, tx: CloseTransaction) -> Result<(), EngineError>;

    async fn record_equity(&self, snapshot: EquitySnapshot) -> Result<(), EngineError>;
    async fn update_health(&self, health: BotHealth) -> Result<(), EngineError>;
    async fn health(&self, bot_id: Uuid) -> Result<Option<BotHealth>, EngineError>;
}

#[derive(Debug)]
struct BotRecord {
    config: BotConfig,
    status: BotStatus,
    ledger: CapitalLedger,
    positions: HashMap<Uuid, Position>,
    trades: Vec<Trade>,
    equity: Vec<EquitySnapshot>,
    health: BotHealth,
}

/// In-memory store. Reads go through a shared `RwLock`; Open/Close
/// transactions additionally hold a per-bot mutex so that same-bot mutations
/// are serialized while unrelated bots proceed concurrently.
pub struct MemoryStore {
    bots: RwLock<HashMap<Uuid, BotRecord>>,
    tx_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { bots: RwLock::new(HashMap::new()), tx_locks: Mutex::new(HashMap::new()) }
    }

    async fn tx_lock(&self, bot_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.tx_locks.lock().await;
        locks.entry(bot_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn upsert_bot(&self, config: BotConfig) -> Result<(), EngineError> {
        let mut bots = self.bots.write().await;
        let bot_id = config.id;
        bots.entry(bot_id)
            .and_modify(|record| record.config = config.clone())
            .or_insert_with(|| BotRecord {
                ledger: CapitalLedger::new(bot_id, config.initial_capital),
                config,
                status: BotStatus::Stopped,
                positions: HashMap::new(),
                trades: Vec::new(),
                equity: Vec::new(),
                health: BotHealth::new(bot_id),
            });
        Ok(())
    }

    async fn load_config(&self, bot_id: Uuid) -> Result<Option<BotConfig>, EngineError> {
        Ok(self.bots.read().await.get(&bot_id).map(|r| r.config.clone()))
    }

    async fn list_statuses(&self) -> Result<Vec<(Uuid, BotStatus)>, EngineError> {
        Ok(self.bots.read().await.iter().map(|(id, r)| (*id, r.status)).collect())
    }

    async fn status(&self, bot_id: Uuid) -> Result<Option<BotStatus>, EngineError> {
        Ok(self.bots.read().await.get(&bot_id).map(|r| r.status))
    }

    async fn set_status(&self, bot_id: Uuid, status: BotStatus) -> Result<(), EngineError> {
        let mut bots = self.bots.write().await;
        let record = bots
            .get_mut(&bot_id)
            .ok_or(EngineError::Execution(ExecutionError::BotNotFound(bot_id)))?;
        record.status = status;
        Ok(())
    }

    async fn ledger(&self, bot_id: Uuid) -> Result<Option<CapitalLedger>, EngineError> {
        Ok(self.bots.read().await.get(&bot_id).map(|r| r.ledger.clone()))
    }

    async fn open_positions(&self, bot_id: Uuid) -> Result<Vec<Position>, EngineError> {
        Ok(self
            .bots
            .read()
            .await
            .get(&bot_id)
            .map(|r| r.positions.values().filter(|p| p.is_open()).cloned().collect())
            .unwrap_or_default())
    }

    async fn trades(&self, bot_id: Uuid) -> Result<Vec<Trade>, EngineError> {
        Ok(self.bots.read().await.get(&bot_id).map(|r| r.trades.clone()).unwrap_or_default())
    }

    async fn entry_trades_today(&self, bot_id: Uuid) -> Result<u32, EngineError> {
        let midnight = Utc::now().date_naive().and_hms_opt(0, 0, 0).unwrap_or_default().and_utc();
        Ok(self
            .bots
            .read()
            .await
            .get(&bot_id)
            .map(|r| {
                r.trades
                    .iter()
                    .filter(|t| {
                        t.action == crate::ledger::TradeAction::Entry && t.executed_at >= midnight
                    })
                    .count() as u32
            })
            .unwrap_or(0))
    }

    async fn apply_open(&self, tx: OpenTransaction) -> Result<(), EngineError> {
        let lock = self.tx_lock(tx.bot_id).await;
        let _guard = lock.lock().await;

        let mut bots = self.bots.write().await;
        let record = bots
            .get_mut(&tx.bot_id)
            .ok_or(EngineError::Execution(ExecutionError::BotNotFound(tx.bot_id)))?;

        let new_cash = record.ledger.cash + tx.cash_delta;
        if new_cash < Decimal::ZERO {
            return Err(EngineError::Execution(ExecutionError::InsufficientFunds {
                needed: -tx.cash_delta,
                available: record.ledger.cash,
            }));
        }

        match record.positions.get(&tx.position.id) {
            Some(existing) if !existing.is_open() => {
                return Err(EngineError::Execution(ExecutionError::AlreadyClosed(tx.position.id)));
            }
            Some(_) => {}
            None => {
                // One open position per (bot, symbol)
                let clash = record
                    .positions
                    .values()
                    .any(|p| p.is_open() && p.symbol == tx.position.symbol);
                if clash {
                    return Err(EngineError::Execution(ExecutionError::PositionExists(
                        tx.position.symbol.clone(),
                    )));
                }
            }
        }

        record.ledger.cash = new_cash;
        record.positions.insert(tx.position.id, tx.position);
        record.trades.push(tx.trade);
        Ok(())
    }

    async fn apply_close(&self, tx: CloseTransaction) -> Result<(), EngineError> {
        let lock = self.tx_lock(tx.bot_id).await;
        let _guard = lock.lock().await;

        let mut bots = self.bots.write().await;
        let record = bots
            .get_mut(&tx.bot_id)
            .ok_or(EngineError::Execution(ExecutionError::BotNotFound(tx.bot_id)))?;

        let position = record
            .positions
            .get_mut(&tx.position_id)
            .ok_or(EngineError::Execution(ExecutionError::PositionNotFound(tx.position_id)))?;
        if !position.is_open() {
            return Err(EngineError::Execution(ExecutionError::AlreadyClosed(tx.position_id)));
        }

        position.status = crate::ledger::PositionStatus::Closed;
        position.closed_at = Some(tx.closed_at);
        position.current_price = tx.exit_price;
        record.ledger.cash += tx.cash_delta;
        record.trades.push(tx.trade);
        Ok(())
    }

    async fn record_equity(&self, snapshot: EquitySnapshot) -> Result<(), EngineError> {
        let mut bots = self.bots.write().await;
        if let Some(record) = bots.get_mut(&snapshot.bot_id) {
            record.equity.push(snapshot);
        }
        Ok(())
    }

    async fn update_health(&self, health: BotHealth) -> Result<(), EngineError> {
        let mut bots = self.bots.write().await;
        if let Some(record) = bots.get_mut(&health.bot_id) {
            record.health = health;
        }
        Ok(())
    }

    async fn health(&self, bot_id: Uuid) -> Result<Option<BotHealth>, EngineError> {
        Ok(self.bots.read().await.get(&bot_id).map(|r| r.health.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{PositionStatus, Side, TradeAction};

    async fn seed_bot(store: &MemoryStore) -> BotConfig {
        let config = BotConfig::paper("store-test", vec!["BTC-PERP".into()]);
        store.upsert_bot(config.clone()).await.unwrap();
        config
    }

    fn open_tx(bot_id: Uuid, symbol: &str) -> OpenTransaction {
        let position_id = Uuid::new_v4();
        OpenTransaction {
            bot_id,
            position: Position {
                id: position_id,
                bot_id,
                symbol: symbol.into(),
                side: Side::Long,
                quantity: Decimal::new(1, 1),
                leverage: Decimal::from(5),
                entry_price: Decimal::from(50_000),
                current_price: Decimal::from(50_000),
                stop_loss: Decimal::from(49_000),
                take_profit: Decimal::from(52_000),
                margin: Decimal::from(1_000),
                entry_count: 1,
                status: PositionStatus::Open,
                opened_at: Utc::now(),
                closed_at: None,
            },
            trade: Trade {
                id: Uuid::new_v4(),
                position_id,
                bot_id,
                symbol: symbol.into(),
                side: Side::Long,
                action: TradeAction::Entry,
                price: Decimal::from(50_000),
                quantity: Decimal::new(1, 1),
                fee: Decimal::ZERO,
                realized_pnl: Decimal::ZERO,
                reason: "test".into(),
                executed_at: Utc::now(),
            },
            cash_delta: Decimal::from(-1_000),
        }
    }

    #[tokio::test]
    async fn test_open_debits_cash_and_stores_position() {
        let store = MemoryStore::new();
        let config = seed_bot(&store).await;

        store.apply_open(open_tx(config.id, "BTC-PERP")).await.unwrap();

        let ledger = store.ledger(config.id).await.unwrap().unwrap();
        assert_eq!(ledger.cash, Decimal::from(9_000));
        assert_eq!(store.open_positions(config.id).await.unwrap().len(), 1);
        assert_eq!(store.entry_trades_today(config.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_second_open_same_symbol_rejected() {
        let store = MemoryStore::new();
        let config = seed_bot(&store).await;

        store.apply_open(open_tx(config.id, "BTC-PERP")).await.unwrap();
        let err = store.apply_open(open_tx(config.id, "BTC-PERP")).await.unwrap_err();
        assert!(matches!(err, EngineError::Execution(ExecutionError::PositionExists(_))));

        // Ledger unchanged by the failed transaction
        let ledger = store.ledger(config.id).await.unwrap().unwrap();
        assert_eq!(ledger.cash, Decimal::from(9_000));
    }

    #[tokio::test]
    async fn test_insufficient_funds_leaves_state_untouched() {
        let store = MemoryStore::new();
        let config = seed_bot(&store).await;

        let mut tx = open_tx(config.id, "BTC-PERP");
        tx.cash_delta = Decimal::from(-20_000);
        let err = store.apply_open(tx).await.unwrap_err();
        assert!(matches!(err, EngineError::Execution(ExecutionError::InsufficientFunds { .. })));
        assert!(store.open_positions(config.id).await.unwrap().is_empty());
        assert_eq!(store.ledger(config.id).await.unwrap().unwrap().cash, Decimal::from(10_000));
    }

    #[tokio::test]
    async fn test_close_is_not_idempotent() {
        let store = MemoryStore::new();
        let config = seed_bot(&store).await;

        let open = open_tx(config.id, "BTC-PERP");
        let position_id = open.position.id;
        store.apply_open(open).await.unwrap();

        let close = CloseTransaction {
            bot_id: config.id,
            position_id,
            exit_price: Decimal::from(51_000),
            trade: Trade {
                id: Uuid::new_v4(),
                position_id,
                bot_id: config.id,
                symbol: "BTC-PERP".into(),
                side: Side::Long,
                action: TradeAction::Exit,
                price: Decimal::from(51_000),
                quantity: Decimal::new(1, 1),
                fee: Decimal::ZERO,
                realized_pnl: Decimal::from(100),
                reason: "test".into(),
                executed_at: Utc::now(),
            },
            cash_delta: Decimal::from(1_100),
            closed_at: Utc::now(),
        };

        store.apply_close(close.clone()).await.unwrap();
        let err = store.apply_close(close).await.unwrap_err();
        assert!(matches!(err, EngineError::Execution(ExecutionError::AlreadyClosed(_))));

        // Cash credited exactly once
        assert_eq!(store.ledger(config.id).await.unwrap().unwrap().cash, Decimal::from(10_100));
    }

    #[tokio::test]
    async fn test_unknown_bot_is_bot_not_found() {
        let store = MemoryStore::new();
        let err = store.apply_open(open_tx(Uuid::new_v4(), "BTC-PERP")).await.unwrap_err();
        assert!(matches!(err, EngineError::Execution(ExecutionError::BotNotFound(_))));
    }
}
