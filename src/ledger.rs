//! Capital ledger, positions, trades and equity snapshots

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "long"),
            Side::Short => write!(f, "short"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// A leveraged perpetual-swap position.
///
/// At most one open position exists per (bot, symbol); pyramid add-ons merge
/// into the existing position rather than opening a second one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub leverage: Decimal,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    /// Capital committed: notional / leverage.
    pub margin: Decimal,
    /// Number of entries merged into this position (1 or 2 with pyramiding).
    pub entry_count: u32,
    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    pub fn notional(&self) -> Decimal {
        self.quantity * self.entry_price
    }

    /// Unrealized PnL at `price`, sign-flipped for shorts.
    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        let raw = (price - self.entry_price) * self.quantity;
        match self.side {
            Side::Long => raw,
            Side::Short => -raw,
        }
    }

    /// Whether `price` has touched the stop-loss for this direction.
    pub fn stop_hit(&self, price: Decimal) -> bool {
        match self.side {
            Side::Long => price <= self.stop_loss,
            Side::Short => price >= self.stop_loss,
        }
    }

    /// Whether `price` has reached the take-profit for this direction.
    pub fn target_hit(&self, price: Decimal) -> bool {
        match self.side {
            Side::Long => price >= self.take_profit,
            Side::Short => price <= self.take_profit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeAction {
    Entry,
    Exit,
}

/// Immutable record of one execution, always linked to its position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub position_id: Uuid,
    pub bot_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub action: TradeAction,
    pub price: Decimal,
    pub quantity: Decimal,
    pub fee: Decimal,
    pub realized_pnl: Decimal,
    pub reason: String,
    pub executed_at: DateTime<Utc>,
}

/// Per-bot capital ledger. Mutated only by the execution engine, exactly
/// once per executed entry or exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapitalLedger {
    pub bot_id: Uuid,
    pub cash: Decimal,
    pub initial_capital: Decimal,
}

impl CapitalLedger {
    pub fn new(bot_id: Uuid, initial_capital: Decimal) -> Self {
        Self { bot_id, cash: initial_capital, initial_capital }
    }

    /// Cash plus margin committed to the given open positions.
    pub fn capital_with(&self, open_positions: &[Position]) -> Decimal {
        self.cash + open_positions.iter().map(|p| p.margin).sum::<Decimal>()
    }
}

/// Point-in-time equity record, append-only reporting series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquitySnapshot {
    pub bot_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub equity: Decimal,
    pub cash: Decimal,
    pub unrealized_pnl: Decimal,
}
