//! Bot configuration

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::market::Timeframe;

/// Per-bot trading configuration.
///
/// Loaded once when a bot's orchestrator starts and treated as read-only for
/// its lifetime; changing config requires restarting that bot.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BotConfig {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    /// Perpetual-swap symbols this bot trades, e.g. "BTC-PERP".
    pub symbols: Vec<String>,
    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval_secs: u64,
    /// Short timeframe used for entries.
    #[serde(default = "default_entry_timeframe")]
    pub entry_timeframe: Timeframe,
    /// Longer timeframe used for regime context.
    #[serde(default = "default_regime_timeframe")]
    pub regime_timeframe: Timeframe,
    #[serde(default)]
    pub risk: RiskLimits,
    #[serde(default)]
    pub decision_mode: DecisionMode,
    #[serde(default)]
    pub trading_mode: TradingMode,
    #[serde(default = "default_leverage")]
    pub leverage: Decimal,
    #[serde(default = "default_initial_capital")]
    pub initial_capital: Decimal,
}

/// Risk limits enforced by the validator before every entry.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct RiskLimits {
    /// Maximum size of one position as a fraction of capital.
    #[serde(default = "default_max_position_fraction")]
    pub max_position_fraction: Decimal,
    /// Maximum total margin across open positions as a fraction of capital.
    #[serde(default = "default_max_exposure_fraction")]
    pub max_exposure_fraction: Decimal,
    /// Drawdown from initial capital beyond which new entries are blocked.
    #[serde(default = "default_max_drawdown_fraction")]
    pub max_drawdown_fraction: Decimal,
    #[serde(default = "default_max_trades_per_day")]
    pub max_trades_per_day: u32,
    /// Minimum reward:risk ratio for an entry.
    #[serde(default = "default_min_reward_risk")]
    pub min_reward_risk: Decimal,
    /// Minimum position notional; anything smaller is a dust trade.
    #[serde(default = "default_min_notional")]
    pub min_notional: Decimal,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_fraction: default_max_position_fraction(),
            max_exposure_fraction: default_max_exposure_fraction(),
            max_drawdown_fraction: default_max_drawdown_fraction(),
            max_trades_per_day: default_max_trades_per_day(),
            min_reward_risk: default_min_reward_risk(),
            min_notional: default_min_notional(),
        }
    }
}

/// How the bot decides: the deterministic confluence engine or an external
/// advisory service behind the same interface.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DecisionMode {
    #[default]
    Deterministic,
    Advisory,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    #[default]
    Paper,
    Live,
}

/// Persisted bot lifecycle status.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BotStatus {
    Active,
    #[default]
    Stopped,
    /// Stopped by a fatal error; requires external intervention to restart.
    Failed,
}

impl std::fmt::Display for BotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BotStatus::Active => write!(f, "active"),
            BotStatus::Stopped => write!(f, "stopped"),
            BotStatus::Failed => write!(f, "failed"),
        }
    }
}

fn default_cycle_interval_secs() -> u64 {
    60
}
fn default_entry_timeframe() -> Timeframe {
    Timeframe::M15
}
fn default_regime_timeframe() -> Timeframe {
    Timeframe::H4
}
fn default_leverage() -> Decimal {
    Decimal::from(5)
}
fn default_initial_capital() -> Decimal {
    Decimal::from(10_000)
}
fn default_max_position_fraction() -> Decimal {
    // 10% of capital per position
    Decimal::new(10, 2)
}
fn default_max_exposure_fraction() -> Decimal {
    // 30% of capital committed as margin at once
    Decimal::new(30, 2)
}
fn default_max_drawdown_fraction() -> Decimal {
    Decimal::new(20, 2)
}
fn default_max_trades_per_day() -> u32 {
    10
}
fn default_min_reward_risk() -> Decimal {
    Decimal::new(15, 1)
}
fn default_min_notional() -> Decimal {
    Decimal::from(10)
}

impl BotConfig {
    /// A paper-mode config with defaults, used by tests and seeding.
    pub fn paper(name: &str, symbols: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            symbols,
            cycle_interval_secs: default_cycle_interval_secs(),
            entry_timeframe: default_entry_timeframe(),
            regime_timeframe: default_regime_timeframe(),
            risk: RiskLimits::default(),
            decision_mode: DecisionMode::Deterministic,
            trading_mode: TradingMode::Paper,
            leverage: default_leverage(),
            initial_capital: default_initial_capital(),
        }
    }
}
