//! Risk validation - ordered checks, pyramiding, adaptive stop sizing
//!
//! Stateless: every cycle re-validates against the current ledger snapshot,
//! nothing is cached across cycles.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::BotConfig;
use crate::ledger::{CapitalLedger, Position, Side};
use crate::signal::Signal;

/// Pyramid add-on margin as a fraction of the first entry's margin.
const PYRAMID_ADD_FRACTION: Decimal = Decimal::from_parts(5, 0, 0, false, 1);
/// Hard ceiling on combined pyramid margin, in units of one max position.
const PYRAMID_COMBINED_CAP: Decimal = Decimal::from_parts(15, 0, 0, false, 1);
/// Maximum entries merged into one position.
const PYRAMID_MAX_ENTRIES: u32 = 2;

/// Why a signal was rejected. Logged and surfaced through bot health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum RejectReason {
    SizeLimit { proposed: Decimal, max: Decimal },
    PositionExists { symbol: String },
    ExposureLimit { projected: Decimal, limit: Decimal },
    InvalidStops { detail: String },
    RewardRisk { ratio: Decimal, min: Decimal },
    DustTrade { notional: Decimal, min: Decimal },
    DailyTradeLimit { max: u32 },
    DrawdownLimit { equity: Decimal, floor: Decimal },
    PyramidLimit,
    PyramidUnprofitable,
    MissingPrices,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::SizeLimit { proposed, max } => {
                write!(f, "size fraction {proposed} exceeds max {max}")
            }
            RejectReason::PositionExists { symbol } => {
                write!(f, "open position already exists for {symbol}")
            }
            RejectReason::ExposureLimit { projected, limit } => {
                write!(f, "projected margin {projected} exceeds exposure limit {limit}")
            }
            RejectReason::InvalidStops { detail } => write!(f, "invalid stops: {detail}"),
            RejectReason::RewardRisk { ratio, min } => {
                write!(f, "reward:risk {ratio} below minimum {min}")
            }
            RejectReason::DustTrade { notional, min } => {
                write!(f, "notional {notional} below minimum {min}")
            }
            RejectReason::DailyTradeLimit { max } => {
                write!(f, "daily trade limit {max} reached")
            }
            RejectReason::DrawdownLimit { equity, floor } => {
                write!(f, "equity {equity} below drawdown floor {floor}")
            }
            RejectReason::PyramidLimit => write!(f, "pyramid entry limit reached"),
            RejectReason::PyramidUnprofitable => {
                write!(f, "existing position not profitable, add-on blocked")
            }
            RejectReason::MissingPrices => write!(f, "entry signal missing price levels"),
        }
    }
}

/// A validated order, ready for execution.
#[derive(Debug, Clone)]
pub struct ApprovedOrder {
    pub symbol: String,
    pub side: Side,
    /// Margin to commit for this entry.
    pub margin: Decimal,
    pub size_fraction: Decimal,
    pub leverage: Decimal,
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    /// Open position this entry merges into, when pyramiding.
    pub add_on_to: Option<Uuid>,
    pub reasoning: String,
}

/// Stateless signal validation against the current ledger and positions.
pub struct RiskValidator;

impl RiskValidator {
    /// Validate a proposed entry. Checks run in a fixed order and
    /// short-circuit on the first failure.
    pub fn validate(
        signal: &Signal,
        ledger: &CapitalLedger,
        open_positions: &[Position],
        trades_today: u32,
        config: &BotConfig,
    ) -> Result<ApprovedOrder, RejectReason> {
        let side = match signal.kind.side() {
            Some(side) => side,
            None => return Err(RejectReason::MissingPrices),
        };
        let risk = &config.risk;
        let capital = ledger.capital_with(open_positions);

        if trades_today >= risk.max_trades_per_day {
            return Err(RejectReason::DailyTradeLimit { max: risk.max_trades_per_day });
        }

        let floor = config.initial_capital * (Decimal::ONE - risk.max_drawdown_fraction);
        if capital < floor {
            return Err(RejectReason::DrawdownLimit { equity: capital, floor });
        }

        // 1. Size fraction within the configured maximum
        if signal.size_fraction > risk.max_position_fraction {
            return Err(RejectReason::SizeLimit {
                proposed: signal.size_fraction,
                max: risk.max_position_fraction,
            });
        }

        let (entry, stop, target) = match (signal.entry_price, signal.stop_loss, signal.take_profit)
        {
            (Some(e), Some(s), Some(t)) => (e, s, t),
            _ => return Err(RejectReason::MissingPrices),
        };

        // 2. One open position per symbol; a same-side add-on may pyramid
        let existing = open_positions.iter().find(|p| p.symbol == signal.symbol);
        let (margin, add_on_to) = match existing {
            None => (capital * signal.size_fraction, None),
            Some(position) if position.side == side => {
                Self::pyramid_margin(position, entry, capital, risk.max_position_fraction)?
            }
            Some(_) => {
                return Err(RejectReason::PositionExists { symbol: signal.symbol.clone() })
            }
        };

        // 3. Projected total margin within the exposure cap
        let committed: Decimal = open_positions.iter().map(|p| p.margin).sum();
        let projected = committed + margin;
        let limit = capital * risk.max_exposure_fraction;
        if projected > limit {
            return Err(RejectReason::ExposureLimit { projected, limit });
        }

        // 4. Stops on the economically correct side of entry
        let stops_ok = match side {
            Side::Long => stop < entry && entry < target,
            Side::Short => target < entry && entry < stop,
        };
        if !stops_ok {
            return Err(RejectReason::InvalidStops {
                detail: format!("{side}: stop {stop}, entry {entry}, target {target}"),
            });
        }

        // 5. Reward:risk at or above the configured minimum
        let reward = (target - entry).abs();
        let risk_dist = (entry - stop).abs();
        if risk_dist.is_zero() {
            return Err(RejectReason::InvalidStops { detail: "zero stop distance".into() });
        }
        let ratio = reward / risk_dist;
        if ratio < risk.min_reward_risk {
            return Err(RejectReason::RewardRisk { ratio, min: risk.min_reward_risk });
        }

        // 6. Notional above the dust threshold
        let notional = margin * signal.leverage;
        if notional < risk.min_notional {
            return Err(RejectReason::DustTrade { notional, min: risk.min_notional });
        }

        Ok(ApprovedOrder {
            symbol: signal.symbol.clone(),
            side,
            margin,
            size_fraction: signal.size_fraction,
            leverage: signal.leverage,
            entry_price: entry,
            stop_loss: stop,
            take_profit: target,
            add_on_to,
            reasoning: signal.reasoning.clone(),
        })
    }

    /// Pyramid sizing: at most two entries per symbol, the second only while
    /// the first is profitable, margin at half the first entry, combined
    /// margin capped at 1.5x one max position.
    fn pyramid_margin(
        position: &Position,
        entry: Decimal,
        capital: Decimal,
        max_position_fraction: Decimal,
    ) -> Result<(Decimal, Option<Uuid>), RejectReason> {
        if position.entry_count >= PYRAMID_MAX_ENTRIES {
            return Err(RejectReason::PyramidLimit);
        }
        if position.unrealized_pnl(entry) <= Decimal::ZERO {
            return Err(RejectReason::PyramidUnprofitable);
        }
        let add_on = position.margin * PYRAMID_ADD_FRACTION;
        let combined_cap = capital * max_position_fraction * PYRAMID_COMBINED_CAP;
        if position.margin + add_on > combined_cap {
            return Err(RejectReason::ExposureLimit {
                projected: position.margin + add_on,
                limit: combined_cap,
            });
        }
        Ok((add_on, Some(position.id)))
    }
}

/// Volatility bucket multipliers for adaptive stop distance.
fn atr_multiplier(atr: f64, price: f64) -> f64 {
    let ratio = if price > 0.0 { atr / price } else { 0.0 };
    if ratio < 0.01 {
        1.5
    } else if ratio < 0.025 {
        2.0
    } else {
        2.5
    }
}

/// Derive stop-loss and take-profit from volatility.
///
/// Stop distance is ATR times a discrete low/medium/high multiplier, halved
/// when the recent structural range is already tight (< 3 ATR). Target sits
/// at `min_reward_risk` times the stop distance from entry.
pub fn adaptive_stops(
    entry: Decimal,
    atr: f64,
    range_width: f64,
    side: Side,
    min_reward_risk: Decimal,
) -> Option<(Decimal, Decimal)> {
    if atr <= 0.0 {
        return None;
    }
    let price = rust_decimal::prelude::ToPrimitive::to_f64(&entry)?;
    let mut distance = atr * atr_multiplier(atr, price);
    if range_width < 3.0 * atr {
        distance /= 2.0;
    }
    let distance = Decimal::try_from(distance).ok()?;
    if distance.is_zero() {
        return None;
    }
    let reward = distance * min_reward_risk;
    Some(match side {
        Side::Long => (entry - distance, entry + reward),
        Side::Short => (entry + distance, entry - reward),
    })
}
