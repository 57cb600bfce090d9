//! Indicator engine - pure OHLCV -> indicator values and signal flags
//!
//! Everything here is side-effect-free numeric computation: identical candle
//! input always produces identical output. Money stays `Decimal` at the
//! boundaries; indicator math runs in `f64`.

use std::collections::BTreeMap;

use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

use crate::market::Candle;

pub mod flow;
pub mod momentum;
pub mod strength;
pub mod trend;
pub mod volatility;

pub use volatility::TrailingStop;

/// Minimum entry-timeframe history for the slowest indicator (regime SMA).
pub const MIN_ENTRY_HISTORY: usize = 200;
/// Minimum regime-timeframe history.
pub const MIN_REGIME_HISTORY: usize = 50;

const REGIME_SMA_PERIOD: usize = 200;
const REGIME_CONTEXT_SMA_PERIOD: usize = 50;
const ENTRY_EMA_PERIOD: usize = 21;
const ADX_PERIOD: usize = 14;
const RSI_PERIOD: usize = 14;
const TRAILING_STOP_PERIOD: usize = 10;
const TRAILING_STOP_MULTIPLIER: f64 = 3.0;
const VOLUME_SMA_PERIOD: usize = 20;
const FLOW_LOOKBACK: usize = 20;
const RANGE_LOOKBACK: usize = 20;

/// ADX reading above which the trend counts as strong.
pub const ADX_STRONG: f64 = 25.0;
/// Volume ratio above which volume confirms the move.
pub const VOLUME_CONFIRM_RATIO: f64 = 1.2;
/// Tolerance around the entry EMA that still counts as a pullback.
const PULLBACK_TOLERANCE: f64 = 0.002;

/// Plain-f64 bar for indicator math.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bar {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    fn from_candle(candle: &Candle) -> Option<Self> {
        Some(Self {
            open: candle.open.to_f64()?,
            high: candle.high.to_f64()?,
            low: candle.low.to_f64()?,
            close: candle.close.to_f64()?,
            volume: candle.volume.to_f64()?,
        })
    }
}

/// Named scalar indicator values for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSet {
    pub price: f64,
    /// Long-period SMA on the entry timeframe (regime filter).
    pub sma_regime: f64,
    /// SMA on the regime timeframe (higher-timeframe context).
    pub sma_context: f64,
    /// Short-period EMA (entry zone).
    pub ema_entry: f64,
    pub adx: f64,
    pub rsi: f64,
    pub atr: f64,
    /// Trailing-stop line (active band).
    pub trailing_stop: f64,
    pub trailing_stop_bullish: bool,
    pub volume_ratio: f64,
    pub flow_cumulative: f64,
    pub flow_delta: f64,
    /// Width of the recent high/low structural range.
    pub range_width: f64,
}

impl IndicatorSet {
    /// Named map of scalar values, for reasoning strings and reporting.
    pub fn to_map(&self) -> BTreeMap<&'static str, f64> {
        BTreeMap::from([
            ("price", self.price),
            ("sma_regime", self.sma_regime),
            ("sma_context", self.sma_context),
            ("ema_entry", self.ema_entry),
            ("adx", self.adx),
            ("rsi", self.rsi),
            ("atr", self.atr),
            ("trailing_stop", self.trailing_stop),
            ("volume_ratio", self.volume_ratio),
            ("flow_cumulative", self.flow_cumulative),
            ("flow_delta", self.flow_delta),
            ("range_width", self.range_width),
        ])
    }
}

/// Ordered boolean signal flags, directional where it matters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalFlags {
    pub regime_ok_long: bool,
    pub regime_ok_short: bool,
    pub trend_strong: bool,
    pub pullback_long: bool,
    pub pullback_short: bool,
    pub momentum_ok_long: bool,
    pub momentum_ok_short: bool,
    pub volume_confirmed: bool,
    pub trailing_stop_bullish: bool,
    pub flow_cross_long: bool,
    pub flow_cross_short: bool,
    pub flow_surge_long: bool,
    pub flow_surge_short: bool,
}

/// Pure indicator computation over the per-symbol candle history.
pub struct IndicatorEngine;

impl IndicatorEngine {
    /// Compute the indicator set and signal flags for one symbol.
    ///
    /// Returns `None` when history is too short for the slowest indicator,
    /// never a zero-filled set: downstream code must be able to distinguish
    /// "no signal" from "neutral signal".
    pub fn compute(entry_candles: &[Candle], regime_candles: &[Candle]) -> Option<(IndicatorSet, SignalFlags)> {
        if entry_candles.len() < MIN_ENTRY_HISTORY || regime_candles.len() < MIN_REGIME_HISTORY {
            return None;
        }

        let bars: Vec<Bar> = entry_candles.iter().filter_map(Bar::from_candle).collect();
        let regime_bars: Vec<Bar> = regime_candles.iter().filter_map(Bar::from_candle).collect();
        if bars.len() < MIN_ENTRY_HISTORY || regime_bars.len() < MIN_REGIME_HISTORY {
            return None;
        }

        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let regime_closes: Vec<f64> = regime_bars.iter().map(|b| b.close).collect();
        let price = *closes.last()?;

        let sma_regime = trend::sma(&closes, REGIME_SMA_PERIOD)?;
        let sma_context = trend::sma(&regime_closes, REGIME_CONTEXT_SMA_PERIOD)?;
        let ema_entry = trend::ema(&closes, ENTRY_EMA_PERIOD)?;
        let adx = strength::adx(&bars, ADX_PERIOD)?;
        let rsi = momentum::rsi(&closes, RSI_PERIOD)?;
        let atr = volatility::atr(&bars, ADX_PERIOD)?;
        let stop = volatility::trailing_stop(&bars, TRAILING_STOP_PERIOD, TRAILING_STOP_MULTIPLIER)?;
        let volume_ratio = flow::volume_ratio(&bars, VOLUME_SMA_PERIOD)?;
        let flow = flow::order_flow(&bars, FLOW_LOOKBACK)?;

        let recent = &bars[bars.len() - RANGE_LOOKBACK..];
        let range_high = recent.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let range_low = recent.iter().map(|b| b.low).fold(f64::MAX, f64::min);

        let set = IndicatorSet {
            price,
            sma_regime,
            sma_context,
            ema_entry,
            adx,
            rsi,
            atr,
            trailing_stop: stop.line,
            trailing_stop_bullish: stop.bullish,
            volume_ratio,
            flow_cumulative: flow.cumulative,
            flow_delta: flow.last_delta,
            range_width: range_high - range_low,
        };

        let flags = SignalFlags {
            regime_ok_long: price > sma_regime && price > sma_context,
            regime_ok_short: price < sma_regime && price < sma_context,
            trend_strong: adx > ADX_STRONG,
            pullback_long: price <= ema_entry * (1.0 + PULLBACK_TOLERANCE),
            pullback_short: price >= ema_entry * (1.0 - PULLBACK_TOLERANCE),
            momentum_ok_long: rsi > 45.0 && rsi < 70.0,
            momentum_ok_short: rsi < 55.0 && rsi > 30.0,
            volume_confirmed: volume_ratio > VOLUME_CONFIRM_RATIO,
            trailing_stop_bullish: stop.bullish,
            flow_cross_long: flow.zero_cross && flow.cumulative > 0.0,
            flow_cross_short: flow.zero_cross && flow.cumulative < 0.0,
            flow_surge_long: flow.surge && flow.last_delta > 0.0,
            flow_surge_short: flow.surge && flow.last_delta < 0.0,
        };

        Some((set, flags))
    }
}
