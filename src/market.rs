//! Market data types - candles, tickers, per-cycle snapshots

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::indicators::{IndicatorSet, SignalFlags};

/// Maximum candles retained per timeframe in a snapshot.
pub const MAX_CANDLES: usize = 500;

/// Candle timeframes recognized by the data provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timeframe {
    M1,
    M5,
    M15,
    H1,
    H4,
    D1,
}

impl Timeframe {
    /// Provider-facing interval string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Price candle data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Current ticker for a symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub price: Decimal,
    pub change_24h_pct: Option<f64>,
    pub volume_24h: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time view of one symbol's market state.
///
/// Built once per cycle and never mutated afterwards; the next cycle gets a
/// fresh snapshot. Indicators are `None` when history was too short to
/// compute them, which downstream code treats as "skip", never as neutral.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub price: Decimal,
    pub candles: BTreeMap<Timeframe, Vec<Candle>>,
    pub indicators: Option<IndicatorSet>,
    pub flags: Option<SignalFlags>,
    pub fetched_at: DateTime<Utc>,
}

impl MarketSnapshot {
    pub fn new(symbol: &str, price: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            price,
            candles: BTreeMap::new(),
            indicators: None,
            flags: None,
            fetched_at: Utc::now(),
        }
    }

    /// Attach a candle series, keeping only the newest `MAX_CANDLES`.
    pub fn with_candles(mut self, timeframe: Timeframe, mut candles: Vec<Candle>) -> Self {
        if candles.len() > MAX_CANDLES {
            candles.drain(..candles.len() - MAX_CANDLES);
        }
        self.candles.insert(timeframe, candles);
        self
    }

    pub fn candles(&self, timeframe: Timeframe) -> &[Candle] {
        self.candles.get(&timeframe).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Whether indicator computation succeeded for this snapshot.
    pub fn has_indicators(&self) -> bool {
        self.indicators.is_some() && self.flags.is_some()
    }
}
