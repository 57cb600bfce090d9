//! Trading signals - output of the decision layer

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ledger::Side;

/// What the signal proposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    EnterLong,
    EnterShort,
    Close,
    Hold,
}

impl SignalKind {
    pub fn side(&self) -> Option<Side> {
        match self {
            SignalKind::EnterLong => Some(Side::Long),
            SignalKind::EnterShort => Some(Side::Short),
            _ => None,
        }
    }
}

/// Confidence tier a confluence score maps into. Below `Weak` the signal is
/// a hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfidenceTier {
    Weak,
    Moderate,
    Strong,
    VeryStrong,
}

impl ConfidenceTier {
    /// Tier from a 0-1 confluence score; `None` below the lowest tier.
    pub fn from_score(score: f64) -> Option<Self> {
        if score >= 0.95 {
            Some(ConfidenceTier::VeryStrong)
        } else if score >= 0.80 {
            Some(ConfidenceTier::Strong)
        } else if score >= 0.65 {
            Some(ConfidenceTier::Moderate)
        } else if score >= 0.50 {
            Some(ConfidenceTier::Weak)
        } else {
            None
        }
    }

    /// Size step: fraction of the configured maximum position, non-decreasing
    /// in confidence.
    pub fn size_multiplier(&self) -> Decimal {
        match self {
            ConfidenceTier::VeryStrong => Decimal::ONE,
            ConfidenceTier::Strong => Decimal::new(75, 2),
            ConfidenceTier::Moderate => Decimal::new(50, 2),
            ConfidenceTier::Weak => Decimal::new(25, 2),
        }
    }
}

/// A scored trading signal. Value object: produced fresh each cycle, never
/// mutated after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub kind: SignalKind,
    /// 0-1 confidence.
    pub confidence: f64,
    pub entry_price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    /// Proposed position size as a fraction of capital.
    pub size_fraction: Decimal,
    pub leverage: Decimal,
    pub reasoning: String,
    pub generated_at: DateTime<Utc>,
}

impl Signal {
    pub fn hold(symbol: &str, reason: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            kind: SignalKind::Hold,
            confidence: 0.0,
            entry_price: None,
            stop_loss: None,
            take_profit: None,
            size_fraction: Decimal::ZERO,
            leverage: Decimal::ONE,
            reasoning: reason.to_string(),
            generated_at: Utc::now(),
        }
    }

    pub fn close(symbol: &str, reason: &str) -> Self {
        Self {
            kind: SignalKind::Close,
            ..Self::hold(symbol, reason)
        }
    }

    pub fn entry(symbol: &str, side: Side, confidence: f64, reason: &str) -> Self {
        let kind = match side {
            Side::Long => SignalKind::EnterLong,
            Side::Short => SignalKind::EnterShort,
        };
        Self {
            kind,
            confidence: confidence.clamp(0.0, 1.0),
            ..Self::hold(symbol, reason)
        }
    }

    pub fn with_prices(mut self, entry: Decimal, stop: Decimal, target: Decimal) -> Self {
        self.entry_price = Some(entry);
        self.stop_loss = Some(stop);
        self.take_profit = Some(target);
        self
    }

    pub fn with_size(mut self, size_fraction: Decimal, leverage: Decimal) -> Self {
        self.size_fraction = size_fraction;
        self.leverage = leverage;
        self
    }

    pub fn is_entry(&self) -> bool {
        matches!(self.kind, SignalKind::EnterLong | SignalKind::EnterShort)
    }
}
