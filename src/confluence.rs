//! Signal generation - weighted confluence entries, independent exit rules

use rust_decimal::Decimal;
use std::sync::Arc;

use crate::config::BotConfig;
use crate::indicators::{IndicatorSet, SignalFlags};
use crate::ledger::Side;
use crate::market::MarketSnapshot;
use crate::risk::adaptive_stops;
use crate::signal::{ConfidenceTier, Signal};

/// RSI extremes that force an exit.
const RSI_OVERBOUGHT: f64 = 80.0;
const RSI_OVERSOLD: f64 = 20.0;

/// Optional collaborator giving a per-symbol confidence factor, e.g. from a
/// learning subsystem. Lifecycle is owned by whoever builds the generator.
pub trait ConfidenceAdjuster: Send + Sync {
    /// Multiplier applied to entry confidence; clamped to [0.5, 1.5].
    fn adjustment(&self, symbol: &str) -> f64;
}

/// Category weights for the confluence score. Must sum to 1.0; the defaults
/// are the tuned production values.
#[derive(Debug, Clone, Copy)]
pub struct ConfluenceWeights {
    pub regime: f64,
    pub trend_strength: f64,
    pub entry_quality: f64,
    pub momentum: f64,
    pub volume: f64,
    pub volatility_readiness: f64,
}

impl Default for ConfluenceWeights {
    fn default() -> Self {
        Self {
            regime: 0.20,
            trend_strength: 0.15,
            entry_quality: 0.20,
            momentum: 0.15,
            volume: 0.15,
            volatility_readiness: 0.15,
        }
    }
}

/// Deterministic signal generator: indicator flags in, scored signal out.
pub struct SignalGenerator {
    weights: ConfluenceWeights,
    adjuster: Option<Arc<dyn ConfidenceAdjuster>>,
}

impl SignalGenerator {
    pub fn new() -> Self {
        Self { weights: ConfluenceWeights::default(), adjuster: None }
    }

    pub fn with_weights(mut self, weights: ConfluenceWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_adjuster(mut self, adjuster: Arc<dyn ConfidenceAdjuster>) -> Self {
        self.adjuster = Some(adjuster);
        self
    }

    /// Generate the signal for one symbol.
    ///
    /// When a position is open, exit conditions are evaluated first and win
    /// over any fresh entry; a triggered exit means no entry is considered
    /// until the next cycle.
    pub fn generate(
        &self,
        snapshot: &MarketSnapshot,
        open_side: Option<Side>,
        config: &BotConfig,
    ) -> Signal {
        let (set, flags) = match (&snapshot.indicators, &snapshot.flags) {
            (Some(set), Some(flags)) => (set, flags),
            _ => return Signal::hold(&snapshot.symbol, "indicators unavailable"),
        };

        if let Some(side) = open_side {
            if let Some(reason) = self.exit_reason(set, side) {
                return Signal::close(&snapshot.symbol, &reason);
            }
        }

        let long = self.score(flags, Side::Long);
        let short = self.score(flags, Side::Short);
        let (side, score) = if long >= short { (Side::Long, long) } else { (Side::Short, short) };

        let factor = self
            .adjuster
            .as_ref()
            .map(|a| a.adjustment(&snapshot.symbol).clamp(0.5, 1.5))
            .unwrap_or(1.0);
        let confidence = (score * factor).clamp(0.0, 1.0);

        let tier = match ConfidenceTier::from_score(confidence) {
            Some(tier) => tier,
            None => {
                return Signal::hold(
                    &snapshot.symbol,
                    &format!("confluence {confidence:.2} below entry threshold"),
                )
            }
        };

        let (stop, target) = match adaptive_stops(
            snapshot.price,
            set.atr,
            set.range_width,
            side,
            config.risk.min_reward_risk,
        ) {
            Some(levels) => levels,
            None => return Signal::hold(&snapshot.symbol, "no volatility estimate for stops"),
        };

        let size_fraction = tier.size_multiplier() * config.risk.max_position_fraction;
        let reasoning = self.describe(flags, side, confidence, set);

        Signal::entry(&snapshot.symbol, side, confidence, &reasoning)
            .with_prices(snapshot.price, stop, target)
            .with_size(size_fraction, config.leverage)
    }

    /// Exit conditions, independent of entry scoring: trailing-stop flip
    /// against the position, price through the regime filter, or momentum at
    /// an extreme.
    pub fn exit_reason(&self, set: &IndicatorSet, side: Side) -> Option<String> {
        match side {
            Side::Long => {
                if !set.trailing_stop_bullish {
                    return Some(format!("trailing stop flipped bearish at {:.2}", set.trailing_stop));
                }
                if set.price < set.sma_regime {
                    return Some(format!("price {:.2} below regime filter {:.2}", set.price, set.sma_regime));
                }
                if set.rsi >= RSI_OVERBOUGHT {
                    return Some(format!("momentum overbought, rsi {:.1}", set.rsi));
                }
            }
            Side::Short => {
                if set.trailing_stop_bullish {
                    return Some(format!("trailing stop flipped bullish at {:.2}", set.trailing_stop));
                }
                if set.price > set.sma_regime {
                    return Some(format!("price {:.2} above regime filter {:.2}", set.price, set.sma_regime));
                }
                if set.rsi <= RSI_OVERSOLD {
                    return Some(format!("momentum oversold, rsi {:.1}", set.rsi));
                }
            }
        }
        None
    }

    /// Weighted confluence: each category contributes its full weight when at
    /// least one of its flags is true. Adding a true flag can never lower
    /// the score.
    fn score(&self, flags: &SignalFlags, side: Side) -> f64 {
        let w = &self.weights;
        let categories = Self::categories(flags, side);
        let mut score = 0.0;
        if categories.regime {
            score += w.regime;
        }
        if categories.trend_strength {
            score += w.trend_strength;
        }
        if categories.entry_quality {
            score += w.entry_quality;
        }
        if categories.momentum {
            score += w.momentum;
        }
        if categories.volume {
            score += w.volume;
        }
        if categories.volatility_readiness {
            score += w.volatility_readiness;
        }
        score
    }

    fn categories(flags: &SignalFlags, side: Side) -> CategoryHits {
        match side {
            Side::Long => CategoryHits {
                regime: flags.regime_ok_long,
                trend_strength: flags.trend_strong,
                entry_quality: flags.pullback_long || flags.flow_cross_long,
                momentum: flags.momentum_ok_long || flags.flow_surge_long,
                volume: flags.volume_confirmed,
                volatility_readiness: flags.trailing_stop_bullish,
            },
            Side::Short => CategoryHits {
                regime: flags.regime_ok_short,
                trend_strength: flags.trend_strong,
                entry_quality: flags.pullback_short || flags.flow_cross_short,
                momentum: flags.momentum_ok_short || flags.flow_surge_short,
                volume: flags.volume_confirmed,
                volatility_readiness: !flags.trailing_stop_bullish,
            },
        }
    }

    fn describe(&self, flags: &SignalFlags, side: Side, confidence: f64, set: &IndicatorSet) -> String {
        let hits = Self::categories(flags, side);
        let mut parts = Vec::new();
        if hits.regime {
            parts.push("regime");
        }
        if hits.trend_strength {
            parts.push("trend-strength");
        }
        if hits.entry_quality {
            parts.push("entry-quality");
        }
        if hits.momentum {
            parts.push("momentum");
        }
        if hits.volume {
            parts.push("volume");
        }
        if hits.volatility_readiness {
            parts.push("volatility");
        }
        format!(
            "{side} confluence {confidence:.2} [{}] adx {:.1} rsi {:.1}",
            parts.join(", "),
            set.adx,
            set.rsi
        )
    }
}

impl Default for SignalGenerator {
    fn default() -> Self {
        Self::new()
    }
}

struct CategoryHits {
    regime: bool,
    trend_strength: bool,
    entry_quality: bool,
    momentum: bool,
    volume: bool,
    volatility_readiness: bool,
}
