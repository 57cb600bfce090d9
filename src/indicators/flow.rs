//! Volume confirmation and order-flow imbalance

use super::trend::sma;
use super::Bar;

/// Current volume relative to its moving average over `period` prior bars.
pub fn volume_ratio(bars: &[Bar], period: usize) -> Option<f64> {
    if bars.len() < period + 1 {
        return None;
    }
    let volumes: Vec<f64> = bars[..bars.len() - 1].iter().map(|b| b.volume).collect();
    let avg = sma(&volumes, period)?;
    if avg <= 0.0 {
        return None;
    }
    Some(bars.last()?.volume / avg)
}

/// Per-bar signed volume estimate: `volume * (close-open) / (high-low)`,
/// zero for bars with no range.
pub fn signed_volume(bar: &Bar) -> f64 {
    let range = bar.high - bar.low;
    if range <= 0.0 {
        return 0.0;
    }
    bar.volume * (bar.close - bar.open) / range
}

/// Order-flow state derived from the cumulative signed-volume sum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderFlow {
    /// Running cumulative sum of per-bar signed volume.
    pub cumulative: f64,
    /// Last per-bar delta.
    pub last_delta: f64,
    /// The cumulative sum crossed zero on the latest bar.
    pub zero_cross: bool,
    /// Latest delta exceeds 2 standard deviations of the recent deltas.
    pub surge: bool,
}

/// Accumulate signed volume over the series; surge statistics use the last
/// `lookback` deltas before the current bar.
pub fn order_flow(bars: &[Bar], lookback: usize) -> Option<OrderFlow> {
    if bars.len() < lookback + 2 {
        return None;
    }

    let deltas: Vec<f64> = bars.iter().map(signed_volume).collect();
    let mut cumulative = 0.0;
    let mut prev_cumulative = 0.0;
    for (i, delta) in deltas.iter().enumerate() {
        if i + 1 == deltas.len() {
            prev_cumulative = cumulative;
        }
        cumulative += delta;
    }

    let last_delta = *deltas.last()?;
    let zero_cross = prev_cumulative != 0.0 && prev_cumulative.signum() != cumulative.signum();

    let window = &deltas[deltas.len() - 1 - lookback..deltas.len() - 1];
    let mean = window.iter().sum::<f64>() / lookback as f64;
    let variance = window.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / lookback as f64;
    let std_dev = variance.sqrt();
    let surge = std_dev > 0.0 && last_delta.abs() > 2.0 * std_dev;

    Some(OrderFlow { cumulative, last_delta, zero_cross, surge })
}
