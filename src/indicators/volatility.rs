//! ATR and the trailing-stop line
//!
//! True Range: max(high-low, |high-prev_close|, |low-prev_close|).
//! ATR uses Wilder smoothing (EMA with alpha = 1/period).
//! The trailing-stop line is ATR bands with a persistent flip state: bands
//! only tighten toward price until a close through the opposite band flips
//! the trend flag.

use super::Bar;

/// True Range series. TR[0] = high[0] - low[0] (no previous close).
pub fn true_range(bars: &[Bar]) -> Vec<f64> {
    let mut tr = Vec::with_capacity(bars.len());
    for (i, bar) in bars.iter().enumerate() {
        if i == 0 {
            tr.push(bar.high - bar.low);
        } else {
            let pc = bars[i - 1].close;
            tr.push((bar.high - bar.low).max((bar.high - pc).abs()).max((bar.low - pc).abs()));
        }
    }
    tr
}

/// Wilder smoothing over a series, alpha = 1/period. The first `period - 1`
/// outputs are unavailable (seeding window).
pub fn wilder_smooth(series: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; series.len()];
    if period == 0 || series.len() < period {
        return out;
    }
    let seed: f64 = series[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = Some(seed);
    let mut smoothed = seed;
    for i in period..series.len() {
        smoothed = (smoothed * (period as f64 - 1.0) + series[i]) / period as f64;
        out[i] = Some(smoothed);
    }
    out
}

/// Latest ATR value.
pub fn atr(bars: &[Bar], period: usize) -> Option<f64> {
    let tr = true_range(bars);
    wilder_smooth(&tr, period).last().copied().flatten()
}

/// Trailing-stop line state: the active band and the trend flag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailingStop {
    /// Lower band (support) when bullish, upper band (resistance) when not.
    pub line: f64,
    pub bullish: bool,
}

/// Compute the trailing-stop line over the whole series and return its final
/// state. Bands tighten toward price and never widen until price closes
/// through the opposite band, which flips `bullish`.
pub fn trailing_stop(bars: &[Bar], period: usize, multiplier: f64) -> Option<TrailingStop> {
    let tr = true_range(bars);
    let atr = wilder_smooth(&tr, period);
    let start = atr.iter().position(|v| v.is_some())?;

    let hl2 = (bars[start].high + bars[start].low) / 2.0;
    let a = atr[start].unwrap_or(0.0);
    let mut upper = hl2 + multiplier * a;
    let mut lower = hl2 - multiplier * a;
    let mut bullish = true;

    for i in (start + 1)..bars.len() {
        let a = match atr[i] {
            Some(a) => a,
            None => continue,
        };
        let hl2 = (bars[i].high + bars[i].low) / 2.0;
        let basic_upper = hl2 + multiplier * a;
        let basic_lower = hl2 - multiplier * a;
        let prev_close = bars[i - 1].close;

        // Resistance can only come down, support can only come up
        upper = if prev_close <= upper { basic_upper.min(upper) } else { basic_upper };
        lower = if prev_close >= lower { basic_lower.max(lower) } else { basic_lower };

        if bullish && bars[i].close < lower {
            bullish = false;
        } else if !bullish && bars[i].close > upper {
            bullish = true;
        }
    }

    Some(TrailingStop {
        line: if bullish { lower } else { upper },
        bullish,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar { open, high, low, close, volume: 100.0 }
    }

    #[test]
    fn test_true_range_uses_previous_close() {
        let bars = [bar(10.0, 12.0, 9.0, 11.0), bar(11.0, 11.5, 11.0, 11.2)];
        let tr = true_range(&bars);
        assert_relative_eq!(tr[0], 3.0);
        // Gap from prev close 11.0: max(0.5, 0.5, 0.0) = 0.5
        assert_relative_eq!(tr[1], 0.5);
    }

    #[test]
    fn test_wilder_smooth_seeds_with_average() {
        let series = [2.0, 4.0, 6.0, 8.0];
        let smoothed = wilder_smooth(&series, 3);
        assert!(smoothed[0].is_none());
        assert!(smoothed[1].is_none());
        assert_relative_eq!(smoothed[2].unwrap(), 4.0);
        // (4*2 + 8)/3
        assert_relative_eq!(smoothed[3].unwrap(), 16.0 / 3.0);
    }

    #[test]
    fn test_atr_insufficient_history() {
        let bars = [bar(10.0, 11.0, 9.0, 10.0)];
        assert!(atr(&bars, 14).is_none());
    }

    #[test]
    fn test_trailing_stop_flips_on_close_through_band() {
        // Steady uptrend, then a hard break below
        let mut bars: Vec<Bar> = (0..20)
            .map(|i| {
                let p = 100.0 + i as f64;
                bar(p, p + 1.0, p - 1.0, p + 0.5)
            })
            .collect();
        let up = trailing_stop(&bars, 5, 2.0).unwrap();
        assert!(up.bullish);
        assert!(up.line < bars.last().unwrap().close);

        // Collapse far through the support band
        bars.push(bar(119.0, 119.0, 80.0, 81.0));
        let down = trailing_stop(&bars, 5, 2.0).unwrap();
        assert!(!down.bullish);
        assert!(down.line > 81.0);
    }

    #[test]
    fn test_trailing_stop_support_never_widens_in_uptrend() {
        let bars: Vec<Bar> = (0..30)
            .map(|i| {
                let p = 100.0 + i as f64 * 0.5;
                bar(p, p + 1.0, p - 1.0, p + 0.2)
            })
            .collect();
        // Support under a rising market stays below every close
        let st = trailing_stop(&bars, 5, 2.0).unwrap();
        assert!(st.bullish);
        assert!(st.line < bars.last().unwrap().close);
    }
}
