//! ADX - directional movement trend strength oscillator

use super::volatility::{true_range, wilder_smooth};
use super::Bar;

/// Average Directional Index, 0-100. Strong trend above 25.
///
/// +DM/-DM and TR are Wilder-smoothed over `period`, turned into +DI/-DI,
/// then DX is Wilder-smoothed again into ADX. Needs roughly `2 * period`
/// bars of history.
pub fn adx(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period * 2 {
        return None;
    }

    let tr = true_range(bars);
    let mut dm_plus = vec![0.0; bars.len()];
    let mut dm_minus = vec![0.0; bars.len()];
    for i in 1..bars.len() {
        let up = bars[i].high - bars[i - 1].high;
        let down = bars[i - 1].low - bars[i].low;
        if up > down && up > 0.0 {
            dm_plus[i] = up;
        }
        if down > up && down > 0.0 {
            dm_minus[i] = down;
        }
    }

    let s_tr = wilder_smooth(&tr, period);
    let s_plus = wilder_smooth(&dm_plus, period);
    let s_minus = wilder_smooth(&dm_minus, period);

    let mut dx = Vec::with_capacity(bars.len());
    for i in 0..bars.len() {
        let (tr, plus, minus) = match (s_tr[i], s_plus[i], s_minus[i]) {
            (Some(t), Some(p), Some(m)) if t > 0.0 => (t, p, m),
            _ => continue,
        };
        let di_plus = 100.0 * plus / tr;
        let di_minus = 100.0 * minus / tr;
        let sum = di_plus + di_minus;
        dx.push(if sum > 0.0 { 100.0 * (di_plus - di_minus).abs() / sum } else { 0.0 });
    }

    wilder_smooth(&dx, period).last().copied().flatten()
}
