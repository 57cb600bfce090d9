//! Moving averages - regime filter and entry zone

/// Simple moving average of the last `period` values.
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let sum: f64 = values[values.len() - period..].iter().sum();
    Some(sum / period as f64)
}

/// Exponential moving average.
///
/// Recurrence `ema[i] = price[i]*k + ema[i-1]*(1-k)` with `k = 2/(period+1)`,
/// seeded by the simple average of the first `period` values.
pub fn ema(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let k = 2.0 / (period as f64 + 1.0);
    let seed: f64 = values[..period].iter().sum::<f64>() / period as f64;
    let mut ema = seed;
    for price in &values[period..] {
        ema = price * k + ema * (1.0 - k);
    }
    Some(ema)
}
