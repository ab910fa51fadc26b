//! Numeric helpers shared by the indicator implementations.
//!
//! All windowed functions look at the trailing `period` values of the slice.

/// Simple moving average of the last `period` values
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let window = &values[values.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

/// Exponential moving average seeded with the SMA of the first `period` values
pub fn ema(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let mut current = sma(&values[..period], period)?;
    for value in &values[period..] {
        current = ema_from_previous(*value, current, period);
    }
    Some(current)
}

pub fn ema_from_previous(value: f64, previous: f64, period: usize) -> f64 {
    let k = 2.0 / (period as f64 + 1.0);
    value * k + previous * (1.0 - k)
}

/// Population standard deviation of the last `period` values
pub fn standard_deviation(values: &[f64], period: usize) -> Option<f64> {
    let mean = sma(values, period)?;
    let window = &values[values.len() - period..];
    let variance = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / period as f64;
    Some(variance.sqrt())
}

pub fn true_range(high: f64, low: f64, previous_close: f64) -> f64 {
    (high - low)
        .max((high - previous_close).abs())
        .max((low - previous_close).abs())
}

/// Relative equality used for `=` comparisons on floating point samples
pub fn approx_eq(a: f64, b: f64, tolerance: f64) -> bool {
    let scale = a.abs().max(b.abs()).max(1.0);
    (a - b).abs() <= tolerance * scale
}
