//! MACD (Moving Average Convergence Divergence) indicator

use crate::common::math;
use crate::models::indicators::{Candle, MacdIndicator};

/// MACD = EMA(fast) - EMA(slow), signal = EMA(signal) of the MACD series,
/// histogram = MACD - signal
pub fn calculate_macd(
    candles: &[Candle],
    fast_period: u32,
    slow_period: u32,
    signal_period: u32,
) -> Option<MacdIndicator> {
    let (fast, slow, signal) = (
        fast_period as usize,
        slow_period as usize,
        signal_period as usize,
    );
    if fast == 0 || signal == 0 || fast >= slow || candles.len() < slow + signal {
        return None;
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

    let mut fast_ema = math::sma(&closes[..fast], fast)?;
    let mut slow_ema = math::sma(&closes[..slow], slow)?;
    for close in &closes[fast..slow] {
        fast_ema = math::ema_from_previous(*close, fast_ema, fast);
    }

    let mut macd_values = vec![fast_ema - slow_ema];
    for close in &closes[slow..] {
        fast_ema = math::ema_from_previous(*close, fast_ema, fast);
        slow_ema = math::ema_from_previous(*close, slow_ema, slow);
        macd_values.push(fast_ema - slow_ema);
    }

    let macd_line = *macd_values.last()?;
    let signal_line = math::ema(&macd_values, signal)?;

    Some(MacdIndicator {
        macd: macd_line,
        signal: signal_line,
        histogram: macd_line - signal_line,
        period: Some((fast_period, slow_period, signal_period)),
    })
}
