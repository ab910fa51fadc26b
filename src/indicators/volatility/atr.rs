//! ATR (Average True Range) indicator

use crate::common::math;
use crate::models::indicators::{AtrIndicator, Candle};

/// Simple average of the true range over the trailing `period` bars
pub fn calculate_atr(candles: &[Candle], period: u32) -> Option<AtrIndicator> {
    if period == 0 || candles.len() < period as usize + 1 {
        return None;
    }

    let ranges: Vec<f64> = candles
        .windows(2)
        .map(|pair| math::true_range(pair[1].high, pair[1].low, pair[0].close))
        .collect();

    let value = math::sma(&ranges, period as usize)?;
    Some(AtrIndicator { value, period })
}
