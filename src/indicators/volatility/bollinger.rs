//! Bollinger Bands indicator

use crate::common::math;
use crate::models::indicators::{BollingerBandsIndicator, Candle};

/// Middle = SMA(period), upper/lower = middle +/- std_dev * sigma
pub fn calculate_bollinger_bands(
    candles: &[Candle],
    period: u32,
    std_dev: f64,
) -> Option<BollingerBandsIndicator> {
    if period == 0 || candles.len() < period as usize {
        return None;
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let middle = math::sma(&closes, period as usize)?;
    let sigma = math::standard_deviation(&closes, period as usize)?;

    Some(BollingerBandsIndicator {
        upper: middle + std_dev * sigma,
        middle,
        lower: middle - std_dev * sigma,
        period,
        std_dev,
    })
}
