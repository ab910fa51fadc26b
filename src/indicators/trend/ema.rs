//! Moving averages over closing prices

use crate::common::math;
use crate::models::indicators::{Candle, EmaIndicator, SmaIndicator};

fn closes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.close).collect()
}

/// Calculate EMA for a specific period
pub fn calculate_ema(candles: &[Candle], period: u32) -> Option<EmaIndicator> {
    if period == 0 || candles.len() < period as usize {
        return None;
    }

    let value = math::ema(&closes(candles), period as usize)?;
    Some(EmaIndicator { value, period })
}

/// Calculate SMA for a specific period
pub fn calculate_sma(candles: &[Candle], period: u32) -> Option<SmaIndicator> {
    if period == 0 || candles.len() < period as usize {
        return None;
    }

    let value = math::sma(&closes(candles), period as usize)?;
    Some(SmaIndicator { value, period })
}
