//! RSI (Relative Strength Index) indicator

use crate::models::indicators::{Candle, RsiIndicator};

/// Calculate RSI over the trailing `period` price changes
///
/// RSI = 100 - (100 / (1 + RS)), RS = average gain / average loss
pub fn calculate_rsi(candles: &[Candle], period: u32) -> Option<RsiIndicator> {
    let period_len = period as usize;
    if period == 0 || candles.len() < period_len + 1 {
        return None;
    }

    let window = &candles[candles.len() - period_len - 1..];
    let (gain, loss) = window.windows(2).fold((0.0, 0.0), |(gain, loss), pair| {
        let change = pair[1].close - pair[0].close;
        if change > 0.0 {
            (gain + change, loss)
        } else {
            (gain, loss - change)
        }
    });

    let avg_gain = gain / period as f64;
    let avg_loss = loss / period as f64;

    let value = if avg_loss == 0.0 {
        if avg_gain == 0.0 {
            50.0
        } else {
            100.0
        }
    } else {
        100.0 - (100.0 / (1.0 + avg_gain / avg_loss))
    };

    Some(RsiIndicator {
        value,
        period: Some(period),
    })
}
