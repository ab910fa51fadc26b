//! Indicator registry: maps an indicator reference onto the calculators

use crate::indicators::momentum::{calculate_macd, calculate_rsi};
use crate::indicators::trend::{calculate_ema, calculate_sma};
use crate::indicators::volatility::{calculate_atr, calculate_bollinger_bands};
use crate::models::indicators::Candle;
use crate::models::strategy::IndicatorRef;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Indicator category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndicatorCategory {
    Price,
    Trend,
    Momentum,
    Volatility,
    Volume,
}

/// Indicators the candle-backed provider can compute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndicatorKind {
    Close,
    Open,
    High,
    Low,
    Volume,
    Sma,
    Ema,
    Rsi,
    Macd,
    Bollinger,
    Atr,
}

impl IndicatorKind {
    pub fn category(&self) -> IndicatorCategory {
        match self {
            IndicatorKind::Close | IndicatorKind::Open | IndicatorKind::High | IndicatorKind::Low => {
                IndicatorCategory::Price
            }
            IndicatorKind::Sma | IndicatorKind::Ema | IndicatorKind::Macd => IndicatorCategory::Trend,
            IndicatorKind::Rsi => IndicatorCategory::Momentum,
            IndicatorKind::Bollinger | IndicatorKind::Atr => IndicatorCategory::Volatility,
            IndicatorKind::Volume => IndicatorCategory::Volume,
        }
    }

    /// Bars needed before the first value exists, for the given parameters
    pub fn warmup(&self, indicator: &IndicatorRef) -> usize {
        match self {
            IndicatorKind::Close
            | IndicatorKind::Open
            | IndicatorKind::High
            | IndicatorKind::Low
            | IndicatorKind::Volume => 1,
            IndicatorKind::Sma | IndicatorKind::Ema | IndicatorKind::Bollinger => {
                indicator.param_usize("period", 20)
            }
            IndicatorKind::Rsi | IndicatorKind::Atr => indicator.param_usize("period", 14) + 1,
            IndicatorKind::Macd => {
                indicator.param_usize("slow_period", 26) + indicator.param_usize("signal_period", 9)
            }
        }
    }
}

impl FromStr for IndicatorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CLOSE" => Ok(IndicatorKind::Close),
            "OPEN" => Ok(IndicatorKind::Open),
            "HIGH" => Ok(IndicatorKind::High),
            "LOW" => Ok(IndicatorKind::Low),
            "VOLUME" => Ok(IndicatorKind::Volume),
            "SMA" => Ok(IndicatorKind::Sma),
            "EMA" => Ok(IndicatorKind::Ema),
            "RSI" => Ok(IndicatorKind::Rsi),
            "MACD" => Ok(IndicatorKind::Macd),
            "BB" | "BOLLINGER" => Ok(IndicatorKind::Bollinger),
            "ATR" => Ok(IndicatorKind::Atr),
            _ => Err(s.to_string()),
        }
    }
}

impl fmt::Display for IndicatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IndicatorKind::Close => "Close",
            IndicatorKind::Open => "Open",
            IndicatorKind::High => "High",
            IndicatorKind::Low => "Low",
            IndicatorKind::Volume => "Volume",
            IndicatorKind::Sma => "SMA",
            IndicatorKind::Ema => "EMA",
            IndicatorKind::Rsi => "RSI",
            IndicatorKind::Macd => "MACD",
            IndicatorKind::Bollinger => "BB",
            IndicatorKind::Atr => "ATR",
        };
        f.write_str(name)
    }
}

fn param_str<'a>(indicator: &'a IndicatorRef, name: &str, default: &'a str) -> &'a str {
    indicator
        .values
        .get(name)
        .and_then(Value::as_str)
        .unwrap_or(default)
}

/// Value of `indicator` at the last candle of `candles`, or `None` when the
/// history is too short.
pub fn compute(kind: IndicatorKind, indicator: &IndicatorRef, candles: &[Candle]) -> Option<f64> {
    let last = candles.last()?;
    match kind {
        IndicatorKind::Close => Some(last.close),
        IndicatorKind::Open => Some(last.open),
        IndicatorKind::High => Some(last.high),
        IndicatorKind::Low => Some(last.low),
        IndicatorKind::Volume => Some(last.volume),
        IndicatorKind::Sma => {
            calculate_sma(candles, indicator.param_usize("period", 20) as u32).map(|s| s.value)
        }
        IndicatorKind::Ema => {
            calculate_ema(candles, indicator.param_usize("period", 20) as u32).map(|e| e.value)
        }
        IndicatorKind::Rsi => {
            calculate_rsi(candles, indicator.param_usize("period", 14) as u32).map(|r| r.value)
        }
        IndicatorKind::Atr => {
            calculate_atr(candles, indicator.param_usize("period", 14) as u32).map(|a| a.value)
        }
        IndicatorKind::Macd => {
            let macd = calculate_macd(
                candles,
                indicator.param_usize("fast_period", 12) as u32,
                indicator.param_usize("slow_period", 26) as u32,
                indicator.param_usize("signal_period", 9) as u32,
            )?;
            match param_str(indicator, "line", "macd") {
                "signal" => Some(macd.signal),
                "histogram" => Some(macd.histogram),
                _ => Some(macd.macd),
            }
        }
        IndicatorKind::Bollinger => {
            let bands = calculate_bollinger_bands(
                candles,
                indicator.param_usize("period", 20) as u32,
                indicator.param_f64("stdDev", 2.0),
            )?;
            match param_str(indicator, "band", "middle") {
                "upper" => Some(bands.upper),
                "lower" => Some(bands.lower),
                _ => Some(bands.middle),
            }
        }
    }
}
