use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// OHLCV bar
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub timestamp: DateTime<Utc>,
}

impl Candle {
    pub fn new(
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            open,
            high,
            low,
            close,
            volume,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacdIndicator {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<(u32, u32, u32)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsiIndicator {
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmaIndicator {
    pub value: f64,
    pub period: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmaIndicator {
    pub value: f64,
    pub period: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtrIndicator {
    pub value: f64,
    pub period: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BollingerBandsIndicator {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    pub period: u32,
    pub std_dev: f64,
}
