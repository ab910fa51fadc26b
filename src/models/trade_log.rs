//! Append-only per-job execution record

use crate::models::job::JobRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "buy" => Some(TradeSide::Buy),
            "sell" => Some(TradeSide::Sell),
            _ => None,
        }
    }
}

/// Entry as produced by a worker, before the store assigns an id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTradeLog {
    pub timestamp: DateTime<Utc>,
    pub side: TradeSide,
    pub price: f64,
    pub quantity: f64,
    pub commission: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pnl: Option<f64>,
    /// Running cash balance after this trade
    pub balance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeLog {
    pub id: i64,
    pub job: JobRef,
    pub timestamp: DateTime<Utc>,
    pub side: TradeSide,
    pub price: f64,
    pub quantity: f64,
    pub commission: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pnl: Option<f64>,
    pub balance: f64,
}

impl TradeLog {
    pub fn from_entry(id: i64, job: JobRef, entry: NewTradeLog) -> Self {
        Self {
            id,
            job,
            timestamp: entry.timestamp,
            side: entry.side,
            price: entry.price,
            quantity: entry.quantity,
            commission: entry.commission,
            pnl: entry.pnl,
            balance: entry.balance,
        }
    }
}
