//! Market data provider interface and the candle-backed implementation

use crate::error::MarketDataError;
use crate::indicators::{self, IndicatorKind};
use crate::models::indicators::Candle;
use crate::models::strategy::{IndicatorRef, StrategyRules};
use crate::strategies::{IndicatorSample, StaticContext};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Value of `indicator` for `ticker` at the latest bar closed at or
    /// before `as_of`, with the bar before it when available.
    async fn indicator_value(
        &self,
        ticker: &str,
        indicator: &IndicatorRef,
        as_of: DateTime<Utc>,
    ) -> Result<IndicatorSample, MarketDataError>;

    /// Candles in `[start, end]`, oldest first
    async fn candles(
        &self,
        ticker: &str,
        timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, MarketDataError>;
}

/// Fetch every indicator the rules reference into a context for evaluation.
///
/// `DataUnavailable` leaves the entry out so evaluation reports the gap on
/// the node that needs it; other provider errors abort the snapshot.
pub async fn snapshot(
    provider: &dyn MarketDataProvider,
    ticker: &str,
    rules: &StrategyRules,
    as_of: DateTime<Utc>,
) -> Result<StaticContext, MarketDataError> {
    let mut ctx = StaticContext::new();
    for (_, indicator) in rules.indicator_refs() {
        match provider.indicator_value(ticker, indicator, as_of).await {
            Ok(sample) => ctx.insert(indicator, sample),
            Err(MarketDataError::DataUnavailable { reason, .. }) => {
                debug!(ticker = %ticker, indicator = %indicator, reason = %reason, "snapshot: indicator unavailable");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(ctx)
}

type SeriesKey = (String, String);

/// Computes indicators from candle series held in memory, keyed by
/// (ticker, timeframe).
#[derive(Clone, Default)]
pub struct CandleMarketData {
    series: Arc<RwLock<HashMap<SeriesKey, Vec<Candle>>>>,
}

impl CandleMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge candles into the series. A bar with an existing timestamp
    /// replaces the stored one.
    pub async fn insert_candles(&self, ticker: &str, timeframe: &str, candles: Vec<Candle>) {
        let mut series = self.series.write().await;
        let entry = series
            .entry((ticker.to_string(), timeframe.to_string()))
            .or_default();
        for candle in candles {
            match entry.binary_search_by_key(&candle.timestamp, |c| c.timestamp) {
                Ok(idx) => entry[idx] = candle,
                Err(idx) => entry.insert(idx, candle),
            }
        }
    }

    pub async fn len(&self, ticker: &str, timeframe: &str) -> usize {
        self.series
            .read()
            .await
            .get(&(ticker.to_string(), timeframe.to_string()))
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl MarketDataProvider for CandleMarketData {
    async fn indicator_value(
        &self,
        ticker: &str,
        indicator: &IndicatorRef,
        as_of: DateTime<Utc>,
    ) -> Result<IndicatorSample, MarketDataError> {
        let kind: IndicatorKind = indicator
            .indicator_key
            .parse()
            .map_err(MarketDataError::UnsupportedIndicator)?;
        let unavailable = |reason: &str| MarketDataError::DataUnavailable {
            ticker: ticker.to_string(),
            indicator: indicator.to_string(),
            reason: reason.to_string(),
        };

        let series = self.series.read().await;
        let candles = series
            .get(&(ticker.to_string(), indicator.timeframe.clone()))
            .ok_or_else(|| unavailable("no candles for timeframe"))?;

        let end = candles.partition_point(|c| c.timestamp <= as_of);
        let window = &candles[..end];
        let current = indicators::compute(kind, indicator, window)
            .ok_or_else(|| unavailable("not enough history"))?;
        let previous = match window.len() {
            0 | 1 => None,
            n => indicators::compute(kind, indicator, &window[..n - 1]),
        };

        Ok(IndicatorSample::new(current, previous))
    }

    async fn candles(
        &self,
        ticker: &str,
        timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, MarketDataError> {
        let series = self.series.read().await;
        let candles = series
            .get(&(ticker.to_string(), timeframe.to_string()))
            .ok_or_else(|| MarketDataError::DataUnavailable {
                ticker: ticker.to_string(),
                indicator: format!("candles@{}", timeframe),
                reason: "no candles for timeframe".to_string(),
            })?;
        Ok(candles
            .iter()
            .filter(|c| c.timestamp >= start && c.timestamp <= end)
            .copied()
            .collect())
    }
}
