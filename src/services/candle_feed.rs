//! REST candle feed backfilling the in-memory candle store

use crate::error::MarketDataError;
use crate::indicators::IndicatorKind;
use crate::models::indicators::Candle;
use crate::models::strategy::IndicatorRef;
use crate::services::market_data::{CandleMarketData, MarketDataProvider};
use crate::strategies::IndicatorSample;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use tracing::debug;

/// Length of one bar for a timeframe label such as `15m`, `4h` or `1d`
pub fn timeframe_duration(timeframe: &str) -> Option<Duration> {
    let split = timeframe.find(|c: char| !c.is_ascii_digit())?;
    let (count, unit) = timeframe.split_at(split);
    let count: i64 = count.parse().ok().filter(|n| *n > 0)?;
    match unit {
        "m" => Some(Duration::minutes(count)),
        "h" => Some(Duration::hours(count)),
        "d" => Some(Duration::days(count)),
        "w" => Some(Duration::weeks(count)),
        _ => None,
    }
}

/// Market data read through a candle HTTP endpoint
///
/// `GET {base}/candles?ticker=..&timeframe=..&start=..&end=..` returns a
/// JSON array of candles. Fetched bars are merged into a local
/// [`CandleMarketData`], which computes the indicators.
pub struct RestCandleFeed {
    client: Client,
    base_url: String,
    cache: CandleMarketData,
}

impl RestCandleFeed {
    pub fn new(base_url: impl Into<String>) -> Result<Self, MarketDataError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(|e| MarketDataError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cache: CandleMarketData::new(),
        })
    }

    pub fn cache(&self) -> &CandleMarketData {
        &self.cache
    }

    /// Fetch `[start, end]` and merge it into the cache
    pub async fn sync(
        &self,
        ticker: &str,
        timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize, MarketDataError> {
        let url = format!("{}/candles", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("ticker", ticker.to_string()),
                ("timeframe", timeframe.to_string()),
                ("start", start.to_rfc3339()),
                ("end", end.to_rfc3339()),
            ])
            .send()
            .await
            .map_err(|e| MarketDataError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MarketDataError::Unreachable(format!(
                "candle endpoint returned {}",
                status
            )));
        }
        let candles: Vec<Candle> = response
            .json()
            .await
            .map_err(|e| MarketDataError::Unreachable(format!("invalid candle payload: {}", e)))?;

        let fetched = candles.len();
        debug!(ticker = %ticker, timeframe = %timeframe, fetched, "candles synced");
        self.cache.insert_candles(ticker, timeframe, candles).await;
        Ok(fetched)
    }
}

#[async_trait]
impl MarketDataProvider for RestCandleFeed {
    async fn indicator_value(
        &self,
        ticker: &str,
        indicator: &IndicatorRef,
        as_of: DateTime<Utc>,
    ) -> Result<IndicatorSample, MarketDataError> {
        match self.cache.indicator_value(ticker, indicator, as_of).await {
            Err(MarketDataError::DataUnavailable { .. }) => {}
            other => return other,
        }

        let kind: IndicatorKind = indicator
            .indicator_key
            .parse()
            .map_err(MarketDataError::UnsupportedIndicator)?;
        let bar = timeframe_duration(&indicator.timeframe)
            .ok_or_else(|| MarketDataError::UnsupportedIndicator(indicator.timeframe.clone()))?;
        let bars = kind.warmup(indicator) as i32 + 2;
        self.sync(ticker, &indicator.timeframe, as_of - bar * bars, as_of)
            .await?;
        self.cache.indicator_value(ticker, indicator, as_of).await
    }

    async fn candles(
        &self,
        ticker: &str,
        timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, MarketDataError> {
        self.sync(ticker, timeframe, start, end).await?;
        self.cache.candles(ticker, timeframe, start, end).await
    }
}
