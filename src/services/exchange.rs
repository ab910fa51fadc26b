//! Order placement against the exchange

use crate::error::OrderError;
use crate::models::trade_log::TradeSide;
use crate::services::credentials::CredentialPair;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub ticker: String,
    pub side: TradeSide,
    pub quantity: f64,
    /// Last observed price, used as the limit for market-like orders
    pub reference_price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFill {
    pub order_id: String,
    pub price: f64,
    pub quantity: f64,
    #[serde(default)]
    pub commission: f64,
    #[serde(default = "Utc::now")]
    pub filled_at: DateTime<Utc>,
}

#[async_trait]
pub trait OrderClient: Send + Sync {
    async fn place_order(
        &self,
        credentials: &CredentialPair,
        order: &OrderRequest,
    ) -> Result<OrderFill, OrderError>;
}

/// Fills every order immediately at the reference price
#[derive(Debug, Clone, Default)]
pub struct DryRunOrderClient {
    pub commission_pct: f64,
}

impl DryRunOrderClient {
    pub fn new(commission_pct: f64) -> Self {
        Self { commission_pct }
    }
}

#[async_trait]
impl OrderClient for DryRunOrderClient {
    async fn place_order(
        &self,
        _credentials: &CredentialPair,
        order: &OrderRequest,
    ) -> Result<OrderFill, OrderError> {
        if order.quantity <= 0.0 {
            return Err(OrderError::Rejected(format!(
                "quantity must be positive, got {}",
                order.quantity
            )));
        }
        let notional = order.reference_price * order.quantity;
        Ok(OrderFill {
            order_id: format!("dry-{}", order.client_order_id),
            price: order.reference_price,
            quantity: order.quantity,
            commission: notional * self.commission_pct / 100.0,
            filled_at: Utc::now(),
        })
    }
}

/// JSON-over-HTTP order gateway: `POST {base_url}/orders`
#[derive(Debug, Clone)]
pub struct RestOrderClient {
    base_url: String,
    http: reqwest::Client,
}

impl RestOrderClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, OrderError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[async_trait]
impl OrderClient for RestOrderClient {
    async fn place_order(
        &self,
        credentials: &CredentialPair,
        order: &OrderRequest,
    ) -> Result<OrderFill, OrderError> {
        debug!(
            ticker = %order.ticker,
            side = order.side.as_str(),
            quantity = order.quantity,
            client_order_id = %order.client_order_id,
            "RestOrderClient: placing order"
        );

        let response = self
            .http
            .post(format!("{}/orders", self.base_url))
            .header("x-api-key", credentials.expose_api_key())
            .header("x-api-secret", credentials.expose_secret())
            .json(order)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OrderError::Rejected(format!("{}: {}", status, body)));
        }

        response
            .json::<OrderFill>()
            .await
            .map_err(|e| OrderError::InvalidResponse(e.to_string()))
    }
}
