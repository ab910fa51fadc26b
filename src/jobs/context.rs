//! Dependencies shared by every job worker

use crate::config::ExecutionConfig;
use crate::db::Store;
use crate::jobs::backtest::{BacktestSimulator, LongOnlySimulator};
use crate::metrics::Metrics;
use crate::services::credentials::CredentialStore;
use crate::services::exchange::OrderClient;
use crate::services::market_data::MarketDataProvider;
use crate::services::notifications::{LogNotifier, Notifier};
use chrono::Utc;
use std::sync::Arc;

/// Lease holder name unique to this process
pub fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
    format!("{}-{}-{}", host, std::process::id(), Utc::now().timestamp_millis())
}

/// Built once at process start and shared by the scheduler and its workers
pub struct JobContext {
    pub store: Arc<dyn Store>,
    pub market_data: Arc<dyn MarketDataProvider>,
    pub credentials: Arc<dyn CredentialStore>,
    pub orders: Arc<dyn OrderClient>,
    pub notifier: Arc<dyn Notifier>,
    pub simulator: Arc<dyn BacktestSimulator>,
    pub metrics: Option<Arc<Metrics>>,
    pub config: ExecutionConfig,
    /// Holder name for live-bot run leases
    pub worker_id: String,
}

impl JobContext {
    pub fn new(
        store: Arc<dyn Store>,
        market_data: Arc<dyn MarketDataProvider>,
        credentials: Arc<dyn CredentialStore>,
        orders: Arc<dyn OrderClient>,
    ) -> Self {
        Self {
            store,
            market_data,
            credentials,
            orders,
            notifier: Arc::new(LogNotifier),
            simulator: Arc::new(LongOnlySimulator),
            metrics: None,
            config: ExecutionConfig::default(),
            worker_id: default_worker_id(),
        }
    }

    pub fn with_config(mut self, config: ExecutionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_simulator(mut self, simulator: Arc<dyn BacktestSimulator>) -> Self {
        self.simulator = simulator;
        self
    }
}
