//! Cortex Worker
//!
//! Consumes backtest and live-bot jobs from the Redis queue and runs them on
//! the execution scheduler. Jobs left behind by a previous run are
//! recovered at startup.

use apalis_redis::RedisStorage;
use cortex::config::AppConfig;
use cortex::core::runtime::WorkerRuntime;
use cortex::core::scheduler::ExecutionScheduler;
use cortex::db::{PostgresStore, Store};
use cortex::jobs::context::JobContext;
use cortex::jobs::types::{RunBacktestJob, RunLiveBotJob};
use cortex::logging;
use cortex::metrics::Metrics;
use cortex::services::candle_feed::RestCandleFeed;
use cortex::services::credentials::{cipher_from_key, CredentialVault};
use cortex::services::exchange::{DryRunOrderClient, OrderClient, RestOrderClient};
use cortex::services::market_data::{CandleMarketData, MarketDataProvider};
use dotenvy::dotenv;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env if present
    dotenv().ok();

    // Initialize logging based on environment
    logging::init_logging();

    let config = AppConfig::from_env();
    info!("Starting Cortex Worker");
    info!(environment = %config.environment, "Environment");
    info!(
        concurrency = config.worker_concurrency,
        "Worker concurrency: {}", config.worker_concurrency
    );

    let metrics = Arc::new(Metrics::new()?);

    info!("Connecting to PostgreSQL...");
    let store: Arc<dyn Store> = match PostgresStore::connect(&config.database_url).await {
        Ok(store) => {
            info!("PostgreSQL connected");
            metrics.database_connected.set(1.0);
            Arc::new(store)
        }
        Err(e) => {
            error!(error = %e, "Failed to connect to PostgreSQL");
            return Err(format!("PostgreSQL connection required for worker: {}", e).into());
        }
    };

    let market_data: Arc<dyn MarketDataProvider> = match &config.market_data_url {
        Some(url) => {
            info!(url = %url, "Reading candles from market data endpoint");
            Arc::new(RestCandleFeed::new(url.clone())?)
        }
        None => {
            warn!("MARKET_DATA_URL not set: using an empty in-memory candle store");
            Arc::new(CandleMarketData::new())
        }
    };

    let orders: Arc<dyn OrderClient> = match &config.exchange_base_url {
        Some(url) => {
            info!(url = %url, "Placing live orders through exchange endpoint");
            Arc::new(RestOrderClient::new(url.clone())?)
        }
        None => {
            warn!("EXCHANGE_BASE_URL not set: live bots run with dry-run fills");
            Arc::new(DryRunOrderClient::new(config.dry_run_commission_pct))
        }
    };

    if config.credential_key.is_none() {
        warn!("CREDENTIAL_KEY not set: live bots cannot decrypt credentials");
    }
    let cipher = cipher_from_key(config.credential_key.as_deref())?;
    let vault = Arc::new(CredentialVault::new(store.clone(), cipher));

    let mut context = JobContext::new(store, market_data, vault, orders)
        .with_config(config.execution.clone())
        .with_metrics(metrics.clone());
    if let Some(worker_id) = &config.worker_id {
        context = context.with_worker_id(worker_id.clone());
    }
    info!(worker_id = %context.worker_id, "Live bot lease holder");
    let context = Arc::new(context);
    let scheduler = ExecutionScheduler::new(context);

    info!("Initializing Apalis Redis storage...");
    let conn = apalis_redis::connect(config.redis_url.clone()).await?;
    let backtest_storage = RedisStorage::<RunBacktestJob>::new(conn.clone());
    let live_bot_storage = RedisStorage::<RunLiveBotJob>::new(conn);
    info!("Apalis Redis storage initialized");

    info!("Starting Apalis workers...");
    let runtime = WorkerRuntime::new(scheduler.clone(), backtest_storage, live_bot_storage)
        .with_concurrency(config.worker_concurrency);
    let worker_handles = runtime.start().await;

    // Graceful shutdown
    info!("Worker started, waiting for shutdown signal...");
    signal::ctrl_c().await?;
    info!("Shutting down worker...");
    scheduler.shutdown().await;
    for handle in worker_handles {
        handle.abort();
    }
    info!("Worker stopped");

    Ok(())
}
