//! Cortex API Server
//!
//! HTTP API for strategies, backtests and live bots. Admission control runs
//! here; admitted jobs are handed to the worker through the Redis queue.
//! This service is stateless and can be horizontally scaled.

use apalis_redis::RedisStorage;
use cortex::config::AppConfig;
use cortex::core::http::{start_server, AppState};
use cortex::core::scheduler::QueueDispatcher;
use cortex::db::{PostgresStore, Store};
use cortex::jobs::store::JobStore;
use cortex::jobs::types::{RunBacktestJob, RunLiveBotJob};
use cortex::logging;
use cortex::metrics::Metrics;
use cortex::services::credentials::{cipher_from_key, CredentialVault};
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
    info!("Starting Cortex API Server");
    info!(environment = %config.environment, "Environment");
    info!(port = config.port, "HTTP Server: http://0.0.0.0:{}", config.port);

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
            return Err(format!("PostgreSQL connection required for API server: {}", e).into());
        }
    };

    info!("Initializing Apalis Redis storage...");
    let conn = apalis_redis::connect(config.redis_url.clone()).await?;
    let dispatcher = Arc::new(QueueDispatcher::new(
        RedisStorage::<RunBacktestJob>::new(conn.clone()),
        RedisStorage::<RunLiveBotJob>::new(conn),
    ));
    info!("Apalis Redis storage initialized");

    if config.credential_key.is_none() {
        warn!("CREDENTIAL_KEY not set: credential registration is disabled");
    }
    let cipher = cipher_from_key(config.credential_key.as_deref())?;
    let vault = Arc::new(CredentialVault::new(store.clone(), cipher));

    let jobs = Arc::new(
        JobStore::new(store, vault.clone(), dispatcher).with_metrics(metrics.clone()),
    );
    let state = AppState::new(metrics, jobs, vault);

    let port = config.port;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(port, state).await {
            error!(error = %e, "HTTP server error");
        }
    });

    // Graceful shutdown
    info!("API server started, waiting for shutdown signal...");
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Shutting down API server...");
            info!("API server stopped");
        }
        _ = server_handle => {
            error!("HTTP server stopped");
        }
    }

    Ok(())
}
