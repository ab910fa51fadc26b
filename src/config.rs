//! Environment-driven configuration

use std::env;
use std::time::Duration;

/// Deployment environment (`APP_ENV`), defaults to `sandbox`
pub fn get_environment() -> String {
    env::var("APP_ENV").unwrap_or_else(|_| "sandbox".to_string())
}

pub fn get_redis_url() -> String {
    env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/".to_string())
}

pub fn get_database_url() -> String {
    env::var("DATABASE_URL")
        .unwrap_or_else(|_| "host=localhost user=cortex password=cortex dbname=cortex".to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Timing knobs for the execution layer
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Sleep between live-bot cycles while the bot is active
    pub live_poll_interval: Duration,
    /// Sleep between polls while the bot is paused
    pub paused_poll_interval: Duration,
    pub backtest_soft_timeout: Duration,
    pub backtest_hard_timeout: Duration,
    /// How long a live bot's run lease outlives its last renewal
    pub bot_lease_ttl: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            live_poll_interval: Duration::from_secs(60),
            paused_poll_interval: Duration::from_secs(30),
            backtest_soft_timeout: Duration::from_secs(240),
            backtest_hard_timeout: Duration::from_secs(300),
            bot_lease_ttl: Duration::from_secs(180),
        }
    }
}

impl ExecutionConfig {
    /// Lease lifetime, kept above twice the longest poll sleep so a live
    /// holder always renews in time
    pub fn effective_lease_ttl(&self) -> Duration {
        let longest_sleep = self.live_poll_interval.max(self.paused_poll_interval);
        self.bot_lease_ttl.max(longest_sleep * 2)
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            live_poll_interval: Duration::from_secs(env_parse(
                "LIVE_POLL_SECONDS",
                defaults.live_poll_interval.as_secs(),
            )),
            paused_poll_interval: Duration::from_secs(env_parse(
                "PAUSED_POLL_SECONDS",
                defaults.paused_poll_interval.as_secs(),
            )),
            backtest_soft_timeout: Duration::from_secs(env_parse(
                "BACKTEST_SOFT_TIMEOUT_SECONDS",
                defaults.backtest_soft_timeout.as_secs(),
            )),
            backtest_hard_timeout: Duration::from_secs(env_parse(
                "BACKTEST_HARD_TIMEOUT_SECONDS",
                defaults.backtest_hard_timeout.as_secs(),
            )),
            bot_lease_ttl: Duration::from_secs(env_parse(
                "BOT_LEASE_SECONDS",
                defaults.bot_lease_ttl.as_secs(),
            )),
        }
    }
}

/// Process-wide settings for both binaries
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: String,
    pub database_url: String,
    pub redis_url: String,
    pub port: u16,
    pub worker_concurrency: usize,
    /// Live-bot lease holder name; generated per process when unset
    pub worker_id: Option<String>,
    /// Base64 AES-256 key for credential decryption
    pub credential_key: Option<String>,
    /// Order endpoint; dry-run fills are used when unset
    pub exchange_base_url: Option<String>,
    /// Candle endpoint read by the worker
    pub market_data_url: Option<String>,
    /// Commission applied to dry-run fills
    pub dry_run_commission_pct: f64,
    pub execution: ExecutionConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            environment: get_environment(),
            database_url: get_database_url(),
            redis_url: get_redis_url(),
            port: env_parse("PORT", 8080),
            worker_concurrency: env_parse("WORKER_CONCURRENCY", 4),
            worker_id: env::var("WORKER_ID").ok().filter(|id| !id.is_empty()),
            credential_key: env::var("CREDENTIAL_KEY").ok().filter(|k| !k.is_empty()),
            exchange_base_url: env::var("EXCHANGE_BASE_URL").ok().filter(|u| !u.is_empty()),
            market_data_url: env::var("MARKET_DATA_URL").ok().filter(|u| !u.is_empty()),
            dry_run_commission_pct: env_parse("DRY_RUN_COMMISSION_PCT", 0.1),
            execution: ExecutionConfig::from_env(),
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self.environment.as_str(), "production" | "prod")
    }
}
