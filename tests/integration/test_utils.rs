//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Duration, TimeZone, Utc};
use cortex::core::scheduler::JobDispatcher;
use cortex::db::{MemoryStore, Store, StrategyRepository};
use cortex::error::DispatchError;
use cortex::jobs::context::JobContext;
use cortex::jobs::store::JobStore;
use cortex::models::credential::ApiCredential;
use cortex::models::indicators::Candle;
use cortex::models::job::{BacktestParameters, BacktestRequest, JobRef, LiveBotRequest};
use cortex::models::plan::{Plan, PlanFeatures, Subscription, SubscriptionStatus};
use cortex::models::strategy::{
    ComparisonOperator, Condition, IndicatorRef, NewStrategy, SignalBlock, Strategy,
    StrategyRules,
};
use cortex::services::credentials::{AesGcmCipher, CredentialVault};
use cortex::services::exchange::DryRunOrderClient;
use cortex::services::market_data::{CandleMarketData, MarketDataProvider};
use cortex::services::notifications::{JobNotification, Notifier};
use serde_json::Map;
use std::sync::Arc;
use tokio::sync::Mutex;

pub const TICKER: &str = "BTC";

pub fn test_cipher() -> Arc<AesGcmCipher> {
    Arc::new(AesGcmCipher::from_base64(&STANDARD.encode([42u8; 32])).expect("valid key"))
}

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Hourly candles starting at [`base_time`], one per close
pub fn hourly_candles(closes: &[f64]) -> Vec<Candle> {
    closes
        .iter()
        .enumerate()
        .map(|(i, close)| {
            Candle::new(
                *close,
                close + 0.5,
                close - 0.5,
                *close,
                1_000.0,
                base_time() + Duration::hours(i as i64),
            )
        })
        .collect()
}

/// Buy when close > `buy_above`, sell when close < `sell_below`
pub fn price_rules(timeframe: &str, buy_above: f64, sell_below: f64) -> StrategyRules {
    let close = IndicatorRef::new("CLOSE", timeframe);
    StrategyRules {
        buy: vec![SignalBlock::new(
            "buy-1",
            Condition::indicator_with(close.clone()),
            ComparisonOperator::GreaterThan,
            Condition::value(buy_above),
        )],
        sell: vec![SignalBlock::new(
            "sell-1",
            Condition::indicator_with(close),
            ComparisonOperator::LessThan,
            Condition::value(sell_below),
        )],
    }
}

pub fn rsi_rules(timeframe: &str) -> StrategyRules {
    StrategyRules {
        buy: vec![SignalBlock::new(
            "rsi-buy",
            Condition::indicator_with(IndicatorRef::new("RSI", timeframe).with_param("period", 14)),
            ComparisonOperator::LessThan,
            Condition::value(30.0),
        )],
        sell: vec![],
    }
}

pub fn new_strategy(name: &str, rules: StrategyRules) -> NewStrategy {
    NewStrategy {
        name: name.to_string(),
        description: None,
        rules,
        is_public: false,
    }
}

pub fn backtest_request(strategy_id: i64) -> BacktestRequest {
    BacktestRequest {
        strategy_id,
        parameters: BacktestParameters {
            ticker: TICKER.to_string(),
            timeframe: "1h".to_string(),
            start_date: base_time(),
            end_date: base_time() + Duration::days(2),
            initial_capital: 1_000.0,
            commission_pct: 0.0,
            extra: Map::new(),
        },
    }
}

pub fn live_bot_request(strategy_id: i64, credential_id: i64) -> LiveBotRequest {
    LiveBotRequest {
        strategy_id,
        credential_id,
        ticker: TICKER.to_string(),
        timeframe: "1h".to_string(),
        initial_capital: 1_000.0,
        order_quantity: 0.5,
    }
}

/// Active subscription for `user_id` to a plan with the given limits
pub async fn subscribe(
    store: &MemoryStore,
    user_id: i64,
    max_backtests_per_day: u32,
    concurrent_bots: u32,
    timeframes: &[&str],
) -> Plan {
    let plan = store
        .insert_plan(Plan {
            id: 0,
            name: format!("plan-{}", user_id),
            price: 19.0,
            features: PlanFeatures {
                max_backtests_per_day: Some(max_backtests_per_day),
                concurrent_bots: Some(concurrent_bots),
                allowed_timeframes: Some(timeframes.iter().map(|t| t.to_string()).collect()),
            },
        })
        .await;
    store
        .put_subscription(Subscription {
            user_id,
            plan_id: plan.id,
            status: SubscriptionStatus::Active,
            current_period_end: Utc::now() + Duration::days(30),
        })
        .await;
    plan
}

pub async fn insert_strategy(store: &MemoryStore, owner_id: i64, rules: StrategyRules) -> Strategy {
    store
        .insert_strategy(owner_id, new_strategy("test strategy", rules))
        .await
        .expect("insert strategy")
}

/// Dispatcher that records hand-offs and revocations
#[derive(Default)]
pub struct RecordingDispatcher {
    pub dispatched: Mutex<Vec<JobRef>>,
    pub revoked: Mutex<Vec<(JobRef, bool)>>,
    pub fail: bool,
}

impl RecordingDispatcher {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl JobDispatcher for RecordingDispatcher {
    async fn dispatch(&self, job: JobRef) -> Result<(), DispatchError> {
        if self.fail {
            return Err(DispatchError::Queue("connection refused".to_string()));
        }
        self.dispatched.lock().await.push(job);
        Ok(())
    }

    async fn revoke(&self, job: JobRef, terminate: bool) {
        self.revoked.lock().await.push((job, terminate));
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<JobNotification>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: JobNotification) {
        self.sent.lock().await.push(notification);
    }
}

/// Job store over an in-memory database with a recording dispatcher
pub struct TestJobStore {
    pub store: Arc<MemoryStore>,
    pub vault: Arc<CredentialVault>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub jobs: Arc<JobStore>,
}

impl TestJobStore {
    pub fn new() -> Self {
        Self::with_dispatcher(RecordingDispatcher::default())
    }

    pub fn with_dispatcher(dispatcher: RecordingDispatcher) -> Self {
        let store = Arc::new(MemoryStore::new());
        let vault = Arc::new(CredentialVault::new(store.clone(), test_cipher()));
        let dispatcher = Arc::new(dispatcher);
        let jobs = Arc::new(JobStore::new(store.clone(), vault.clone(), dispatcher.clone()));
        Self {
            store,
            vault,
            dispatcher,
            jobs,
        }
    }

    pub async fn credential(&self, user_id: i64) -> ApiCredential {
        self.vault
            .register(user_id, "binance", "key-123", "secret-456")
            .await
            .expect("register credential")
    }
}

/// Worker-side context over an in-memory database and candle store
pub struct TestWorkerContext {
    pub store: Arc<MemoryStore>,
    pub market_data: CandleMarketData,
    pub vault: Arc<CredentialVault>,
    pub notifier: Arc<RecordingNotifier>,
    pub context: Arc<JobContext>,
}

impl TestWorkerContext {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    pub fn with_store(store: Arc<MemoryStore>) -> Self {
        let market_data = CandleMarketData::new();
        let vault = Arc::new(CredentialVault::new(store.clone(), test_cipher()));
        let notifier = Arc::new(RecordingNotifier::default());
        let context = Arc::new(
            JobContext::new(
                store.clone() as Arc<dyn Store>,
                Arc::new(market_data.clone()),
                vault.clone(),
                Arc::new(DryRunOrderClient::new(0.0)),
            )
            .with_notifier(notifier.clone()),
        );
        Self {
            store,
            market_data,
            vault,
            notifier,
            context,
        }
    }
}

/// Context over `store` with a caller-supplied market data provider
pub fn job_context(store: Arc<MemoryStore>, market_data: Arc<dyn MarketDataProvider>) -> JobContext {
    let vault = Arc::new(CredentialVault::new(store.clone(), test_cipher()));
    JobContext::new(
        store as Arc<dyn Store>,
        market_data,
        vault,
        Arc::new(DryRunOrderClient::new(0.0)),
    )
}

/// Poll `check` every 10ms until it holds, for at most `attempts` polls
pub async fn wait_until<F, Fut>(attempts: usize, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..attempts {
        if check().await {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    false
}
