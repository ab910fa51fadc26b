//! Integration tests for the worker side: backtest runs, the live bot
//! control loop and the execution scheduler.

use crate::test_utils::{
    backtest_request, base_time, hourly_candles, insert_strategy, job_context, price_rules, rsi_rules,
    wait_until, TestWorkerContext, TICKER,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use cortex::core::runtime::{recover_jobs, RecoveryReport};
use cortex::core::scheduler::ExecutionScheduler;
use cortex::db::{Admission, JobRepository, MemoryStore, Store, TradeLogRepository};
use cortex::error::MarketDataError;
use cortex::jobs::backtest::{run_backtest, BacktestSimulator, BarSignal, SimulationOutcome};
use cortex::jobs::live_bot::LiveBotRunner;
use cortex::jobs::store::JobStore;
use cortex::models::indicators::Candle;
use cortex::models::job::{
    Backtest, BacktestParameters, JobRef, JobStatus, LiveBot, NewBacktest, NewLiveBot,
    TransitionStamp,
};
use cortex::models::strategy::IndicatorRef;
use cortex::models::trade_log::TradeSide;
use cortex::models::user::User;
use cortex::services::market_data::{CandleMarketData, MarketDataProvider};
use cortex::strategies::IndicatorSample;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio_util::sync::CancellationToken;

/// Never answers, so the worker hangs wherever it asks for data
struct StalledMarketData;

#[async_trait]
impl MarketDataProvider for StalledMarketData {
    async fn indicator_value(
        &self,
        _ticker: &str,
        _indicator: &IndicatorRef,
        _as_of: DateTime<Utc>,
    ) -> Result<IndicatorSample, MarketDataError> {
        std::future::pending().await
    }

    async fn candles(
        &self,
        _ticker: &str,
        _timeframe: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, MarketDataError> {
        std::future::pending().await
    }
}

/// Feed that is always down, counting candle requests
#[derive(Default)]
struct UnreachableMarketData {
    candle_requests: AtomicUsize,
}

impl UnreachableMarketData {
    fn requests(&self) -> usize {
        self.candle_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MarketDataProvider for UnreachableMarketData {
    async fn indicator_value(
        &self,
        _ticker: &str,
        _indicator: &IndicatorRef,
        _as_of: DateTime<Utc>,
    ) -> Result<IndicatorSample, MarketDataError> {
        Err(MarketDataError::Unreachable("feed offline".to_string()))
    }

    async fn candles(
        &self,
        _ticker: &str,
        _timeframe: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, MarketDataError> {
        self.candle_requests.fetch_add(1, Ordering::SeqCst);
        Err(MarketDataError::Unreachable("feed offline".to_string()))
    }
}

/// Candle feed that takes the store down on the first 1h lookup
struct OutageOnHourlyLookup {
    inner: CandleMarketData,
    store: Arc<MemoryStore>,
    tripped: AtomicBool,
}

#[async_trait]
impl MarketDataProvider for OutageOnHourlyLookup {
    async fn indicator_value(
        &self,
        ticker: &str,
        indicator: &IndicatorRef,
        as_of: DateTime<Utc>,
    ) -> Result<IndicatorSample, MarketDataError> {
        if indicator.timeframe == "1h" && !self.tripped.swap(true, Ordering::SeqCst) {
            self.store.simulate_outage();
        }
        self.inner.indicator_value(ticker, indicator, as_of).await
    }

    async fn candles(
        &self,
        ticker: &str,
        timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, MarketDataError> {
        self.inner.candles(ticker, timeframe, start, end).await
    }
}

struct PanickingSimulator;

impl BacktestSimulator for PanickingSimulator {
    fn simulate(&self, _params: &BacktestParameters, _bars: &[BarSignal]) -> SimulationOutcome {
        panic!("simulator blew up")
    }
}

async fn pending_backtest(store: &MemoryStore, strategy_id: i64) -> Backtest {
    let admission = store
        .admit_backtest(
            NewBacktest {
                user_id: 1,
                strategy_id,
                parameters: backtest_request(strategy_id).parameters,
            },
            Utc::now() - Duration::days(1),
            100,
        )
        .await
        .expect("admit backtest");
    match admission {
        Admission::Admitted(backtest) => backtest,
        other => panic!("unexpected admission {:?}", other),
    }
}

async fn initializing_bot(store: &MemoryStore, strategy_id: i64, credential_id: i64) -> LiveBot {
    let admission = store
        .admit_live_bot(
            NewLiveBot {
                user_id: 1,
                strategy_id,
                credential_id,
                ticker: TICKER.to_string(),
                timeframe: "1h".to_string(),
                initial_capital: 1_000.0,
                order_quantity: 0.5,
            },
            100,
        )
        .await
        .expect("admit bot");
    match admission {
        Admission::Admitted(bot) => bot,
        other => panic!("unexpected admission {:?}", other),
    }
}

async fn set_status(store: &MemoryStore, job: JobRef, from: JobStatus, to: JobStatus) {
    store
        .transition(job, &[from], to, TransitionStamp::default())
        .await
        .expect("status change");
}

async fn backtest_status(store: &MemoryStore, id: i64) -> Option<JobStatus> {
    store
        .get_backtest(id)
        .await
        .ok()
        .flatten()
        .map(|b| b.status)
}

async fn bot_status(store: &MemoryStore, id: i64) -> Option<JobStatus> {
    store
        .get_live_bot(id)
        .await
        .ok()
        .flatten()
        .map(|b| b.status)
}

async fn wait_for_backtest(store: &MemoryStore, id: i64, status: JobStatus) -> bool {
    wait_until(200, move || async move { backtest_status(store, id).await == Some(status) }).await
}

async fn wait_for_bot(store: &MemoryStore, id: i64, status: JobStatus) -> bool {
    wait_until(200, move || async move { bot_status(store, id).await == Some(status) }).await
}

// Backtests

#[tokio::test]
async fn backtest_runs_to_completion() {
    let env = TestWorkerContext::new();
    let strategy = insert_strategy(&env.store, 1, price_rules("1h", 105.0, 95.0)).await;
    env.market_data
        .insert_candles(TICKER, "1h", hourly_candles(&[100.0, 110.0, 120.0, 90.0]))
        .await;
    let backtest = pending_backtest(&env.store, strategy.id).await;

    run_backtest(&env.context, backtest.id, &CancellationToken::new(), false)
        .await
        .expect("backtest succeeds");

    let stored = env.store.get_backtest(backtest.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert!(stored.started_at.is_some());
    assert!(stored.completed_at.is_some());

    let trades = env
        .store
        .trade_logs(JobRef::backtest(backtest.id))
        .await
        .unwrap();
    assert_eq!(trades.len(), 2);
    assert_eq!(trades[0].side, TradeSide::Buy);
    assert_eq!(trades[0].price, 110.0);
    assert_eq!(trades[1].side, TradeSide::Sell);
    assert_eq!(trades[1].price, 90.0);
    assert!(trades[0].timestamp < trades[1].timestamp);

    let result = env
        .store
        .backtest_result(backtest.id)
        .await
        .unwrap()
        .expect("result saved");
    assert_eq!(result.trade_count, 2);
    assert_eq!(result.equity_curve.len(), 4);
    assert!((result.final_balance - 1_000.0 * 90.0 / 110.0).abs() < 1e-6);
    assert!(result.total_return_pct < 0.0);
    assert_eq!(result.win_rate_pct, Some(0.0));

    let sent = env.notifier.sent.lock().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].status, JobStatus::Completed);
}

#[tokio::test]
async fn backtest_skips_job_that_left_pending() {
    let env = TestWorkerContext::new();
    let strategy = insert_strategy(&env.store, 1, price_rules("1h", 105.0, 95.0)).await;
    env.market_data
        .insert_candles(TICKER, "1h", hourly_candles(&[100.0, 110.0]))
        .await;
    let backtest = pending_backtest(&env.store, strategy.id).await;
    let job = JobRef::backtest(backtest.id);
    set_status(&env.store, job, JobStatus::Pending, JobStatus::Canceled).await;

    tokio_test::assert_ok!(run_backtest(&env.context, backtest.id, &CancellationToken::new(), false).await);

    assert_eq!(
        backtest_status(&env.store, backtest.id).await,
        Some(JobStatus::Canceled)
    );
    assert!(env.store.trade_logs(job).await.unwrap().is_empty());
    assert!(env.store.backtest_result(backtest.id).await.unwrap().is_none());

    // missing records are ignored too
    tokio_test::assert_ok!(run_backtest(&env.context, 9_999, &CancellationToken::new(), false).await);
}

#[tokio::test]
async fn insufficient_history_fails_the_backtest() {
    let env = TestWorkerContext::new();
    let strategy = insert_strategy(&env.store, 1, rsi_rules("1h")).await;
    env.market_data
        .insert_candles(TICKER, "1h", hourly_candles(&[100.0, 101.0, 99.0, 102.0, 98.0]))
        .await;
    let backtest = pending_backtest(&env.store, strategy.id).await;
    let scheduler = ExecutionScheduler::new(env.context.clone());

    scheduler.submit(JobRef::backtest(backtest.id)).await;
    assert!(wait_for_backtest(&env.store, backtest.id, JobStatus::Failed).await);

    let stored = env.store.get_backtest(backtest.id).await.unwrap().unwrap();
    assert!(stored
        .failure_reason
        .as_deref()
        .is_some_and(|r| r.contains("insufficient history")));
    assert!(stored.completed_at.is_some());

    let sent = env.notifier.sent.lock().await;
    assert_eq!(sent.last().map(|n| n.status), Some(JobStatus::Failed));
}

#[tokio::test]
async fn job_store_hands_off_to_in_process_scheduler() {
    let env = TestWorkerContext::new();
    env.market_data
        .insert_candles(TICKER, "1h", hourly_candles(&[100.0, 110.0, 120.0, 90.0]))
        .await;
    let scheduler = ExecutionScheduler::new(env.context.clone());
    let jobs = JobStore::new(
        env.store.clone() as Arc<dyn Store>,
        env.vault.clone(),
        Arc::new(scheduler.clone()),
    );
    let user = User::new(1);
    let strategy = insert_strategy(&env.store, 1, price_rules("1h", 105.0, 95.0)).await;

    let backtest = jobs
        .create_backtest_job(&user, backtest_request(strategy.id))
        .await
        .unwrap();
    assert!(wait_for_backtest(&env.store, backtest.id, JobStatus::Completed).await);

    let trades = jobs
        .trade_logs(JobRef::backtest(backtest.id), &user)
        .await
        .unwrap();
    assert_eq!(trades.len(), 2);
    let result = jobs.backtest_result(backtest.id, &user).await.unwrap();
    assert_eq!(result.backtest_id, backtest.id);
}

// Scheduler

#[tokio::test]
async fn submit_is_idempotent_per_job() {
    let store = Arc::new(MemoryStore::new());
    let strategy = insert_strategy(&store, 1, price_rules("1h", 105.0, 95.0)).await;
    let backtest = pending_backtest(&store, strategy.id).await;
    let scheduler = ExecutionScheduler::new(Arc::new(job_context(
        store.clone(),
        Arc::new(StalledMarketData),
    )));
    let job = JobRef::backtest(backtest.id);

    let first = scheduler.submit(job).await;
    let second = scheduler.submit(job).await;
    assert_eq!(first.job(), second.job());
    assert_eq!(scheduler.running_jobs().await, vec![job]);
    assert!(scheduler.is_running(job).await);

    assert!(scheduler.revoke_job(job, true).await);
    assert!(first.is_cancelled());
    let sched = &scheduler;
    assert!(wait_until(200, move || async move { !sched.is_running(job).await }).await);

    // an aborted worker leaves the record to the caller
    assert_eq!(
        backtest_status(&store, backtest.id).await,
        Some(JobStatus::Running)
    );
    assert!(!scheduler.revoke_job(JobRef::backtest(4_242), true).await);
}

#[tokio::test(start_paused = true)]
async fn hard_time_limit_fails_the_backtest() {
    let store = Arc::new(MemoryStore::new());
    let strategy = insert_strategy(&store, 1, price_rules("1h", 105.0, 95.0)).await;
    let backtest = pending_backtest(&store, strategy.id).await;
    let scheduler = ExecutionScheduler::new(Arc::new(job_context(
        store.clone(),
        Arc::new(StalledMarketData),
    )));
    let job = JobRef::backtest(backtest.id);

    let handle = scheduler.submit(job).await;
    tokio::time::sleep(StdDuration::from_secs(250)).await;
    assert!(handle.is_cancelled(), "soft limit requests cancellation");
    assert_eq!(
        backtest_status(&store, backtest.id).await,
        Some(JobStatus::Running)
    );

    tokio::time::sleep(StdDuration::from_secs(60)).await;
    let stored = store.get_backtest(backtest.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert!(stored
        .failure_reason
        .as_deref()
        .is_some_and(|r| r.contains("hard time limit exceeded")));
    assert!(!scheduler.is_running(job).await);
}

#[tokio::test(start_paused = true)]
async fn unreachable_feed_is_retried_until_exhausted() {
    let store = Arc::new(MemoryStore::new());
    let strategy = insert_strategy(&store, 1, price_rules("1h", 105.0, 95.0)).await;
    let backtest = pending_backtest(&store, strategy.id).await;
    let feed = Arc::new(UnreachableMarketData::default());
    let scheduler = ExecutionScheduler::new(Arc::new(job_context(store.clone(), feed.clone())));
    let job = JobRef::backtest(backtest.id);

    scheduler.submit(job).await;
    tokio::time::sleep(StdDuration::from_secs(10)).await;
    assert_eq!(feed.requests(), 1);
    assert_eq!(backtest_status(&store, backtest.id).await, Some(JobStatus::Running));
    assert!(scheduler.is_running(job).await, "waiting out the backoff");

    // second attempt after 300s, outliving the per-attempt hard limit
    tokio::time::sleep(StdDuration::from_secs(300)).await;
    assert_eq!(feed.requests(), 2);
    assert_eq!(backtest_status(&store, backtest.id).await, Some(JobStatus::Running));

    // third and last attempt after a further 600s
    tokio::time::sleep(StdDuration::from_secs(600)).await;
    assert_eq!(feed.requests(), 3);

    tokio::time::sleep(StdDuration::from_secs(10)).await;
    let stored = store.get_backtest(backtest.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    let reason = stored.failure_reason.unwrap_or_default();
    assert!(reason.contains("retries exhausted after 3 attempts"), "{}", reason);
    assert!(reason.contains("unreachable"), "{}", reason);
    assert!(!scheduler.is_running(job).await);

    tokio::time::sleep(StdDuration::from_secs(3_600)).await;
    assert_eq!(feed.requests(), 3);
}

#[tokio::test(start_paused = true)]
async fn revoke_during_backoff_stops_retries() {
    let store = Arc::new(MemoryStore::new());
    let strategy = insert_strategy(&store, 1, price_rules("1h", 105.0, 95.0)).await;
    let backtest = pending_backtest(&store, strategy.id).await;
    let feed = Arc::new(UnreachableMarketData::default());
    let scheduler = ExecutionScheduler::new(Arc::new(job_context(store.clone(), feed.clone())));
    let job = JobRef::backtest(backtest.id);

    scheduler.submit(job).await;
    tokio::time::sleep(StdDuration::from_secs(10)).await;
    assert_eq!(feed.requests(), 1);

    assert!(scheduler.revoke_job(job, true).await);
    tokio::time::sleep(StdDuration::from_secs(1_000)).await;
    assert_eq!(feed.requests(), 1);
    assert!(!scheduler.is_running(job).await);
}

#[tokio::test]
async fn panicking_worker_is_recorded_as_failed() {
    let env = TestWorkerContext::new();
    let strategy = insert_strategy(&env.store, 1, price_rules("1h", 105.0, 95.0)).await;
    env.market_data
        .insert_candles(TICKER, "1h", hourly_candles(&[100.0, 110.0]))
        .await;
    let backtest = pending_backtest(&env.store, strategy.id).await;
    let ctx = job_context(env.store.clone(), Arc::new(env.market_data.clone()))
        .with_simulator(Arc::new(PanickingSimulator));
    let scheduler = ExecutionScheduler::new(Arc::new(ctx));

    scheduler.submit(JobRef::backtest(backtest.id)).await;
    assert!(wait_for_backtest(&env.store, backtest.id, JobStatus::Failed).await);
    let stored = env.store.get_backtest(backtest.id).await.unwrap().unwrap();
    assert_eq!(stored.failure_reason.as_deref(), Some("worker panicked"));
}

#[tokio::test]
async fn recovery_resubmits_unfinished_jobs() {
    let env = TestWorkerContext::new();
    let strategy = insert_strategy(&env.store, 1, price_rules("1h", 105.0, 95.0)).await;
    let credential = env
        .vault
        .register(1, "binance", "key", "secret")
        .await
        .unwrap();

    let interrupted = pending_backtest(&env.store, strategy.id).await;
    set_status(
        &env.store,
        JobRef::backtest(interrupted.id),
        JobStatus::Pending,
        JobStatus::Running,
    )
    .await;
    let queued = pending_backtest(&env.store, strategy.id).await;
    let bot = initializing_bot(&env.store, strategy.id, credential.id).await;
    let stopped = initializing_bot(&env.store, strategy.id, credential.id).await;
    set_status(
        &env.store,
        JobRef::live_bot(stopped.id),
        JobStatus::Initializing,
        JobStatus::Stopped,
    )
    .await;

    let ctx = job_context(env.store.clone(), Arc::new(StalledMarketData));
    let scheduler = ExecutionScheduler::new(Arc::new(ctx));
    let report = recover_jobs(&scheduler).await.unwrap();
    assert_eq!(
        report,
        RecoveryReport {
            resubmitted_backtests: 1,
            failed_backtests: 1,
            resubmitted_bots: 1,
        }
    );

    let failed = env
        .store
        .get_backtest(interrupted.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.failure_reason.as_deref(), Some("worker restarted"));

    let running = scheduler.running_jobs().await;
    assert!(running.contains(&JobRef::backtest(queued.id)));
    assert!(running.contains(&JobRef::live_bot(bot.id)));
    assert!(!running.contains(&JobRef::live_bot(stopped.id)));

    scheduler.shutdown().await;
}

// Live bots

#[tokio::test(start_paused = true)]
async fn live_bot_trades_on_signals() {
    let env = TestWorkerContext::new();
    let strategy = insert_strategy(&env.store, 1, price_rules("1h", 105.0, 95.0)).await;
    let credential = env
        .vault
        .register(1, "binance", "key", "secret")
        .await
        .unwrap();
    env.market_data
        .insert_candles(TICKER, "1h", hourly_candles(&[100.0, 110.0]))
        .await;
    let bot = initializing_bot(&env.store, strategy.id, credential.id).await;
    let job = JobRef::live_bot(bot.id);

    let ctx = env.context.clone();
    let runner = tokio::spawn(async move {
        LiveBotRunner::new(&ctx, bot.id, CancellationToken::new())
            .run()
            .await
    });

    tokio::time::sleep(StdDuration::from_secs(1)).await;
    let active = env.store.get_live_bot(bot.id).await.unwrap().unwrap();
    assert_eq!(active.status, JobStatus::Active);
    assert!(active.started_at.is_some());
    assert!(active.last_run_at.is_some());

    let trades = env.store.trade_logs(job).await.unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].side, TradeSide::Buy);
    assert_eq!(trades[0].quantity, 0.5);
    assert!((trades[0].balance - 945.0).abs() < 1e-9);

    // still holding: a repeated buy signal is ignored
    tokio::time::sleep(StdDuration::from_secs(60)).await;
    assert_eq!(env.store.trade_logs(job).await.unwrap().len(), 1);

    env.market_data
        .insert_candles(
            TICKER,
            "1h",
            vec![Candle::new(
                90.0,
                90.5,
                89.5,
                90.0,
                1_000.0,
                base_time() + Duration::hours(2),
            )],
        )
        .await;
    tokio::time::sleep(StdDuration::from_secs(60)).await;
    let trades = env.store.trade_logs(job).await.unwrap();
    assert_eq!(trades.len(), 2);
    assert_eq!(trades[1].side, TradeSide::Sell);
    assert!((trades[1].pnl.unwrap() - (-10.0)).abs() < 1e-9);

    set_status(&env.store, job, JobStatus::Active, JobStatus::Stopped).await;
    let finished = tokio::time::timeout(StdDuration::from_secs(120), runner)
        .await
        .expect("runner exits after stop")
        .expect("runner task");
    assert!(finished.is_ok());
}

#[tokio::test(start_paused = true)]
async fn paused_bot_skips_cycles() {
    let env = TestWorkerContext::new();
    let strategy = insert_strategy(&env.store, 1, price_rules("1h", 105.0, 95.0)).await;
    let credential = env
        .vault
        .register(1, "binance", "key", "secret")
        .await
        .unwrap();
    env.market_data
        .insert_candles(TICKER, "1h", hourly_candles(&[100.0, 100.0]))
        .await;
    let bot = initializing_bot(&env.store, strategy.id, credential.id).await;
    let job = JobRef::live_bot(bot.id);

    let token = CancellationToken::new();
    let ctx = env.context.clone();
    let runner_token = token.clone();
    let runner = tokio::spawn(async move { LiveBotRunner::new(&ctx, bot.id, runner_token).run().await });

    tokio::time::sleep(StdDuration::from_secs(1)).await;
    set_status(&env.store, job, JobStatus::Active, JobStatus::Paused).await;
    let before = env.store.get_live_bot(bot.id).await.unwrap().unwrap();

    // a buy signal appears while paused
    env.market_data
        .insert_candles(TICKER, "1h", hourly_candles(&[100.0, 100.0, 110.0]))
        .await;
    tokio::time::sleep(StdDuration::from_secs(120)).await;
    let paused = env.store.get_live_bot(bot.id).await.unwrap().unwrap();
    assert_eq!(paused.status, JobStatus::Paused);
    assert_eq!(paused.last_run_at, before.last_run_at);
    assert!(env.store.trade_logs(job).await.unwrap().is_empty());

    set_status(&env.store, job, JobStatus::Paused, JobStatus::Active).await;
    tokio::time::sleep(StdDuration::from_secs(31)).await;
    assert_eq!(env.store.trade_logs(job).await.unwrap().len(), 1);

    // local revoke exits without touching the record
    token.cancel();
    runner.await.unwrap().unwrap();
    assert_eq!(bot_status(&env.store, bot.id).await, Some(JobStatus::Active));
}

#[tokio::test(start_paused = true)]
async fn live_bot_reconnects_after_store_outage() {
    let env = TestWorkerContext::new();
    let strategy = insert_strategy(&env.store, 1, price_rules("1h", 105.0, 95.0)).await;
    let credential = env
        .vault
        .register(1, "binance", "key", "secret")
        .await
        .unwrap();
    env.market_data
        .insert_candles(TICKER, "1h", hourly_candles(&[100.0, 100.0]))
        .await;
    let bot = initializing_bot(&env.store, strategy.id, credential.id).await;

    let token = CancellationToken::new();
    let ctx = env.context.clone();
    let runner_token = token.clone();
    let runner = tokio::spawn(async move { LiveBotRunner::new(&ctx, bot.id, runner_token).run().await });

    tokio::time::sleep(StdDuration::from_secs(1)).await;
    let first_run = env
        .store
        .get_live_bot(bot.id)
        .await
        .unwrap()
        .unwrap()
        .last_run_at;

    env.store.simulate_outage();
    tokio::time::sleep(StdDuration::from_secs(60)).await;

    assert_eq!(env.store.reconnect_count(), 1);
    let after = env.store.get_live_bot(bot.id).await.unwrap().unwrap();
    assert_eq!(after.status, JobStatus::Active);
    assert!(after.last_run_at > first_run);
    assert!(!runner.is_finished());

    token.cancel();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn deleted_bot_exits_as_orphan() {
    let env = TestWorkerContext::new();
    let strategy = insert_strategy(&env.store, 1, price_rules("1h", 105.0, 95.0)).await;
    let credential = env
        .vault
        .register(1, "binance", "key", "secret")
        .await
        .unwrap();
    env.market_data
        .insert_candles(TICKER, "1h", hourly_candles(&[100.0, 100.0]))
        .await;
    let bot = initializing_bot(&env.store, strategy.id, credential.id).await;

    let ctx = env.context.clone();
    let runner = tokio::spawn(async move {
        LiveBotRunner::new(&ctx, bot.id, CancellationToken::new())
            .run()
            .await
    });

    tokio::time::sleep(StdDuration::from_secs(1)).await;
    env.store.delete_live_bot(bot.id).await.unwrap();

    let finished = tokio::time::timeout(StdDuration::from_secs(120), runner)
        .await
        .expect("orphaned loop exits")
        .expect("runner task");
    assert!(finished.is_ok());
    assert!(env.store.get_live_bot(bot.id).await.unwrap().is_none());
}

#[tokio::test]
async fn live_bot_error_is_recorded() {
    let env = TestWorkerContext::new();
    let strategy = insert_strategy(&env.store, 1, price_rules("1h", 105.0, 95.0)).await;
    let credential = env
        .vault
        .register(1, "binance", "key", "secret")
        .await
        .unwrap();
    // no candles: the rules can never be evaluated
    let bot = initializing_bot(&env.store, strategy.id, credential.id).await;
    let scheduler = ExecutionScheduler::new(env.context.clone());

    scheduler.submit(JobRef::live_bot(bot.id)).await;
    assert!(wait_for_bot(&env.store, bot.id, JobStatus::Error).await);

    let stored = env.store.get_live_bot(bot.id).await.unwrap().unwrap();
    assert!(stored.stopped_at.is_some());
    assert!(stored
        .failure_reason
        .as_deref()
        .is_some_and(|r| r.contains("CLOSE@1h unavailable")));
}

#[tokio::test(start_paused = true)]
async fn store_outage_mid_cycle_does_not_end_the_bot() {
    let env = TestWorkerContext::new();
    let strategy = insert_strategy(&env.store, 1, price_rules("15m", 105.0, 95.0)).await;
    let credential = env
        .vault
        .register(1, "binance", "key", "secret")
        .await
        .unwrap();
    env.market_data
        .insert_candles(TICKER, "15m", hourly_candles(&[100.0, 110.0]))
        .await;
    env.market_data
        .insert_candles(TICKER, "1h", hourly_candles(&[110.0]))
        .await;
    let bot = initializing_bot(&env.store, strategy.id, credential.id).await;
    let job = JobRef::live_bot(bot.id);

    // the outage hits between the signal and the credential read
    let feed = OutageOnHourlyLookup {
        inner: env.market_data.clone(),
        store: env.store.clone(),
        tripped: AtomicBool::new(false),
    };
    let ctx = Arc::new(job_context(env.store.clone(), Arc::new(feed)));
    let token = CancellationToken::new();
    let runner_token = token.clone();
    let runner = tokio::spawn(async move { LiveBotRunner::new(&ctx, bot.id, runner_token).run().await });

    tokio::time::sleep(StdDuration::from_secs(1)).await;
    assert_eq!(env.store.reconnect_count(), 1);
    assert!(!runner.is_finished());
    let after = env.store.get_live_bot(bot.id).await.unwrap().unwrap();
    assert_eq!(after.status, JobStatus::Active);
    assert!(after.last_run_at.is_none());
    assert!(env.store.trade_logs(job).await.unwrap().is_empty());

    // next cycle one poll later goes through
    tokio::time::sleep(StdDuration::from_secs(60)).await;
    let trades = env.store.trade_logs(job).await.unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].side, TradeSide::Buy);
    assert!(env
        .store
        .get_live_bot(bot.id)
        .await
        .unwrap()
        .unwrap()
        .last_run_at
        .is_some());

    token.cancel();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn second_worker_leaves_a_leased_bot_alone() {
    let env = TestWorkerContext::new();
    let strategy = insert_strategy(&env.store, 1, price_rules("1h", 105.0, 95.0)).await;
    let credential = env
        .vault
        .register(1, "binance", "key", "secret")
        .await
        .unwrap();
    env.market_data
        .insert_candles(TICKER, "1h", hourly_candles(&[100.0, 100.0]))
        .await;
    let bot = initializing_bot(&env.store, strategy.id, credential.id).await;

    let first = Arc::new(
        job_context(env.store.clone(), Arc::new(env.market_data.clone())).with_worker_id("worker-a"),
    );
    let second =
        job_context(env.store.clone(), Arc::new(env.market_data.clone())).with_worker_id("worker-b");

    let token = CancellationToken::new();
    let runner_token = token.clone();
    let runner = tokio::spawn(async move { LiveBotRunner::new(&first, bot.id, runner_token).run().await });
    tokio::time::sleep(StdDuration::from_secs(1)).await;
    assert_eq!(bot_status(&env.store, bot.id).await, Some(JobStatus::Active));

    // the holder keeps renewing, so the second worker gives up after one
    // lease lifetime without ever trading
    let outcome = tokio::time::timeout(
        StdDuration::from_secs(600),
        LiveBotRunner::new(&second, bot.id, CancellationToken::new()).run(),
    )
    .await
    .expect("second worker gives up");
    assert!(outcome.is_ok());
    assert!(!runner.is_finished());
    assert_eq!(bot_status(&env.store, bot.id).await, Some(JobStatus::Active));

    // the lease is released on exit
    token.cancel();
    runner.await.unwrap().unwrap();
    let now = Utc::now();
    assert!(env
        .store
        .claim_live_bot(bot.id, "worker-b", now, now + Duration::minutes(3))
        .await
        .unwrap());
}

#[tokio::test(start_paused = true)]
async fn expired_lease_is_taken_over() {
    let env = TestWorkerContext::new();
    let strategy = insert_strategy(&env.store, 1, price_rules("1h", 105.0, 95.0)).await;
    let credential = env
        .vault
        .register(1, "binance", "key", "secret")
        .await
        .unwrap();
    env.market_data
        .insert_candles(TICKER, "1h", hourly_candles(&[100.0, 100.0]))
        .await;
    let bot = initializing_bot(&env.store, strategy.id, credential.id).await;
    // left behind by a worker that died
    let past = Utc::now() - Duration::minutes(10);
    assert!(env
        .store
        .claim_live_bot(bot.id, "crashed-worker", past, past + Duration::minutes(3))
        .await
        .unwrap());

    let token = CancellationToken::new();
    let ctx = env.context.clone();
    let runner_token = token.clone();
    let runner = tokio::spawn(async move { LiveBotRunner::new(&ctx, bot.id, runner_token).run().await });

    tokio::time::sleep(StdDuration::from_secs(1)).await;
    assert_eq!(bot_status(&env.store, bot.id).await, Some(JobStatus::Active));
    assert!(!runner.is_finished());

    token.cancel();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn live_bot_lease_has_one_holder_until_expiry() {
    let env = TestWorkerContext::new();
    let strategy = insert_strategy(&env.store, 1, price_rules("1h", 105.0, 95.0)).await;
    let credential = env
        .vault
        .register(1, "binance", "key", "secret")
        .await
        .unwrap();
    let bot = initializing_bot(&env.store, strategy.id, credential.id).await;
    let now = Utc::now();
    let ttl = Duration::minutes(3);

    assert!(env.store.claim_live_bot(bot.id, "a", now, now + ttl).await.unwrap());
    assert!(!env.store.claim_live_bot(bot.id, "b", now, now + ttl).await.unwrap());
    // renewal by the holder
    assert!(env.store.claim_live_bot(bot.id, "a", now, now + ttl).await.unwrap());

    // releasing someone else's lease does nothing
    env.store.release_live_bot(bot.id, "b").await.unwrap();
    assert!(!env.store.claim_live_bot(bot.id, "b", now, now + ttl).await.unwrap());

    // an expired lease can be taken over
    let later = now + ttl + Duration::seconds(1);
    assert!(env.store.claim_live_bot(bot.id, "b", later, later + ttl).await.unwrap());
    assert!(!env.store.claim_live_bot(bot.id, "a", later, later + ttl).await.unwrap());

    assert!(!env.store.claim_live_bot(4_242, "a", now, now + ttl).await.unwrap());
}
