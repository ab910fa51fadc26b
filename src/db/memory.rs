//! In-process store. One mutex guards all tables, so every call (and in
//! particular admission) is serialised.

use super::{
    Admission, CredentialRepository, JobRepository, PlanRepository, Store, StoreResult,
    StrategyRepository, TradeLogRepository,
};
use crate::error::StoreError;
use crate::models::credential::{ApiCredential, NewCredential};
use crate::models::job::{
    Backtest, BacktestResult, JobFilter, JobKind, JobRecord, JobRef, JobSort, JobStatus, LiveBot,
    NewBacktest, NewLiveBot, TransitionStamp, ACTIVE_BOT_STATUSES, BACKTEST_QUOTA_STATUSES,
};
use crate::models::plan::{Plan, Subscription};
use crate::models::strategy::{NewStrategy, Strategy};
use crate::models::trade_log::{NewTradeLog, TradeLog};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;

#[derive(Default)]
struct MemoryState {
    last_id: i64,
    plans: BTreeMap<i64, Plan>,
    subscriptions: HashMap<i64, Subscription>,
    strategies: BTreeMap<i64, Strategy>,
    credentials: BTreeMap<i64, ApiCredential>,
    backtests: BTreeMap<i64, Backtest>,
    live_bots: BTreeMap<i64, LiveBot>,
    trades: HashMap<JobRef, Vec<TradeLog>>,
    results: HashMap<i64, BacktestResult>,
    /// bot id -> (holder, expiry)
    leases: HashMap<i64, (String, DateTime<Utc>)>,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn bots_blocking(&self, pred: impl Fn(&LiveBot) -> bool) -> usize {
        self.live_bots
            .values()
            .filter(|b| ACTIVE_BOT_STATUSES.contains(&b.status) && pred(b))
            .count()
    }
}

pub struct MemoryStore {
    state: Mutex<MemoryState>,
    available: AtomicBool,
    reconnects: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            available: AtomicBool::new(true),
            reconnects: AtomicUsize::new(0),
        }
    }

    fn check(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("connection reset".to_string()))
        }
    }

    /// Every call fails with `Unavailable` until `reconnect` is called
    pub fn simulate_outage(&self) {
        self.available.store(false, Ordering::SeqCst);
    }

    pub fn reconnect_count(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub async fn insert_plan(&self, mut plan: Plan) -> Plan {
        let mut state = self.state.lock().await;
        if plan.id == 0 {
            plan.id = state.next_id();
        }
        state.plans.insert(plan.id, plan.clone());
        plan
    }

    pub async fn put_subscription(&self, subscription: Subscription) {
        let mut state = self.state.lock().await;
        state
            .subscriptions
            .insert(subscription.user_id, subscription);
    }
}

fn page<T>(
    mut items: Vec<T>,
    filter: &JobFilter,
    created: impl Fn(&T) -> DateTime<Utc>,
    finished: impl Fn(&T) -> Option<DateTime<Utc>>,
) -> Vec<T> {
    match filter.sort {
        JobSort::CreatedAtDesc => items.sort_by_key(|b| std::cmp::Reverse(created(b))),
        JobSort::CreatedAtAsc => items.sort_by_key(|b| created(b)),
        JobSort::CompletedAtDesc => items.sort_by_key(|b| std::cmp::Reverse(finished(b))),
    }
    items
        .into_iter()
        .skip(filter.offset)
        .take(filter.limit)
        .collect()
}

#[async_trait]
impl PlanRepository for MemoryStore {
    async fn subscription_for_user(&self, user_id: i64) -> StoreResult<Option<Subscription>> {
        self.check()?;
        Ok(self.state.lock().await.subscriptions.get(&user_id).cloned())
    }

    async fn plan_by_id(&self, plan_id: i64) -> StoreResult<Option<Plan>> {
        self.check()?;
        Ok(self.state.lock().await.plans.get(&plan_id).cloned())
    }

    async fn plan_by_name(&self, name: &str) -> StoreResult<Option<Plan>> {
        self.check()?;
        let state = self.state.lock().await;
        Ok(state.plans.values().find(|p| p.name == name).cloned())
    }
}

#[async_trait]
impl StrategyRepository for MemoryStore {
    async fn insert_strategy(&self, owner_id: i64, strategy: NewStrategy) -> StoreResult<Strategy> {
        self.check()?;
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let stored = Strategy {
            id: state.next_id(),
            owner_id,
            name: strategy.name,
            description: strategy.description,
            rules: strategy.rules,
            is_public: strategy.is_public,
            created_at: now,
            updated_at: now,
        };
        state.strategies.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_strategy(&self, id: i64) -> StoreResult<Option<Strategy>> {
        self.check()?;
        Ok(self.state.lock().await.strategies.get(&id).cloned())
    }

    async fn list_strategies(&self, owner_id: i64) -> StoreResult<Vec<Strategy>> {
        self.check()?;
        let state = self.state.lock().await;
        Ok(state
            .strategies
            .values()
            .filter(|s| s.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn update_strategy(&self, strategy: &Strategy) -> StoreResult<Strategy> {
        self.check()?;
        let mut state = self.state.lock().await;
        let slot = state
            .strategies
            .get_mut(&strategy.id)
            .ok_or(StoreError::NotFound {
                entity: "strategy",
                id: strategy.id,
            })?;
        *slot = strategy.clone();
        slot.updated_at = Utc::now();
        Ok(slot.clone())
    }

    async fn delete_strategy_if_unused(&self, _owner_id: i64, id: i64) -> StoreResult<()> {
        self.check()?;
        let mut state = self.state.lock().await;
        if !state.strategies.contains_key(&id) {
            return Err(StoreError::NotFound {
                entity: "strategy",
                id,
            });
        }
        let dependents = state.bots_blocking(|b| b.strategy_id == id)
            + state
                .backtests
                .values()
                .filter(|b| b.strategy_id == id && !b.status.is_terminal())
                .count();
        if dependents > 0 {
            return Err(StoreError::InUse { dependents });
        }
        state.strategies.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl CredentialRepository for MemoryStore {
    async fn insert_credential(&self, credential: NewCredential) -> StoreResult<ApiCredential> {
        self.check()?;
        let mut state = self.state.lock().await;
        let stored = ApiCredential {
            id: state.next_id(),
            user_id: credential.user_id,
            exchange: credential.exchange,
            api_key_encrypted: credential.api_key_encrypted,
            secret_key_encrypted: credential.secret_key_encrypted,
            is_active: credential.is_active,
            created_at: Utc::now(),
        };
        state.credentials.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_credential(&self, id: i64) -> StoreResult<Option<ApiCredential>> {
        self.check()?;
        Ok(self.state.lock().await.credentials.get(&id).cloned())
    }

    async fn delete_credential_if_unused(&self, _owner_id: i64, id: i64) -> StoreResult<()> {
        self.check()?;
        let mut state = self.state.lock().await;
        if !state.credentials.contains_key(&id) {
            return Err(StoreError::NotFound {
                entity: "credential",
                id,
            });
        }
        let dependents = state.bots_blocking(|b| b.credential_id == id);
        if dependents > 0 {
            return Err(StoreError::InUse { dependents });
        }
        state.credentials.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn admit_backtest(
        &self,
        backtest: NewBacktest,
        since: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Admission<Backtest>> {
        self.check()?;
        let mut state = self.state.lock().await;
        if !state.strategies.contains_key(&backtest.strategy_id) {
            return Err(StoreError::NotFound {
                entity: "strategy",
                id: backtest.strategy_id,
            });
        }
        let used = state
            .backtests
            .values()
            .filter(|b| {
                b.user_id == backtest.user_id
                    && b.created_at >= since
                    && BACKTEST_QUOTA_STATUSES.contains(&b.status)
            })
            .count() as u32;
        if used >= limit {
            return Ok(Admission::OverQuota { used, limit });
        }

        let now = Utc::now();
        let stored = Backtest {
            id: state.next_id(),
            user_id: backtest.user_id,
            strategy_id: backtest.strategy_id,
            status: JobStatus::Pending,
            parameters: backtest.parameters,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };
        state.backtests.insert(stored.id, stored.clone());
        Ok(Admission::Admitted(stored))
    }

    async fn admit_live_bot(&self, bot: NewLiveBot, limit: u32) -> StoreResult<Admission<LiveBot>> {
        self.check()?;
        let mut state = self.state.lock().await;
        if !state.strategies.contains_key(&bot.strategy_id) {
            return Err(StoreError::NotFound {
                entity: "strategy",
                id: bot.strategy_id,
            });
        }
        let usable = state
            .credentials
            .get(&bot.credential_id)
            .is_some_and(|c| c.user_id == bot.user_id && c.is_active);
        if !usable {
            return Err(StoreError::NotFound {
                entity: "credential",
                id: bot.credential_id,
            });
        }
        let used = state.bots_blocking(|b| b.user_id == bot.user_id) as u32;
        if used >= limit {
            return Ok(Admission::OverQuota { used, limit });
        }

        let now = Utc::now();
        let stored = LiveBot {
            id: state.next_id(),
            user_id: bot.user_id,
            strategy_id: bot.strategy_id,
            credential_id: bot.credential_id,
            ticker: bot.ticker,
            timeframe: bot.timeframe,
            initial_capital: bot.initial_capital,
            order_quantity: bot.order_quantity,
            status: JobStatus::Initializing,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            last_run_at: None,
            stopped_at: None,
        };
        state.live_bots.insert(stored.id, stored.clone());
        Ok(Admission::Admitted(stored))
    }

    async fn count_backtests_since(&self, user_id: i64, since: DateTime<Utc>) -> StoreResult<u32> {
        self.check()?;
        let state = self.state.lock().await;
        Ok(state
            .backtests
            .values()
            .filter(|b| {
                b.user_id == user_id
                    && b.created_at >= since
                    && BACKTEST_QUOTA_STATUSES.contains(&b.status)
            })
            .count() as u32)
    }

    async fn count_active_bots(&self, user_id: i64) -> StoreResult<u32> {
        self.check()?;
        let state = self.state.lock().await;
        Ok(state.bots_blocking(|b| b.user_id == user_id) as u32)
    }

    async fn get_backtest(&self, id: i64) -> StoreResult<Option<Backtest>> {
        self.check()?;
        Ok(self.state.lock().await.backtests.get(&id).cloned())
    }

    async fn get_live_bot(&self, id: i64) -> StoreResult<Option<LiveBot>> {
        self.check()?;
        Ok(self.state.lock().await.live_bots.get(&id).cloned())
    }

    async fn list_backtests(
        &self,
        user_id: Option<i64>,
        filter: &JobFilter,
    ) -> StoreResult<Vec<Backtest>> {
        self.check()?;
        let state = self.state.lock().await;
        let items: Vec<Backtest> = state
            .backtests
            .values()
            .filter(|b| user_id.map_or(true, |u| b.user_id == u))
            .filter(|b| filter.status.map_or(true, |s| b.status == s))
            .filter(|b| filter.strategy_id.map_or(true, |s| b.strategy_id == s))
            .cloned()
            .collect();
        Ok(page(items, filter, |b| b.created_at, |b| b.completed_at))
    }

    async fn list_live_bots(
        &self,
        user_id: Option<i64>,
        filter: &JobFilter,
    ) -> StoreResult<Vec<LiveBot>> {
        self.check()?;
        let state = self.state.lock().await;
        let items: Vec<LiveBot> = state
            .live_bots
            .values()
            .filter(|b| user_id.map_or(true, |u| b.user_id == u))
            .filter(|b| filter.status.map_or(true, |s| b.status == s))
            .filter(|b| filter.strategy_id.map_or(true, |s| b.strategy_id == s))
            .cloned()
            .collect();
        Ok(page(items, filter, |b| b.created_at, |b| b.stopped_at))
    }

    async fn transition(
        &self,
        job: JobRef,
        from: &[JobStatus],
        to: JobStatus,
        stamp: TransitionStamp,
    ) -> StoreResult<JobRecord> {
        self.check()?;
        let mut state = self.state.lock().await;
        let now = Utc::now();
        match job.kind {
            JobKind::Backtest => {
                let record = state.backtests.get_mut(&job.id).ok_or(StoreError::NotFound {
                    entity: "backtest",
                    id: job.id,
                })?;
                if !from.contains(&record.status) {
                    return Err(StoreError::Conflict {
                        current: record.status,
                    });
                }
                record.status = to;
                record.updated_at = now;
                record.started_at = stamp.started_at.or(record.started_at);
                record.completed_at = stamp.completed_at.or(record.completed_at);
                record.failure_reason = stamp.failure_reason.or(record.failure_reason.take());
                Ok(JobRecord::Backtest(record.clone()))
            }
            JobKind::LiveBot => {
                let record = state.live_bots.get_mut(&job.id).ok_or(StoreError::NotFound {
                    entity: "live bot",
                    id: job.id,
                })?;
                if !from.contains(&record.status) {
                    return Err(StoreError::Conflict {
                        current: record.status,
                    });
                }
                record.status = to;
                record.updated_at = now;
                record.started_at = stamp.started_at.or(record.started_at);
                record.stopped_at = stamp.stopped_at.or(record.stopped_at);
                record.failure_reason = stamp.failure_reason.or(record.failure_reason.take());
                Ok(JobRecord::LiveBot(record.clone()))
            }
        }
    }

    async fn touch_last_run(&self, bot_id: i64, at: DateTime<Utc>) -> StoreResult<()> {
        self.check()?;
        let mut state = self.state.lock().await;
        let bot = state.live_bots.get_mut(&bot_id).ok_or(StoreError::NotFound {
            entity: "live bot",
            id: bot_id,
        })?;
        bot.last_run_at = Some(at);
        Ok(())
    }

    async fn claim_live_bot(
        &self,
        bot_id: i64,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.check()?;
        let mut state = self.state.lock().await;
        if !state.live_bots.contains_key(&bot_id) {
            return Ok(false);
        }
        if let Some((current, expiry)) = state.leases.get(&bot_id) {
            if current != holder && *expiry > now {
                return Ok(false);
            }
        }
        state
            .leases
            .insert(bot_id, (holder.to_string(), expires_at));
        Ok(true)
    }

    async fn release_live_bot(&self, bot_id: i64, holder: &str) -> StoreResult<()> {
        self.check()?;
        let mut state = self.state.lock().await;
        if state.leases.get(&bot_id).is_some_and(|(current, _)| current == holder) {
            state.leases.remove(&bot_id);
        }
        Ok(())
    }

    async fn delete_live_bot(&self, id: i64) -> StoreResult<()> {
        self.check()?;
        let mut state = self.state.lock().await;
        state.leases.remove(&id);
        state
            .live_bots
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound {
                entity: "live bot",
                id,
            })
    }

    async fn jobs_in_status(
        &self,
        kind: JobKind,
        statuses: &[JobStatus],
    ) -> StoreResult<Vec<JobRef>> {
        self.check()?;
        let state = self.state.lock().await;
        let refs = match kind {
            JobKind::Backtest => state
                .backtests
                .values()
                .filter(|b| statuses.contains(&b.status))
                .map(|b| JobRef::backtest(b.id))
                .collect(),
            JobKind::LiveBot => state
                .live_bots
                .values()
                .filter(|b| statuses.contains(&b.status))
                .map(|b| JobRef::live_bot(b.id))
                .collect(),
        };
        Ok(refs)
    }
}

#[async_trait]
impl TradeLogRepository for MemoryStore {
    async fn append_trade(&self, job: JobRef, entry: NewTradeLog) -> StoreResult<TradeLog> {
        self.check()?;
        let mut state = self.state.lock().await;
        let latest = state
            .trades
            .get(&job)
            .and_then(|log| log.last())
            .map(|t| t.timestamp);
        if latest.is_some_and(|ts| entry.timestamp < ts) {
            return Err(StoreError::OutOfOrder { job });
        }
        let id = state.next_id();
        let trade = TradeLog::from_entry(id, job, entry);
        state.trades.entry(job).or_default().push(trade.clone());
        Ok(trade)
    }

    async fn trade_logs(&self, job: JobRef) -> StoreResult<Vec<TradeLog>> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .await
            .trades
            .get(&job)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_result(&self, result: &BacktestResult) -> StoreResult<()> {
        self.check()?;
        self.state
            .lock()
            .await
            .results
            .insert(result.backtest_id, result.clone());
        Ok(())
    }

    async fn backtest_result(&self, backtest_id: i64) -> StoreResult<Option<BacktestResult>> {
        self.check()?;
        Ok(self.state.lock().await.results.get(&backtest_id).cloned())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn reconnect(&self) -> StoreResult<()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        self.available.store(true, Ordering::SeqCst);
        Ok(())
    }
}
