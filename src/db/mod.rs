//! Persistence seams. `PostgresStore` backs production, `MemoryStore` backs
//! tests and single-process development.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use crate::error::StoreError;
use crate::models::credential::{ApiCredential, NewCredential};
use crate::models::job::{
    Backtest, BacktestResult, JobFilter, JobKind, JobRecord, JobRef, JobStatus, LiveBot,
    NewBacktest, NewLiveBot, TransitionStamp,
};
use crate::models::plan::{Plan, Subscription};
use crate::models::strategy::{NewStrategy, Strategy};
use crate::models::trade_log::{NewTradeLog, TradeLog};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of a quota-checked insert
#[derive(Debug, Clone, PartialEq)]
pub enum Admission<T> {
    Admitted(T),
    OverQuota { used: u32, limit: u32 },
}

#[async_trait]
pub trait PlanRepository: Send + Sync {
    /// The user's subscription regardless of status; at most one exists
    async fn subscription_for_user(&self, user_id: i64) -> StoreResult<Option<Subscription>>;
    async fn plan_by_id(&self, plan_id: i64) -> StoreResult<Option<Plan>>;
    async fn plan_by_name(&self, name: &str) -> StoreResult<Option<Plan>>;
}

#[async_trait]
pub trait StrategyRepository: Send + Sync {
    async fn insert_strategy(&self, owner_id: i64, strategy: NewStrategy) -> StoreResult<Strategy>;
    async fn get_strategy(&self, id: i64) -> StoreResult<Option<Strategy>>;
    async fn list_strategies(&self, owner_id: i64) -> StoreResult<Vec<Strategy>>;
    async fn update_strategy(&self, strategy: &Strategy) -> StoreResult<Strategy>;
    /// Deletes unless a non-terminal job references the strategy
    /// (`StoreError::InUse`). Serialised with admission for the owner.
    async fn delete_strategy_if_unused(&self, owner_id: i64, id: i64) -> StoreResult<()>;
}

#[async_trait]
pub trait CredentialRepository: Send + Sync {
    async fn insert_credential(&self, credential: NewCredential) -> StoreResult<ApiCredential>;
    async fn get_credential(&self, id: i64) -> StoreResult<Option<ApiCredential>>;
    async fn delete_credential_if_unused(&self, owner_id: i64, id: i64) -> StoreResult<()>;
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Count the user's backtests created at or after `since` in a quota
    /// status and insert `pending` if under `limit`, as one atomic step that
    /// is serialised with deletes of the strategy. A strategy deleted in the
    /// meantime fails with `NotFound`.
    async fn admit_backtest(
        &self,
        backtest: NewBacktest,
        since: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Admission<Backtest>>;

    /// Count the user's bots in an active status and insert `initializing`
    /// if under `limit`, as one atomic step. The strategy must still exist
    /// and the credential must be the user's and active, otherwise
    /// `NotFound` names the missing one.
    async fn admit_live_bot(&self, bot: NewLiveBot, limit: u32) -> StoreResult<Admission<LiveBot>>;

    /// Backtests created at or after `since` in a quota status
    async fn count_backtests_since(&self, user_id: i64, since: DateTime<Utc>) -> StoreResult<u32>;
    /// Bots in an active status
    async fn count_active_bots(&self, user_id: i64) -> StoreResult<u32>;

    async fn get_backtest(&self, id: i64) -> StoreResult<Option<Backtest>>;
    async fn get_live_bot(&self, id: i64) -> StoreResult<Option<LiveBot>>;

    /// `user_id = None` lists every user's jobs
    async fn list_backtests(
        &self,
        user_id: Option<i64>,
        filter: &JobFilter,
    ) -> StoreResult<Vec<Backtest>>;
    async fn list_live_bots(
        &self,
        user_id: Option<i64>,
        filter: &JobFilter,
    ) -> StoreResult<Vec<LiveBot>>;

    /// Compare-and-set: moves `job` to `to` only if its status is one of
    /// `from`. Otherwise `StoreError::Conflict` with the status found.
    async fn transition(
        &self,
        job: JobRef,
        from: &[JobStatus],
        to: JobStatus,
        stamp: TransitionStamp,
    ) -> StoreResult<JobRecord>;

    async fn touch_last_run(&self, bot_id: i64, at: DateTime<Utc>) -> StoreResult<()>;

    /// Take or renew the run lease on a live bot for `holder` until
    /// `expires_at`. `false` while another holder's lease is unexpired at
    /// `now`, or when the bot is gone.
    async fn claim_live_bot(
        &self,
        bot_id: i64,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Drop the lease if `holder` still owns it
    async fn release_live_bot(&self, bot_id: i64, holder: &str) -> StoreResult<()>;
    async fn delete_live_bot(&self, id: i64) -> StoreResult<()>;

    /// Job refs of `kind` currently in any of `statuses`, oldest first
    async fn jobs_in_status(&self, kind: JobKind, statuses: &[JobStatus])
        -> StoreResult<Vec<JobRef>>;
}

#[async_trait]
pub trait TradeLogRepository: Send + Sync {
    /// Rejects entries older than the job's latest (`StoreError::OutOfOrder`)
    async fn append_trade(&self, job: JobRef, entry: NewTradeLog) -> StoreResult<TradeLog>;
    /// Ascending by timestamp
    async fn trade_logs(&self, job: JobRef) -> StoreResult<Vec<TradeLog>>;
    async fn save_result(&self, result: &BacktestResult) -> StoreResult<()>;
    async fn backtest_result(&self, backtest_id: i64) -> StoreResult<Option<BacktestResult>>;
}

/// Full persistence surface used by the job store and workers
#[async_trait]
pub trait Store:
    PlanRepository + StrategyRepository + CredentialRepository + JobRepository + TradeLogRepository
{
    /// Drop the current session and open a fresh one
    async fn reconnect(&self) -> StoreResult<()>;
}
