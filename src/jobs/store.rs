//! Request-path job operations: admission control, the status state machine,
//! queries, and strategy/credential management with dependent protection.

use crate::core::scheduler::JobDispatcher;
use crate::db::{
    Admission, CredentialRepository, JobRepository, Store, StrategyRepository, TradeLogRepository,
};
use crate::error::{CoreError, CredentialError, Result, StoreError};
use crate::metrics::Metrics;
use crate::models::job::{
    Backtest, BacktestRequest, BacktestResult, JobFilter, JobKind, JobRecord, JobRef, JobStatus,
    LiveBot, LiveBotRequest, NewBacktest, NewLiveBot, TransitionStamp,
};
use crate::models::strategy::{NewStrategy, Strategy, StrategyRules, StrategyUpdate};
use crate::models::trade_log::TradeLog;
use crate::models::user::User;
use crate::plans::PlanLimiter;
use crate::services::credentials::CredentialStore;
use crate::strategies::{check_timeframes, validate_structure};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

pub struct JobStore {
    store: Arc<dyn Store>,
    limiter: PlanLimiter,
    credentials: Arc<dyn CredentialStore>,
    dispatcher: Arc<dyn JobDispatcher>,
    metrics: Option<Arc<Metrics>>,
}

/// Start of the current UTC day
pub fn utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .unwrap_or(now)
}

impl JobStore {
    pub fn new(
        store: Arc<dyn Store>,
        credentials: Arc<dyn CredentialStore>,
        dispatcher: Arc<dyn JobDispatcher>,
    ) -> Self {
        Self {
            limiter: PlanLimiter::new(store.clone()),
            store,
            credentials,
            dispatcher,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn limiter(&self) -> &PlanLimiter {
        &self.limiter
    }

    fn reject(&self, kind: JobKind, reason: &str) {
        if let Some(metrics) = &self.metrics {
            metrics
                .admission_rejections_total
                .with_label_values(&[kind.as_str(), reason])
                .inc();
        }
    }

    fn count_submitted(&self, kind: JobKind) {
        if let Some(metrics) = &self.metrics {
            metrics
                .jobs_submitted_total
                .with_label_values(&[kind.as_str()])
                .inc();
        }
    }

    async fn validate_rules(&self, user: &User, rules: &StrategyRules) -> Result<()> {
        validate_structure(rules)?;
        let limits = self.limiter.resolve(user).await;
        check_timeframes(&limits, rules)
    }

    pub async fn create_strategy(&self, user: &User, strategy: NewStrategy) -> Result<Strategy> {
        if strategy.name.trim().is_empty() {
            return Err(CoreError::InvalidStrategy("name must not be empty".to_string()));
        }
        self.validate_rules(user, &strategy.rules).await?;
        let stored = self.store.insert_strategy(user.id, strategy).await?;
        info!(user_id = user.id, strategy_id = stored.id, "strategy created");
        Ok(stored)
    }

    /// Readable by the owner, admins, and anyone when public
    pub async fn get_strategy(&self, user: &User, id: i64) -> Result<Strategy> {
        let strategy = self.load_strategy(id).await?;
        if !user.can_control(strategy.owner_id) && !strategy.is_public {
            return Err(CoreError::Forbidden);
        }
        Ok(strategy)
    }

    pub async fn list_strategies(&self, user: &User) -> Result<Vec<Strategy>> {
        Ok(self.store.list_strategies(user.id).await?)
    }

    pub async fn update_strategy(
        &self,
        user: &User,
        id: i64,
        update: StrategyUpdate,
    ) -> Result<Strategy> {
        let mut strategy = self.owned_strategy(user, id).await?;
        if let Some(rules) = update.rules {
            self.validate_rules(user, &rules).await?;
            strategy.rules = rules;
        }
        if let Some(name) = update.name {
            if name.trim().is_empty() {
                return Err(CoreError::InvalidStrategy("name must not be empty".to_string()));
            }
            strategy.name = name;
        }
        if update.description.is_some() {
            strategy.description = update.description;
        }
        if let Some(is_public) = update.is_public {
            strategy.is_public = is_public;
        }
        Ok(self.store.update_strategy(&strategy).await?)
    }

    pub async fn delete_strategy(&self, user: &User, id: i64) -> Result<()> {
        let strategy = self.owned_strategy(user, id).await?;
        match self
            .store
            .delete_strategy_if_unused(strategy.owner_id, id)
            .await
        {
            Ok(()) => {
                info!(user_id = user.id, strategy_id = id, "strategy deleted");
                Ok(())
            }
            Err(StoreError::InUse { dependents }) => Err(CoreError::ResourceInUse {
                resource: "strategy",
                id,
                dependents,
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete_credential(&self, user: &User, id: i64) -> Result<()> {
        let credential = self
            .store
            .get_credential(id)
            .await?
            .ok_or(CoreError::NotFound {
                entity: "credential",
                id,
            })?;
        if !user.can_control(credential.user_id) {
            return Err(CoreError::Forbidden);
        }
        match self
            .store
            .delete_credential_if_unused(credential.user_id, id)
            .await
        {
            Ok(()) => {
                info!(user_id = user.id, credential_id = id, "credential deleted");
                Ok(())
            }
            Err(StoreError::InUse { dependents }) => Err(CoreError::ResourceInUse {
                resource: "credential",
                id,
                dependents,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_strategy(&self, id: i64) -> Result<Strategy> {
        self.store
            .get_strategy(id)
            .await?
            .ok_or(CoreError::NotFound {
                entity: "strategy",
                id,
            })
    }

    async fn owned_strategy(&self, user: &User, id: i64) -> Result<Strategy> {
        let strategy = self.load_strategy(id).await?;
        if !user.can_control(strategy.owner_id) {
            return Err(CoreError::Forbidden);
        }
        Ok(strategy)
    }

    pub async fn create_backtest_job(&self, user: &User, request: BacktestRequest) -> Result<Backtest> {
        let kind = JobKind::Backtest;
        let limits = self.limiter.resolve(user).await;
        let since = utc_midnight(Utc::now());

        let used = self.store.count_backtests_since(user.id, since).await?;
        if used >= limits.max_backtests_per_day {
            self.reject(kind, "quota");
            return Err(CoreError::QuotaExceeded {
                resource: "backtests today",
                used,
                limit: limits.max_backtests_per_day,
            });
        }

        let strategy = self.owned_strategy(user, request.strategy_id).await?;
        if let Err(e) = check_timeframes(&limits, &strategy.rules) {
            self.reject(kind, "plan");
            return Err(e);
        }
        let params = &request.parameters;
        if !limits.allows_timeframe(&params.timeframe) {
            self.reject(kind, "plan");
            return Err(CoreError::PlanViolation {
                timeframe: params.timeframe.clone(),
                node_id: "backtest".to_string(),
            });
        }
        if params.end_date <= params.start_date {
            return Err(CoreError::InvalidStrategy(
                "backtest end_date must be after start_date".to_string(),
            ));
        }

        let admission = self
            .store
            .admit_backtest(
                NewBacktest {
                    user_id: user.id,
                    strategy_id: strategy.id,
                    parameters: request.parameters,
                },
                since,
                limits.max_backtests_per_day,
            )
            .await?;
        let backtest = match admission {
            Admission::Admitted(backtest) => backtest,
            Admission::OverQuota { used, limit } => {
                self.reject(kind, "quota");
                return Err(CoreError::QuotaExceeded {
                    resource: "backtests today",
                    used,
                    limit,
                });
            }
        };

        let job = JobRef::backtest(backtest.id);
        self.hand_off(job, backtest.user_id).await?;
        info!(user_id = user.id, job = %job, strategy_id = strategy.id, "backtest submitted");
        Ok(backtest)
    }

    pub async fn create_live_bot_job(&self, user: &User, request: LiveBotRequest) -> Result<LiveBot> {
        let kind = JobKind::LiveBot;
        let limits = self.limiter.resolve(user).await;

        let used = self.store.count_active_bots(user.id).await?;
        if used >= limits.concurrent_bot_limit {
            self.reject(kind, "quota");
            return Err(CoreError::QuotaExceeded {
                resource: "live bots",
                used,
                limit: limits.concurrent_bot_limit,
            });
        }

        let strategy = self.owned_strategy(user, request.strategy_id).await?;
        if let Err(e) = check_timeframes(&limits, &strategy.rules) {
            self.reject(kind, "plan");
            return Err(e);
        }
        if !limits.allows_timeframe(&request.timeframe) {
            self.reject(kind, "plan");
            return Err(CoreError::PlanViolation {
                timeframe: request.timeframe,
                node_id: "bot".to_string(),
            });
        }

        let credential = self
            .credentials
            .get(request.credential_id, user.id)
            .await
            .map_err(|e| match e {
                CredentialError::Store(e) => CoreError::from(e),
                other => {
                    warn!(user_id = user.id, credential_id = request.credential_id, error = %other, "credential lookup failed");
                    CoreError::CredentialInvalid(request.credential_id)
                }
            })?;
        if !credential.is_some_and(|c| c.active) {
            self.reject(kind, "credential");
            return Err(CoreError::CredentialInvalid(request.credential_id));
        }
        if request.order_quantity <= 0.0 {
            return Err(CoreError::InvalidStrategy(
                "order_quantity must be positive".to_string(),
            ));
        }

        let admission = self
            .store
            .admit_live_bot(
                NewLiveBot {
                    user_id: user.id,
                    strategy_id: strategy.id,
                    credential_id: request.credential_id,
                    ticker: request.ticker,
                    timeframe: request.timeframe,
                    initial_capital: request.initial_capital,
                    order_quantity: request.order_quantity,
                },
                limits.concurrent_bot_limit,
            )
            .await
            .map_err(|e| match e {
                StoreError::NotFound {
                    entity: "credential",
                    id,
                } => {
                    self.reject(kind, "credential");
                    CoreError::CredentialInvalid(id)
                }
                other => other.into(),
            })?;
        let bot = match admission {
            Admission::Admitted(bot) => bot,
            Admission::OverQuota { used, limit } => {
                self.reject(kind, "quota");
                return Err(CoreError::QuotaExceeded {
                    resource: "live bots",
                    used,
                    limit,
                });
            }
        };

        let job = JobRef::live_bot(bot.id);
        self.hand_off(job, bot.user_id).await?;
        info!(user_id = user.id, job = %job, strategy_id = strategy.id, "live bot submitted");
        Ok(bot)
    }

    /// Dispatch a freshly admitted job. On failure the row stays visible as
    /// `failed_dispatch`.
    async fn hand_off(&self, job: JobRef, user_id: i64) -> Result<()> {
        match self.dispatcher.dispatch(job).await {
            Ok(()) => {
                self.count_submitted(job.kind);
                Ok(())
            }
            Err(e) => {
                warn!(job = %job, user_id, error = %e, "dispatch failed");
                let initial = match job.kind {
                    JobKind::Backtest => JobStatus::Pending,
                    JobKind::LiveBot => JobStatus::Initializing,
                };
                let stamp = TransitionStamp::default().with_reason(e.to_string());
                if let Err(mark) = self
                    .store
                    .transition(job, &[initial], JobStatus::FailedDispatch, stamp)
                    .await
                {
                    warn!(job = %job, error = %mark, "could not mark job failed_dispatch");
                }
                Err(CoreError::DispatchFailure {
                    job,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Owner or admin. Backtests end `canceled` (worker terminated), bots
    /// end `stopped`. A terminal job yields `InvalidTransition`.
    pub async fn cancel(&self, job: JobRef, user: &User) -> Result<JobRecord> {
        let record = self.load_controlled(job, user).await?;
        let target = match job.kind {
            JobKind::Backtest => JobStatus::Canceled,
            JobKind::LiveBot => JobStatus::Stopped,
        };
        let current = record.status();
        if !current.can_transition(job.kind, target) {
            return Err(CoreError::InvalidTransition {
                job,
                from: current,
                to: target,
            });
        }

        let record = match job.kind {
            JobKind::Backtest => {
                self.dispatcher.revoke(job, true).await;
                self.apply(job, target).await?
            }
            JobKind::LiveBot => {
                let record = self.apply(job, target).await?;
                self.dispatcher.revoke(job, false).await;
                record
            }
        };
        info!(job = %job, user_id = user.id, status = %record.status(), "job canceled");
        Ok(record)
    }

    /// Pause, resume or stop a bot. Requesting the current status returns
    /// the bot unchanged.
    pub async fn update_live_bot_status(
        &self,
        bot_id: i64,
        user: &User,
        target: JobStatus,
    ) -> Result<LiveBot> {
        let job = JobRef::live_bot(bot_id);
        let bot = self.get_live_bot(bot_id, user).await?;
        if !matches!(
            target,
            JobStatus::Active | JobStatus::Paused | JobStatus::Stopped
        ) {
            return Err(CoreError::InvalidTransition {
                job,
                from: bot.status,
                to: target,
            });
        }
        if bot.status == target {
            return Ok(bot);
        }
        if !bot.status.can_transition(JobKind::LiveBot, target) {
            return Err(CoreError::InvalidTransition {
                job,
                from: bot.status,
                to: target,
            });
        }

        let record = self.apply(job, target).await?;
        if target == JobStatus::Stopped {
            self.dispatcher.revoke(job, false).await;
        }
        info!(job = %job, user_id = user.id, status = %target, "live bot status updated");
        record.into_live_bot().ok_or(CoreError::NotFound {
            entity: "live bot",
            id: bot_id,
        })
    }

    /// Stops a running bot first, then removes the row
    pub async fn delete_live_bot(&self, bot_id: i64, user: &User) -> Result<()> {
        let job = JobRef::live_bot(bot_id);
        let bot = self.get_live_bot(bot_id, user).await?;
        if !bot.status.is_terminal() {
            match self.apply(job, JobStatus::Stopped).await {
                Ok(_) | Err(CoreError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
            self.dispatcher.revoke(job, false).await;
        }
        self.store.delete_live_bot(bot_id).await?;
        info!(job = %job, user_id = user.id, "live bot deleted");
        Ok(())
    }

    /// Compare-and-set from every legal source status; a lost race becomes
    /// `InvalidTransition`.
    async fn apply(&self, job: JobRef, target: JobStatus) -> Result<JobRecord> {
        let sources = JobStatus::sources_for(job.kind, target);
        let stamp = TransitionStamp::for_status(job.kind, target, Utc::now());
        match self.store.transition(job, &sources, target, stamp).await {
            Ok(record) => {
                if target.is_terminal() {
                    if let Some(metrics) = &self.metrics {
                        metrics
                            .jobs_finished_total
                            .with_label_values(&[job.kind.as_str(), target.as_str()])
                            .inc();
                    }
                }
                Ok(record)
            }
            Err(StoreError::Conflict { current }) => Err(CoreError::InvalidTransition {
                job,
                from: current,
                to: target,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_controlled(&self, job: JobRef, user: &User) -> Result<JobRecord> {
        let record = match job.kind {
            JobKind::Backtest => self.get_backtest(job.id, user).await.map(JobRecord::Backtest)?,
            JobKind::LiveBot => self.get_live_bot(job.id, user).await.map(JobRecord::LiveBot)?,
        };
        Ok(record)
    }

    pub async fn get_backtest(&self, id: i64, user: &User) -> Result<Backtest> {
        let backtest = self
            .store
            .get_backtest(id)
            .await?
            .ok_or(CoreError::NotFound {
                entity: "backtest",
                id,
            })?;
        if !user.can_control(backtest.user_id) {
            return Err(CoreError::Forbidden);
        }
        Ok(backtest)
    }

    pub async fn get_live_bot(&self, id: i64, user: &User) -> Result<LiveBot> {
        let bot = self
            .store
            .get_live_bot(id)
            .await?
            .ok_or(CoreError::NotFound {
                entity: "live bot",
                id,
            })?;
        if !user.can_control(bot.user_id) {
            return Err(CoreError::Forbidden);
        }
        Ok(bot)
    }

    /// A user's own jobs; admins see everyone's
    pub async fn list_backtests(&self, user: &User, filter: &JobFilter) -> Result<Vec<Backtest>> {
        let owner = (!user.is_admin()).then_some(user.id);
        Ok(self.store.list_backtests(owner, filter).await?)
    }

    pub async fn list_live_bots(&self, user: &User, filter: &JobFilter) -> Result<Vec<LiveBot>> {
        let owner = (!user.is_admin()).then_some(user.id);
        Ok(self.store.list_live_bots(owner, filter).await?)
    }

    /// Ascending by timestamp
    pub async fn trade_logs(&self, job: JobRef, user: &User) -> Result<Vec<TradeLog>> {
        self.load_controlled(job, user).await?;
        Ok(self.store.trade_logs(job).await?)
    }

    pub async fn backtest_result(&self, id: i64, user: &User) -> Result<BacktestResult> {
        self.get_backtest(id, user).await?;
        self.store
            .backtest_result(id)
            .await?
            .ok_or(CoreError::NotFound {
                entity: "backtest result",
                id,
            })
    }
}
