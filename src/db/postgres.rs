//! PostgreSQL store over tokio-postgres

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
use crate::models::plan::{Plan, Subscription, SubscriptionStatus};
use crate::models::strategy::{NewStrategy, Strategy};
use crate::models::trade_log::{NewTradeLog, TradeLog, TradeSide};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_postgres::{Client, NoTls, Row, Transaction};
use tracing::{error, info};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS plans (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    price DOUBLE PRECISION NOT NULL DEFAULT 0,
    features JSONB NOT NULL DEFAULT '{}'
);
CREATE TABLE IF NOT EXISTS subscriptions (
    user_id BIGINT PRIMARY KEY,
    plan_id BIGINT NOT NULL REFERENCES plans(id),
    status TEXT NOT NULL,
    current_period_end TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS strategies (
    id BIGSERIAL PRIMARY KEY,
    owner_id BIGINT NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    rules JSONB NOT NULL,
    is_public BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE TABLE IF NOT EXISTS api_keys (
    id BIGSERIAL PRIMARY KEY,
    user_id BIGINT NOT NULL,
    exchange TEXT NOT NULL,
    api_key_encrypted TEXT NOT NULL,
    secret_key_encrypted TEXT NOT NULL,
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE TABLE IF NOT EXISTS backtests (
    id BIGSERIAL PRIMARY KEY,
    user_id BIGINT NOT NULL,
    strategy_id BIGINT NOT NULL,
    status TEXT NOT NULL,
    parameters JSONB NOT NULL,
    failure_reason TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    started_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS backtests_user_created ON backtests (user_id, created_at);
CREATE TABLE IF NOT EXISTS live_bots (
    id BIGSERIAL PRIMARY KEY,
    user_id BIGINT NOT NULL,
    strategy_id BIGINT NOT NULL,
    credential_id BIGINT NOT NULL,
    ticker TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    initial_capital DOUBLE PRECISION NOT NULL,
    order_quantity DOUBLE PRECISION NOT NULL,
    status TEXT NOT NULL,
    failure_reason TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    started_at TIMESTAMPTZ,
    last_run_at TIMESTAMPTZ,
    stopped_at TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS live_bots_user_status ON live_bots (user_id, status);
ALTER TABLE live_bots ADD COLUMN IF NOT EXISTS lease_holder TEXT;
ALTER TABLE live_bots ADD COLUMN IF NOT EXISTS lease_expires_at TIMESTAMPTZ;
CREATE TABLE IF NOT EXISTS trade_logs (
    id BIGSERIAL PRIMARY KEY,
    job_kind TEXT NOT NULL,
    job_id BIGINT NOT NULL,
    timestamp TIMESTAMPTZ NOT NULL,
    side TEXT NOT NULL,
    price DOUBLE PRECISION NOT NULL,
    quantity DOUBLE PRECISION NOT NULL,
    commission DOUBLE PRECISION NOT NULL,
    pnl DOUBLE PRECISION,
    balance DOUBLE PRECISION NOT NULL
);
CREATE INDEX IF NOT EXISTS trade_logs_job ON trade_logs (job_kind, job_id, timestamp);
CREATE TABLE IF NOT EXISTS backtest_results (
    backtest_id BIGINT PRIMARY KEY,
    total_return_pct DOUBLE PRECISION NOT NULL,
    max_drawdown_pct DOUBLE PRECISION NOT NULL,
    win_rate_pct DOUBLE PRECISION,
    trade_count INTEGER NOT NULL,
    final_balance DOUBLE PRECISION NOT NULL,
    equity_curve JSONB NOT NULL,
    executed_at TIMESTAMPTZ NOT NULL
);
";

const STRATEGY_COLUMNS: &str =
    "id, owner_id, name, description, rules, is_public, created_at, updated_at";
const CREDENTIAL_COLUMNS: &str =
    "id, user_id, exchange, api_key_encrypted, secret_key_encrypted, is_active, created_at";
const BACKTEST_COLUMNS: &str = "id, user_id, strategy_id, status, parameters, failure_reason, \
     created_at, updated_at, started_at, completed_at";
const LIVE_BOT_COLUMNS: &str = "id, user_id, strategy_id, credential_id, ticker, timeframe, \
     initial_capital, order_quantity, status, failure_reason, created_at, updated_at, \
     started_at, last_run_at, stopped_at";
const TRADE_COLUMNS: &str =
    "id, job_kind, job_id, timestamp, side, price, quantity, commission, pnl, balance";

pub struct PostgresStore {
    url: String,
    client: Arc<RwLock<Option<Client>>>,
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Value> {
    serde_json::to_value(value).map_err(|e| StoreError::Query(format!("encode: {}", e)))
}

fn decode<T: DeserializeOwned>(value: Value) -> StoreResult<T> {
    serde_json::from_value(value).map_err(|e| StoreError::Query(format!("decode: {}", e)))
}

fn status_of(row: &Row, column: &str) -> StoreResult<JobStatus> {
    let raw: String = row.try_get(column)?;
    raw.parse()
        .map_err(|e: crate::models::job::UnknownStatus| StoreError::Query(e.to_string()))
}

fn status_names(statuses: &[JobStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

fn order_clause(sort: JobSort, finished_column: &str) -> String {
    match sort {
        JobSort::CreatedAtDesc => "created_at DESC, id DESC".to_string(),
        JobSort::CreatedAtAsc => "created_at ASC, id ASC".to_string(),
        JobSort::CompletedAtDesc => format!("{} DESC NULLS LAST, id DESC", finished_column),
    }
}

fn connected(guard: &Option<Client>) -> StoreResult<&Client> {
    guard
        .as_ref()
        .ok_or_else(|| StoreError::Unavailable("not connected".to_string()))
}

fn row_to_strategy(row: &Row) -> StoreResult<Strategy> {
    Ok(Strategy {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        rules: decode(row.try_get("rules")?)?,
        is_public: row.try_get("is_public")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_plan(row: &Row) -> StoreResult<Plan> {
    Ok(Plan {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        price: row.try_get("price")?,
        features: decode(row.try_get("features")?)?,
    })
}

fn row_to_credential(row: &Row) -> StoreResult<ApiCredential> {
    Ok(ApiCredential {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        exchange: row.try_get("exchange")?,
        api_key_encrypted: row.try_get("api_key_encrypted")?,
        secret_key_encrypted: row.try_get("secret_key_encrypted")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_backtest(row: &Row) -> StoreResult<Backtest> {
    Ok(Backtest {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        strategy_id: row.try_get("strategy_id")?,
        status: status_of(row, "status")?,
        parameters: decode(row.try_get("parameters")?)?,
        failure_reason: row.try_get("failure_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn row_to_live_bot(row: &Row) -> StoreResult<LiveBot> {
    Ok(LiveBot {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        strategy_id: row.try_get("strategy_id")?,
        credential_id: row.try_get("credential_id")?,
        ticker: row.try_get("ticker")?,
        timeframe: row.try_get("timeframe")?,
        initial_capital: row.try_get("initial_capital")?,
        order_quantity: row.try_get("order_quantity")?,
        status: status_of(row, "status")?,
        failure_reason: row.try_get("failure_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        last_run_at: row.try_get("last_run_at")?,
        stopped_at: row.try_get("stopped_at")?,
    })
}

fn row_to_trade(row: &Row, job: JobRef) -> StoreResult<TradeLog> {
    let side: String = row.try_get("side")?;
    Ok(TradeLog {
        id: row.try_get("id")?,
        job,
        timestamp: row.try_get("timestamp")?,
        side: TradeSide::parse(&side)
            .ok_or_else(|| StoreError::Query(format!("unknown trade side '{}'", side)))?,
        price: row.try_get("price")?,
        quantity: row.try_get("quantity")?,
        commission: row.try_get("commission")?,
        pnl: row.try_get("pnl")?,
        balance: row.try_get("balance")?,
    })
}

fn row_to_result(row: &Row) -> StoreResult<BacktestResult> {
    let trade_count: i32 = row.try_get("trade_count")?;
    Ok(BacktestResult {
        backtest_id: row.try_get("backtest_id")?,
        total_return_pct: row.try_get("total_return_pct")?,
        max_drawdown_pct: row.try_get("max_drawdown_pct")?,
        win_rate_pct: row.try_get("win_rate_pct")?,
        trade_count: trade_count.max(0) as u32,
        final_balance: row.try_get("final_balance")?,
        equity_curve: decode(row.try_get("equity_curve")?)?,
        executed_at: row.try_get("executed_at")?,
    })
}

/// Admission locks both the submitting user (quota) and the strategy owner
/// (dependency deletes), in id order. The strategy is re-read once the
/// locks are held since a delete may have committed while waiting.
async fn lock_admission(tx: &Transaction<'_>, user_id: i64, strategy_id: i64) -> StoreResult<()> {
    let missing = StoreError::NotFound {
        entity: "strategy",
        id: strategy_id,
    };
    let owner_id: i64 = match tx
        .query_opt("SELECT owner_id FROM strategies WHERE id = $1", &[&strategy_id])
        .await?
    {
        Some(row) => row.try_get(0)?,
        None => return Err(missing),
    };

    let mut keys = vec![user_id, owner_id];
    keys.sort_unstable();
    keys.dedup();
    for key in keys {
        tx.execute("SELECT pg_advisory_xact_lock($1)", &[&key])
            .await?;
    }

    if tx
        .query_opt("SELECT id FROM strategies WHERE id = $1", &[&strategy_id])
        .await?
        .is_none()
    {
        return Err(missing);
    }
    Ok(())
}

impl PostgresStore {
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Self::open(url).await?;
        let store = Self {
            url: url.to_string(),
            client: Arc::new(RwLock::new(Some(client))),
        };
        store.init_schema().await?;
        info!("PostgresStore: connected and schema ready");
        Ok(store)
    }

    async fn open(url: &str) -> StoreResult<Client> {
        let (client, connection) = tokio_postgres::connect(url, NoTls)
            .await
            .map_err(|e| StoreError::Unavailable(format!("failed to connect: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection error");
            }
        });

        Ok(client)
    }

    async fn init_schema(&self) -> StoreResult<()> {
        let guard = self.client.read().await;
        connected(&guard)?.batch_execute(SCHEMA).await?;
        Ok(())
    }

    /// Seed or replace a plan row by name
    pub async fn upsert_plan(&self, plan: &Plan) -> StoreResult<Plan> {
        let guard = self.client.read().await;
        let row = connected(&guard)?
            .query_one(
                "INSERT INTO plans (name, price, features) VALUES ($1, $2, $3)
                 ON CONFLICT (name) DO UPDATE SET price = EXCLUDED.price, features = EXCLUDED.features
                 RETURNING id, name, price, features",
                &[&plan.name, &plan.price, &encode(&plan.features)?],
            )
            .await?;
        row_to_plan(&row)
    }

    async fn missing_or_conflict(&self, client: &Client, job: JobRef) -> StoreError {
        let (table, entity) = match job.kind {
            JobKind::Backtest => ("backtests", "backtest"),
            JobKind::LiveBot => ("live_bots", "live bot"),
        };
        let sql = format!("SELECT status FROM {} WHERE id = $1", table);
        match client.query_opt(sql.as_str(), &[&job.id]).await {
            Ok(Some(row)) => match status_of(&row, "status") {
                Ok(current) => StoreError::Conflict { current },
                Err(e) => e,
            },
            Ok(None) => StoreError::NotFound { entity, id: job.id },
            Err(e) => e.into(),
        }
    }
}

#[async_trait]
impl PlanRepository for PostgresStore {
    async fn subscription_for_user(&self, user_id: i64) -> StoreResult<Option<Subscription>> {
        let guard = self.client.read().await;
        let row = connected(&guard)?
            .query_opt(
                "SELECT user_id, plan_id, status, current_period_end FROM subscriptions WHERE user_id = $1",
                &[&user_id],
            )
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let status: String = row.try_get("status")?;
        Ok(Some(Subscription {
            user_id: row.try_get("user_id")?,
            plan_id: row.try_get("plan_id")?,
            status: SubscriptionStatus::parse(&status)
                .ok_or_else(|| StoreError::Query(format!("unknown subscription status '{}'", status)))?,
            current_period_end: row.try_get("current_period_end")?,
        }))
    }

    async fn plan_by_id(&self, plan_id: i64) -> StoreResult<Option<Plan>> {
        let guard = self.client.read().await;
        connected(&guard)?
            .query_opt("SELECT id, name, price, features FROM plans WHERE id = $1", &[&plan_id])
            .await?
            .map(|row| row_to_plan(&row))
            .transpose()
    }

    async fn plan_by_name(&self, name: &str) -> StoreResult<Option<Plan>> {
        let guard = self.client.read().await;
        connected(&guard)?
            .query_opt("SELECT id, name, price, features FROM plans WHERE name = $1", &[&name])
            .await?
            .map(|row| row_to_plan(&row))
            .transpose()
    }
}

#[async_trait]
impl StrategyRepository for PostgresStore {
    async fn insert_strategy(&self, owner_id: i64, strategy: NewStrategy) -> StoreResult<Strategy> {
        let guard = self.client.read().await;
        let sql = format!(
            "INSERT INTO strategies (owner_id, name, description, rules, is_public)
             VALUES ($1, $2, $3, $4, $5) RETURNING {}",
            STRATEGY_COLUMNS
        );
        let row = connected(&guard)?
            .query_one(
                sql.as_str(),
                &[
                    &owner_id,
                    &strategy.name,
                    &strategy.description,
                    &encode(&strategy.rules)?,
                    &strategy.is_public,
                ],
            )
            .await?;
        row_to_strategy(&row)
    }

    async fn get_strategy(&self, id: i64) -> StoreResult<Option<Strategy>> {
        let guard = self.client.read().await;
        let sql = format!("SELECT {} FROM strategies WHERE id = $1", STRATEGY_COLUMNS);
        connected(&guard)?
            .query_opt(sql.as_str(), &[&id])
            .await?
            .map(|row| row_to_strategy(&row))
            .transpose()
    }

    async fn list_strategies(&self, owner_id: i64) -> StoreResult<Vec<Strategy>> {
        let guard = self.client.read().await;
        let sql = format!(
            "SELECT {} FROM strategies WHERE owner_id = $1 ORDER BY id",
            STRATEGY_COLUMNS
        );
        connected(&guard)?
            .query(sql.as_str(), &[&owner_id])
            .await?
            .iter()
            .map(row_to_strategy)
            .collect()
    }

    async fn update_strategy(&self, strategy: &Strategy) -> StoreResult<Strategy> {
        let guard = self.client.read().await;
        let sql = format!(
            "UPDATE strategies SET name = $2, description = $3, rules = $4, is_public = $5,
             updated_at = now() WHERE id = $1 RETURNING {}",
            STRATEGY_COLUMNS
        );
        let row = connected(&guard)?
            .query_opt(
                sql.as_str(),
                &[
                    &strategy.id,
                    &strategy.name,
                    &strategy.description,
                    &encode(&strategy.rules)?,
                    &strategy.is_public,
                ],
            )
            .await?
            .ok_or(StoreError::NotFound {
                entity: "strategy",
                id: strategy.id,
            })?;
        row_to_strategy(&row)
    }

    async fn delete_strategy_if_unused(&self, owner_id: i64, id: i64) -> StoreResult<()> {
        let mut guard = self.client.write().await;
        let client = guard
            .as_mut()
            .ok_or_else(|| StoreError::Unavailable("not connected".to_string()))?;
        let tx = client.transaction().await?;
        tx.execute("SELECT pg_advisory_xact_lock($1)", &[&owner_id])
            .await?;

        if tx
            .query_opt("SELECT id FROM strategies WHERE id = $1", &[&id])
            .await?
            .is_none()
        {
            return Err(StoreError::NotFound {
                entity: "strategy",
                id,
            });
        }

        let bots: i64 = tx
            .query_one(
                "SELECT COUNT(*) FROM live_bots WHERE strategy_id = $1 AND status = ANY($2)",
                &[&id, &status_names(&ACTIVE_BOT_STATUSES)],
            )
            .await?
            .try_get(0)?;
        let backtests: i64 = tx
            .query_one(
                "SELECT COUNT(*) FROM backtests WHERE strategy_id = $1 AND status = ANY($2)",
                &[
                    &id,
                    &status_names(&[JobStatus::Pending, JobStatus::Running]),
                ],
            )
            .await?
            .try_get(0)?;
        let dependents = (bots + backtests) as usize;
        if dependents > 0 {
            return Err(StoreError::InUse { dependents });
        }

        tx.execute("DELETE FROM strategies WHERE id = $1", &[&id])
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl CredentialRepository for PostgresStore {
    async fn insert_credential(&self, credential: NewCredential) -> StoreResult<ApiCredential> {
        let guard = self.client.read().await;
        let sql = format!(
            "INSERT INTO api_keys (user_id, exchange, api_key_encrypted, secret_key_encrypted, is_active)
             VALUES ($1, $2, $3, $4, $5) RETURNING {}",
            CREDENTIAL_COLUMNS
        );
        let row = connected(&guard)?
            .query_one(
                sql.as_str(),
                &[
                    &credential.user_id,
                    &credential.exchange,
                    &credential.api_key_encrypted,
                    &credential.secret_key_encrypted,
                    &credential.is_active,
                ],
            )
            .await?;
        row_to_credential(&row)
    }

    async fn get_credential(&self, id: i64) -> StoreResult<Option<ApiCredential>> {
        let guard = self.client.read().await;
        let sql = format!("SELECT {} FROM api_keys WHERE id = $1", CREDENTIAL_COLUMNS);
        connected(&guard)?
            .query_opt(sql.as_str(), &[&id])
            .await?
            .map(|row| row_to_credential(&row))
            .transpose()
    }

    async fn delete_credential_if_unused(&self, owner_id: i64, id: i64) -> StoreResult<()> {
        let mut guard = self.client.write().await;
        let client = guard
            .as_mut()
            .ok_or_else(|| StoreError::Unavailable("not connected".to_string()))?;
        let tx = client.transaction().await?;
        tx.execute("SELECT pg_advisory_xact_lock($1)", &[&owner_id])
            .await?;

        let bots: i64 = tx
            .query_one(
                "SELECT COUNT(*) FROM live_bots WHERE credential_id = $1 AND status = ANY($2)",
                &[&id, &status_names(&ACTIVE_BOT_STATUSES)],
            )
            .await?
            .try_get(0)?;
        if bots > 0 {
            return Err(StoreError::InUse {
                dependents: bots as usize,
            });
        }

        let deleted = tx
            .execute("DELETE FROM api_keys WHERE id = $1", &[&id])
            .await?;
        if deleted == 0 {
            return Err(StoreError::NotFound {
                entity: "credential",
                id,
            });
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl JobRepository for PostgresStore {
    async fn admit_backtest(
        &self,
        backtest: NewBacktest,
        since: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Admission<Backtest>> {
        let mut guard = self.client.write().await;
        let client = guard
            .as_mut()
            .ok_or_else(|| StoreError::Unavailable("not connected".to_string()))?;
        let tx = client.transaction().await?;
        lock_admission(&tx, backtest.user_id, backtest.strategy_id).await?;

        let used: i64 = tx
            .query_one(
                "SELECT COUNT(*) FROM backtests
                 WHERE user_id = $1 AND created_at >= $2 AND status = ANY($3)",
                &[
                    &backtest.user_id,
                    &since,
                    &status_names(&BACKTEST_QUOTA_STATUSES),
                ],
            )
            .await?
            .try_get(0)?;
        if used >= i64::from(limit) {
            return Ok(Admission::OverQuota {
                used: used as u32,
                limit,
            });
        }

        let sql = format!(
            "INSERT INTO backtests (user_id, strategy_id, status, parameters)
             VALUES ($1, $2, $3, $4) RETURNING {}",
            BACKTEST_COLUMNS
        );
        let row = tx
            .query_one(
                sql.as_str(),
                &[
                    &backtest.user_id,
                    &backtest.strategy_id,
                    &JobStatus::Pending.as_str(),
                    &encode(&backtest.parameters)?,
                ],
            )
            .await?;
        let stored = row_to_backtest(&row)?;
        tx.commit().await?;
        Ok(Admission::Admitted(stored))
    }

    async fn admit_live_bot(&self, bot: NewLiveBot, limit: u32) -> StoreResult<Admission<LiveBot>> {
        let mut guard = self.client.write().await;
        let client = guard
            .as_mut()
            .ok_or_else(|| StoreError::Unavailable("not connected".to_string()))?;
        let tx = client.transaction().await?;
        lock_admission(&tx, bot.user_id, bot.strategy_id).await?;
        if tx
            .query_opt(
                "SELECT id FROM api_keys WHERE id = $1 AND user_id = $2 AND is_active",
                &[&bot.credential_id, &bot.user_id],
            )
            .await?
            .is_none()
        {
            return Err(StoreError::NotFound {
                entity: "credential",
                id: bot.credential_id,
            });
        }

        let used: i64 = tx
            .query_one(
                "SELECT COUNT(*) FROM live_bots WHERE user_id = $1 AND status = ANY($2)",
                &[&bot.user_id, &status_names(&ACTIVE_BOT_STATUSES)],
            )
            .await?
            .try_get(0)?;
        if used >= i64::from(limit) {
            return Ok(Admission::OverQuota {
                used: used as u32,
                limit,
            });
        }

        let sql = format!(
            "INSERT INTO live_bots (user_id, strategy_id, credential_id, ticker, timeframe,
             initial_capital, order_quantity, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING {}",
            LIVE_BOT_COLUMNS
        );
        let row = tx
            .query_one(
                sql.as_str(),
                &[
                    &bot.user_id,
                    &bot.strategy_id,
                    &bot.credential_id,
                    &bot.ticker,
                    &bot.timeframe,
                    &bot.initial_capital,
                    &bot.order_quantity,
                    &JobStatus::Initializing.as_str(),
                ],
            )
            .await?;
        let stored = row_to_live_bot(&row)?;
        tx.commit().await?;
        Ok(Admission::Admitted(stored))
    }

    async fn count_backtests_since(&self, user_id: i64, since: DateTime<Utc>) -> StoreResult<u32> {
        let guard = self.client.read().await;
        let used: i64 = connected(&guard)?
            .query_one(
                "SELECT COUNT(*) FROM backtests
                 WHERE user_id = $1 AND created_at >= $2 AND status = ANY($3)",
                &[&user_id, &since, &status_names(&BACKTEST_QUOTA_STATUSES)],
            )
            .await?
            .try_get(0)?;
        Ok(used as u32)
    }

    async fn count_active_bots(&self, user_id: i64) -> StoreResult<u32> {
        let guard = self.client.read().await;
        let used: i64 = connected(&guard)?
            .query_one(
                "SELECT COUNT(*) FROM live_bots WHERE user_id = $1 AND status = ANY($2)",
                &[&user_id, &status_names(&ACTIVE_BOT_STATUSES)],
            )
            .await?
            .try_get(0)?;
        Ok(used as u32)
    }

    async fn get_backtest(&self, id: i64) -> StoreResult<Option<Backtest>> {
        let guard = self.client.read().await;
        let sql = format!("SELECT {} FROM backtests WHERE id = $1", BACKTEST_COLUMNS);
        connected(&guard)?
            .query_opt(sql.as_str(), &[&id])
            .await?
            .map(|row| row_to_backtest(&row))
            .transpose()
    }

    async fn get_live_bot(&self, id: i64) -> StoreResult<Option<LiveBot>> {
        let guard = self.client.read().await;
        let sql = format!("SELECT {} FROM live_bots WHERE id = $1", LIVE_BOT_COLUMNS);
        connected(&guard)?
            .query_opt(sql.as_str(), &[&id])
            .await?
            .map(|row| row_to_live_bot(&row))
            .transpose()
    }

    async fn list_backtests(
        &self,
        user_id: Option<i64>,
        filter: &JobFilter,
    ) -> StoreResult<Vec<Backtest>> {
        let guard = self.client.read().await;
        let sql = format!(
            "SELECT {} FROM backtests
             WHERE ($1::BIGINT IS NULL OR user_id = $1)
               AND ($2::TEXT IS NULL OR status = $2)
               AND ($3::BIGINT IS NULL OR strategy_id = $3)
             ORDER BY {} OFFSET $4 LIMIT $5",
            BACKTEST_COLUMNS,
            order_clause(filter.sort, "completed_at")
        );
        let status = filter.status.map(|s| s.as_str().to_string());
        connected(&guard)?
            .query(
                sql.as_str(),
                &[
                    &user_id,
                    &status,
                    &filter.strategy_id,
                    &(filter.offset as i64),
                    &(filter.limit as i64),
                ],
            )
            .await?
            .iter()
            .map(row_to_backtest)
            .collect()
    }

    async fn list_live_bots(
        &self,
        user_id: Option<i64>,
        filter: &JobFilter,
    ) -> StoreResult<Vec<LiveBot>> {
        let guard = self.client.read().await;
        let sql = format!(
            "SELECT {} FROM live_bots
             WHERE ($1::BIGINT IS NULL OR user_id = $1)
               AND ($2::TEXT IS NULL OR status = $2)
               AND ($3::BIGINT IS NULL OR strategy_id = $3)
             ORDER BY {} OFFSET $4 LIMIT $5",
            LIVE_BOT_COLUMNS,
            order_clause(filter.sort, "stopped_at")
        );
        let status = filter.status.map(|s| s.as_str().to_string());
        connected(&guard)?
            .query(
                sql.as_str(),
                &[
                    &user_id,
                    &status,
                    &filter.strategy_id,
                    &(filter.offset as i64),
                    &(filter.limit as i64),
                ],
            )
            .await?
            .iter()
            .map(row_to_live_bot)
            .collect()
    }

    async fn transition(
        &self,
        job: JobRef,
        from: &[JobStatus],
        to: JobStatus,
        stamp: TransitionStamp,
    ) -> StoreResult<JobRecord> {
        let guard = self.client.read().await;
        let client = connected(&guard)?;
        let from = status_names(from);

        let updated = match job.kind {
            JobKind::Backtest => {
                let sql = format!(
                    "UPDATE backtests SET status = $1, updated_at = now(),
                     started_at = COALESCE($2, started_at),
                     completed_at = COALESCE($3, completed_at),
                     failure_reason = COALESCE($4, failure_reason)
                     WHERE id = $5 AND status = ANY($6) RETURNING {}",
                    BACKTEST_COLUMNS
                );
                client
                    .query_opt(
                        sql.as_str(),
                        &[
                            &to.as_str(),
                            &stamp.started_at,
                            &stamp.completed_at,
                            &stamp.failure_reason,
                            &job.id,
                            &from,
                        ],
                    )
                    .await?
                    .map(|row| row_to_backtest(&row).map(JobRecord::Backtest))
            }
            JobKind::LiveBot => {
                let sql = format!(
                    "UPDATE live_bots SET status = $1, updated_at = now(),
                     started_at = COALESCE($2, started_at),
                     stopped_at = COALESCE($3, stopped_at),
                     failure_reason = COALESCE($4, failure_reason)
                     WHERE id = $5 AND status = ANY($6) RETURNING {}",
                    LIVE_BOT_COLUMNS
                );
                client
                    .query_opt(
                        sql.as_str(),
                        &[
                            &to.as_str(),
                            &stamp.started_at,
                            &stamp.stopped_at,
                            &stamp.failure_reason,
                            &job.id,
                            &from,
                        ],
                    )
                    .await?
                    .map(|row| row_to_live_bot(&row).map(JobRecord::LiveBot))
            }
        };

        match updated {
            Some(record) => record,
            None => Err(self.missing_or_conflict(client, job).await),
        }
    }

    async fn touch_last_run(&self, bot_id: i64, at: DateTime<Utc>) -> StoreResult<()> {
        let guard = self.client.read().await;
        let updated = connected(&guard)?
            .execute(
                "UPDATE live_bots SET last_run_at = $2 WHERE id = $1",
                &[&bot_id, &at],
            )
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                entity: "live bot",
                id: bot_id,
            });
        }
        Ok(())
    }

    async fn claim_live_bot(
        &self,
        bot_id: i64,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let guard = self.client.read().await;
        let updated = connected(&guard)?
            .execute(
                "UPDATE live_bots SET lease_holder = $2, lease_expires_at = $4
                 WHERE id = $1
                   AND (lease_holder IS NULL OR lease_holder = $2 OR lease_expires_at <= $3)",
                &[&bot_id, &holder, &now, &expires_at],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn release_live_bot(&self, bot_id: i64, holder: &str) -> StoreResult<()> {
        let guard = self.client.read().await;
        connected(&guard)?
            .execute(
                "UPDATE live_bots SET lease_holder = NULL, lease_expires_at = NULL
                 WHERE id = $1 AND lease_holder = $2",
                &[&bot_id, &holder],
            )
            .await?;
        Ok(())
    }

    async fn delete_live_bot(&self, id: i64) -> StoreResult<()> {
        let guard = self.client.read().await;
        let deleted = connected(&guard)?
            .execute("DELETE FROM live_bots WHERE id = $1", &[&id])
            .await?;
        if deleted == 0 {
            return Err(StoreError::NotFound {
                entity: "live bot",
                id,
            });
        }
        Ok(())
    }

    async fn jobs_in_status(
        &self,
        kind: JobKind,
        statuses: &[JobStatus],
    ) -> StoreResult<Vec<JobRef>> {
        let guard = self.client.read().await;
        let table = match kind {
            JobKind::Backtest => "backtests",
            JobKind::LiveBot => "live_bots",
        };
        let sql = format!(
            "SELECT id FROM {} WHERE status = ANY($1) ORDER BY created_at, id",
            table
        );
        let rows = connected(&guard)?
            .query(sql.as_str(), &[&status_names(statuses)])
            .await?;
        rows.iter()
            .map(|row| {
                let id: i64 = row.try_get("id")?;
                Ok(JobRef { kind, id })
            })
            .collect()
    }
}

#[async_trait]
impl TradeLogRepository for PostgresStore {
    async fn append_trade(&self, job: JobRef, entry: NewTradeLog) -> StoreResult<TradeLog> {
        let mut guard = self.client.write().await;
        let client = guard
            .as_mut()
            .ok_or_else(|| StoreError::Unavailable("not connected".to_string()))?;
        let tx = client.transaction().await?;

        let latest: Option<DateTime<Utc>> = tx
            .query_one(
                "SELECT MAX(timestamp) FROM trade_logs WHERE job_kind = $1 AND job_id = $2",
                &[&job.kind.as_str(), &job.id],
            )
            .await?
            .try_get(0)?;
        if latest.is_some_and(|ts| entry.timestamp < ts) {
            return Err(StoreError::OutOfOrder { job });
        }

        let sql = format!(
            "INSERT INTO trade_logs (job_kind, job_id, timestamp, side, price, quantity, commission, pnl, balance)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING {}",
            TRADE_COLUMNS
        );
        let row = tx
            .query_one(
                sql.as_str(),
                &[
                    &job.kind.as_str(),
                    &job.id,
                    &entry.timestamp,
                    &entry.side.as_str(),
                    &entry.price,
                    &entry.quantity,
                    &entry.commission,
                    &entry.pnl,
                    &entry.balance,
                ],
            )
            .await?;
        let trade = row_to_trade(&row, job)?;
        tx.commit().await?;
        Ok(trade)
    }

    async fn trade_logs(&self, job: JobRef) -> StoreResult<Vec<TradeLog>> {
        let guard = self.client.read().await;
        let sql = format!(
            "SELECT {} FROM trade_logs WHERE job_kind = $1 AND job_id = $2 ORDER BY timestamp, id",
            TRADE_COLUMNS
        );
        connected(&guard)?
            .query(sql.as_str(), &[&job.kind.as_str(), &job.id])
            .await?
            .iter()
            .map(|row| row_to_trade(row, job))
            .collect()
    }

    async fn save_result(&self, result: &BacktestResult) -> StoreResult<()> {
        let guard = self.client.read().await;
        connected(&guard)?
            .execute(
                "INSERT INTO backtest_results (backtest_id, total_return_pct, max_drawdown_pct,
                 win_rate_pct, trade_count, final_balance, equity_curve, executed_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (backtest_id) DO UPDATE SET
                   total_return_pct = EXCLUDED.total_return_pct,
                   max_drawdown_pct = EXCLUDED.max_drawdown_pct,
                   win_rate_pct = EXCLUDED.win_rate_pct,
                   trade_count = EXCLUDED.trade_count,
                   final_balance = EXCLUDED.final_balance,
                   equity_curve = EXCLUDED.equity_curve,
                   executed_at = EXCLUDED.executed_at",
                &[
                    &result.backtest_id,
                    &result.total_return_pct,
                    &result.max_drawdown_pct,
                    &result.win_rate_pct,
                    &(result.trade_count.min(i32::MAX as u32) as i32),
                    &result.final_balance,
                    &encode(&result.equity_curve)?,
                    &result.executed_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn backtest_result(&self, backtest_id: i64) -> StoreResult<Option<BacktestResult>> {
        let guard = self.client.read().await;
        connected(&guard)?
            .query_opt(
                "SELECT backtest_id, total_return_pct, max_drawdown_pct, win_rate_pct, trade_count,
                 final_balance, equity_curve, executed_at FROM backtest_results WHERE backtest_id = $1",
                &[&backtest_id],
            )
            .await?
            .map(|row| row_to_result(&row))
            .transpose()
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn reconnect(&self) -> StoreResult<()> {
        let fresh = Self::open(&self.url).await?;
        let mut guard = self.client.write().await;
        *guard = Some(fresh);
        info!("PostgresStore: reconnected");
        Ok(())
    }
}
