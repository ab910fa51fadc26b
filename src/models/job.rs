//! Backtest and live-bot jobs and their shared state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Backtest,
    LiveBot,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Backtest => "backtest",
            JobKind::LiveBot => "live_bot",
        }
    }
}

/// Job identity. The scheduler uses it as the task identity too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobRef {
    pub kind: JobKind,
    pub id: i64,
}

impl JobRef {
    pub fn backtest(id: i64) -> Self {
        Self {
            kind: JobKind::Backtest,
            id,
        }
    }

    pub fn live_bot(id: i64) -> Self {
        Self {
            kind: JobKind::LiveBot,
            id,
        }
    }
}

impl fmt::Display for JobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Initializing,
    Running,
    Active,
    Paused,
    Completed,
    Failed,
    FailedDispatch,
    Canceled,
    Error,
    Stopped,
}

/// Statuses counted against the daily backtest quota
pub const BACKTEST_QUOTA_STATUSES: [JobStatus; 3] =
    [JobStatus::Pending, JobStatus::Running, JobStatus::Completed];

/// Statuses counted against the concurrent bot limit
pub const ACTIVE_BOT_STATUSES: [JobStatus; 3] =
    [JobStatus::Initializing, JobStatus::Active, JobStatus::Paused];

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Initializing => "initializing",
            JobStatus::Running => "running",
            JobStatus::Active => "active",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::FailedDispatch => "failed_dispatch",
            JobStatus::Canceled => "canceled",
            JobStatus::Error => "error",
            JobStatus::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::Failed
                | JobStatus::FailedDispatch
                | JobStatus::Canceled
                | JobStatus::Error
                | JobStatus::Stopped
        )
    }

    /// Whether `self -> to` is a legal edge for a job of `kind`
    pub fn can_transition(&self, kind: JobKind, to: JobStatus) -> bool {
        use JobStatus::*;
        if self.is_terminal() {
            return false;
        }
        match kind {
            JobKind::Backtest => matches!(
                (self, to),
                (Pending, Running)
                    | (Pending, Canceled)
                    | (Pending, Failed)
                    | (Pending, FailedDispatch)
                    | (Running, Completed)
                    | (Running, Failed)
                    | (Running, Canceled)
            ),
            JobKind::LiveBot => matches!(
                (self, to),
                (Initializing, Active)
                    | (Initializing, Stopped)
                    | (Initializing, Error)
                    | (Initializing, FailedDispatch)
                    | (Active, Paused)
                    | (Paused, Active)
                    | (Active, Stopped)
                    | (Paused, Stopped)
                    | (Active, Error)
                    | (Paused, Error)
            ),
        }
    }

    /// Every status that may legally move to `to`
    pub fn sources_for(kind: JobKind, to: JobStatus) -> Vec<JobStatus> {
        Self::all()
            .into_iter()
            .filter(|from| from.can_transition(kind, to))
            .collect()
    }

    pub fn all() -> [JobStatus; 11] {
        use JobStatus::*;
        [
            Pending,
            Initializing,
            Running,
            Active,
            Paused,
            Completed,
            Failed,
            FailedDispatch,
            Canceled,
            Error,
            Stopped,
        ]
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown job status '{}'", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::all()
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

fn default_capital() -> f64 {
    10_000.0
}

/// Free-form backtest payload. Known keys are typed, the rest is kept as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestParameters {
    pub ticker: String,
    pub timeframe: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    #[serde(default = "default_capital")]
    pub initial_capital: f64,
    #[serde(default)]
    pub commission_pct: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestRequest {
    pub strategy_id: i64,
    #[serde(flatten)]
    pub parameters: BacktestParameters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backtest {
    pub id: i64,
    pub user_id: i64,
    pub strategy_id: i64,
    pub status: JobStatus,
    pub parameters: BacktestParameters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Row to insert once admission succeeds
#[derive(Debug, Clone)]
pub struct NewBacktest {
    pub user_id: i64,
    pub strategy_id: i64,
    pub parameters: BacktestParameters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveBotRequest {
    pub strategy_id: i64,
    #[serde(alias = "api_key_id")]
    pub credential_id: i64,
    pub ticker: String,
    pub timeframe: String,
    #[serde(default = "default_capital")]
    pub initial_capital: f64,
    /// Base-asset quantity per order
    pub order_quantity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveBot {
    pub id: i64,
    pub user_id: i64,
    pub strategy_id: i64,
    pub credential_id: i64,
    pub ticker: String,
    pub timeframe: String,
    pub initial_capital: f64,
    pub order_quantity: f64,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewLiveBot {
    pub user_id: i64,
    pub strategy_id: i64,
    pub credential_id: i64,
    pub ticker: String,
    pub timeframe: String,
    pub initial_capital: f64,
    pub order_quantity: f64,
}

/// Either kind of job, for code paths that handle both
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobRecord {
    Backtest(Backtest),
    LiveBot(LiveBot),
}

impl JobRecord {
    pub fn job_ref(&self) -> JobRef {
        match self {
            JobRecord::Backtest(b) => JobRef::backtest(b.id),
            JobRecord::LiveBot(b) => JobRef::live_bot(b.id),
        }
    }

    pub fn status(&self) -> JobStatus {
        match self {
            JobRecord::Backtest(b) => b.status,
            JobRecord::LiveBot(b) => b.status,
        }
    }

    pub fn user_id(&self) -> i64 {
        match self {
            JobRecord::Backtest(b) => b.user_id,
            JobRecord::LiveBot(b) => b.user_id,
        }
    }

    pub fn strategy_id(&self) -> i64 {
        match self {
            JobRecord::Backtest(b) => b.strategy_id,
            JobRecord::LiveBot(b) => b.strategy_id,
        }
    }

    pub fn into_backtest(self) -> Option<Backtest> {
        match self {
            JobRecord::Backtest(b) => Some(b),
            JobRecord::LiveBot(_) => None,
        }
    }

    pub fn into_live_bot(self) -> Option<LiveBot> {
        match self {
            JobRecord::LiveBot(b) => Some(b),
            JobRecord::Backtest(_) => None,
        }
    }
}

/// Timestamps to stamp alongside a status change
#[derive(Debug, Clone, Default)]
pub struct TransitionStamp {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl TransitionStamp {
    /// Stamp matching the conventional timestamp column for `to`
    pub fn for_status(kind: JobKind, to: JobStatus, now: DateTime<Utc>) -> Self {
        let mut stamp = Self::default();
        match (kind, to) {
            (JobKind::Backtest, JobStatus::Running) | (JobKind::LiveBot, JobStatus::Active) => {
                stamp.started_at = Some(now)
            }
            (JobKind::Backtest, status) if status.is_terminal() => stamp.completed_at = Some(now),
            (JobKind::LiveBot, JobStatus::Stopped | JobStatus::Error) => {
                stamp.stopped_at = Some(now)
            }
            _ => {}
        }
        stamp
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.failure_reason = Some(reason.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSort {
    #[default]
    CreatedAtDesc,
    CreatedAtAsc,
    CompletedAtDesc,
}

/// Listing filter shared by backtests and live bots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFilter {
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub strategy_id: Option<i64>,
    #[serde(default)]
    pub sort: JobSort,
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            status: None,
            strategy_id: None,
            sort: JobSort::default(),
            offset: 0,
            limit: default_limit(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub time: DateTime<Utc>,
    pub value: f64,
}

/// Summary written by the backtest worker on completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub backtest_id: i64,
    pub total_return_pct: f64,
    pub max_drawdown_pct: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub win_rate_pct: Option<f64>,
    pub trade_count: u32,
    pub final_balance: f64,
    pub equity_curve: Vec<EquityPoint>,
    pub executed_at: DateTime<Utc>,
}
