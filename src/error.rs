//! Error taxonomy for the engine and its collaborators

use crate::models::job::{JobRef, JobStatus};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced to callers of the job store and strategy operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("quota exceeded: {used} of {limit} {resource} in use")]
    QuotaExceeded {
        resource: &'static str,
        used: u32,
        limit: u32,
    },

    #[error("timeframe '{timeframe}' is not allowed by the current plan (node {node_id})")]
    PlanViolation { timeframe: String, node_id: String },

    #[error("credential {0} is missing, inactive or not owned by the caller")]
    CredentialInvalid(i64),

    #[error("{resource} {id} is still referenced by {dependents} active job(s)")]
    ResourceInUse {
        resource: &'static str,
        id: i64,
        dependents: usize,
    },

    #[error("{job}: cannot move from '{from}' to '{to}'")]
    InvalidTransition {
        job: JobRef,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("indicator {key}@{timeframe} unavailable (node {node})")]
    IndicatorUnavailable {
        key: String,
        timeframe: String,
        node: String,
    },

    #[error("failed to dispatch {job}: {reason}")]
    DispatchFailure { job: JobRef, reason: String },

    #[error("execution failed: {0}")]
    ExecutionFailure(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("forbidden")]
    Forbidden,

    #[error("invalid strategy: {0}")]
    InvalidStrategy(String),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("market data error: {0}")]
    MarketData(MarketDataError),
}

impl CoreError {
    /// Connectivity failures that another attempt may get past
    pub fn is_transient(&self) -> bool {
        match self {
            CoreError::Store(e) => e.is_transient(),
            CoreError::MarketData(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => CoreError::NotFound { entity, id },
            other => CoreError::Store(other),
        }
    }
}

impl From<MarketDataError> for CoreError {
    fn from(err: MarketDataError) -> Self {
        match err {
            MarketDataError::Unreachable(_) => CoreError::MarketData(err),
            other => CoreError::ExecutionFailure(other.to_string()),
        }
    }
}

impl From<EvaluationError> for CoreError {
    fn from(err: EvaluationError) -> Self {
        match err {
            EvaluationError::IndicatorUnavailable {
                key,
                timeframe,
                node,
            } => CoreError::IndicatorUnavailable {
                key,
                timeframe,
                node,
            },
            EvaluationError::IncompleteNode { node } => {
                CoreError::InvalidStrategy(format!("node {} is missing a condition", node))
            }
        }
    }
}

/// Persistence-layer failures
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    /// Connection lost or never established. Callers may reconnect.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// Compare-and-set lost: the record was not in an expected state
    #[error("status conflict: record is '{current}'")]
    Conflict { current: JobStatus },

    #[error("trade log for {job} would go back in time")]
    OutOfOrder { job: JobRef },

    #[error("still referenced by {dependents} active job(s)")]
    InUse { dependents: usize },

    #[error("query failed: {0}")]
    Query(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<tokio_postgres::Error> for StoreError {
    fn from(err: tokio_postgres::Error) -> Self {
        if err.is_closed() {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Query(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvaluationError {
    #[error("indicator {key}@{timeframe} unavailable (node {node})")]
    IndicatorUnavailable {
        key: String,
        timeframe: String,
        node: String,
    },

    #[error("node {node} is missing a condition")]
    IncompleteNode { node: String },
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum MarketDataError {
    #[error("no data for {indicator} on {ticker}: {reason}")]
    DataUnavailable {
        ticker: String,
        indicator: String,
        reason: String,
    },

    #[error("unsupported indicator '{0}'")]
    UnsupportedIndicator(String),

    /// Upstream feed unreachable; worth retrying
    #[error("market data source unreachable: {0}")]
    Unreachable(String),
}

impl MarketDataError {
    pub fn is_transient(&self) -> bool {
        matches!(self, MarketDataError::Unreachable(_))
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CredentialError {
    #[error("credential {0} not found")]
    NotFound(i64),

    #[error("credential {0} is inactive")]
    Inactive(i64),

    #[error("credential key is not configured")]
    MissingKey,

    #[error("invalid credential key: {0}")]
    InvalidKey(String),

    #[error("failed to decrypt credential: {0}")]
    Decrypt(String),

    #[error("failed to encrypt credential: {0}")]
    Encrypt(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("order rejected by exchange: {0}")]
    Rejected(String),

    #[error("exchange request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected exchange response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DispatchError {
    #[error("queue unavailable: {0}")]
    Queue(String),

    #[error("scheduler is shutting down")]
    Closed,
}
