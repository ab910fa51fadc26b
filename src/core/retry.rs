//! Backoff policy for transient failures, one per job kind. The scheduler
//! walks `delays()` between attempts, each attempt being a fresh worker.

use crate::models::job::JobKind;
use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const fn backtest() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(300),
            max_delay: Duration::from_secs(3600),
        }
    }

    pub const fn live_bot() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(600),
        }
    }

    pub fn for_kind(kind: JobKind) -> Self {
        match kind {
            JobKind::Backtest => Self::backtest(),
            JobKind::LiveBot => Self::live_bot(),
        }
    }

    pub fn builder(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_delay)
            .with_max_delay(self.max_delay)
            .with_factor(2.0)
            .with_max_times(self.max_attempts.saturating_sub(1))
    }

    /// Delays between attempts, in order
    pub fn delays(&self) -> ExponentialBackoff {
        self.builder().build()
    }
}
