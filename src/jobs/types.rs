//! Queue payloads handed from the API server to the worker

use crate::models::job::JobRef;
use serde::{Deserialize, Serialize};

/// Run (or resume) one backtest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunBacktestJob {
    pub backtest_id: i64,
}

/// Start the control loop of one live bot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLiveBotJob {
    pub bot_id: i64,
}

impl RunBacktestJob {
    pub fn job_ref(&self) -> JobRef {
        JobRef::backtest(self.backtest_id)
    }
}

impl RunLiveBotJob {
    pub fn job_ref(&self) -> JobRef {
        JobRef::live_bot(self.bot_id)
    }
}
