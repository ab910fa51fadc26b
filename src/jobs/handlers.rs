//! Apalis handlers: queued jobs are handed to the local execution scheduler

use crate::core::scheduler::ExecutionScheduler;
use crate::jobs::types::{RunBacktestJob, RunLiveBotJob};
use apalis::prelude::*;
use tracing::debug;

/// Returns once the worker is started; the job itself runs under the scheduler
pub async fn handle_run_backtest(
    job: RunBacktestJob,
    scheduler: Data<ExecutionScheduler>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    debug!(backtest_id = job.backtest_id, "RunBacktestJob: submitting to scheduler");
    scheduler.submit(job.job_ref()).await;
    Ok(())
}

pub async fn handle_run_live_bot(
    job: RunLiveBotJob,
    scheduler: Data<ExecutionScheduler>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    debug!(bot_id = job.bot_id, "RunLiveBotJob: submitting to scheduler");
    scheduler.submit(job.job_ref()).await;
    Ok(())
}
