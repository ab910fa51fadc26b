//! Worker process runtime: crash recovery plus the Apalis queue consumers

use crate::core::scheduler::{mark_failed, ExecutionScheduler};
use crate::db::JobRepository;
use crate::error::StoreError;
use crate::jobs::handlers;
use crate::jobs::types::{RunBacktestJob, RunLiveBotJob};
use crate::models::job::{JobKind, JobStatus, ACTIVE_BOT_STATUSES};
use apalis::prelude::*;
use apalis_redis::RedisStorage;
use tracing::{info, warn};

/// What startup recovery did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub resubmitted_backtests: usize,
    pub failed_backtests: usize,
    pub resubmitted_bots: usize,
}

/// Bring jobs left behind by a previous worker back under supervision:
/// pending backtests and unfinished bots are resubmitted, backtests caught
/// mid-run are failed.
pub async fn recover_jobs(scheduler: &ExecutionScheduler) -> Result<RecoveryReport, StoreError> {
    let ctx = scheduler.context();
    let mut report = RecoveryReport::default();

    for job in ctx
        .store
        .jobs_in_status(JobKind::Backtest, &[JobStatus::Running])
        .await?
    {
        mark_failed(ctx, job, "worker restarted").await;
        report.failed_backtests += 1;
    }

    for job in ctx
        .store
        .jobs_in_status(JobKind::Backtest, &[JobStatus::Pending])
        .await?
    {
        scheduler.submit(job).await;
        report.resubmitted_backtests += 1;
    }

    for job in ctx
        .store
        .jobs_in_status(JobKind::LiveBot, &ACTIVE_BOT_STATUSES)
        .await?
    {
        scheduler.submit(job).await;
        report.resubmitted_bots += 1;
    }

    info!(
        resubmitted_backtests = report.resubmitted_backtests,
        failed_backtests = report.failed_backtests,
        resubmitted_bots = report.resubmitted_bots,
        "recovery complete"
    );
    Ok(report)
}

/// Queue consumers feeding the scheduler
pub struct WorkerRuntime {
    scheduler: ExecutionScheduler,
    backtest_storage: RedisStorage<RunBacktestJob>,
    live_bot_storage: RedisStorage<RunLiveBotJob>,
    concurrency: usize,
}

impl WorkerRuntime {
    pub fn new(
        scheduler: ExecutionScheduler,
        backtest_storage: RedisStorage<RunBacktestJob>,
        live_bot_storage: RedisStorage<RunLiveBotJob>,
    ) -> Self {
        Self {
            scheduler,
            backtest_storage,
            live_bot_storage,
            concurrency: 1,
        }
    }

    /// Consumers per queue
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn scheduler(&self) -> &ExecutionScheduler {
        &self.scheduler
    }

    /// Run recovery, then start the consumers and return their handles
    pub async fn start(&self) -> Vec<tokio::task::JoinHandle<()>> {
        if let Err(e) = recover_jobs(&self.scheduler).await {
            warn!(error = %e, "recovery failed, continuing with queued jobs only");
        }

        info!(
            concurrency = self.concurrency,
            "WorkerRuntime: starting Apalis workers with concurrency {}",
            self.concurrency
        );

        let mut handles = Vec::new();
        for i in 0..self.concurrency {
            let storage = self.backtest_storage.clone();
            let scheduler = self.scheduler.clone();
            handles.push(tokio::spawn(async move {
                let worker = WorkerBuilder::new(format!("backtest-worker-{}", i))
                    .data(scheduler)
                    .backend(storage)
                    .build_fn(handlers::handle_run_backtest);
                worker.run().await;
            }));

            let storage = self.live_bot_storage.clone();
            let scheduler = self.scheduler.clone();
            handles.push(tokio::spawn(async move {
                let worker = WorkerBuilder::new(format!("live-bot-worker-{}", i))
                    .data(scheduler)
                    .backend(storage)
                    .build_fn(handlers::handle_run_live_bot);
                worker.run().await;
            }));
        }

        info!("WorkerRuntime: all workers started");
        handles
    }
}
