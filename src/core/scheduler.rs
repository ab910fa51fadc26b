//! Execution scheduler: one supervised tokio task per job.
//!
//! The job id is the task identity. Submitting a job that already has a
//! live worker returns the existing handle. Workers that return an error or
//! panic leave the job `failed` (backtest) or `error` (live bot).
//!
//! Transient failures (store or market data unreachable) are retried by the
//! supervisor: after the `RetryPolicy` delay a fresh worker task is started
//! under the same handle, with its own backtest time limits.

use crate::core::retry::RetryPolicy;
use crate::error::{CoreError, DispatchError, StoreError};
use crate::jobs::backtest::run_backtest;
use crate::jobs::context::JobContext;
use crate::jobs::live_bot::LiveBotRunner;
use crate::jobs::types::{RunBacktestJob, RunLiveBotJob};
use crate::models::job::{JobKind, JobRef, JobStatus, TransitionStamp};
use crate::services::notifications::JobNotification;
use apalis::prelude::*;
use apalis_redis::RedisStorage;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Hand-off seam between the request path and job execution
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn dispatch(&self, job: JobRef) -> Result<(), DispatchError>;

    /// `terminate` aborts the worker outright; otherwise it is asked to stop
    async fn revoke(&self, job: JobRef, terminate: bool);
}

/// Reference to a submitted job's worker
#[derive(Debug, Clone)]
pub struct JobHandle {
    job: JobRef,
    token: CancellationToken,
    generation: u64,
}

impl JobHandle {
    pub fn job(&self) -> JobRef {
        self.job
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

struct Slot {
    handle: JobHandle,
    work: AbortHandle,
    supervisor: JoinHandle<()>,
}

type Slots = Arc<Mutex<HashMap<JobRef, Slot>>>;

#[derive(Clone)]
pub struct ExecutionScheduler {
    ctx: Arc<JobContext>,
    slots: Slots,
    generation: Arc<AtomicU64>,
}

impl ExecutionScheduler {
    pub fn new(ctx: Arc<JobContext>) -> Self {
        Self {
            ctx,
            slots: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn context(&self) -> &Arc<JobContext> {
        &self.ctx
    }

    /// Start a worker for `job` unless one is already running. A job whose
    /// record is terminal (or missing) makes the worker exit immediately.
    pub async fn submit(&self, job: JobRef) -> JobHandle {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.get(&job) {
            if !slot.supervisor.is_finished() {
                debug!(job = %job, "worker already running, reusing handle");
                return slot.handle.clone();
            }
        }

        let handle = JobHandle {
            job,
            token: CancellationToken::new(),
            generation: self.generation.fetch_add(1, Ordering::Relaxed),
        };

        let work = spawn_worker(self.ctx.clone(), job, handle.token.clone(), false);
        let abort = work.abort_handle();
        let supervisor = tokio::spawn(supervise(
            self.ctx.clone(),
            self.slots.clone(),
            handle.clone(),
            work,
        ));

        slots.insert(
            job,
            Slot {
                handle: handle.clone(),
                work: abort,
                supervisor,
            },
        );
        info!(job = %job, "worker submitted");
        handle
    }

    /// Cooperative cancellation; `terminate` also aborts the worker task.
    /// Status updates are left to the caller.
    pub async fn revoke(&self, handle: &JobHandle, terminate: bool) {
        handle.token.cancel();
        if terminate {
            let slots = self.slots.lock().await;
            if let Some(slot) = slots.get(&handle.job) {
                if slot.handle.generation == handle.generation {
                    slot.work.abort();
                }
            }
        }
        info!(job = %handle.job, terminate, "worker revoked");
    }

    /// Revoke by job identity. `false` when no worker is known for it.
    pub async fn revoke_job(&self, job: JobRef, terminate: bool) -> bool {
        let handle = {
            let slots = self.slots.lock().await;
            slots.get(&job).map(|slot| slot.handle.clone())
        };
        match handle {
            Some(handle) => {
                self.revoke(&handle, terminate).await;
                true
            }
            None => false,
        }
    }

    pub async fn is_running(&self, job: JobRef) -> bool {
        self.slots
            .lock()
            .await
            .get(&job)
            .is_some_and(|slot| !slot.supervisor.is_finished())
    }

    pub async fn running_jobs(&self) -> Vec<JobRef> {
        let slots = self.slots.lock().await;
        let mut jobs: Vec<JobRef> = slots
            .iter()
            .filter(|(_, slot)| !slot.supervisor.is_finished())
            .map(|(job, _)| *job)
            .collect();
        jobs.sort_by_key(|job| (job.kind.as_str(), job.id));
        jobs
    }

    /// Revoke every worker, e.g. on shutdown. Records are left as they are
    /// so recovery can pick the jobs up again.
    pub async fn shutdown(&self) {
        let slots = self.slots.lock().await;
        for slot in slots.values() {
            slot.handle.token.cancel();
            slot.work.abort();
        }
        info!(workers = slots.len(), "scheduler shut down");
    }
}

#[async_trait]
impl JobDispatcher for ExecutionScheduler {
    async fn dispatch(&self, job: JobRef) -> Result<(), DispatchError> {
        self.submit(job).await;
        Ok(())
    }

    async fn revoke(&self, job: JobRef, terminate: bool) {
        self.revoke_job(job, terminate).await;
    }
}

fn spawn_worker(
    ctx: Arc<JobContext>,
    job: JobRef,
    token: CancellationToken,
    resume: bool,
) -> JoinHandle<Result<(), CoreError>> {
    tokio::spawn(async move {
        match job.kind {
            JobKind::Backtest => run_backtest(&ctx, job.id, &token, resume).await,
            JobKind::LiveBot => LiveBotRunner::new(&ctx, job.id, token).run().await,
        }
    })
}

type Attempt = (Result<Result<(), CoreError>, JoinError>, bool);

/// Wait for one attempt. Backtests get a soft limit (cooperative cancel)
/// and a hard limit (abort); the flag reports whether the soft limit fired.
async fn watch(
    ctx: &JobContext,
    handle: &JobHandle,
    work: &mut JoinHandle<Result<(), CoreError>>,
) -> Attempt {
    let job = handle.job;
    if job.kind == JobKind::LiveBot {
        return (work.await, false);
    }

    let mut soft_fired = false;
    let soft = tokio::time::sleep(ctx.config.backtest_soft_timeout);
    let hard = tokio::time::sleep(ctx.config.backtest_hard_timeout);
    tokio::pin!(soft, hard);
    loop {
        tokio::select! {
            result = &mut *work => return (result, soft_fired),
            _ = &mut soft, if !soft_fired => {
                soft_fired = true;
                warn!(job = %job, limit_secs = ctx.config.backtest_soft_timeout.as_secs(), "backtest over soft time limit, cancelling");
                handle.token.cancel();
            }
            _ = &mut hard => {
                work.abort();
                error!(job = %job, limit_secs = ctx.config.backtest_hard_timeout.as_secs(), "backtest over hard time limit, terminated");
                return (
                    Ok(Err(CoreError::ExecutionFailure("hard time limit exceeded".to_string()))),
                    false,
                );
            }
        }
    }
}

/// Drives a job's attempts to an outcome, records failures and frees the
/// slot.
async fn supervise(
    ctx: Arc<JobContext>,
    slots: Slots,
    handle: JobHandle,
    mut work: JoinHandle<Result<(), CoreError>>,
) {
    let job = handle.job;
    if let Some(metrics) = &ctx.metrics {
        metrics.jobs_running.inc();
    }

    let mut delays = RetryPolicy::for_kind(job.kind).delays();
    let mut attempt = 1;
    loop {
        let outcome = watch(&ctx, &handle, &mut work).await;
        match outcome {
            (Ok(Ok(())), _) => debug!(job = %job, attempt, "worker finished"),
            (Ok(Err(e)), _) if e.is_transient() && !handle.token.is_cancelled() => {
                let Some(delay) = delays.next() else {
                    error!(job = %job, attempts = attempt, error = %e, "retries exhausted");
                    let reason = format!("retries exhausted after {} attempts: {}", attempt, e);
                    mark_failed(&ctx, job, &reason).await;
                    break;
                };
                warn!(job = %job, attempt, error = %e, delay_secs = delay.as_secs(), "transient failure, retrying");
                let revoked = tokio::select! {
                    _ = handle.token.cancelled() => true,
                    _ = tokio::time::sleep(delay) => false,
                };
                if revoked {
                    debug!(job = %job, "revoked while waiting to retry");
                    break;
                }

                attempt += 1;
                work = spawn_worker(ctx.clone(), job, handle.token.clone(), true);
                let mut slots = slots.lock().await;
                if let Some(slot) = slots.get_mut(&job) {
                    if slot.handle.generation == handle.generation {
                        slot.work = work.abort_handle();
                    }
                }
                continue;
            }
            (Ok(Err(e)), soft_fired) => {
                warn!(job = %job, error = %e, "worker failed");
                let reason = if soft_fired {
                    "soft time limit exceeded".to_string()
                } else {
                    e.to_string()
                };
                mark_failed(&ctx, job, &reason).await;
            }
            (Err(e), _) => handle_join_error(&ctx, job, e).await,
        }
        break;
    }

    if let Some(metrics) = &ctx.metrics {
        metrics.jobs_running.dec();
    }
    let mut slots = slots.lock().await;
    if slots
        .get(&job)
        .is_some_and(|slot| slot.handle.generation == handle.generation)
    {
        slots.remove(&job);
    }
}

async fn handle_join_error(ctx: &JobContext, job: JobRef, err: JoinError) {
    if err.is_panic() {
        error!(job = %job, "worker panicked");
        mark_failed(ctx, job, "worker panicked").await;
    } else {
        debug!(job = %job, "worker aborted");
    }
}

/// Move a non-terminal job to its failure status. Losing the race to
/// another writer is fine: the record already says how the job ended.
pub async fn mark_failed(ctx: &JobContext, job: JobRef, reason: &str) {
    let target = match job.kind {
        JobKind::Backtest => JobStatus::Failed,
        JobKind::LiveBot => JobStatus::Error,
    };
    let sources = JobStatus::sources_for(job.kind, target);
    let stamp = TransitionStamp::for_status(job.kind, target, Utc::now()).with_reason(reason);

    let mut written = ctx.store.transition(job, &sources, target, stamp.clone()).await;
    if matches!(&written, Err(e) if e.is_transient()) {
        warn!(job = %job, "store unavailable recording failure, reconnecting");
        if ctx.store.reconnect().await.is_ok() {
            written = ctx.store.transition(job, &sources, target, stamp).await;
        }
    }

    match written {
        Ok(record) => {
            if let Some(metrics) = &ctx.metrics {
                metrics
                    .jobs_finished_total
                    .with_label_values(&[job.kind.as_str(), target.as_str()])
                    .inc();
            }
            ctx.notifier
                .notify(JobNotification {
                    user_id: record.user_id(),
                    job,
                    status: target,
                    message: Some(reason.to_string()),
                })
                .await;
        }
        Err(StoreError::Conflict { current }) => {
            debug!(job = %job, status = %current, "job already left a running state");
        }
        Err(e) => error!(job = %job, error = %e, "failed to record job failure"),
    }
}

/// Dispatcher for the API server: pushes jobs onto the Redis queue read by
/// the worker process.
#[derive(Clone)]
pub struct QueueDispatcher {
    backtests: RedisStorage<RunBacktestJob>,
    live_bots: RedisStorage<RunLiveBotJob>,
}

impl QueueDispatcher {
    pub fn new(
        backtests: RedisStorage<RunBacktestJob>,
        live_bots: RedisStorage<RunLiveBotJob>,
    ) -> Self {
        Self {
            backtests,
            live_bots,
        }
    }
}

#[async_trait]
impl JobDispatcher for QueueDispatcher {
    async fn dispatch(&self, job: JobRef) -> Result<(), DispatchError> {
        let pushed = match job.kind {
            JobKind::Backtest => {
                let mut storage = self.backtests.clone();
                storage
                    .push(RunBacktestJob { backtest_id: job.id })
                    .await
                    .map(|_| ())
            }
            JobKind::LiveBot => {
                let mut storage = self.live_bots.clone();
                storage.push(RunLiveBotJob { bot_id: job.id }).await.map(|_| ())
            }
        };
        pushed.map_err(|e| DispatchError::Queue(e.to_string()))?;
        debug!(job = %job, "job enqueued");
        Ok(())
    }

    async fn revoke(&self, job: JobRef, _terminate: bool) {
        // workers in another process see the status change on their next check
        debug!(job = %job, "revocation delivered through the job record");
    }
}
