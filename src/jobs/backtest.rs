//! Backtest worker: per-bar rule evaluation over historical candles, then a
//! pluggable simulation turning signals into trades and a summary.

use crate::error::{CoreError, EvaluationError, StoreError};
use crate::jobs::context::JobContext;
use crate::models::indicators::Candle;
use crate::models::job::{
    BacktestParameters, BacktestResult, EquityPoint, JobKind, JobRef, JobStatus, TransitionStamp,
};
use crate::models::trade_log::{NewTradeLog, TradeSide};
use crate::services::market_data::snapshot;
use crate::services::notifications::JobNotification;
use crate::strategies::{evaluate_rules, SignalDecision};
use chrono::Utc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bars between checks that the record is still `running`
const STATUS_CHECK_INTERVAL: usize = 250;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BarSignal {
    pub candle: Candle,
    pub decision: SignalDecision,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationOutcome {
    pub trades: Vec<NewTradeLog>,
    pub total_return_pct: f64,
    pub max_drawdown_pct: f64,
    pub win_rate_pct: Option<f64>,
    pub final_balance: f64,
    pub equity_curve: Vec<EquityPoint>,
}

/// Turns a signal series into trades and performance figures
pub trait BacktestSimulator: Send + Sync {
    fn simulate(&self, params: &BacktestParameters, bars: &[BarSignal]) -> SimulationOutcome;
}

/// All-in long positions: enter on a buy-only bar, exit on a sell bar.
/// Fills at the bar close; an open position is marked to market at the end.
#[derive(Debug, Clone, Copy, Default)]
pub struct LongOnlySimulator;

impl BacktestSimulator for LongOnlySimulator {
    fn simulate(&self, params: &BacktestParameters, bars: &[BarSignal]) -> SimulationOutcome {
        let fee = params.commission_pct.max(0.0) / 100.0;
        let initial = params.initial_capital;

        let mut cash = initial;
        let mut quantity = 0.0;
        let mut entry_cost = 0.0;
        let mut trades = Vec::new();
        let mut equity_curve = Vec::with_capacity(bars.len());
        let mut peak = initial;
        let mut max_drawdown: f64 = 0.0;
        let mut round_trips = 0u32;
        let mut wins = 0u32;

        for bar in bars {
            let price = bar.candle.close;
            let time = bar.candle.timestamp;

            if quantity == 0.0 && bar.decision.buy && !bar.decision.sell && cash > 0.0 && price > 0.0
            {
                quantity = cash / (price * (1.0 + fee));
                let commission = price * quantity * fee;
                entry_cost = price * quantity + commission;
                cash -= entry_cost;
                trades.push(NewTradeLog {
                    timestamp: time,
                    side: TradeSide::Buy,
                    price,
                    quantity,
                    commission,
                    pnl: None,
                    balance: cash,
                });
            } else if quantity > 0.0 && bar.decision.sell {
                let proceeds = price * quantity;
                let commission = proceeds * fee;
                let pnl = proceeds - commission - entry_cost;
                cash += proceeds - commission;
                round_trips += 1;
                if pnl > 0.0 {
                    wins += 1;
                }
                trades.push(NewTradeLog {
                    timestamp: time,
                    side: TradeSide::Sell,
                    price,
                    quantity,
                    commission,
                    pnl: Some(pnl),
                    balance: cash,
                });
                quantity = 0.0;
                entry_cost = 0.0;
            }

            let equity = cash + quantity * price;
            peak = peak.max(equity);
            if peak > 0.0 {
                max_drawdown = max_drawdown.max((peak - equity) / peak * 100.0);
            }
            equity_curve.push(EquityPoint { time, value: equity });
        }

        let final_balance = equity_curve.last().map_or(initial, |p| p.value);
        let total_return_pct = if initial > 0.0 {
            (final_balance - initial) / initial * 100.0
        } else {
            0.0
        };

        SimulationOutcome {
            trades,
            total_return_pct,
            max_drawdown_pct: max_drawdown,
            win_rate_pct: (round_trips > 0).then(|| wins as f64 / round_trips as f64 * 100.0),
            final_balance,
            equity_curve,
        }
    }
}

/// Claim a pending backtest, run it and record the outcome.
///
/// Returns `Ok(())` without side effects when the job is missing, already
/// claimed or terminal. `resume` marks a retry of this job's own earlier
/// attempt, which may have left it `running`. Errors are recorded on the job
/// by the scheduler, which also retries transient ones.
pub async fn run_backtest(
    ctx: &JobContext,
    backtest_id: i64,
    cancel: &CancellationToken,
    resume: bool,
) -> Result<(), CoreError> {
    let job = JobRef::backtest(backtest_id);
    let started = Instant::now();
    let claimable: &[JobStatus] = if resume {
        &[JobStatus::Pending, JobStatus::Running]
    } else {
        &[JobStatus::Pending]
    };

    let backtest = match ctx.store.get_backtest(backtest_id).await? {
        Some(backtest) => backtest,
        None => {
            warn!(job = %job, "backtest record not found, nothing to run");
            return Ok(());
        }
    };
    if !claimable.contains(&backtest.status) {
        debug!(job = %job, status = %backtest.status, "backtest not pending, skipping");
        return Ok(());
    }

    let claimed = ctx
        .store
        .transition(
            job,
            claimable,
            JobStatus::Running,
            TransitionStamp::for_status(JobKind::Backtest, JobStatus::Running, Utc::now()),
        )
        .await;
    match claimed {
        Ok(_) => {}
        Err(StoreError::Conflict { current }) => {
            debug!(job = %job, status = %current, "backtest claimed elsewhere or canceled");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }

    let strategy = ctx.store.get_strategy(backtest.strategy_id).await?.ok_or_else(|| {
        CoreError::ExecutionFailure(format!("strategy {} no longer exists", backtest.strategy_id))
    })?;
    let params = &backtest.parameters;

    info!(
        job = %job,
        strategy_id = strategy.id,
        ticker = %params.ticker,
        timeframe = %params.timeframe,
        resume,
        "backtest started"
    );

    let candles = ctx
        .market_data
        .candles(&params.ticker, &params.timeframe, params.start_date, params.end_date)
        .await?;

    let mut bars = Vec::with_capacity(candles.len());
    for (i, candle) in candles.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(CoreError::ExecutionFailure("backtest canceled".to_string()));
        }
        if i > 0 && i % STATUS_CHECK_INTERVAL == 0 {
            if !still_running(ctx, backtest_id).await? {
                info!(job = %job, "backtest no longer running, stopping");
                return Ok(());
            }
            tokio::task::yield_now().await;
        }

        let context = snapshot(
            ctx.market_data.as_ref(),
            &params.ticker,
            &strategy.rules,
            candle.timestamp,
        )
        .await?;

        match evaluate_rules(&strategy.rules, &context) {
            Ok(decision) => bars.push(BarSignal {
                candle: *candle,
                decision,
            }),
            // warm-up: indicators without enough history yet
            Err(EvaluationError::IndicatorUnavailable { .. }) if bars.is_empty() => continue,
            Err(e) => return Err(e.into()),
        }
    }

    if bars.is_empty() {
        return Err(CoreError::ExecutionFailure(format!(
            "insufficient history: none of {} bars had every indicator available",
            candles.len()
        )));
    }

    let outcome = ctx.simulator.simulate(params, &bars);
    if !still_running(ctx, backtest_id).await? {
        info!(job = %job, "backtest no longer running, discarding results");
        return Ok(());
    }

    // a retry after partial writes would duplicate trades
    let recorded =
        |e: StoreError| CoreError::ExecutionFailure(format!("failed to record results: {}", e));
    let trade_count = outcome.trades.len() as u32;
    for trade in outcome.trades {
        ctx.store.append_trade(job, trade).await.map_err(recorded)?;
    }
    ctx.store
        .save_result(&BacktestResult {
            backtest_id,
            total_return_pct: outcome.total_return_pct,
            max_drawdown_pct: outcome.max_drawdown_pct,
            win_rate_pct: outcome.win_rate_pct,
            trade_count,
            final_balance: outcome.final_balance,
            equity_curve: outcome.equity_curve,
            executed_at: Utc::now(),
        })
        .await
        .map_err(recorded)?;

    match ctx
        .store
        .transition(
            job,
            &[JobStatus::Running],
            JobStatus::Completed,
            TransitionStamp::for_status(JobKind::Backtest, JobStatus::Completed, Utc::now()),
        )
        .await
    {
        Ok(_) => {}
        Err(StoreError::Conflict { current }) => {
            info!(job = %job, status = %current, "backtest finished after leaving running");
            return Ok(());
        }
        Err(e) => return Err(recorded(e)),
    }

    if let Some(metrics) = &ctx.metrics {
        metrics
            .jobs_finished_total
            .with_label_values(&[JobKind::Backtest.as_str(), JobStatus::Completed.as_str()])
            .inc();
        metrics
            .backtest_duration_seconds
            .observe(started.elapsed().as_secs_f64());
    }
    info!(
        job = %job,
        bars = bars.len(),
        trades = trade_count,
        total_return_pct = outcome.total_return_pct,
        "backtest completed"
    );
    ctx.notifier
        .notify(JobNotification {
            user_id: backtest.user_id,
            job,
            status: JobStatus::Completed,
            message: None,
        })
        .await;
    Ok(())
}

async fn still_running(ctx: &JobContext, backtest_id: i64) -> Result<bool, CoreError> {
    Ok(ctx
        .store
        .get_backtest(backtest_id)
        .await?
        .is_some_and(|b| b.status == JobStatus::Running))
}
