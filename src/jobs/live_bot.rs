//! Long-lived control loop of one live bot.
//!
//! Control (pause, resume, stop) arrives as status changes on the stored
//! record, observed on reload at the top of every iteration, so the accepted
//! control latency is one poll interval. A local revoke through the
//! cancellation token interrupts the sleep and exits without a status write.
//!
//! A bot runs under a store lease renewed every iteration. A worker that
//! cannot take the lease within one lease lifetime, or loses it, exits, so
//! one bot never has two loops.

use crate::error::{CoreError, CredentialError, MarketDataError, StoreError};
use crate::jobs::context::JobContext;
use crate::models::job::{JobKind, JobRef, JobStatus, LiveBot, TransitionStamp};
use crate::models::strategy::IndicatorRef;
use crate::models::trade_log::{NewTradeLog, TradeLog, TradeSide};
use crate::services::exchange::OrderRequest;
use crate::services::market_data::snapshot;
use crate::strategies::evaluate_rules;
use chrono::Utc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What one reload of the record decided
enum Reload {
    Bot(LiveBot),
    /// Record gone: the bot is orphaned
    Missing,
    /// Store still unreachable after a reconnect
    Unavailable,
}

pub struct LiveBotRunner<'a> {
    ctx: &'a JobContext,
    bot_id: i64,
    cancel: CancellationToken,
}

impl<'a> LiveBotRunner<'a> {
    pub fn new(ctx: &'a JobContext, bot_id: i64, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            bot_id,
            cancel,
        }
    }

    fn job(&self) -> JobRef {
        JobRef::live_bot(self.bot_id)
    }

    /// Runs until the bot is stopped, errors out or is revoked locally.
    /// An `Err` is recorded on the bot as `error` by the scheduler; a
    /// transient one before the loop starts is retried by it instead.
    pub async fn run(&self) -> Result<(), CoreError> {
        let job = self.job();
        let bot = match self.ctx.store.get_live_bot(self.bot_id).await? {
            Some(bot) => bot,
            None => {
                warn!(job = %job, "live bot record not found, not starting");
                return Ok(());
            }
        };
        if bot.status.is_terminal() {
            debug!(job = %job, status = %bot.status, "live bot already finished");
            return Ok(());
        }
        if !self.await_claim().await? {
            info!(job = %job, "live bot held by another worker, not starting");
            return Ok(());
        }

        let outcome = self.control_loop(&bot).await;
        if let Err(e) = self
            .ctx
            .store
            .release_live_bot(self.bot_id, &self.ctx.worker_id)
            .await
        {
            debug!(job = %job, error = %e, "lease not released, it will expire");
        }
        outcome
    }

    async fn control_loop(&self, bot: &LiveBot) -> Result<(), CoreError> {
        let job = self.job();
        if bot.status == JobStatus::Initializing {
            self.activate().await?;
        }
        info!(job = %job, ticker = %bot.ticker, timeframe = %bot.timeframe, "live bot started");

        loop {
            let bot = match self.reload().await? {
                Reload::Bot(bot) => bot,
                Reload::Missing => {
                    error!(job = %job, "live bot record disappeared, exiting orphaned loop");
                    return Ok(());
                }
                Reload::Unavailable => {
                    if !self.sleep(self.ctx.config.live_poll_interval).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            if bot.status.is_terminal() {
                info!(job = %job, status = %bot.status, "live bot finished");
                return Ok(());
            }
            match self.claim().await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(job = %job, "run lease taken over by another worker, exiting");
                    return Ok(());
                }
                Err(e) => self.recover(e).await?,
            }

            let pause = match bot.status {
                JobStatus::Paused => {
                    debug!(job = %job, "live bot paused, skipping cycle");
                    self.ctx.config.paused_poll_interval
                }
                JobStatus::Active => {
                    match self.run_cycle(&bot).await {
                        Ok(()) => {
                            if let Err(e) = self.ctx.store.touch_last_run(bot.id, Utc::now()).await {
                                self.recover(e).await?;
                            }
                        }
                        Err(CoreError::Store(e)) => self.recover(e).await?,
                        Err(e) => return Err(e),
                    }
                    self.ctx.config.live_poll_interval
                }
                JobStatus::Initializing => {
                    self.activate().await?;
                    continue;
                }
                status => {
                    return Err(CoreError::ExecutionFailure(format!(
                        "unexpected live bot status '{}'",
                        status
                    )));
                }
            };

            if !self.sleep(pause).await {
                info!(job = %job, "live bot revoked");
                return Ok(());
            }
        }
    }

    /// Take the run lease, waiting out at most one lease lifetime for a
    /// holder that may have died. `false` if it stays held or on revoke.
    async fn await_claim(&self) -> Result<bool, CoreError> {
        let poll = self.ctx.config.live_poll_interval;
        let deadline = tokio::time::Instant::now() + self.ctx.config.effective_lease_ttl() + poll;
        loop {
            if self.claim().await? {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            debug!(job = %self.job(), "run lease held elsewhere, waiting");
            if !self.sleep(poll).await {
                return Ok(false);
            }
        }
    }

    /// Take or renew this worker's run lease
    async fn claim(&self) -> Result<bool, StoreError> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.ctx.config.effective_lease_ttl())
            .unwrap_or_else(|_| chrono::Duration::minutes(3));
        self.ctx
            .store
            .claim_live_bot(self.bot_id, &self.ctx.worker_id, now, now + ttl)
            .await
    }

    /// Store errors inside the loop: a transient one triggers a reconnect
    /// and the loop carries on, a vanished record is left to the next
    /// reload, anything else ends the bot.
    async fn recover(&self, err: StoreError) -> Result<(), CoreError> {
        let job = self.job();
        match err {
            e if e.is_transient() => {
                warn!(job = %job, error = %e, "store unavailable, reconnecting");
                if let Err(e) = self.ctx.store.reconnect().await {
                    warn!(job = %job, error = %e, "reconnect failed");
                }
                Ok(())
            }
            StoreError::NotFound { .. } => {
                debug!(job = %job, "live bot record gone, next reload decides");
                Ok(())
            }
            e => Err(e.into()),
        }
    }

    async fn activate(&self) -> Result<(), CoreError> {
        let stamp = TransitionStamp::for_status(JobKind::LiveBot, JobStatus::Active, Utc::now());
        match self
            .ctx
            .store
            .transition(self.job(), &[JobStatus::Initializing], JobStatus::Active, stamp)
            .await
        {
            Ok(_) => Ok(()),
            // someone else moved it; the next reload decides
            Err(StoreError::Conflict { .. }) => Ok(()),
            Err(e) => self.recover(e).await,
        }
    }

    async fn reload(&self) -> Result<Reload, CoreError> {
        let job = self.job();
        match self.ctx.store.get_live_bot(self.bot_id).await {
            Ok(Some(bot)) => return Ok(Reload::Bot(bot)),
            Ok(None) => return Ok(Reload::Missing),
            Err(e) if e.is_transient() => {
                warn!(job = %job, error = %e, "store unavailable, reconnecting");
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = self.ctx.store.reconnect().await {
            warn!(job = %job, error = %e, "reconnect failed");
            return Ok(Reload::Unavailable);
        }
        match self.ctx.store.get_live_bot(self.bot_id).await {
            Ok(Some(bot)) => Ok(Reload::Bot(bot)),
            Ok(None) => Ok(Reload::Missing),
            Err(e) if e.is_transient() => {
                warn!(job = %job, error = %e, "store still unavailable after reconnect");
                Ok(Reload::Unavailable)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// `false` when interrupted by the cancellation token
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// One evaluation cycle: snapshot, evaluate, act on a signal
    async fn run_cycle(&self, bot: &LiveBot) -> Result<(), CoreError> {
        let job = self.job();
        let now = Utc::now();
        if let Some(metrics) = &self.ctx.metrics {
            metrics.live_bot_cycles_total.inc();
        }

        let strategy = self
            .ctx
            .store
            .get_strategy(bot.strategy_id)
            .await?
            .ok_or_else(|| {
                CoreError::ExecutionFailure(format!("strategy {} no longer exists", bot.strategy_id))
            })?;

        let context = match snapshot(self.ctx.market_data.as_ref(), &bot.ticker, &strategy.rules, now)
            .await
        {
            Ok(context) => context,
            Err(MarketDataError::Unreachable(reason)) => {
                warn!(job = %job, reason = %reason, "market data unreachable, skipping cycle");
                return Ok(());
            }
            Err(e) => return Err(CoreError::ExecutionFailure(e.to_string())),
        };
        let decision = evaluate_rules(&strategy.rules, &context)?;

        let trades = self.ctx.store.trade_logs(job).await?;
        let holding = trades.last().is_some_and(|t| t.side == TradeSide::Buy);
        let side = match (decision.buy, decision.sell, holding) {
            (true, false, false) => TradeSide::Buy,
            (_, true, true) => TradeSide::Sell,
            _ => {
                debug!(job = %job, buy = decision.buy, sell = decision.sell, holding, "no action");
                return Ok(());
            }
        };

        let price = match self
            .ctx
            .market_data
            .indicator_value(&bot.ticker, &IndicatorRef::new("CLOSE", &bot.timeframe), now)
            .await
        {
            Ok(sample) => sample.current,
            Err(e) => {
                warn!(job = %job, error = %e, "no reference price, skipping order");
                return Ok(());
            }
        };

        let quantity = match (side, trades.last()) {
            (TradeSide::Sell, Some(entry)) => entry.quantity,
            _ => bot.order_quantity,
        };
        let order = OrderRequest {
            client_order_id: format!("bot{}-{}", bot.id, now.timestamp_millis()),
            ticker: bot.ticker.clone(),
            side,
            quantity,
            reference_price: price,
        };

        let fill = {
            let credentials = self
                .ctx
                .credentials
                .decrypt(bot.credential_id)
                .await
                .map_err(|e| match e {
                    CredentialError::Store(e) => CoreError::from(e),
                    _ => CoreError::CredentialInvalid(bot.credential_id),
                })?;
            self.ctx.orders.place_order(&credentials, &order).await
        };
        let fill = match fill {
            Ok(fill) => fill,
            Err(e) => {
                warn!(job = %job, side = side.as_str(), error = %e, "order failed");
                if let Some(metrics) = &self.ctx.metrics {
                    metrics.live_bot_order_failures_total.inc();
                }
                return Ok(());
            }
        };

        let entry = trade_entry(bot, &trades, side, fill.price, fill.quantity, fill.commission, fill.filled_at);
        match self.ctx.store.append_trade(job, entry).await {
            Ok(trade) => {
                info!(
                    job = %job,
                    side = trade.side.as_str(),
                    price = trade.price,
                    quantity = trade.quantity,
                    "order filled"
                );
                Ok(())
            }
            Err(e @ StoreError::OutOfOrder { .. }) => {
                warn!(job = %job, error = %e, "fill older than the last trade, not logged");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn trade_entry(
    bot: &LiveBot,
    history: &[TradeLog],
    side: TradeSide,
    price: f64,
    quantity: f64,
    commission: f64,
    timestamp: chrono::DateTime<Utc>,
) -> NewTradeLog {
    let balance_before = history.last().map_or(bot.initial_capital, |t| t.balance);
    let notional = price * quantity;
    let (balance, pnl) = match side {
        TradeSide::Buy => (balance_before - notional - commission, None),
        TradeSide::Sell => {
            let entry_cost = history
                .last()
                .map_or(0.0, |t| t.price * t.quantity + t.commission);
            (
                balance_before + notional - commission,
                Some(notional - commission - entry_cost),
            )
        }
    };
    NewTradeLog {
        timestamp,
        side,
        price,
        quantity,
        commission,
        pnl,
        balance,
    }
}
