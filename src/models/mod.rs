//! Shared data models spanning the engine layers.

pub mod credential;
pub mod indicators;
pub mod job;
pub mod plan;
pub mod strategy;
pub mod trade_log;
pub mod user;

pub use credential::{ApiCredential, NewCredential};
pub use indicators::Candle;
pub use job::{
    Backtest, BacktestParameters, BacktestRequest, BacktestResult, EquityPoint, JobFilter,
    JobKind, JobRecord, JobRef, JobSort, JobStatus, LiveBot, LiveBotRequest, NewBacktest,
    NewLiveBot, TransitionStamp,
};
pub use plan::{Plan, PlanFeatures, PlanLimits, Subscription, SubscriptionStatus};
pub use strategy::{
    ComparisonOperator, Condition, IndicatorRef, LogicOperator, NewStrategy, SignalBlock,
    Strategy, StrategyRules, StrategyUpdate,
};
pub use trade_log::{NewTradeLog, TradeLog, TradeSide};
pub use user::{Role, User};
