//! Job execution and the request-path job store

pub mod backtest;
pub mod context;
pub mod handlers;
pub mod live_bot;
pub mod store;
pub mod types;

pub use backtest::{BacktestSimulator, BarSignal, LongOnlySimulator, SimulationOutcome};
pub use context::JobContext;
pub use live_bot::LiveBotRunner;
pub use store::JobStore;
pub use types::{RunBacktestJob, RunLiveBotJob};
