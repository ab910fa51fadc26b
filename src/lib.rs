//! Cortex strategy rule engine and execution scheduler.
//!
//! The crate holds the pieces shared by the `api-server` and `worker`
//! binaries: the signal rule tree, plan limits, the job store with its
//! admission control, and the scheduler that runs backtests and live bots.

pub mod common;
pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod indicators;
pub mod jobs;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod plans;
pub mod services;
pub mod strategies;

pub use error::CoreError;
