//! Core application primitives (scheduler, retries, runtime, HTTP surface)

pub mod http;
pub mod retry;
pub mod runtime;
pub mod scheduler;

pub use http::*;
pub use retry::*;
pub use runtime::*;
pub use scheduler::*;
