pub mod registry;

pub mod momentum;
pub mod trend;
pub mod volatility;

pub use registry::*;
