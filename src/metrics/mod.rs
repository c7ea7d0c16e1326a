// Risk metrics derived from book views - spread, depth bands, imbalance,
// slippage cost estimates. Exact decimal arithmetic throughout.

pub mod engine;
pub mod slippage;

pub use engine::{MetricsEngine, MetricsStats};
