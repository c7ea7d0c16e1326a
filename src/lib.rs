// liquidity-monitor - Real-time liquidity risk detection for crypto futures
// Order book reconstruction -> risk metrics -> anomaly detection -> PostgreSQL

pub mod anomaly;
pub mod book;
pub mod core;
pub mod metrics;
pub mod parser;
pub mod pipeline;
pub mod sink;
pub mod transport;

pub use crate::core::config::MonitorConfig;
pub use crate::core::types::{AnomalyEvent, BookView, MetricsSample, Severity};
