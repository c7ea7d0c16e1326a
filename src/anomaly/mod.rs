// Anomaly detection - rolling statistical baselines over metric streams

pub mod detector;
pub mod window;

pub use detector::{AnomalyDetector, DetectorStats};
pub use window::RollingWindow;
