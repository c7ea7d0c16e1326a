// Core module - shared types, configuration, logging

pub mod config;
pub mod logger;
pub mod types;

pub use config::{ConfigError, MonitorConfig};
pub use types::*;
