// Configuration for the liquidity monitor
// Immutable after startup; loaded from JSON with per-section defaults

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("required environment variable {0} is not set")]
    MissingEnv(&'static str),
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Exchange identifier persisted with every row.
    pub name: String,
    pub ws_url: String,
    pub rest_url: String,

    // Reconnection: exponential backoff, reset on successful frame
    pub reconnect_delay_secs: u64,
    pub max_reconnect_delay_secs: u64,
    pub ping_interval_secs: u64,

    // Snapshot fetch
    pub snapshot_limit: u32,
    pub snapshot_timeout_secs: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            name: "binance_futures".to_string(),
            ws_url: "wss://fstream.binance.com/ws".to_string(),
            rest_url: "https://fapi.binance.com".to_string(),
            reconnect_delay_secs: 2,
            max_reconnect_delay_secs: 60,
            ping_interval_secs: 30,
            snapshot_limit: 1000,
            snapshot_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BookConfig {
    /// Top-K levels per side published in each view.
    pub view_depth: usize,
    /// Deltas buffered while waiting for a snapshot.
    pub buffer_capacity: usize,
    /// Failed resyncs tolerated inside the resync window before Stale.
    pub max_resync_attempts: u32,
    pub resync_window_secs: u64,
}

impl Default for BookConfig {
    fn default() -> Self {
        Self {
            view_depth: 50,
            buffer_capacity: 1024,
            max_resync_attempts: 3,
            resync_window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Minimum interval between published samples per symbol.
    pub period_ms: u64,
    pub depth_bands_bps: Vec<u32>,
    /// Levels per side in the imbalance calculation.
    pub imbalance_levels: usize,
    /// Order sizes (USD notional) to estimate slippage for.
    pub slippage_sizes_usd: Vec<u64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            period_ms: 1000,
            depth_bands_bps: vec![10, 50, 100],
            imbalance_levels: 5,
            slippage_sizes_usd: vec![100_000, 500_000, 1_000_000],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Rolling window length per (symbol, metric).
    pub window: usize,
    /// Samples required before z-scores are meaningful.
    pub min_samples: usize,
    /// |z| above this flags a metric.
    pub zscore_threshold: f64,
    /// Suppress repeat events inside this interval unless severity escalates.
    pub cooldown_ms: i64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window: 300,
            min_samples: 30,
            zscore_threshold: 3.0,
            cooldown_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub min_connections: u32,
    pub max_connections: u32,
    /// Persist every Nth metrics sample as a snapshot row.
    pub snapshot_every: u64,
    /// Snapshot rows buffered before a batched flush.
    pub batch_size: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "localhost".to_string(),
            port: 5432,
            database: "liquidity_monitor".to_string(),
            user: "risk_analyst".to_string(),
            min_connections: 5,
            max_connections: 20,
            snapshot_every: 60,
            batch_size: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ============================================================================
// Top-level config
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub symbols: Vec<String>,
    pub exchange: ExchangeConfig,
    pub book: BookConfig,
    pub metrics: MetricsConfig,
    pub detector: DetectorConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

impl MonitorConfig {
    /// Load from a JSON file; missing sections fall back to defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;

        info!(
            path = %path.as_ref().display(),
            symbols = ?config.symbols,
            exchange = %config.exchange.name,
            "Configuration loaded"
        );

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.metrics.period_ms == 0 {
            return Err(ConfigError::Validation(
                "metrics.period_ms must be positive".to_string(),
            ));
        }
        if self.metrics.depth_bands_bps.is_empty() {
            return Err(ConfigError::Validation(
                "metrics.depth_bands_bps must not be empty".to_string(),
            ));
        }
        if self.detector.min_samples < 2 {
            return Err(ConfigError::Validation(
                "detector.min_samples must be at least 2".to_string(),
            ));
        }
        if self.detector.window < self.detector.min_samples {
            return Err(ConfigError::Validation(
                "detector.window must be >= detector.min_samples".to_string(),
            ));
        }
        if self.book.view_depth == 0 {
            return Err(ConfigError::Validation(
                "book.view_depth must be positive".to_string(),
            ));
        }
        if self.book.max_resync_attempts == 0 {
            return Err(ConfigError::Validation(
                "book.max_resync_attempts must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Database password comes from the environment only. Fail fast when the
    /// sink is enabled and the variable is absent.
    pub fn db_password(&self) -> Result<String, ConfigError> {
        std::env::var("DB_PASSWORD").map_err(|_| ConfigError::MissingEnv("DB_PASSWORD"))
    }
}
