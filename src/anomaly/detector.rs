// Anomaly detector - z-score analysis over rolling metric baselines
// One window per (exchange, symbol, metric); windows survive reconnects.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::anomaly::window::RollingWindow;
use crate::core::config::DetectorConfig;
use crate::core::types::{
    AnomalyEvent, MarketState, MetricZScores, MetricsSample, Severity,
};

/// Detector counters.
#[derive(Debug, Clone, Default)]
pub struct DetectorStats {
    pub samples_observed: u64,
    pub events_emitted: u64,
    pub suppressed_cooldown: u64,
    pub dropped_non_finite: u64,
}

struct SymbolState {
    depth: RollingWindow,
    spread: RollingWindow,
    imbalance: RollingWindow,
    /// Timestamp and severity of the last emitted event, for cooldown.
    last_event: Option<(DateTime<Utc>, Severity)>,
}

impl SymbolState {
    fn new(window: usize) -> Self {
        Self {
            depth: RollingWindow::new(window),
            spread: RollingWindow::new(window),
            imbalance: RollingWindow::new(window),
            last_event: None,
        }
    }
}

pub struct AnomalyDetector {
    config: DetectorConfig,
    state: HashMap<(String, String), SymbolState>,
    stats: DetectorStats,
}

impl AnomalyDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            state: HashMap::new(),
            stats: DetectorStats::default(),
        }
    }

    pub fn stats(&self) -> &DetectorStats {
        &self.stats
    }

    /// Mean/std/len of a monitored window, for introspection and tests.
    pub fn window_statistics(
        &self,
        exchange: &str,
        symbol: &str,
    ) -> Option<[(&'static str, f64, f64, usize); 3]> {
        let state = self
            .state
            .get(&(exchange.to_string(), symbol.to_string()))?;
        Some([
            ("depth_10bps_usd", state.depth.mean(), state.depth.std_dev(), state.depth.len()),
            ("spread_bps", state.spread.mean(), state.spread.std_dev(), state.spread.len()),
            ("imbalance", state.imbalance.mean(), state.imbalance.std_dev(), state.imbalance.len()),
        ])
    }

    /// Observe one sample; emit at most one event per tick.
    pub fn observe(&mut self, sample: &MetricsSample) -> Option<AnomalyEvent> {
        self.stats.samples_observed += 1;

        let depth_usd = sample
            .depth_band(10)
            .map(|b| b.total_usd())
            .unwrap_or(Decimal::ZERO);

        let (depth, spread, imbalance) = match (
            finite(depth_usd),
            finite(sample.spread_bps),
            finite(sample.imbalance),
        ) {
            (Some(d), Some(s), Some(i)) => (d, s, i),
            _ => {
                self.stats.dropped_non_finite += 1;
                return None;
            }
        };

        let key = (sample.exchange.clone(), sample.symbol.clone());
        let window = self.config.window;
        let state = self
            .state
            .entry(key)
            .or_insert_with(|| SymbolState::new(window));

        state.depth.push(depth);
        state.spread.push(spread);
        state.imbalance.push(imbalance);

        if state.depth.len() < self.config.min_samples {
            return None;
        }

        let zscores = MetricZScores {
            depth_10bps_usd: zscore(&state.depth, depth),
            spread_bps: zscore(&state.spread, spread),
            imbalance: zscore(&state.imbalance, imbalance),
        };
        let max_z = zscores.max_abs();

        let severity = classify(max_z, self.config.zscore_threshold)?;

        // Cooldown: suppress repeats unless severity strictly escalated
        if let Some((last_at, last_severity)) = state.last_event {
            let elapsed_ms = (sample.timestamp - last_at).num_milliseconds();
            if elapsed_ms < self.config.cooldown_ms && severity <= last_severity {
                self.stats.suppressed_cooldown += 1;
                debug!(
                    symbol = %sample.symbol,
                    elapsed_ms = elapsed_ms,
                    "Anomaly suppressed by cooldown"
                );
                return None;
            }
        }

        let reason = reason_string(&zscores, self.config.zscore_threshold);

        state.last_event = Some((sample.timestamp, severity));
        self.stats.events_emitted += 1;

        warn!(
            symbol = %sample.symbol,
            exchange = %sample.exchange,
            severity = %severity,
            max_zscore = max_z,
            reason = %reason,
            "Liquidity anomaly detected"
        );

        Some(AnomalyEvent {
            event_id: Uuid::new_v4(),
            symbol: sample.symbol.clone(),
            exchange: sample.exchange.clone(),
            detected_at: sample.timestamp,
            severity,
            reason,
            zscores,
            max_zscore: max_z,
            market: MarketState {
                mid_price: sample.mid_price,
                spread_bps: sample.spread_bps,
                depth_10bps_usd: depth_usd,
                imbalance: sample.imbalance,
            },
        })
    }
}

fn finite(value: Decimal) -> Option<f64> {
    value.to_f64().filter(|v| v.is_finite())
}

fn zscore(window: &RollingWindow, value: f64) -> f64 {
    let std = window.std_dev();
    if std == 0.0 {
        return 0.0;
    }
    (value - window.mean()) / std
}

/// Severity by max |z|: >= 5 critical, >= 4 high, >= threshold warning.
fn classify(max_z: f64, threshold: f64) -> Option<Severity> {
    if max_z >= 5.0 {
        Some(Severity::Critical)
    } else if max_z >= 4.0 {
        Some(Severity::High)
    } else if max_z >= threshold {
        Some(Severity::Warning)
    } else {
        None
    }
}

/// Name every metric whose |z| crossed the threshold, worst-first order
/// fixed as depth, spread, imbalance.
fn reason_string(zscores: &MetricZScores, threshold: f64) -> String {
    let mut parts = Vec::new();
    if zscores.depth_10bps_usd.abs() > threshold {
        parts.push(format!(
            "depth_10bps_usd {:.1}σ from baseline",
            zscores.depth_10bps_usd.abs()
        ));
    }
    if zscores.spread_bps.abs() > threshold {
        parts.push(format!(
            "spread_bps {:.1}σ from baseline",
            zscores.spread_bps.abs()
        ));
    }
    if zscores.imbalance.abs() > threshold {
        parts.push(format!(
            "imbalance {:.1}σ from baseline",
            zscores.imbalance.abs()
        ));
    }
    parts.join("; ")
}
