// Domain types shared across pipeline stages
// Prices and quantities are exact decimals end to end; f64 only appears at
// the statistics boundary in the anomaly detector.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Exact price, venue scale preserved.
pub type Px = Decimal;
/// Exact quantity in base currency. Zero is the removal sentinel.
pub type Qty = Decimal;

/// A single [price, quantity] level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Px,
    pub qty: Qty,
}

impl PriceLevel {
    pub fn new(price: Px, qty: Qty) -> Self {
        Self { price, qty }
    }

    pub fn notional(&self) -> Decimal {
        self.price * self.qty
    }
}

/// Incremental depth update with venue sequence cursors.
/// Quantities are absolute per-price values, not deltas.
#[derive(Debug, Clone, Serialize)]
pub struct DepthDelta {
    pub symbol: String,
    pub first_id: u64,
    pub last_id: u64,
    pub event_time_ms: i64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

impl fmt::Display for DepthDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DepthDelta({} {}..{} bids={} asks={})",
            self.symbol,
            self.first_id,
            self.last_id,
            self.bids.len(),
            self.asks.len()
        )
    }
}

/// Full book snapshot tagged with the sequence cursor it was captured at.
#[derive(Debug, Clone)]
pub struct DepthSnapshot {
    pub symbol: Option<String>,
    pub last_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

/// Event emitted by a frame source.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Raw venue frame (JSON text).
    Frame(String),
    /// Transport reconnected; the local book must resynchronize.
    Reset,
    /// Source closed permanently.
    Closed,
}

/// Book lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookState {
    Uninitialized,
    Syncing,
    Live,
    Stale,
}

impl fmt::Display for BookState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Order side for slippage walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

/// Immutable read-only projection of the book for downstream consumers.
/// Bids are ordered best (highest) first, asks best (lowest) first.
#[derive(Debug, Clone)]
pub struct BookView {
    pub symbol: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub last_update_id: u64,
    pub captured_at: DateTime<Utc>,
}

impl BookView {
    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first()
    }

    /// Mid-price, or None if either side is empty.
    pub fn mid_price(&self) -> Option<Px> {
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        Some((bid.price + ask.price) / Decimal::TWO)
    }
}

/// Depth available within one basis-point band of mid, both sides.
#[derive(Debug, Clone, Serialize)]
pub struct DepthBand {
    pub bps: u32,
    pub bid_qty: Qty,
    pub ask_qty: Qty,
    pub bid_usd: Decimal,
    pub ask_usd: Decimal,
}

impl DepthBand {
    pub fn total_qty(&self) -> Qty {
        self.bid_qty + self.ask_qty
    }

    pub fn total_usd(&self) -> Decimal {
        self.bid_usd + self.ask_usd
    }
}

/// Result of walking one side of the book for a given order size.
#[derive(Debug, Clone, Serialize)]
pub struct SlippageEstimate {
    pub size_usd: u64,
    pub side: Side,
    pub avg_fill_price: Px,
    pub filled_qty: Qty,
    pub total_cost: Decimal,
    pub levels_consumed: usize,
    pub slippage_bps: Decimal,
    pub slippage_usd: Decimal,
    /// False when the side was exhausted before the target quantity.
    pub filled: bool,
}

/// One tick of liquidity metrics derived from a book view.
#[derive(Debug, Clone)]
pub struct MetricsSample {
    pub snapshot_id: Uuid,
    pub symbol: String,
    pub exchange: String,
    pub timestamp: DateTime<Utc>,
    pub last_update_id: u64,
    pub mid_price: Px,
    pub spread_abs: Decimal,
    pub spread_bps: Decimal,
    pub bid_levels: usize,
    pub ask_levels: usize,
    pub best_bid_qty: Qty,
    pub best_ask_qty: Qty,
    pub depth: Vec<DepthBand>,
    pub imbalance: Decimal,
    pub slippage: Vec<SlippageEstimate>,
}

impl MetricsSample {
    pub fn depth_band(&self, bps: u32) -> Option<&DepthBand> {
        self.depth.iter().find(|b| b.bps == bps)
    }

    pub fn slippage_for(&self, size_usd: u64, side: Side) -> Option<&SlippageEstimate> {
        self.slippage
            .iter()
            .find(|s| s.size_usd == size_usd && s.side == side)
    }
}

impl fmt::Display for MetricsSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MetricsSample({} mid={} spread={}bps imb={})",
            self.symbol, self.mid_price, self.spread_bps, self.imbalance
        )
    }
}

/// Event severity, ordered so that comparisons express escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Warning,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Z-scores for the monitored metric set at one tick.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MetricZScores {
    pub depth_10bps_usd: f64,
    pub spread_bps: f64,
    pub imbalance: f64,
}

impl MetricZScores {
    pub fn max_abs(&self) -> f64 {
        self.depth_10bps_usd
            .abs()
            .max(self.spread_bps.abs())
            .max(self.imbalance.abs())
    }
}

/// Market state captured alongside an anomaly for post-incident analysis.
#[derive(Debug, Clone, Serialize)]
pub struct MarketState {
    pub mid_price: Px,
    pub spread_bps: Decimal,
    pub depth_10bps_usd: Decimal,
    pub imbalance: Decimal,
}

/// Statistically flagged liquidity anomaly.
#[derive(Debug, Clone)]
pub struct AnomalyEvent {
    pub event_id: Uuid,
    pub symbol: String,
    pub exchange: String,
    pub detected_at: DateTime<Utc>,
    pub severity: Severity,
    pub reason: String,
    pub zscores: MetricZScores,
    pub max_zscore: f64,
    pub market: MarketState,
}

impl fmt::Display for AnomalyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AnomalyEvent({} {} |z|={:.2} reason={})",
            self.symbol, self.severity, self.max_zscore, self.reason
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_mid_price() {
        let view = BookView {
            symbol: "BTCUSDT".to_string(),
            bids: vec![PriceLevel::new(dec!(50000), dec!(1))],
            asks: vec![PriceLevel::new(dec!(50010), dec!(2))],
            last_update_id: 1,
            captured_at: Utc::now(),
        };
        assert_eq!(view.mid_price(), Some(dec!(50005)));
    }

    #[test]
    fn test_mid_price_empty_side() {
        let view = BookView {
            symbol: "BTCUSDT".to_string(),
            bids: vec![],
            asks: vec![PriceLevel::new(dec!(50010), dec!(2))],
            last_update_id: 1,
            captured_at: Utc::now(),
        };
        assert!(view.mid_price().is_none());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Warning);
        assert_eq!(Severity::Critical.as_str(), "critical");
    }

    #[test]
    fn test_max_abs_zscore() {
        let z = MetricZScores {
            depth_10bps_usd: -4.5,
            spread_bps: 2.0,
            imbalance: 1.0,
        };
        assert!((z.max_abs() - 4.5).abs() < f64::EPSILON);
    }
}
