// Metrics engine - transforms a book view into a liquidity sample
// All arithmetic on exact decimals; conversion to f64 happens only in the
// anomaly detector.

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::debug;
use uuid::Uuid;

use crate::core::config::MetricsConfig;
use crate::core::types::{BookView, DepthBand, MetricsSample, Side};
use crate::metrics::slippage;

const BPS_SCALE: Decimal = Decimal::from_parts(10_000, 0, 0, false, 0);

/// Per-engine counters.
#[derive(Debug, Clone, Default)]
pub struct MetricsStats {
    pub samples_emitted: u64,
    pub skipped_degenerate: u64,
    pub views_coalesced: u64,
}

pub struct MetricsEngine {
    exchange: String,
    config: MetricsConfig,
    stats: MetricsStats,
}

impl MetricsEngine {
    pub fn new(exchange: &str, config: MetricsConfig) -> Self {
        Self {
            exchange: exchange.to_string(),
            config,
            stats: MetricsStats::default(),
        }
    }

    pub fn stats(&self) -> &MetricsStats {
        &self.stats
    }

    pub fn note_coalesced(&mut self, discarded: u64) {
        self.stats.views_coalesced += discarded;
    }

    /// Compute a sample from one view. Returns None (and counts it) when the
    /// book is degenerate: either side empty or a non-positive mid.
    pub fn compute(&mut self, view: &BookView) -> Option<MetricsSample> {
        let (best_bid, best_ask) = match (view.best_bid(), view.best_ask()) {
            (Some(b), Some(a)) => (*b, *a),
            _ => {
                self.stats.skipped_degenerate += 1;
                debug!(symbol = %view.symbol, "Skipping sample: one-sided book");
                return None;
            }
        };

        let mid = (best_bid.price + best_ask.price) / Decimal::TWO;
        if mid <= Decimal::ZERO {
            self.stats.skipped_degenerate += 1;
            return None;
        }

        let spread_abs = best_ask.price - best_bid.price;
        let spread_bps = (spread_abs / mid * BPS_SCALE).round_dp(4);

        let depth = self
            .config
            .depth_bands_bps
            .iter()
            .map(|&bps| depth_band(view, mid, bps))
            .collect();

        let imbalance = imbalance(view, self.config.imbalance_levels);

        let mut estimates = Vec::with_capacity(self.config.slippage_sizes_usd.len() * 2);
        for &size_usd in &self.config.slippage_sizes_usd {
            let target_qty = Decimal::from(size_usd) / mid;
            estimates.push(slippage::estimate(
                &view.asks,
                mid,
                target_qty,
                size_usd,
                Side::Buy,
            ));
            estimates.push(slippage::estimate(
                &view.bids,
                mid,
                target_qty,
                size_usd,
                Side::Sell,
            ));
        }

        self.stats.samples_emitted += 1;

        Some(MetricsSample {
            snapshot_id: Uuid::new_v4(),
            symbol: view.symbol.clone(),
            exchange: self.exchange.clone(),
            timestamp: Utc::now(),
            last_update_id: view.last_update_id,
            mid_price: mid.round_dp(8),
            spread_abs,
            spread_bps,
            bid_levels: view.bids.len(),
            ask_levels: view.asks.len(),
            best_bid_qty: best_bid.qty,
            best_ask_qty: best_ask.qty,
            depth,
            imbalance,
            slippage: estimates,
        })
    }
}

/// Depth on both sides within `bps` basis points of mid.
fn depth_band(view: &BookView, mid: Decimal, bps: u32) -> DepthBand {
    let threshold = Decimal::from(bps) / BPS_SCALE;
    let bid_limit = mid * (Decimal::ONE - threshold);
    let ask_limit = mid * (Decimal::ONE + threshold);

    let mut bid_qty = Decimal::ZERO;
    let mut bid_usd = Decimal::ZERO;
    for level in &view.bids {
        if level.price < bid_limit {
            break;
        }
        bid_qty += level.qty;
        bid_usd += level.notional();
    }

    let mut ask_qty = Decimal::ZERO;
    let mut ask_usd = Decimal::ZERO;
    for level in &view.asks {
        if level.price > ask_limit {
            break;
        }
        ask_qty += level.qty;
        ask_usd += level.notional();
    }

    DepthBand {
        bps,
        bid_qty: bid_qty.round_dp(8),
        ask_qty: ask_qty.round_dp(8),
        bid_usd: bid_usd.round_dp(2),
        ask_usd: ask_usd.round_dp(2),
    }
}

/// (bid_vol - ask_vol) / (bid_vol + ask_vol) over the top N levels.
/// Zero when the denominator is zero.
fn imbalance(view: &BookView, levels: usize) -> Decimal {
    let bid_vol: Decimal = view.bids.iter().take(levels).map(|l| l.qty).sum();
    let ask_vol: Decimal = view.asks.iter().take(levels).map(|l| l.qty).sum();

    let total = bid_vol + ask_vol;
    if total.is_zero() {
        return Decimal::ZERO;
    }
    ((bid_vol - ask_vol) / total).round_dp(4)
}
