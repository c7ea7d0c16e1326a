// Book reconstruction engine
// Converts the unordered delta stream plus REST snapshots into a
// continuously consistent local book, resynchronizing on disruption.
//
// State machine per symbol:
//   Uninitialized -> Syncing -> Live, with Stale as the terminal failure
//   state until the stream is externally restarted.

use chrono::Utc;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::book::ladder::BookSide;
use crate::core::config::BookConfig;
use crate::core::types::{BookState, BookView, DepthDelta, DepthSnapshot, PriceLevel};

#[derive(Debug, Error)]
pub enum BookError {
    #[error("no bridge delta for snapshot cursor {snapshot_id} (buffered: {buffered})")]
    NoBridge { snapshot_id: u64, buffered: usize },
    #[error("book is stale after {0} failed resync attempts")]
    Stale(u32),
    #[error("snapshot received in {0} state")]
    UnexpectedSnapshot(BookState),
}

/// Per-engine counters, exposed through the pipeline introspection surface.
#[derive(Debug, Clone, Default)]
pub struct BookEngineStats {
    pub deltas_applied: u64,
    pub deltas_dropped_stale: u64,
    pub deltas_buffered: u64,
    pub gaps_detected: u64,
    pub snapshots_applied: u64,
    pub resync_failures: u64,
    pub crossed_detected: u64,
    pub views_published: u64,
    pub last_error: Option<String>,
}

pub struct BookEngine {
    symbol: String,
    state: BookState,
    bids: BookSide,
    asks: BookSide,
    last_update_id: u64,

    // Deltas held while waiting for a snapshot
    buffer: VecDeque<DepthDelta>,
    buffer_capacity: usize,

    view_depth: usize,

    // Resync failure accounting inside a sliding window
    max_resync_attempts: u32,
    resync_window: Duration,
    resync_attempts: u32,
    first_failure_at: Option<Instant>,

    stats: BookEngineStats,
}

impl BookEngine {
    pub fn new(symbol: &str, config: &BookConfig) -> Self {
        info!(symbol = symbol, view_depth = config.view_depth, "BookEngine created");

        Self {
            symbol: symbol.to_uppercase(),
            state: BookState::Uninitialized,
            bids: BookSide::bid(),
            asks: BookSide::ask(),
            last_update_id: 0,
            buffer: VecDeque::with_capacity(config.buffer_capacity.min(4096)),
            buffer_capacity: config.buffer_capacity,
            view_depth: config.view_depth,
            max_resync_attempts: config.max_resync_attempts,
            resync_window: Duration::from_secs(config.resync_window_secs),
            resync_attempts: 0,
            first_failure_at: None,
            stats: BookEngineStats::default(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn state(&self) -> BookState {
        self.state
    }

    pub fn is_live(&self) -> bool {
        self.state == BookState::Live
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    pub fn stats(&self) -> &BookEngineStats {
        &self.stats
    }

    pub fn bid_levels(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_levels(&self) -> usize {
        self.asks.len()
    }

    /// Deltas held while waiting for a snapshot.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Stream started or transport reconnected: begin (re)synchronizing.
    /// The caller is responsible for issuing a snapshot request whenever the
    /// engine reports `Syncing`.
    pub fn start_sync(&mut self) {
        debug!(symbol = %self.symbol, from = %self.state, "Entering Syncing");
        self.state = BookState::Syncing;
        self.buffer.clear();
    }

    /// Transport reconnect. Also the externally-triggered recovery path out
    /// of Stale.
    pub fn on_stream_reset(&mut self) {
        if self.state == BookState::Stale {
            info!(symbol = %self.symbol, "Stream restarted, leaving Stale");
            self.resync_attempts = 0;
            self.first_failure_at = None;
        }
        self.start_sync();
    }

    /// Feed one delta through the state machine. Returns a fresh view when
    /// the delta was applied to a live book.
    pub fn handle_delta(&mut self, delta: DepthDelta) -> Option<BookView> {
        match self.state {
            BookState::Uninitialized | BookState::Stale => {
                self.stats.deltas_dropped_stale += 1;
                None
            }
            BookState::Syncing => {
                self.buffer_delta(delta);
                None
            }
            BookState::Live => self.apply_live_delta(delta),
        }
    }

    fn buffer_delta(&mut self, delta: DepthDelta) {
        if self.buffer.len() >= self.buffer_capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(delta);
        self.stats.deltas_buffered += 1;
    }

    fn apply_live_delta(&mut self, delta: DepthDelta) -> Option<BookView> {
        // Already covered by the current cursor
        if delta.last_id <= self.last_update_id {
            self.stats.deltas_dropped_stale += 1;
            return None;
        }

        // Sequence gap: resynchronize. The offending delta is discarded and
        // will be re-covered by the next snapshot + bridge.
        if delta.first_id > self.last_update_id + 1 {
            self.stats.gaps_detected += 1;
            warn!(
                symbol = %self.symbol,
                last_update_id = self.last_update_id,
                first_id = delta.first_id,
                gap = delta.first_id - self.last_update_id - 1,
                "Sequence gap detected, resyncing"
            );
            self.start_sync();
            return None;
        }

        self.apply_levels(&delta);
        self.last_update_id = delta.last_id;
        self.stats.deltas_applied += 1;

        // A crossed book is a data defect the resync protocol can repair
        if self.is_crossed() {
            self.stats.crossed_detected += 1;
            warn!(symbol = %self.symbol, "Crossed book detected, resyncing");
            self.start_sync();
            return None;
        }

        Some(self.publish_view())
    }

    /// Install a snapshot and replay the buffered bridge deltas.
    ///
    /// On `NoBridge` the buffer is kept: later buffered deltas may bridge a
    /// fresh snapshot. Three failures inside the resync window tip the
    /// engine into Stale.
    pub fn apply_snapshot(&mut self, snapshot: DepthSnapshot) -> Result<BookView, BookError> {
        if self.state != BookState::Syncing {
            return Err(BookError::UnexpectedSnapshot(self.state));
        }

        let snapshot_id = snapshot.last_update_id;

        // Discard buffered deltas the snapshot already covers
        while matches!(self.buffer.front(), Some(d) if d.last_id <= snapshot_id) {
            self.buffer.pop_front();
        }

        // The first remaining delta must bridge the snapshot cursor:
        // first_id <= snapshot_id + 1 <= last_id
        let bridges = matches!(
            self.buffer.front(),
            Some(d) if d.first_id <= snapshot_id + 1 && snapshot_id + 1 <= d.last_id
        );
        if !bridges {
            self.stats.resync_failures += 1;
            let err = BookError::NoBridge {
                snapshot_id,
                buffered: self.buffer.len(),
            };
            self.stats.last_error = Some(err.to_string());
            if self.note_resync_failure() {
                return Err(BookError::Stale(self.resync_attempts));
            }
            return Err(err);
        }

        // Install snapshot levels atomically
        self.bids.clear();
        self.asks.clear();
        for level in &snapshot.bids {
            if level.qty > rust_decimal::Decimal::ZERO {
                self.bids.apply(level.price, level.qty);
            }
        }
        for level in &snapshot.asks {
            if level.qty > rust_decimal::Decimal::ZERO {
                self.asks.apply(level.price, level.qty);
            }
        }
        self.last_update_id = snapshot_id;
        self.stats.snapshots_applied += 1;

        // Apply the bridge and everything after it, in order
        let mut applied = 0u64;
        while let Some(delta) = self.buffer.pop_front() {
            self.apply_levels(&delta);
            self.last_update_id = delta.last_id;
            applied += 1;
        }
        self.stats.deltas_applied += applied;

        self.state = BookState::Live;
        self.resync_attempts = 0;
        self.first_failure_at = None;

        info!(
            symbol = %self.symbol,
            snapshot_id = snapshot_id,
            bridged = applied,
            last_update_id = self.last_update_id,
            bid_levels = self.bids.len(),
            ask_levels = self.asks.len(),
            "Book synchronized"
        );

        Ok(self.publish_view())
    }

    /// Snapshot fetch failed (unreachable, timeout). Shares the failure
    /// budget with the no-bridge path. Returns true once the engine is Stale.
    pub fn on_snapshot_failure(&mut self, error: &str) -> bool {
        if self.state != BookState::Syncing {
            return false;
        }
        self.stats.resync_failures += 1;
        self.stats.last_error = Some(error.to_string());
        self.note_resync_failure()
    }

    fn note_resync_failure(&mut self) -> bool {
        let now = Instant::now();
        match self.first_failure_at {
            Some(first) if now.duration_since(first) <= self.resync_window => {
                self.resync_attempts += 1;
            }
            _ => {
                self.first_failure_at = Some(now);
                self.resync_attempts = 1;
            }
        }

        if self.resync_attempts >= self.max_resync_attempts {
            warn!(
                symbol = %self.symbol,
                attempts = self.resync_attempts,
                "Resync failed repeatedly, entering Stale"
            );
            self.state = BookState::Stale;
            self.buffer.clear();
            true
        } else {
            false
        }
    }

    fn apply_levels(&mut self, delta: &DepthDelta) {
        for level in &delta.bids {
            self.bids.apply(level.price, level.qty);
        }
        for level in &delta.asks {
            self.asks.apply(level.price, level.qty);
        }
    }

    /// Bid >= ask means the book is corrupted.
    pub fn is_crossed(&self) -> bool {
        match (self.bids.best(), self.asks.best()) {
            (Some((bid, _)), Some((ask, _))) => bid >= ask,
            _ => false,
        }
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.best().map(|(p, q)| PriceLevel::new(p, q))
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.best().map(|(p, q)| PriceLevel::new(p, q))
    }

    fn publish_view(&mut self) -> BookView {
        self.stats.views_published += 1;
        BookView {
            symbol: self.symbol.clone(),
            bids: self.bids.top(self.view_depth),
            asks: self.asks.top(self.view_depth),
            last_update_id: self.last_update_id,
            captured_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn engine() -> BookEngine {
        BookEngine::new("BTCUSDT", &BookConfig::default())
    }

    fn delta(first_id: u64, last_id: u64, bids: Vec<(f64, f64)>, asks: Vec<(f64, f64)>) -> DepthDelta {
        let to_levels = |pairs: Vec<(f64, f64)>| {
            pairs
                .into_iter()
                .map(|(p, q)| {
                    PriceLevel::new(
                        rust_decimal::Decimal::try_from(p).unwrap(),
                        rust_decimal::Decimal::try_from(q).unwrap(),
                    )
                })
                .collect()
        };
        DepthDelta {
            symbol: "BTCUSDT".to_string(),
            first_id,
            last_id,
            event_time_ms: 0,
            bids: to_levels(bids),
            asks: to_levels(asks),
        }
    }

    fn snapshot(last_update_id: u64, bids: Vec<(f64, f64)>, asks: Vec<(f64, f64)>) -> DepthSnapshot {
        let to_levels = |pairs: Vec<(f64, f64)>| {
            pairs
                .into_iter()
                .map(|(p, q)| {
                    PriceLevel::new(
                        rust_decimal::Decimal::try_from(p).unwrap(),
                        rust_decimal::Decimal::try_from(q).unwrap(),
                    )
                })
                .collect()
        };
        DepthSnapshot {
            symbol: Some("BTCUSDT".to_string()),
            last_update_id,
            bids: to_levels(bids),
            asks: to_levels(asks),
        }
    }

    fn go_live(engine: &mut BookEngine, snapshot_id: u64) {
        engine.start_sync();
        engine.handle_delta(delta(
            snapshot_id,
            snapshot_id + 1,
            vec![(50000.0, 1.0)],
            vec![(50010.0, 1.0)],
        ));
        engine
            .apply_snapshot(snapshot(
                snapshot_id,
                vec![(50000.0, 1.0)],
                vec![(50010.0, 1.0)],
            ))
            .unwrap();
    }

    #[test]
    fn test_uninitialized_drops_deltas() {
        let mut eng = engine();
        assert!(eng.handle_delta(delta(1, 2, vec![], vec![])).is_none());
        assert_eq!(eng.stats().deltas_dropped_stale, 1);
    }

    #[test]
    fn test_sync_buffers_and_bridges() {
        let mut eng = engine();
        eng.start_sync();

        // Too old: fully covered by the snapshot
        eng.handle_delta(delta(95, 99, vec![(49999.0, 9.0)], vec![]));
        // Bridge: 100 <= 101 <= 105
        eng.handle_delta(delta(100, 105, vec![(50001.0, 2.0)], vec![]));
        // Follow-up
        eng.handle_delta(delta(106, 110, vec![], vec![(50005.0, 1.0)]));

        let view = eng
            .apply_snapshot(snapshot(100, vec![(50000.0, 1.0)], vec![(50010.0, 1.0)]))
            .unwrap();

        assert_eq!(eng.state(), BookState::Live);
        assert_eq!(eng.last_update_id(), 110);
        // The stale buffered delta must not have resurrected 49999
        assert_eq!(view.best_bid().unwrap().price, dec!(50001.0));
        assert_eq!(view.best_ask().unwrap().price, dec!(50005.0));
    }

    #[test]
    fn test_gap_triggers_resync_then_recovers() {
        let mut eng = engine();
        go_live(&mut eng, 99);
        assert_eq!(eng.last_update_id(), 100);

        // Gap: first_id 105 > 100 + 1
        assert!(eng
            .handle_delta(delta(105, 107, vec![(50002.0, 1.0)], vec![]))
            .is_none());
        assert_eq!(eng.state(), BookState::Syncing);
        assert_eq!(eng.stats().gaps_detected, 1);

        // Bridge delta for the upcoming snapshot: 108 <= 111 <= 112
        eng.handle_delta(delta(108, 112, vec![(50003.0, 1.0)], vec![]));

        eng.apply_snapshot(snapshot(110, vec![(50000.0, 1.0)], vec![(50010.0, 1.0)]))
            .unwrap();

        assert_eq!(eng.state(), BookState::Live);
        assert_eq!(eng.last_update_id(), 112);
    }

    #[test]
    fn test_stale_delta_dropped_live() {
        let mut eng = engine();
        go_live(&mut eng, 99);
        let dropped_before = eng.stats().deltas_dropped_stale;

        assert!(eng.handle_delta(delta(98, 100, vec![], vec![])).is_none());
        assert_eq!(eng.stats().deltas_dropped_stale, dropped_before + 1);
        assert_eq!(eng.state(), BookState::Live);
    }

    #[test]
    fn test_zero_qty_removes_and_best_recomputes() {
        let mut eng = engine();
        eng.start_sync();
        eng.handle_delta(delta(101, 101, vec![], vec![]));
        eng.apply_snapshot(snapshot(
            100,
            vec![(100.00, 2.5), (99.50, 1.0)],
            vec![(100.50, 1.0)],
        ))
        .unwrap();

        let view = eng
            .handle_delta(delta(102, 102, vec![(100.00, 0.0)], vec![]))
            .unwrap();

        assert_eq!(view.best_bid().unwrap().price, dec!(99.5));
        assert!(!view.bids.iter().any(|l| l.price == dec!(100.00)));
    }

    #[test]
    fn test_sequence_monotonicity() {
        let mut eng = engine();
        go_live(&mut eng, 99);

        let mut prev = eng.last_update_id();
        for (first, last) in [(101, 103), (104, 104), (90, 95), (105, 109)] {
            eng.handle_delta(delta(first, last, vec![(50001.0, 1.0)], vec![]));
            assert!(eng.last_update_id() >= prev);
            prev = eng.last_update_id();
        }
        assert_eq!(prev, 109);
    }

    #[test]
    fn test_no_bridge_keeps_buffer_and_counts_failure() {
        let mut eng = engine();
        eng.start_sync();
        // Buffered delta starts past the bridge point
        eng.handle_delta(delta(110, 115, vec![], vec![]));

        let err = eng
            .apply_snapshot(snapshot(100, vec![(50000.0, 1.0)], vec![(50010.0, 1.0)]))
            .unwrap_err();
        assert!(matches!(err, BookError::NoBridge { .. }));
        assert_eq!(eng.state(), BookState::Syncing);
        assert_eq!(eng.stats().resync_failures, 1);

        // A later snapshot that the buffered delta does bridge succeeds
        eng.apply_snapshot(snapshot(112, vec![(50000.0, 1.0)], vec![(50010.0, 1.0)]))
            .unwrap();
        assert_eq!(eng.state(), BookState::Live);
        assert_eq!(eng.last_update_id(), 115);
    }

    #[test]
    fn test_three_failures_enter_stale() {
        let mut eng = engine();
        eng.start_sync();

        assert!(!eng.on_snapshot_failure("timeout"));
        assert!(!eng.on_snapshot_failure("timeout"));
        assert!(eng.on_snapshot_failure("timeout"));
        assert_eq!(eng.state(), BookState::Stale);

        // Stale drops everything until the stream restarts
        assert!(eng.handle_delta(delta(1, 2, vec![], vec![])).is_none());

        eng.on_stream_reset();
        assert_eq!(eng.state(), BookState::Syncing);
    }

    #[test]
    fn test_crossed_book_triggers_resync() {
        let mut eng = engine();
        go_live(&mut eng, 99);

        // Bid crossing above the resting ask
        let view = eng.handle_delta(delta(101, 101, vec![(50020.0, 1.0)], vec![]));
        assert!(view.is_none());
        assert_eq!(eng.state(), BookState::Syncing);
        assert_eq!(eng.stats().crossed_detected, 1);
    }

    #[test]
    fn test_live_book_never_crossed() {
        let mut eng = engine();
        go_live(&mut eng, 99);

        let updates = [
            delta(101, 102, vec![(50005.0, 1.0)], vec![]),
            delta(103, 104, vec![], vec![(50006.0, 2.0)]),
            delta(105, 106, vec![(50005.0, 0.0)], vec![(50010.0, 0.5)]),
        ];
        for d in updates {
            if eng.state() == BookState::Live {
                eng.handle_delta(d);
            }
            if eng.state() == BookState::Live {
                let bid = eng.best_bid().unwrap().price;
                let ask = eng.best_ask().unwrap().price;
                assert!(bid < ask, "book crossed: {} >= {}", bid, ask);
            }
        }
    }

    #[test]
    fn test_view_truncated_to_depth() {
        let mut config = BookConfig::default();
        config.view_depth = 2;
        let mut eng = BookEngine::new("BTCUSDT", &config);
        eng.start_sync();
        eng.handle_delta(delta(101, 101, vec![], vec![]));
        let view = eng
            .apply_snapshot(snapshot(
                100,
                vec![(50000.0, 1.0), (49999.0, 1.0), (49998.0, 1.0)],
                vec![(50010.0, 1.0), (50011.0, 1.0), (50012.0, 1.0)],
            ))
            .unwrap();

        assert_eq!(view.bids.len(), 2);
        assert_eq!(view.asks.len(), 2);
        assert_eq!(view.bids[0].price, dec!(50000.0));
    }
}
