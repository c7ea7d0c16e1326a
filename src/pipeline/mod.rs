// Pipeline orchestration
// Per-symbol stage tasks connected by bounded queues. The hot path (frames
// -> book) drops old data rather than stalling; the cold path (samples ->
// sinks) applies true backpressure. Book state is owned by exactly one task
// per symbol - no locking on the hot path.

pub mod queue;

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::anomaly::AnomalyDetector;
use crate::book::{BookEngine, BookError};
use crate::core::config::MonitorConfig;
use crate::core::types::{BookState, BookView, DepthDelta, MetricsSample, StreamEvent};
use crate::metrics::MetricsEngine;
use crate::parser::{MessageParser, ParsedFrame};
use crate::pipeline::queue::{bounded, Receiver, Sender};
use crate::sink::{EventSink, SnapshotSink};
use crate::transport::{FrameSource, SnapshotFetcher, TransportError};

// Stage link capacities. The asymmetry is deliberate: freshness on the hot
// path, no loss on the cold path.
const FRAME_QUEUE_CAP: usize = 1024;
const DELTA_QUEUE_CAP: usize = 1024;
const VIEW_QUEUE_CAP: usize = 16;
const SAMPLE_QUEUE_CAP: usize = 64;
const SNAPSHOT_QUEUE_CAP: usize = 256;
const EVENT_QUEUE_CAP: usize = 64;

/// Grace period before the parser falls back to evicting the oldest delta.
const DELTA_PUSH_GRACE: Duration = Duration::from_millis(25);
/// Pause between snapshot attempts after a failure.
const RESYNC_RETRY_DELAY: Duration = Duration::from_millis(500);
/// Degraded health tolerated before the process gives up with exit code 2.
const TERMINAL_DEADLINE: Duration = Duration::from_secs(300);
/// Drain budget per stage on shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

/// Input to the book task: deltas interleaved with transport resets.
enum BookInput {
    Delta(DepthDelta),
    Reset,
}

/// Shared health flag the supervisor watches. Stages set it on persistent
/// failures; it never unwinds a stage.
#[derive(Default)]
pub struct HealthState {
    inner: parking_lot::Mutex<Option<(Instant, String)>>,
}

impl HealthState {
    pub fn set_degraded(&self, reason: &str) {
        let mut inner = self.inner.lock();
        if inner.is_none() {
            warn!(reason = reason, "Health degraded");
            *inner = Some((Instant::now(), reason.to_string()));
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        if inner.take().is_some() {
            info!("Health recovered");
        }
    }

    pub fn degraded_for(&self) -> Option<Duration> {
        self.inner.lock().as_ref().map(|(since, _)| since.elapsed())
    }
}

/// Handle over one symbol's running stage tasks.
pub struct PipelineHandle {
    pub symbol: String,
    tasks: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    /// Wait for every stage to finish its drain, aborting stragglers.
    pub async fn join(self) {
        for task in self.tasks {
            if tokio::time::timeout(SHUTDOWN_DRAIN, task).await.is_err() {
                warn!(symbol = %self.symbol, "Stage exceeded drain deadline, aborting");
            }
        }
    }
}

/// Wire and spawn the stage tasks for one symbol.
///
/// Shutdown propagates as a cascade: the reader closes its output on the
/// shutdown signal, and each downstream stage drains its input to
/// completion before closing its own output. Sinks flush synchronously at
/// the end of their drain.
pub fn spawn_symbol_pipeline<S, F>(
    config: &MonitorConfig,
    symbol: &str,
    source: S,
    fetcher: F,
    snapshot_sink: Box<dyn SnapshotSink>,
    event_sink: Box<dyn EventSink>,
    shutdown: watch::Receiver<bool>,
    health: Arc<HealthState>,
) -> PipelineHandle
where
    S: FrameSource + 'static,
    F: SnapshotFetcher + Clone + 'static,
{
    let (frame_tx, frame_rx) = bounded::<StreamEvent>(FRAME_QUEUE_CAP);
    let (delta_tx, delta_rx) = bounded::<BookInput>(DELTA_QUEUE_CAP);
    let (view_tx, view_rx) = bounded::<BookView>(VIEW_QUEUE_CAP);
    let (sample_tx, sample_rx) = bounded::<MetricsSample>(SAMPLE_QUEUE_CAP);
    let (snap_tx, snap_rx) = bounded::<MetricsSample>(SNAPSHOT_QUEUE_CAP);
    let (event_tx, event_rx) = bounded::<crate::core::types::AnomalyEvent>(EVENT_QUEUE_CAP);

    let engine = BookEngine::new(symbol, &config.book);
    let parser = MessageParser::new(symbol);
    let metrics = MetricsEngine::new(&config.exchange.name, config.metrics.clone());
    let detector = AnomalyDetector::new(config.detector.clone());

    let tasks = vec![
        tokio::spawn(reader_task(source, frame_tx, shutdown)),
        tokio::spawn(parser_task(frame_rx, delta_tx, parser)),
        tokio::spawn(book_task(
            delta_rx,
            view_tx,
            engine,
            fetcher,
            config.exchange.snapshot_limit,
            health.clone(),
        )),
        tokio::spawn(metrics_task(
            view_rx,
            sample_tx,
            snap_tx,
            metrics,
            Duration::from_millis(config.metrics.period_ms),
            config.database.snapshot_every,
        )),
        tokio::spawn(detector_task(sample_rx, event_tx, detector)),
        tokio::spawn(snapshot_sink_task(snap_rx, snapshot_sink, health.clone())),
        tokio::spawn(event_sink_task(event_rx, event_sink, health)),
    ];

    info!(symbol = symbol, "Pipeline started");

    PipelineHandle {
        symbol: symbol.to_string(),
        tasks,
    }
}

// ============================================================================
// Stage tasks
// ============================================================================

async fn reader_task<S: FrameSource>(
    mut source: S,
    frames: Sender<StreamEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                source.close().await;
                break;
            }
            event = source.next_event() => match event {
                StreamEvent::Closed => break,
                StreamEvent::Reset => {
                    // Resets must not be lost to the drop-oldest policy
                    if frames.push(StreamEvent::Reset).await.is_err() {
                        break;
                    }
                }
                frame => frames.push_or_drop_oldest(frame),
            },
        }
    }
    debug!(dropped = frames.dropped(), "Reader stage finished");
    frames.close();
}

async fn parser_task(
    mut frames: Receiver<StreamEvent>,
    deltas: Sender<BookInput>,
    mut parser: MessageParser,
) {
    while let Some(event) = frames.recv().await {
        match event {
            StreamEvent::Frame(raw) => match parser.parse(&raw) {
                Ok(ParsedFrame::Delta(delta)) => {
                    deltas
                        .push_within(BookInput::Delta(delta), DELTA_PUSH_GRACE)
                        .await;
                }
                // Full snapshots arrive through the fetcher, not the stream
                Ok(ParsedFrame::Snapshot(_)) => {}
                Err(e) => debug!(error = %e, "Frame dropped"),
            },
            StreamEvent::Reset => {
                if deltas.push(BookInput::Reset).await.is_err() {
                    break;
                }
            }
            StreamEvent::Closed => break,
        }
    }
    info!(
        parsed = parser.stats.frames_parsed,
        errors = parser.stats.parse_errors,
        "Parser stage finished"
    );
    deltas.close();
}

async fn book_task<F>(
    mut deltas: Receiver<BookInput>,
    views: Sender<BookView>,
    mut engine: BookEngine,
    fetcher: F,
    snapshot_limit: u32,
    health: Arc<HealthState>,
) where
    F: SnapshotFetcher + Clone + 'static,
{
    let (snap_tx, mut snap_rx) =
        tokio::sync::mpsc::channel::<Result<crate::core::types::DepthSnapshot, TransportError>>(1);
    let mut fetch_inflight = false;

    engine.start_sync();

    loop {
        // One snapshot request in flight per symbol, and only once there is
        // at least one buffered delta to bridge with
        if engine.state() == BookState::Syncing && !fetch_inflight && engine.buffered() > 0 {
            fetch_inflight = true;
            let fetcher = fetcher.clone();
            let tx = snap_tx.clone();
            let symbol = engine.symbol().to_string();
            tokio::spawn(async move {
                let result = fetcher.fetch(&symbol, snapshot_limit).await;
                let _ = tx.send(result).await;
            });
        }

        tokio::select! {
            input = deltas.recv() => match input {
                Some(BookInput::Delta(delta)) => {
                    if let Some(view) = engine.handle_delta(delta) {
                        views.push_or_drop_oldest(view);
                    }
                }
                Some(BookInput::Reset) => engine.on_stream_reset(),
                None => break,
            },
            Some(result) = snap_rx.recv() => {
                fetch_inflight = false;
                match result {
                    Ok(snapshot) => match engine.apply_snapshot(snapshot) {
                        Ok(view) => {
                            health.clear();
                            views.push_or_drop_oldest(view);
                        }
                        Err(BookError::Stale(attempts)) => {
                            error!(symbol = %engine.symbol(), attempts, "Book is stale");
                            health.set_degraded("book stale");
                        }
                        Err(e) => {
                            debug!(symbol = %engine.symbol(), error = %e, "Snapshot not applicable, retrying");
                            tokio::time::sleep(RESYNC_RETRY_DELAY).await;
                        }
                    },
                    Err(e) => {
                        warn!(symbol = %engine.symbol(), error = %e, "Snapshot fetch failed");
                        if engine.on_snapshot_failure(&e.to_string()) {
                            health.set_degraded("snapshot unreachable");
                        } else {
                            tokio::time::sleep(RESYNC_RETRY_DELAY).await;
                        }
                    }
                }
            },
        }
    }

    let stats = engine.stats();
    info!(
        symbol = %engine.symbol(),
        applied = stats.deltas_applied,
        gaps = stats.gaps_detected,
        resyncs = stats.snapshots_applied,
        "Book stage finished"
    );
    views.close();
}

async fn metrics_task(
    mut views: Receiver<BookView>,
    samples: Sender<MetricsSample>,
    snapshots: Sender<MetricsSample>,
    mut metrics: MetricsEngine,
    period: Duration,
    snapshot_every: u64,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut emitted = 0u64;

    loop {
        ticker.tick().await;

        // Intermediate views are coalesced: the newest wins
        let (newest, discarded) = views.latest_now();
        metrics.note_coalesced(discarded);

        match newest {
            Some(view) => {
                if let Some(sample) = metrics.compute(&view) {
                    emitted += 1;
                    if samples.push(sample.clone()).await.is_err() {
                        break;
                    }
                    if snapshot_every > 0 && emitted % snapshot_every == 0 {
                        if snapshots.push(sample).await.is_err() {
                            break;
                        }
                    }
                }
            }
            None => {
                if views.is_closed() {
                    break;
                }
            }
        }
    }

    info!(
        emitted = metrics.stats().samples_emitted,
        coalesced = metrics.stats().views_coalesced,
        skipped = metrics.stats().skipped_degenerate,
        "Metrics stage finished"
    );
    samples.close();
    snapshots.close();
}

async fn detector_task(
    mut samples: Receiver<MetricsSample>,
    events: Sender<crate::core::types::AnomalyEvent>,
    mut detector: AnomalyDetector,
) {
    while let Some(sample) = samples.recv().await {
        if let Some(event) = detector.observe(&sample) {
            if events.push(event).await.is_err() {
                break;
            }
        }
    }
    info!(
        observed = detector.stats().samples_observed,
        emitted = detector.stats().events_emitted,
        suppressed = detector.stats().suppressed_cooldown,
        "Detector stage finished"
    );
    events.close();
}

async fn snapshot_sink_task(
    mut rows: Receiver<MetricsSample>,
    mut sink: Box<dyn SnapshotSink>,
    health: Arc<HealthState>,
) {
    while let Some(sample) = rows.recv().await {
        if let Err(e) = sink.write(sample).await {
            error!(error = %e, "Snapshot write failed");
            health.set_degraded("snapshot sink failing");
        }
    }
    if let Err(e) = sink.flush().await {
        error!(error = %e, "Final snapshot flush failed");
    }
    debug!("Snapshot sink drained");
}

async fn event_sink_task(
    mut events: Receiver<crate::core::types::AnomalyEvent>,
    mut sink: Box<dyn EventSink>,
    health: Arc<HealthState>,
) {
    while let Some(event) = events.recv().await {
        if let Err(e) = sink.write(event).await {
            error!(error = %e, "Event write failed");
            health.set_degraded("event sink failing");
        }
    }
    debug!("Event sink drained");
}

// ============================================================================
// Supervisor
// ============================================================================

/// Outcome the supervisor hands back to the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Clean shutdown (signal or stream end).
    Finished,
    /// Persistent external failure beyond the terminal deadline.
    Failed,
    /// Interrupted by the operator.
    Interrupted,
}

/// Watch health until shutdown fires or degradation outlives the terminal
/// deadline. Returns the outcome the exit code is derived from.
pub async fn supervise(
    health: Arc<HealthState>,
    mut shutdown: watch::Receiver<bool>,
) -> RunOutcome {
    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = shutdown.changed() => return RunOutcome::Finished,
            _ = ticker.tick() => {
                if let Some(elapsed) = health.degraded_for() {
                    if elapsed > TERMINAL_DEADLINE {
                        error!(
                            degraded_secs = elapsed.as_secs(),
                            "Degraded past terminal deadline"
                        );
                        return RunOutcome::Failed;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_state_transitions() {
        let health = HealthState::default();
        assert!(health.degraded_for().is_none());

        health.set_degraded("book stale");
        assert!(health.degraded_for().is_some());

        // A second cause must not reset the clock
        let first = health.degraded_for().unwrap();
        health.set_degraded("sink failing");
        assert!(health.degraded_for().unwrap() >= first);

        health.clear();
        assert!(health.degraded_for().is_none());
    }

    #[tokio::test]
    async fn test_supervisor_returns_on_shutdown() {
        let health = Arc::new(HealthState::default());
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(supervise(health, rx));
        tx.send(true).unwrap();

        assert_eq!(handle.await.unwrap(), RunOutcome::Finished);
    }
}
