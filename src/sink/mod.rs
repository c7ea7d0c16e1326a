// Persistence sinks - durable storage for metric snapshots and anomalies

pub mod postgres;

use async_trait::async_trait;

use crate::core::types::{AnomalyEvent, MetricsSample};

pub use postgres::{connect_pool, health_check, PgEventSink, PgSnapshotSink};

/// Persists metric samples. Writes are idempotent on `snapshot_id`.
#[async_trait]
pub trait SnapshotSink: Send {
    async fn write(&mut self, sample: MetricsSample) -> anyhow::Result<()>;

    /// Flush any buffered rows. Called on shutdown and periodically.
    async fn flush(&mut self) -> anyhow::Result<()>;
}

/// Persists anomaly events. Writes are idempotent on `event_id`.
#[async_trait]
pub trait EventSink: Send {
    async fn write(&mut self, event: AnomalyEvent) -> anyhow::Result<()>;
}

/// Console-only sinks for database-less runs.
#[derive(Default)]
pub struct LogSnapshotSink;

#[async_trait]
impl SnapshotSink for LogSnapshotSink {
    async fn write(&mut self, sample: MetricsSample) -> anyhow::Result<()> {
        tracing::info!(
            symbol = %sample.symbol,
            mid = %sample.mid_price,
            spread_bps = %sample.spread_bps,
            imbalance = %sample.imbalance,
            "Liquidity snapshot"
        );
        Ok(())
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct LogEventSink;

#[async_trait]
impl EventSink for LogEventSink {
    async fn write(&mut self, event: AnomalyEvent) -> anyhow::Result<()> {
        tracing::warn!(
            symbol = %event.symbol,
            severity = %event.severity,
            max_zscore = event.max_zscore,
            reason = %event.reason,
            "Anomaly detected"
        );
        Ok(())
    }
}

/// Capturing sink for tests.
#[derive(Default)]
pub struct MemorySnapshotSink {
    pub samples: Vec<MetricsSample>,
}

#[async_trait]
impl SnapshotSink for MemorySnapshotSink {
    async fn write(&mut self, sample: MetricsSample) -> anyhow::Result<()> {
        self.samples.push(sample);
        Ok(())
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryEventSink {
    pub events: Vec<AnomalyEvent>,
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn write(&mut self, event: AnomalyEvent) -> anyhow::Result<()> {
        self.events.push(event);
        Ok(())
    }
}
