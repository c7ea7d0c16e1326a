// PostgreSQL sinks over sqlx
// Snapshot rows are buffered and flushed in batches inside a transaction;
// anomaly events are written immediately. Both inserts are idempotent via
// ON CONFLICT DO NOTHING on the UUID column.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, error, info};

use crate::core::config::DatabaseConfig;
use crate::core::types::{AnomalyEvent, MetricsSample, Side};
use crate::sink::{EventSink, SnapshotSink};

/// Build the shared connection pool.
pub async fn connect_pool(config: &DatabaseConfig, password: &str) -> Result<PgPool> {
    let url = format!(
        "postgres://{}:{}@{}:{}/{}",
        config.user, password, config.host, config.port, config.database
    );

    let pool = PgPoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .connect(&url)
        .await
        .context("failed to connect to PostgreSQL")?;

    info!(
        host = %config.host,
        database = %config.database,
        "Database connected"
    );

    Ok(pool)
}

/// `SELECT 1` probe used by the supervisor.
pub async fn health_check(pool: &PgPool) -> bool {
    match sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(pool).await {
        Ok(1) => true,
        Ok(_) => false,
        Err(e) => {
            error!(error = %e, "Database health check failed");
            false
        }
    }
}

pub struct PgSnapshotSink {
    pool: PgPool,
    buffer: Vec<MetricsSample>,
    batch_size: usize,
    pub rows_written: u64,
}

impl PgSnapshotSink {
    pub fn new(pool: PgPool, batch_size: usize) -> Self {
        Self {
            pool,
            buffer: Vec::with_capacity(batch_size),
            batch_size,
            rows_written: 0,
        }
    }

    fn sell_slippage(sample: &MetricsSample, size_usd: u64) -> (Decimal, Decimal) {
        sample
            .slippage_for(size_usd, Side::Sell)
            .map(|s| (s.slippage_bps, s.slippage_usd))
            .unwrap_or((Decimal::ZERO, Decimal::ZERO))
    }

    fn band_totals(sample: &MetricsSample, bps: u32) -> (Decimal, Decimal) {
        sample
            .depth_band(bps)
            .map(|b| (b.total_usd(), b.total_qty()))
            .unwrap_or((Decimal::ZERO, Decimal::ZERO))
    }

    async fn insert_all(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for sample in self.buffer.drain(..) {
            let (depth_10_usd, depth_10) = Self::band_totals(&sample, 10);
            let (depth_50_usd, depth_50) = Self::band_totals(&sample, 50);
            let (depth_100_usd, depth_100) = Self::band_totals(&sample, 100);
            let (slip_100k_bps, slip_100k_usd) = Self::sell_slippage(&sample, 100_000);
            let (slip_500k_bps, slip_500k_usd) = Self::sell_slippage(&sample, 500_000);
            let (slip_1m_bps, slip_1m_usd) = Self::sell_slippage(&sample, 1_000_000);

            sqlx::query(
                r"
                INSERT INTO liquidity_snapshots (
                    snapshot_id, symbol, exchange, timestamp,
                    mid_price, spread_bps, bid_levels, ask_levels,
                    depth_10bps_usd, depth_50bps_usd, depth_100bps_usd,
                    depth_10bps, depth_50bps, depth_100bps,
                    imbalance,
                    slippage_100k_bps, slippage_100k_usd,
                    slippage_500k_bps, slippage_500k_usd,
                    slippage_1m_bps, slippage_1m_usd
                ) VALUES (
                    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                    $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21
                )
                ON CONFLICT (snapshot_id) DO NOTHING
                ",
            )
            .bind(sample.snapshot_id)
            .bind(&sample.symbol)
            .bind(&sample.exchange)
            .bind(sample.timestamp)
            .bind(sample.mid_price)
            .bind(sample.spread_bps)
            .bind(sample.bid_levels as i32)
            .bind(sample.ask_levels as i32)
            .bind(depth_10_usd)
            .bind(depth_50_usd)
            .bind(depth_100_usd)
            .bind(depth_10)
            .bind(depth_50)
            .bind(depth_100)
            .bind(sample.imbalance)
            .bind(slip_100k_bps)
            .bind(slip_100k_usd)
            .bind(slip_500k_bps)
            .bind(slip_500k_usd)
            .bind(slip_1m_bps)
            .bind(slip_1m_usd)
            .execute(&mut *tx)
            .await?;

            self.rows_written += 1;
        }

        tx.commit().await?;
        debug!(rows = self.rows_written, "Snapshot batch flushed");
        Ok(())
    }
}

#[async_trait]
impl SnapshotSink for PgSnapshotSink {
    async fn write(&mut self, sample: MetricsSample) -> Result<()> {
        self.buffer.push(sample);
        if self.buffer.len() >= self.batch_size {
            self.insert_all().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.insert_all().await
    }
}

pub struct PgEventSink {
    pool: PgPool,
    pub rows_written: u64,
}

impl PgEventSink {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            rows_written: 0,
        }
    }
}

#[async_trait]
impl EventSink for PgEventSink {
    async fn write(&mut self, event: AnomalyEvent) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO anomaly_events (
                event_id, symbol, exchange, detected_at,
                severity, reason,
                depth_zscore, spread_zscore, imbalance_zscore, max_zscore,
                mid_price, spread_bps, depth_10bps_usd, imbalance
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14
            )
            ON CONFLICT (event_id) DO NOTHING
            ",
        )
        .bind(event.event_id)
        .bind(&event.symbol)
        .bind(&event.exchange)
        .bind(event.detected_at)
        .bind(event.severity.as_str())
        .bind(&event.reason)
        .bind(round4(event.zscores.depth_10bps_usd))
        .bind(round4(event.zscores.spread_bps))
        .bind(round4(event.zscores.imbalance))
        .bind(round4(event.max_zscore))
        .bind(event.market.mid_price)
        .bind(event.market.spread_bps)
        .bind(event.market.depth_10bps_usd)
        .bind(event.market.imbalance)
        .execute(&self.pool)
        .await?;

        self.rows_written += 1;

        info!(
            symbol = %event.symbol,
            severity = %event.severity,
            reason = %event.reason,
            "Anomaly persisted"
        );

        Ok(())
    }
}

/// Z-scores are stored as decimal(10,4).
fn round4(value: f64) -> Decimal {
    Decimal::try_from(value)
        .map(|d| d.round_dp(4))
        .unwrap_or(Decimal::ZERO)
}
