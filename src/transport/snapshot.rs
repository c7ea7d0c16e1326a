// Snapshot fetcher - full book snapshots on demand via REST
// Callable concurrently with delta reception; the book task keeps at most
// one request in flight per symbol.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::core::config::ExchangeConfig;
use crate::core::types::{DepthSnapshot, PriceLevel};
use crate::transport::TransportError;

#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch(&self, symbol: &str, depth_limit: u32) -> Result<DepthSnapshot, TransportError>;
}

/// REST snapshot fetcher with a hard deadline per request.
#[derive(Clone)]
pub struct RestSnapshotFetcher {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct RawSnapshot {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

impl RestSnapshotFetcher {
    pub fn new(config: &ExchangeConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.rest_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.snapshot_timeout_secs),
        }
    }

    fn convert_levels(raw: &[[String; 2]]) -> Result<Vec<PriceLevel>, TransportError> {
        raw.iter()
            .map(|[p, q]| {
                let price = Decimal::from_str(p)
                    .map_err(|_| TransportError::InvalidSnapshot(format!("bad price '{p}'")))?;
                let qty = Decimal::from_str(q)
                    .map_err(|_| TransportError::InvalidSnapshot(format!("bad quantity '{q}'")))?;
                Ok(PriceLevel::new(price, qty))
            })
            .collect()
    }
}

#[async_trait]
impl SnapshotFetcher for RestSnapshotFetcher {
    async fn fetch(&self, symbol: &str, depth_limit: u32) -> Result<DepthSnapshot, TransportError> {
        let url = format!(
            "{}/fapi/v1/depth?symbol={}&limit={}",
            self.base_url,
            symbol.to_uppercase(),
            depth_limit
        );
        debug!(symbol = symbol, limit = depth_limit, "Fetching snapshot");

        let request = async {
            let raw: RawSnapshot = self
                .client
                .get(&url)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            Ok::<_, TransportError>(raw)
        };

        let raw = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))??;

        let snapshot = DepthSnapshot {
            symbol: Some(symbol.to_uppercase()),
            last_update_id: raw.last_update_id,
            bids: Self::convert_levels(&raw.bids)?,
            asks: Self::convert_levels(&raw.asks)?,
        };

        info!(
            symbol = symbol,
            last_update_id = snapshot.last_update_id,
            bid_levels = snapshot.bids.len(),
            ask_levels = snapshot.asks.len(),
            "Snapshot fetched"
        );

        Ok(snapshot)
    }
}

/// Scripted fetcher serving snapshots from a queue. Used by tests.
#[derive(Clone)]
pub struct ScriptedSnapshotFetcher {
    responses: Arc<parking_lot::Mutex<VecDeque<Result<DepthSnapshot, String>>>>,
}

impl ScriptedSnapshotFetcher {
    pub fn new(responses: Vec<Result<DepthSnapshot, String>>) -> Self {
        Self {
            responses: Arc::new(parking_lot::Mutex::new(responses.into())),
        }
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().len()
    }
}

#[async_trait]
impl SnapshotFetcher for ScriptedSnapshotFetcher {
    async fn fetch(&self, _symbol: &str, _depth_limit: u32) -> Result<DepthSnapshot, TransportError> {
        match self.responses.lock().pop_front() {
            Some(Ok(snapshot)) => Ok(snapshot),
            Some(Err(message)) => Err(TransportError::InvalidSnapshot(message)),
            None => Err(TransportError::Exhausted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_convert_levels() {
        let raw = vec![
            ["50000.10".to_string(), "1.5".to_string()],
            ["49999.90".to_string(), "0".to_string()],
        ];
        let levels = RestSnapshotFetcher::convert_levels(&raw).unwrap();
        assert_eq!(levels[0].price, dec!(50000.10));
        assert_eq!(levels[0].qty, dec!(1.5));
        assert_eq!(levels[1].qty, Decimal::ZERO);
    }

    #[test]
    fn test_convert_levels_rejects_garbage() {
        let raw = vec![["x".to_string(), "1".to_string()]];
        assert!(RestSnapshotFetcher::convert_levels(&raw).is_err());
    }

    #[tokio::test]
    async fn test_scripted_fetcher_sequence() {
        let snapshot = DepthSnapshot {
            symbol: Some("BTCUSDT".to_string()),
            last_update_id: 100,
            bids: vec![],
            asks: vec![],
        };
        let fetcher = ScriptedSnapshotFetcher::new(vec![
            Err("unreachable".to_string()),
            Ok(snapshot),
        ]);

        assert!(fetcher.fetch("BTCUSDT", 1000).await.is_err());
        let snap = fetcher.fetch("BTCUSDT", 1000).await.unwrap();
        assert_eq!(snap.last_update_id, 100);
        assert!(matches!(
            fetcher.fetch("BTCUSDT", 1000).await,
            Err(TransportError::Exhausted)
        ));
    }
}
