// External transport - venue WebSocket frames and REST snapshots

pub mod snapshot;
pub mod source;

use thiserror::Error;

pub use snapshot::{RestSnapshotFetcher, ScriptedSnapshotFetcher, SnapshotFetcher};
pub use source::{FrameSource, ScriptedFrameSource, WsFrameSource};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("snapshot request timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("invalid snapshot payload: {0}")]
    InvalidSnapshot(String),
    #[error("source exhausted")]
    Exhausted,
}
