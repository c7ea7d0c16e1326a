// Frame sources - the venue stream reduced to a pull interface
// WsFrameSource reconnects with exponential backoff (2s doubling to 60s,
// reset on a successful frame) and surfaces StreamReset so the book can
// resynchronize.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::core::config::ExchangeConfig;
use crate::core::types::StreamEvent;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Pull interface over a venue frame stream.
#[async_trait]
pub trait FrameSource: Send {
    /// Next event. Implementations handle reconnection internally and emit
    /// `StreamEvent::Reset` after re-establishing a connection.
    async fn next_event(&mut self) -> StreamEvent;

    async fn close(&mut self);
}

/// Live WebSocket source for one symbol's depth stream.
pub struct WsFrameSource {
    url: String,
    symbol: String,
    ws: Option<WsStream>,
    backoff: Duration,
    initial_backoff: Duration,
    max_backoff: Duration,
    /// True once we have connected at least once; later connects are resets.
    connected_before: bool,
    reconnect_count: u64,
    frame_count: u64,
}

impl WsFrameSource {
    pub fn new(symbol: &str, config: &ExchangeConfig) -> Self {
        let url = format!(
            "{}/{}@depth@100ms",
            config.ws_url.trim_end_matches('/'),
            symbol.to_lowercase()
        );
        Self {
            url,
            symbol: symbol.to_uppercase(),
            ws: None,
            backoff: Duration::from_secs(config.reconnect_delay_secs),
            initial_backoff: Duration::from_secs(config.reconnect_delay_secs),
            max_backoff: Duration::from_secs(config.max_reconnect_delay_secs),
            connected_before: false,
            reconnect_count: 0,
            frame_count: 0,
        }
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnect_count
    }

    /// Connect with backoff. Returns true when this is a reconnect rather
    /// than the first connection.
    async fn ensure_connected(&mut self) -> bool {
        let mut was_reconnect = false;
        while self.ws.is_none() {
            if self.connected_before {
                warn!(
                    symbol = %self.symbol,
                    delay_secs = self.backoff.as_secs(),
                    "Reconnecting after backoff"
                );
                tokio::time::sleep(self.backoff).await;
                self.backoff = (self.backoff * 2).min(self.max_backoff);
                was_reconnect = true;
            }

            match connect_async(self.url.as_str()).await {
                Ok((stream, _)) => {
                    info!(symbol = %self.symbol, url = %self.url, "WebSocket connected");
                    self.ws = Some(stream);
                    if self.connected_before {
                        self.reconnect_count += 1;
                    }
                    self.connected_before = true;
                }
                Err(e) => {
                    warn!(symbol = %self.symbol, error = %e, "WebSocket connect failed");
                    // First connection failures also back off
                    if !self.connected_before {
                        tokio::time::sleep(self.backoff).await;
                        self.backoff = (self.backoff * 2).min(self.max_backoff);
                    }
                }
            }
        }
        was_reconnect
    }
}

#[async_trait]
impl FrameSource for WsFrameSource {
    async fn next_event(&mut self) -> StreamEvent {
        loop {
            if self.ensure_connected().await {
                return StreamEvent::Reset;
            }

            let ws = self.ws.as_mut().expect("connected");
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    self.frame_count += 1;
                    // A live frame proves the connection is healthy
                    self.backoff = self.initial_backoff;
                    return StreamEvent::Frame(text.to_string());
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = ws.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(symbol = %self.symbol, frame = ?frame, "Server closed connection");
                    self.ws = None;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(symbol = %self.symbol, error = %e, "WebSocket read error");
                    self.ws = None;
                }
                None => {
                    debug!(symbol = %self.symbol, "WebSocket stream ended");
                    self.ws = None;
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut ws) = self.ws.take() {
            let _ = ws.close(None).await;
            info!(symbol = %self.symbol, frames = self.frame_count, "WebSocket closed");
        }
    }
}

/// In-memory source fed from a fixed script. Used by tests and replay.
pub struct ScriptedFrameSource {
    events: VecDeque<StreamEvent>,
    delay: Option<Duration>,
}

impl ScriptedFrameSource {
    pub fn new(events: Vec<StreamEvent>) -> Self {
        Self {
            events: events.into(),
            delay: None,
        }
    }

    /// Pace events at a fixed interval, approximating a live stream.
    pub fn with_delay(events: Vec<StreamEvent>, delay: Duration) -> Self {
        Self {
            events: events.into(),
            delay: Some(delay),
        }
    }
}

#[async_trait]
impl FrameSource for ScriptedFrameSource {
    async fn next_event(&mut self) -> StreamEvent {
        match self.events.pop_front() {
            Some(event) => {
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                event
            }
            None => StreamEvent::Closed,
        }
    }

    async fn close(&mut self) {
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_source_yields_then_closes() {
        let mut source = ScriptedFrameSource::new(vec![
            StreamEvent::Frame("a".to_string()),
            StreamEvent::Reset,
            StreamEvent::Frame("b".to_string()),
        ]);

        assert!(matches!(source.next_event().await, StreamEvent::Frame(f) if f == "a"));
        assert!(matches!(source.next_event().await, StreamEvent::Reset));
        assert!(matches!(source.next_event().await, StreamEvent::Frame(f) if f == "b"));
        assert!(matches!(source.next_event().await, StreamEvent::Closed));
        assert!(matches!(source.next_event().await, StreamEvent::Closed));
    }

    #[test]
    fn test_ws_url_built_from_config() {
        let config = ExchangeConfig::default();
        let source = WsFrameSource::new("BTCUSDT", &config);
        assert_eq!(
            source.url,
            "wss://fstream.binance.com/ws/btcusdt@depth@100ms"
        );
        assert_eq!(source.symbol, "BTCUSDT");
    }
}
