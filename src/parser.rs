// Frame parser - validates venue frames and converts numeric fields to
// exact decimals. Malformed frames are counted and dropped; this stage
// never propagates errors upstream.

use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use thiserror::Error;

use crate::core::types::{DepthDelta, DepthSnapshot, PriceLevel};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("invalid {field}: '{value}'")]
    InvalidDecimal { field: &'static str, value: String },
    #[error("unknown event type: {0}")]
    UnknownEvent(String),
    #[error("symbol mismatch: expected {expected}, got {got}")]
    SymbolMismatch { expected: String, got: String },
    #[error("inverted sequence range: {first_id} > {last_id}")]
    InvertedRange { first_id: u64, last_id: u64 },
}

/// Parser statistics.
#[derive(Debug, Clone, Default)]
pub struct ParserStats {
    pub frames_parsed: u64,
    pub parse_errors: u64,
    pub depth_updates: u64,
    pub snapshots: u64,
    pub unknown_events: u64,
}

impl ParserStats {
    pub fn error_rate(&self) -> f64 {
        let total = self.frames_parsed + self.parse_errors;
        if total > 0 {
            self.parse_errors as f64 / total as f64
        } else {
            0.0
        }
    }
}

/// Successfully parsed frame.
#[derive(Debug, Clone)]
pub enum ParsedFrame {
    Delta(DepthDelta),
    Snapshot(DepthSnapshot),
}

// ============================================================================
// Raw venue JSON structures
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawDepthUpdate {
    #[serde(rename = "e")]
    _event_type: String,
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    final_update_id: u64,
    #[serde(rename = "b")]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a")]
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
struct RawDepthSnapshot {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

fn parse_decimal(value: &str, field: &'static str) -> Result<Decimal, ParseError> {
    Decimal::from_str(value).map_err(|_| ParseError::InvalidDecimal {
        field,
        value: value.to_string(),
    })
}

fn parse_levels(raw: &[[String; 2]]) -> Result<Vec<PriceLevel>, ParseError> {
    raw.iter()
        .map(|[p, q]| {
            Ok(PriceLevel::new(
                parse_decimal(p, "price")?,
                parse_decimal(q, "quantity")?,
            ))
        })
        .collect()
}

/// Stateful per-symbol frame parser with counters.
pub struct MessageParser {
    pub symbol: String,
    pub stats: ParserStats,
}

impl MessageParser {
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            stats: ParserStats::default(),
        }
    }

    /// Parse a raw venue frame, auto-detecting the payload type.
    /// Counts the outcome either way.
    pub fn parse(&mut self, raw: &str) -> Result<ParsedFrame, ParseError> {
        match self.parse_inner(raw) {
            Ok(frame) => {
                self.stats.frames_parsed += 1;
                match &frame {
                    ParsedFrame::Delta(_) => self.stats.depth_updates += 1,
                    ParsedFrame::Snapshot(_) => self.stats.snapshots += 1,
                }
                Ok(frame)
            }
            Err(e) => {
                if matches!(e, ParseError::UnknownEvent(_)) {
                    self.stats.unknown_events += 1;
                } else {
                    self.stats.parse_errors += 1;
                }
                Err(e)
            }
        }
    }

    fn parse_inner(&self, raw: &str) -> Result<ParsedFrame, ParseError> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| ParseError::InvalidJson(e.to_string()))?;

        // Combined stream frames wrap the payload: {"stream": ..., "data": {...}}
        let data = value.get("data").unwrap_or(&value);

        // Snapshot payloads carry lastUpdateId and no event type
        if data.get("lastUpdateId").is_some() && data.get("e").is_none() {
            let raw: RawDepthSnapshot = serde_json::from_value(data.clone())
                .map_err(|e| ParseError::InvalidJson(e.to_string()))?;
            return Ok(ParsedFrame::Snapshot(DepthSnapshot {
                symbol: None,
                last_update_id: raw.last_update_id,
                bids: parse_levels(&raw.bids)?,
                asks: parse_levels(&raw.asks)?,
            }));
        }

        let event_type = data
            .get("e")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ParseError::InvalidJson("missing event type 'e'".to_string()))?;

        if event_type != "depthUpdate" {
            return Err(ParseError::UnknownEvent(event_type.to_string()));
        }

        let raw: RawDepthUpdate = serde_json::from_value(data.clone())
            .map_err(|e| ParseError::InvalidJson(e.to_string()))?;

        if raw.symbol.to_uppercase() != self.symbol {
            return Err(ParseError::SymbolMismatch {
                expected: self.symbol.clone(),
                got: raw.symbol,
            });
        }

        if raw.first_update_id > raw.final_update_id {
            return Err(ParseError::InvertedRange {
                first_id: raw.first_update_id,
                last_id: raw.final_update_id,
            });
        }

        Ok(ParsedFrame::Delta(DepthDelta {
            symbol: self.symbol.clone(),
            first_id: raw.first_update_id,
            last_id: raw.final_update_id,
            event_time_ms: raw.event_time,
            bids: parse_levels(&raw.bids)?,
            asks: parse_levels(&raw.asks)?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const DEPTH_UPDATE: &str = r#"{
        "e": "depthUpdate",
        "E": 1700000000123,
        "s": "BTCUSDT",
        "U": 157,
        "u": 160,
        "b": [["50000.00", "1.50"], ["49999.00", "0"]],
        "a": [["50010.00", "2.00"]]
    }"#;

    #[test]
    fn test_parse_depth_update() {
        let mut parser = MessageParser::new("BTCUSDT");
        let frame = parser.parse(DEPTH_UPDATE).unwrap();

        let ParsedFrame::Delta(delta) = frame else {
            panic!("expected delta");
        };
        assert_eq!(delta.first_id, 157);
        assert_eq!(delta.last_id, 160);
        assert_eq!(delta.event_time_ms, 1700000000123);
        assert_eq!(delta.bids.len(), 2);
        assert_eq!(delta.bids[0].price, dec!(50000.00));
        assert_eq!(delta.bids[0].qty, dec!(1.50));
        // Zero quantity survives parsing; removal happens in the book
        assert_eq!(delta.bids[1].qty, Decimal::ZERO);
        assert_eq!(parser.stats.depth_updates, 1);
    }

    #[test]
    fn test_parse_combined_stream_frame() {
        let mut parser = MessageParser::new("BTCUSDT");
        let wrapped = format!(r#"{{"stream": "btcusdt@depth@100ms", "data": {}}}"#, DEPTH_UPDATE);
        let frame = parser.parse(&wrapped).unwrap();
        assert!(matches!(frame, ParsedFrame::Delta(_)));
    }

    #[test]
    fn test_parse_snapshot() {
        let mut parser = MessageParser::new("BTCUSDT");
        let raw = r#"{
            "lastUpdateId": 1027024,
            "bids": [["50000.00", "1.00"]],
            "asks": [["50010.00", "2.00"]]
        }"#;
        let frame = parser.parse(raw).unwrap();

        let ParsedFrame::Snapshot(snap) = frame else {
            panic!("expected snapshot");
        };
        assert_eq!(snap.last_update_id, 1027024);
        assert_eq!(snap.bids[0].price, dec!(50000.00));
        assert_eq!(parser.stats.snapshots, 1);
    }

    #[test]
    fn test_malformed_json_counted() {
        let mut parser = MessageParser::new("BTCUSDT");
        assert!(parser.parse("{not json").is_err());
        assert!(parser.parse(r#"{"e": "depthUpdate"}"#).is_err());
        assert_eq!(parser.stats.parse_errors, 2);
        assert_eq!(parser.stats.frames_parsed, 0);
    }

    #[test]
    fn test_non_numeric_quantity_rejected() {
        let mut parser = MessageParser::new("BTCUSDT");
        let raw = r#"{
            "e": "depthUpdate", "E": 1, "s": "BTCUSDT", "U": 1, "u": 2,
            "b": [["50000.00", "abc"]], "a": []
        }"#;
        let err = parser.parse(raw).unwrap_err();
        assert!(matches!(err, ParseError::InvalidDecimal { .. }));
    }

    #[test]
    fn test_symbol_mismatch_rejected() {
        let mut parser = MessageParser::new("ETHUSDT");
        let err = parser.parse(DEPTH_UPDATE).unwrap_err();
        assert!(matches!(err, ParseError::SymbolMismatch { .. }));
    }

    #[test]
    fn test_unknown_event_counted_separately() {
        let mut parser = MessageParser::new("BTCUSDT");
        let raw = r#"{"e": "aggTrade", "s": "BTCUSDT"}"#;
        assert!(parser.parse(raw).is_err());
        assert_eq!(parser.stats.unknown_events, 1);
        assert_eq!(parser.stats.parse_errors, 0);
    }

    #[test]
    fn test_inverted_range_rejected() {
        let mut parser = MessageParser::new("BTCUSDT");
        let raw = r#"{
            "e": "depthUpdate", "E": 1, "s": "BTCUSDT", "U": 200, "u": 100,
            "b": [], "a": []
        }"#;
        let err = parser.parse(raw).unwrap_err();
        assert!(matches!(err, ParseError::InvertedRange { .. }));
    }

    #[test]
    fn test_empty_sides_are_valid() {
        let mut parser = MessageParser::new("BTCUSDT");
        let raw = r#"{
            "e": "depthUpdate", "E": 1, "s": "BTCUSDT", "U": 5, "u": 6,
            "b": [], "a": []
        }"#;
        let frame = parser.parse(raw).unwrap();
        let ParsedFrame::Delta(delta) = frame else {
            panic!("expected delta");
        };
        assert!(delta.bids.is_empty());
        assert!(delta.asks.is_empty());
    }
}
