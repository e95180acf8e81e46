// =============================================================================
// Stream wire codec — Advanced Trade WebSocket frames
// =============================================================================
//
// Outbound control frames (field order is part of the wire contract):
//
//   {"type":"subscribe","channel":"ticker","product_ids":["BTC-USD"],"jwt":"..."}
//   {"type":"unsubscribe","channel":"ticker","product_ids":["BTC-USD"],"jwt":"..."}
//   {"type":"subscribe","channel":"heartbeats"}
//
// Inbound frames are decoded once, here, into the closed `StreamMessage` sum
// type. Nothing past this module looks at raw JSON.
// =============================================================================

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::coinbase::de::{lenient_f64, lenient_i64, lenient_opt_f64};
use crate::market_data::{Candle, Ticker};

pub const HEARTBEATS_CHANNEL: &str = "heartbeats";
pub const TICKER_CHANNEL: &str = "ticker";
pub const CANDLES_CHANNEL: &str = "candles";

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Subscribe,
    Unsubscribe,
}

impl std::fmt::Display for ControlAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Subscribe => write!(f, "subscribe"),
            Self::Unsubscribe => write!(f, "unsubscribe"),
        }
    }
}

#[derive(Serialize)]
struct ControlFrame<'a> {
    #[serde(rename = "type")]
    action: ControlAction,
    channel: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    product_ids: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    jwt: Option<&'a str>,
}

/// Serialize a subscribe / unsubscribe frame.
pub fn encode_control(
    action: ControlAction,
    channel: &str,
    product_ids: Option<&[String]>,
    jwt: Option<&str>,
) -> Result<String> {
    let frame = ControlFrame {
        action,
        channel,
        product_ids,
        jwt,
    };
    serde_json::to_string(&frame).context("failed to encode control frame")
}

/// The keep-alive subscription sent on every open. Carries neither products
/// nor a token.
pub fn heartbeat_subscription() -> Result<String> {
    encode_control(ControlAction::Subscribe, HEARTBEATS_CHANNEL, None, None)
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Every inbound frame kind the engine understands.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Tickers(Vec<Ticker>),
    /// Five-minute bars from the `candles` channel.
    Candles(Vec<Candle>),
    Heartbeat { counter: u64 },
    /// Server's view of the active subscriptions, channel -> products.
    Subscriptions(BTreeMap<String, Vec<String>>),
    Error(String),
    /// A channel this engine does not consume.
    Ignored(String),
}

#[derive(Deserialize)]
struct Envelope {
    channel: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    message: Option<String>,
    timestamp: Option<String>,
    #[serde(default)]
    events: Vec<Value>,
}

#[derive(Deserialize)]
struct TickerEvent {
    #[serde(default)]
    tickers: Vec<WireTicker>,
}

#[derive(Deserialize)]
struct WireTicker {
    product_id: String,
    #[serde(deserialize_with = "lenient_f64")]
    price: f64,
    #[serde(deserialize_with = "lenient_opt_f64", default)]
    volume_24_h: Option<f64>,
    #[serde(deserialize_with = "lenient_opt_f64", default)]
    price_percent_chg_24_h: Option<f64>,
    #[serde(deserialize_with = "lenient_opt_f64", default)]
    high_24_h: Option<f64>,
    #[serde(deserialize_with = "lenient_opt_f64", default)]
    low_24_h: Option<f64>,
    #[serde(deserialize_with = "lenient_opt_f64", default)]
    high_52_w: Option<f64>,
    #[serde(deserialize_with = "lenient_opt_f64", default)]
    low_52_w: Option<f64>,
    #[serde(deserialize_with = "lenient_opt_f64", default)]
    best_bid: Option<f64>,
    #[serde(deserialize_with = "lenient_opt_f64", default)]
    best_ask: Option<f64>,
    #[serde(deserialize_with = "lenient_opt_f64", default)]
    best_bid_quantity: Option<f64>,
    #[serde(deserialize_with = "lenient_opt_f64", default)]
    best_ask_quantity: Option<f64>,
}

impl WireTicker {
    fn into_ticker(self, timestamp: DateTime<Utc>) -> Ticker {
        Ticker {
            product_id: self.product_id,
            price: self.price,
            volume_24h: self.volume_24_h,
            percent_change_24h: self.price_percent_chg_24_h,
            high_24h: self.high_24_h,
            low_24h: self.low_24_h,
            high_52w: self.high_52_w,
            low_52w: self.low_52_w,
            best_bid: self.best_bid,
            best_ask: self.best_ask,
            best_bid_quantity: self.best_bid_quantity,
            best_ask_quantity: self.best_ask_quantity,
            timestamp,
        }
    }
}

#[derive(Deserialize)]
struct CandleEvent {
    #[serde(default)]
    candles: Vec<WireCandle>,
}

#[derive(Deserialize)]
struct WireCandle {
    product_id: String,
    #[serde(deserialize_with = "lenient_i64")]
    start: i64,
    #[serde(deserialize_with = "lenient_f64")]
    open: f64,
    #[serde(deserialize_with = "lenient_f64")]
    high: f64,
    #[serde(deserialize_with = "lenient_f64")]
    low: f64,
    #[serde(deserialize_with = "lenient_f64")]
    close: f64,
    #[serde(deserialize_with = "lenient_opt_f64", default)]
    volume: Option<f64>,
}

#[derive(Deserialize)]
struct HeartbeatEvent {
    #[serde(default)]
    heartbeat_counter: u64,
}

#[derive(Deserialize)]
struct SubscriptionsEvent {
    #[serde(default)]
    subscriptions: BTreeMap<String, Vec<String>>,
}

/// Decode one text frame.
pub fn decode_frame(text: &str) -> Result<StreamMessage> {
    let envelope: Envelope = serde_json::from_str(text).context("frame is not valid JSON")?;

    if envelope.kind.as_deref() == Some("error") {
        return Ok(StreamMessage::Error(
            envelope.message.unwrap_or_else(|| "unknown stream error".into()),
        ));
    }

    let channel = envelope.channel.context("frame has no channel")?;
    match channel.as_str() {
        TICKER_CHANNEL => {
            let timestamp = envelope
                .timestamp
                .as_deref()
                .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                .map(|ts| ts.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);
            let mut tickers = Vec::new();
            for event in envelope.events {
                let event: TickerEvent =
                    serde_json::from_value(event).context("malformed ticker event")?;
                tickers.extend(event.tickers.into_iter().map(|t| t.into_ticker(timestamp)));
            }
            Ok(StreamMessage::Tickers(tickers))
        }
        CANDLES_CHANNEL => {
            let mut candles = Vec::new();
            for event in envelope.events {
                let event: CandleEvent =
                    serde_json::from_value(event).context("malformed candles event")?;
                candles.extend(event.candles.into_iter().map(|c| Candle {
                    product_id: c.product_id,
                    start: c.start,
                    open: c.open,
                    high: c.high,
                    low: c.low,
                    close: c.close,
                    volume: c.volume.unwrap_or_default(),
                }));
            }
            Ok(StreamMessage::Candles(candles))
        }
        HEARTBEATS_CHANNEL => {
            let counter = envelope
                .events
                .into_iter()
                .filter_map(|e| serde_json::from_value::<HeartbeatEvent>(e).ok())
                .map(|e| e.heartbeat_counter)
                .max()
                .unwrap_or(0);
            Ok(StreamMessage::Heartbeat { counter })
        }
        "subscriptions" => {
            let mut merged = BTreeMap::new();
            for event in envelope.events {
                let event: SubscriptionsEvent =
                    serde_json::from_value(event).context("malformed subscriptions event")?;
                merged.extend(event.subscriptions);
            }
            Ok(StreamMessage::Subscriptions(merged))
        }
        _ => Ok(StreamMessage::Ignored(channel)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_frame_is_bit_exact() {
        let ids = vec!["BTC-USD".to_string(), "ETH-USD".to_string()];
        let frame =
            encode_control(ControlAction::Subscribe, TICKER_CHANNEL, Some(&ids), Some("tok")).unwrap();
        assert_eq!(
            frame,
            r#"{"type":"subscribe","channel":"ticker","product_ids":["BTC-USD","ETH-USD"],"jwt":"tok"}"#
        );
    }

    #[test]
    fn unsubscribe_frame_without_token_omits_jwt() {
        let ids = vec!["BTC-USD".to_string()];
        let frame = encode_control(ControlAction::Unsubscribe, CANDLES_CHANNEL, Some(&ids), None).unwrap();
        assert_eq!(
            frame,
            r#"{"type":"unsubscribe","channel":"candles","product_ids":["BTC-USD"]}"#
        );
    }

    #[test]
    fn heartbeat_frame_has_no_products_or_token() {
        assert_eq!(
            heartbeat_subscription().unwrap(),
            r#"{"type":"subscribe","channel":"heartbeats"}"#
        );
    }

    #[test]
    fn decodes_ticker_update() {
        let json = r#"{
            "channel": "ticker",
            "client_id": "",
            "timestamp": "2023-02-09T20:30:37.167359596Z",
            "sequence_num": 0,
            "events": [{
                "type": "update",
                "tickers": [{
                    "type": "ticker",
                    "product_id": "BTC-USD",
                    "price": "21932.98",
                    "volume_24_h": "16038.28770938",
                    "low_24_h": "21835.29",
                    "high_24_h": "23011.18",
                    "low_52_w": "15460",
                    "high_52_w": "48240",
                    "price_percent_chg_24_h": "-4.15775596190603",
                    "best_bid": "21931.98",
                    "best_bid_quantity": "8000.21",
                    "best_ask": "21933.98",
                    "best_ask_quantity": "8038.07770147"
                }]
            }]
        }"#;

        let StreamMessage::Tickers(tickers) = decode_frame(json).unwrap() else {
            panic!("expected tickers");
        };
        assert_eq!(tickers.len(), 1);
        let t = &tickers[0];
        assert_eq!(t.product_id, "BTC-USD");
        assert!((t.price - 21932.98).abs() < 1e-9);
        assert!((t.percent_change_24h.unwrap() + 4.15775596190603).abs() < 1e-9);
        assert_eq!(t.high_52w, Some(48240.0));
        assert_eq!(t.timestamp.timestamp(), 1_675_974_637);
    }

    #[test]
    fn decodes_candles_snapshot() {
        let json = r#"{
            "channel": "candles",
            "events": [{
                "type": "snapshot",
                "candles": [{
                    "start": "1688998200",
                    "high": "1867.72",
                    "low": "1865.63",
                    "open": "1867.38",
                    "close": "1866.81",
                    "volume": "0.20269406",
                    "product_id": "ETH-USD"
                }]
            }]
        }"#;
        let StreamMessage::Candles(candles) = decode_frame(json).unwrap() else {
            panic!("expected candles");
        };
        assert_eq!(candles[0].start, 1_688_998_200);
        assert_eq!(candles[0].product_id, "ETH-USD");
        assert!((candles[0].close - 1866.81).abs() < 1e-9);
    }

    #[test]
    fn decodes_control_channels() {
        let hb = r#"{"channel":"heartbeats","events":[{"current_time":"x","heartbeat_counter":3}]}"#;
        assert_eq!(decode_frame(hb).unwrap(), StreamMessage::Heartbeat { counter: 3 });

        let subs = r#"{"channel":"subscriptions","events":[{"subscriptions":{"ticker":["BTC-USD"]}}]}"#;
        let StreamMessage::Subscriptions(map) = decode_frame(subs).unwrap() else {
            panic!("expected subscriptions");
        };
        assert_eq!(map["ticker"], vec!["BTC-USD".to_string()]);

        let err = r#"{"type":"error","message":"authentication failure"}"#;
        assert_eq!(
            decode_frame(err).unwrap(),
            StreamMessage::Error("authentication failure".into())
        );

        let other = r#"{"channel":"level2","events":[]}"#;
        assert_eq!(decode_frame(other).unwrap(), StreamMessage::Ignored("level2".into()));
    }

    #[test]
    fn malformed_frames_are_errors_not_panics() {
        assert!(decode_frame("not json").is_err());
        assert!(decode_frame(r#"{"events":[]}"#).is_err());
        assert!(decode_frame(r#"{"channel":"ticker","events":[{"tickers":[{"product_id":"X","price":"abc"}]}]}"#).is_err());
    }

    #[test]
    fn blank_ticker_statistics_decode_as_absent() {
        let json = r#"{
            "channel": "ticker",
            "timestamp": "2023-02-09T20:30:37.167359596Z",
            "events": [{
                "type": "update",
                "tickers": [{
                    "product_id": "BTC-USD",
                    "price": "21932.98",
                    "best_bid": "",
                    "best_ask": null,
                    "volume_24_h": "16038.28770938"
                }]
            }]
        }"#;

        let StreamMessage::Tickers(tickers) = decode_frame(json).unwrap() else {
            panic!("expected tickers");
        };
        let t = &tickers[0];
        assert_eq!(t.best_bid, None);
        assert_eq!(t.best_ask, None);
        assert_eq!(t.high_52w, None);
        assert!((t.volume_24h.unwrap() - 16038.28770938).abs() < 1e-9);
    }

    #[test]
    fn blank_ticker_price_is_malformed() {
        for price in [r#""""#, r#""  ""#, "null"] {
            let frame = format!(
                r#"{{"channel":"ticker","events":[{{"tickers":[{{"product_id":"BTC-USD","price":{price}}}]}}]}}"#
            );
            let err = decode_frame(&frame).unwrap_err();
            assert!(format!("{err:#}").contains("malformed ticker event"), "{err:#}");
        }
    }
}
