//! Stream Codec Module
//!
//! JSON encoding and decoding for the upstream price feed.
//!
//! # Inbound
//!
//! Feeds disagree on shape and field names, so decoding is lenient. A frame
//! may be a single object, an array of objects, or an envelope whose `data`
//! field holds either:
//!
//! ```json
//! {"symbol":"EURUSD","price":1.0851}
//! [{"s":"EUR/USD","p":"1.0851"},{"s":"USD/JPY","p":"151.20"}]
//! {"type":"ticker","data":{"ticker":"AAPL","last":189.5,"v":1200}}
//! ```
//!
//! Control messages (acks, pongs, status) are recognized by their `type`,
//! `event` or `T` field and counted separately. Entries without a symbol or
//! a usable price are counted as malformed and dropped.
//!
//! # Outbound
//!
//! ```json
//! {"action":"subscribe","symbols":["EURUSD","XAUUSD"]}
//! {"action":"unsubscribe","symbols":["USDJPY"]}
//! ```

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::domain::streaming::RawTick;
use crate::domain::subscription::WireInstruction;

/// Symbol field names, tried in order.
const SYMBOL_KEYS: &[&str] = &[
    "symbol",
    "s",
    "S",
    "ticker",
    "code",
    "pair",
    "instrument",
    "product_id",
];

/// Price field names, tried in order.
const PRICE_KEYS: &[&str] = &[
    "price",
    "p",
    "last",
    "lastPrice",
    "last_price",
    "c",
    "close",
    "mid",
    "bid",
];

const OPEN_KEYS: &[&str] = &["open", "o"];
const HIGH_KEYS: &[&str] = &["high", "h"];
const LOW_KEYS: &[&str] = &["low", "l"];
const CLOSE_KEYS: &[&str] = &["close", "c"];
const VOLUME_KEYS: &[&str] = &["volume", "v"];
const TIMESTAMP_KEYS: &[&str] = &["timestamp", "ts", "time", "t"];

/// Field names that carry a message type.
const TYPE_KEYS: &[&str] = &["type", "event", "T"];

/// Message types that never carry prices.
const CONTROL_TYPES: &[&str] = &[
    "subscribed",
    "unsubscribed",
    "ack",
    "pong",
    "heartbeat",
    "status",
    "welcome",
    "info",
];

/// Epoch values above this are milliseconds.
const MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Valid JSON that is neither an object nor an array.
    #[error("invalid frame format: {0}")]
    InvalidFormat(String),
}

/// Result of decoding one inbound frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedFrame {
    /// Price ticks in frame order.
    pub ticks: Vec<RawTick>,
    /// Entries dropped for missing symbol or price.
    pub malformed: usize,
    /// Control entries ignored.
    pub control: usize,
}

#[derive(Serialize)]
struct ActionMessage<'a> {
    action: &'static str,
    symbols: &'a [String],
}

/// JSON codec for the price feed.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonFrameCodec;

impl JsonFrameCodec {
    /// Create a new JSON codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode an inbound text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not JSON or is a JSON scalar.
    pub fn decode(&self, text: &str) -> Result<DecodedFrame, CodecError> {
        let value: Value = serde_json::from_str(text.trim())?;
        let mut frame = DecodedFrame::default();

        match value {
            Value::Object(object) => self.decode_object(&object, true, &mut frame),
            Value::Array(items) => self.decode_array(&items, true, &mut frame),
            other => {
                let shown: String = other.to_string().chars().take(50).collect();
                return Err(CodecError::InvalidFormat(format!(
                    "expected JSON object or array, got: {shown}"
                )));
            }
        }

        Ok(frame)
    }

    /// Encode an instruction as one message per non-empty side.
    ///
    /// Subscribes are sent before unsubscribes.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self, instruction: &WireInstruction) -> Result<Vec<String>, CodecError> {
        let mut messages = Vec::with_capacity(2);

        if !instruction.subscribe.is_empty() {
            messages.push(serde_json::to_string(&ActionMessage {
                action: "subscribe",
                symbols: &instruction.subscribe,
            })?);
        }
        if !instruction.unsubscribe.is_empty() {
            messages.push(serde_json::to_string(&ActionMessage {
                action: "unsubscribe",
                symbols: &instruction.unsubscribe,
            })?);
        }

        Ok(messages)
    }

    fn decode_array(&self, items: &[Value], allow_envelope: bool, frame: &mut DecodedFrame) {
        for item in items {
            match item {
                Value::Object(object) => self.decode_object(object, allow_envelope, frame),
                _ => frame.malformed += 1,
            }
        }
    }

    fn decode_object(
        &self,
        object: &Map<String, Value>,
        allow_envelope: bool,
        frame: &mut DecodedFrame,
    ) {
        if is_control(object) {
            frame.control += 1;
            return;
        }

        // Envelope: {"type":"...","data":{...} | [...]}
        if allow_envelope && !has_any(object, SYMBOL_KEYS) {
            match object.get("data") {
                Some(Value::Object(inner)) => return self.decode_object(inner, false, frame),
                Some(Value::Array(items)) => return self.decode_array(items, false, frame),
                _ => {}
            }
        }

        match extract_tick(object) {
            Some(tick) => frame.ticks.push(tick),
            None => frame.malformed += 1,
        }
    }
}

// =============================================================================
// Field Extraction
// =============================================================================

fn is_control(object: &Map<String, Value>) -> bool {
    TYPE_KEYS.iter().any(|key| {
        object
            .get(*key)
            .and_then(Value::as_str)
            .is_some_and(|kind| CONTROL_TYPES.contains(&kind.to_ascii_lowercase().as_str()))
    })
}

fn has_any(object: &Map<String, Value>, keys: &[&str]) -> bool {
    keys.iter().any(|key| object.contains_key(*key))
}

fn extract_tick(object: &Map<String, Value>) -> Option<RawTick> {
    let symbol = SYMBOL_KEYS
        .iter()
        .filter_map(|key| object.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())?;

    let price = first_decimal(object, PRICE_KEYS)?;

    Some(RawTick {
        symbol: symbol.to_string(),
        price,
        open: first_decimal(object, OPEN_KEYS),
        high: first_decimal(object, HIGH_KEYS),
        low: first_decimal(object, LOW_KEYS),
        close: first_decimal(object, CLOSE_KEYS),
        volume: first_decimal(object, VOLUME_KEYS),
        timestamp: TIMESTAMP_KEYS
            .iter()
            .find_map(|key| object.get(*key).and_then(parse_timestamp)),
    })
}

fn first_decimal(object: &Map<String, Value>, keys: &[&str]) -> Option<Decimal> {
    keys.iter()
        .find_map(|key| object.get(*key).and_then(parse_decimal))
}

fn parse_decimal(value: &Value) -> Option<Decimal> {
    let text = match value {
        Value::Number(number) => number.to_string(),
        Value::String(text) => text.trim().to_string(),
        _ => return None,
    };

    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(number) => {
            if let Some(whole) = number.as_i64() {
                from_epoch(whole)
            } else {
                number.as_f64().and_then(from_epoch_float)
            }
        }
        Value::String(text) => {
            let text = text.trim();
            if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                return Some(parsed.with_timezone(&Utc));
            }
            if let Ok(whole) = text.parse::<i64>() {
                return from_epoch(whole);
            }
            text.parse::<f64>().ok().and_then(from_epoch_float)
        }
        _ => None,
    }
}

fn from_epoch(value: i64) -> Option<DateTime<Utc>> {
    if value.abs() >= MILLIS_THRESHOLD {
        DateTime::from_timestamp_millis(value)
    } else {
        DateTime::from_timestamp(value, 0)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn from_epoch_float(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() {
        return None;
    }
    let millis = if value.abs() >= 1e11 {
        value
    } else {
        value * 1000.0
    };
    DateTime::from_timestamp_millis(millis.round() as i64)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn decode(text: &str) -> DecodedFrame {
        JsonFrameCodec::new().decode(text).unwrap()
    }

    #[test]
    fn decode_single_object() {
        let frame = decode(r#"{"symbol":"EURUSD","price":1.0851}"#);

        assert_eq!(frame.ticks.len(), 1);
        assert_eq!(frame.ticks[0].symbol, "EURUSD");
        assert_eq!(frame.ticks[0].price, dec("1.0851"));
        assert_eq!(frame.malformed, 0);
    }

    #[test]
    fn decode_array_of_objects() {
        let frame = decode(r#"[{"s":"EUR/USD","p":"1.0851"},{"s":"USD/JPY","p":"151.20"}]"#);

        assert_eq!(frame.ticks.len(), 2);
        assert_eq!(frame.ticks[0].symbol, "EUR/USD");
        assert_eq!(frame.ticks[1].price, dec("151.20"));
    }

    #[test]
    fn decode_envelope_object() {
        let frame = decode(r#"{"type":"ticker","data":{"ticker":"AAPL","last":189.5,"v":1200}}"#);

        assert_eq!(frame.ticks.len(), 1);
        assert_eq!(frame.ticks[0].symbol, "AAPL");
        assert_eq!(frame.ticks[0].volume, Some(dec("1200")));
    }

    #[test]
    fn decode_envelope_array() {
        let frame = decode(r#"{"data":[{"pair":"BTCUSD","mid":"64000.5"},{"pair":"ETHUSD"}]}"#);

        assert_eq!(frame.ticks.len(), 1);
        assert_eq!(frame.ticks[0].price, dec("64000.5"));
        assert_eq!(frame.malformed, 1);
    }

    #[test_case("symbol" ; "symbol")]
    #[test_case("s" ; "lowercase s")]
    #[test_case("S" ; "uppercase S")]
    #[test_case("ticker" ; "ticker")]
    #[test_case("code" ; "code")]
    #[test_case("pair" ; "pair")]
    #[test_case("instrument" ; "instrument")]
    #[test_case("product_id" ; "product id")]
    fn symbol_keys(key: &str) {
        let frame = decode(&format!(r#"{{"{key}":"XAUUSD","price":2300}}"#));
        assert_eq!(frame.ticks[0].symbol, "XAUUSD");
    }

    #[test_case("price" ; "price")]
    #[test_case("p" ; "p")]
    #[test_case("last" ; "last")]
    #[test_case("lastPrice" ; "camel last price")]
    #[test_case("last_price" ; "snake last price")]
    #[test_case("c" ; "c")]
    #[test_case("close" ; "close")]
    #[test_case("mid" ; "mid")]
    #[test_case("bid" ; "bid")]
    fn price_keys(key: &str) {
        let frame = decode(&format!(r#"{{"symbol":"SPX","{key}":"5200.25"}}"#));
        assert_eq!(frame.ticks[0].price, dec("5200.25"));
    }

    #[test]
    fn price_key_precedence() {
        let frame = decode(r#"{"symbol":"SPX","bid":1,"last":2,"price":3}"#);
        assert_eq!(frame.ticks[0].price, dec("3"));
    }

    #[test]
    fn ohlc_fields() {
        let frame = decode(r#"{"symbol":"NDX","price":18000,"o":17900,"h":18100,"l":17850,"c":17950}"#);
        let tick = &frame.ticks[0];

        assert_eq!(tick.open, Some(dec("17900")));
        assert_eq!(tick.high, Some(dec("18100")));
        assert_eq!(tick.low, Some(dec("17850")));
        assert_eq!(tick.close, Some(dec("17950")));
    }

    #[test]
    fn missing_price_is_malformed() {
        let frame = decode(r#"[{"symbol":"EURUSD"},{"symbol":"EURUSD","price":"n/a"}]"#);
        assert!(frame.ticks.is_empty());
        assert_eq!(frame.malformed, 2);
    }

    #[test]
    fn empty_symbol_is_malformed() {
        let frame = decode(r#"{"symbol":"  ","price":1}"#);
        assert!(frame.ticks.is_empty());
        assert_eq!(frame.malformed, 1);
    }

    #[test]
    fn non_object_array_items_are_malformed() {
        let frame = decode(r#"[1, "x", {"s":"A","p":1}]"#);
        assert_eq!(frame.ticks.len(), 1);
        assert_eq!(frame.malformed, 2);
    }

    #[test_case(r#"{"type":"subscribed","symbols":["EURUSD"]}"# ; "subscribed ack")]
    #[test_case(r#"{"event":"heartbeat"}"# ; "heartbeat event")]
    #[test_case(r#"{"T":"status","S":"AAPL","price":1}"# ; "status with symbol")]
    #[test_case(r#"{"type":"Welcome"}"# ; "case insensitive")]
    fn control_frames(text: &str) {
        let frame = decode(text);
        assert!(frame.ticks.is_empty());
        assert_eq!(frame.control, 1);
        assert_eq!(frame.malformed, 0);
    }

    #[test]
    fn invalid_json_is_error() {
        assert!(matches!(
            JsonFrameCodec::new().decode("not json"),
            Err(CodecError::Json(_))
        ));
    }

    #[test]
    fn scalar_json_is_error() {
        assert!(matches!(
            JsonFrameCodec::new().decode("42"),
            Err(CodecError::InvalidFormat(_))
        ));
    }

    #[test]
    fn timestamp_epoch_seconds() {
        let frame = decode(r#"{"s":"A","p":1,"ts":1700000000}"#);
        assert_eq!(
            frame.ticks[0].timestamp,
            DateTime::from_timestamp(1_700_000_000, 0)
        );
    }

    #[test]
    fn timestamp_epoch_millis() {
        let frame = decode(r#"{"s":"A","p":1,"t":1700000000123}"#);
        assert_eq!(
            frame.ticks[0].timestamp,
            DateTime::from_timestamp_millis(1_700_000_000_123)
        );
    }

    #[test]
    fn timestamp_fractional_seconds() {
        let frame = decode(r#"{"s":"A","p":1,"time":1700000000.5}"#);
        assert_eq!(
            frame.ticks[0].timestamp,
            DateTime::from_timestamp_millis(1_700_000_000_500)
        );
    }

    #[test]
    fn timestamp_rfc3339() {
        let frame = decode(r#"{"s":"A","p":1,"timestamp":"2024-03-15T14:30:00Z"}"#);
        assert_eq!(
            frame.ticks[0].timestamp.unwrap().to_rfc3339(),
            "2024-03-15T14:30:00+00:00"
        );
    }

    #[test]
    fn scientific_price() {
        let frame = decode(r#"{"s":"SHIBUSD","p":1.2e-5}"#);
        assert_eq!(frame.ticks[0].price, dec("0.000012"));
    }

    #[test]
    fn encode_both_sides() {
        let instruction = WireInstruction {
            subscribe: vec!["EURUSD".into(), "XAUUSD".into()],
            unsubscribe: vec!["USDJPY".into()],
        };

        let messages = JsonFrameCodec::new().encode(&instruction).unwrap();

        assert_eq!(
            messages,
            vec![
                r#"{"action":"subscribe","symbols":["EURUSD","XAUUSD"]}"#,
                r#"{"action":"unsubscribe","symbols":["USDJPY"]}"#,
            ]
        );
    }

    #[test]
    fn encode_skips_empty_side() {
        let instruction = WireInstruction::subscribe_only(vec!["SPX".to_string()]);
        let messages = JsonFrameCodec::new().encode(&instruction).unwrap();
        assert_eq!(messages, vec![r#"{"action":"subscribe","symbols":["SPX"]}"#]);
    }

    #[test]
    fn encode_empty_instruction() {
        let messages = JsonFrameCodec::new()
            .encode(&WireInstruction::default())
            .unwrap();
        assert!(messages.is_empty());
    }
}
