//! Upstream wire envelope.
//!
//! The gateway never interprets business payloads. It only reads the
//! envelope fields below; everything else rides along as `serde_json::Value`.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::types::{Candle, Tick};

/// Error object attached to a failed upstream response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EchoReq {
    #[serde(default)]
    pub req_id: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionRef {
    pub id: String,
}

/// The fields of an inbound message the client routes on.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub req_id: Option<u64>,
    #[serde(default)]
    pub echo_req: Option<EchoReq>,
    #[serde(default)]
    pub error: Option<ApiError>,
    #[serde(default)]
    pub subscription: Option<SubscriptionRef>,
    #[serde(default)]
    pub msg_type: Option<String>,
}

impl Envelope {
    /// Extract the envelope from an already-parsed message. Fields with an
    /// unexpected shape are treated as absent rather than failing the whole
    /// message.
    pub fn from_value(msg: &Value) -> Self {
        Self::deserialize(msg).unwrap_or_else(|_| Self {
            req_id: msg.get("req_id").and_then(Value::as_u64),
            echo_req: None,
            error: None,
            subscription: None,
            msg_type: msg.get("msg_type").and_then(Value::as_str).map(str::to_string),
        })
    }

    /// The request id, whether echoed at top level or under `echo_req`.
    pub fn request_id(&self) -> Option<u64> {
        self.req_id
            .or_else(|| self.echo_req.as_ref().and_then(|e| e.req_id))
    }

    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription.as_ref().map(|s| s.id.as_str())
    }
}

/// Attach `req_id` to an outgoing payload.
pub fn attach_req_id(payload: Value, req_id: u64) -> Result<Value, String> {
    match payload {
        Value::Object(mut map) => {
            map.insert("req_id".to_string(), Value::from(req_id));
            Ok(Value::Object(map))
        }
        other => Err(format!("payload must be a JSON object, got {other}")),
    }
}

// ---------------------------------------------------------------------------
// Request builders
// ---------------------------------------------------------------------------

pub fn ping() -> Value {
    json!({ "ping": 1 })
}

pub fn authorize(token: &str) -> Value {
    json!({ "authorize": token })
}

pub fn forget(subscription_id: &str) -> Value {
    json!({ "forget": subscription_id })
}

pub fn ticks_subscribe(asset: &str) -> Value {
    json!({ "ticks": asset, "subscribe": 1 })
}

pub fn balance() -> Value {
    json!({ "balance": 1 })
}

/// `ticks_history` in candle style, ending now.
pub fn candle_history(asset: &str, granularity_secs: u32, count: usize) -> Value {
    json!({
        "ticks_history": asset,
        "style": "candles",
        "granularity": granularity_secs,
        "count": count,
        "end": "latest",
        "adjust_start_time": 1,
    })
}

/// Buy a contract. `parameters` is passed through untouched.
pub fn buy(price: f64, parameters: Map<String, Value>) -> Value {
    json!({ "buy": 1, "price": price, "parameters": parameters })
}

// ---------------------------------------------------------------------------
// Payload parsers
// ---------------------------------------------------------------------------

/// Parse a `{ "tick": { "symbol", "quote", "epoch" } }` push.
pub fn parse_tick(msg: &Value) -> Option<Tick> {
    let tick = msg.get("tick")?;
    let asset = tick.get("symbol")?.as_str()?;
    let price = number(tick.get("quote")?).ok()?;
    let epoch = tick.get("epoch")?.as_i64()?;
    Some(Tick::new(asset, price, epoch.checked_mul(1000)?))
}

/// Parse the `candles` array of a `ticks_history` response.
///
/// Expected shape:
/// ```json
/// { "candles": [ { "epoch": 1700000040, "open": 1.0, "high": 2.0, "low": 0.5, "close": 1.5 } ] }
/// ```
pub fn parse_history_candles(msg: &Value, asset: &str, timeframe_secs: u32) -> Result<Vec<Candle>> {
    let rows = msg
        .get("candles")
        .and_then(Value::as_array)
        .context("history response missing 'candles' array")?;

    rows.iter()
        .map(|row| {
            Ok(Candle {
                asset: asset.to_string(),
                timeframe_secs,
                timestamp: row["epoch"].as_i64().context("missing field epoch")?,
                open: number(&row["open"]).context("open")?,
                high: number(&row["high"]).context("high")?,
                low: number(&row["low"]).context("low")?,
                close: number(&row["close"]).context("close")?,
            })
        })
        .collect()
}

/// Prices sometimes arrive as JSON strings.
fn number(val: &Value) -> Result<f64> {
    match val {
        Value::Number(n) => n.as_f64().context("number is not a valid f64"),
        Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {s} as f64")),
        _ => anyhow::bail!("field has unexpected JSON type"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_reads_top_level_and_echoed_req_id() {
        let top = Envelope::from_value(&json!({ "req_id": 7, "msg_type": "ping" }));
        assert_eq!(top.request_id(), Some(7));
        assert_eq!(top.msg_type.as_deref(), Some("ping"));

        let nested = Envelope::from_value(&json!({ "echo_req": { "ping": 1, "req_id": 9 } }));
        assert_eq!(nested.request_id(), Some(9));

        let none = Envelope::from_value(&json!({ "msg_type": "tick" }));
        assert_eq!(none.request_id(), None);
    }

    #[test]
    fn envelope_reads_error_and_subscription() {
        let msg = json!({
            "error": { "code": "InvalidSymbol", "message": "Symbol XYZ invalid" },
            "subscription": { "id": "abc-123" },
            "req_id": 3
        });
        let env = Envelope::from_value(&msg);
        assert_eq!(env.error.as_ref().unwrap().code, "InvalidSymbol");
        assert_eq!(env.subscription_id(), Some("abc-123"));
    }

    #[test]
    fn envelope_tolerates_odd_shapes() {
        let env = Envelope::from_value(&json!({ "req_id": 4, "subscription": "weird" }));
        assert_eq!(env.request_id(), Some(4));
        assert!(env.subscription_id().is_none());
    }

    #[test]
    fn attach_req_id_requires_object() {
        let out = attach_req_id(json!({ "ping": 1 }), 12).unwrap();
        assert_eq!(out["req_id"], 12);
        assert!(attach_req_id(json!([1, 2]), 1).is_err());
    }

    #[test]
    fn parse_tick_converts_epoch_to_millis() {
        let msg = json!({
            "msg_type": "tick",
            "tick": { "symbol": "R_100", "quote": 1234.56, "epoch": 1700000000, "id": "x" },
            "subscription": { "id": "x" }
        });
        let tick = parse_tick(&msg).unwrap();
        assert_eq!(tick.asset, "R_100");
        assert_eq!(tick.timestamp_ms, 1_700_000_000_000);
        assert!((tick.price - 1234.56).abs() < f64::EPSILON);

        assert!(parse_tick(&json!({ "tick": { "symbol": "R_100" } })).is_none());
    }

    #[test]
    fn parse_history_accepts_numbers_and_strings() {
        let msg = json!({
            "candles": [
                { "epoch": 60, "open": 1.0, "high": "2.5", "low": 0.5, "close": "1.5" },
                { "epoch": 120, "open": "1.5", "high": 3.0, "low": 1.0, "close": 2.0 }
            ]
        });
        let candles = parse_history_candles(&msg, "R_100", 60).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].high, 2.5);
        assert_eq!(candles[1].timestamp, 120);

        assert!(parse_history_candles(&json!({}), "R_100", 60).is_err());
    }
}
