//! Downstream wire frames: command in, response / event / error out.
//!
//! All frames are single JSON text messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CommandError;
use crate::event_bus::GatewayEvent;

/// `{type:"command", command, params?, requestId, timestamp}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    pub request_id: String,
    #[serde(default)]
    pub timestamp: i64,
}

impl CommandEnvelope {
    pub fn new(command: impl Into<String>, request_id: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            kind: "command".to_string(),
            command: command.into(),
            params,
            request_id: request_id.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Look up a parameter by name.
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.as_ref().and_then(|p| p.get(key))
    }
}

/// `{type:"response", requestId, success, data?, error?}`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub request_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandError>,
}

impl ResponseEnvelope {
    pub fn new(request_id: impl Into<String>, success: bool, data: Option<Value>, error: Option<CommandError>) -> Self {
        Self {
            kind: "response",
            request_id: request_id.into(),
            success,
            data,
            error,
        }
    }
}

/// `{type:<eventName>, data}`. Events without a payload carry `data: {}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
}

impl EventEnvelope {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    pub fn from_event(event: &GatewayEvent) -> Result<Self, serde_json::Error> {
        let mut value = serde_json::to_value(event)?;
        let data = value
            .get_mut("data")
            .map(Value::take)
            .unwrap_or_else(|| Value::Object(Default::default()));
        Ok(Self::new(event.name(), data))
    }
}

/// `{type:"error", code, message}` sent to a single client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorFrame {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub code: &'static str,
    pub message: String,
}

impl ErrorFrame {
    pub const PARSE_ERROR: &'static str = "PARSE_ERROR";
    pub const INVALID_COMMAND: &'static str = "INVALID_COMMAND";

    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind: "error",
            code,
            message: message.into(),
        }
    }
}

/// `{type:"pong", timestamp}` answering an application-level ping.
#[derive(Debug, Clone, Serialize)]
pub struct Pong {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub timestamp: i64,
}

impl Pong {
    pub fn now() -> Self {
        Self {
            kind: "pong",
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// What a client text frame turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Command(CommandEnvelope),
    Ping,
    /// Valid JSON that is not a usable command.
    Invalid(String),
    /// Not JSON at all.
    Unparseable(String),
}

pub fn classify(text: &str) -> Inbound {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return Inbound::Unparseable(e.to_string()),
    };

    match value.get("type").and_then(Value::as_str) {
        Some("ping") => Inbound::Ping,
        Some("command") => match serde_json::from_value::<CommandEnvelope>(value) {
            Ok(cmd) if cmd.command.trim().is_empty() => Inbound::Invalid("command name is empty".to_string()),
            Ok(cmd) => Inbound::Command(cmd),
            Err(e) => Inbound::Invalid(e.to_string()),
        },
        Some(other) => Inbound::Invalid(format!("unsupported message type '{other}'")),
        None => Inbound::Invalid("missing 'type' field".to_string()),
    }
}
