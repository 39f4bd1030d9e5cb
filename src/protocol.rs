use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

pub const PROTOCOL_VERSION: i64 = 1;

pub const ERR_INVALID_COMMAND: &str = "INVALID_COMMAND";
pub const ERR_RATE_LIMITED: &str = "RATE_LIMITED";
pub const ERR_FORBIDDEN_CONVERSATION: &str = "FORBIDDEN_CONVERSATION";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ProtocolError {
    pub code: &'static str,
    pub message: String,
}

impl ProtocolError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            code: ERR_INVALID_COMMAND,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Subscribe { conversation_ids: Vec<String> },
    Unsubscribe { conversation_ids: Vec<String> },
    Ping { ts: Option<i64> },
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SubscribeFrame {
    #[allow(dead_code)]
    op: String,
    conversation_ids: Vec<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct UnsubscribeFrame {
    #[allow(dead_code)]
    op: String,
    conversation_ids: Vec<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PingFrame {
    #[allow(dead_code)]
    op: String,
    #[serde(default)]
    ts: Option<i64>,
}

/// Parses one client frame. Rejects oversize frames, malformed JSON,
/// non-object payloads, unknown ops, unknown fields, and missing or
/// ill-typed required fields.
pub fn parse_command(raw_text: &str, max_bytes: usize) -> Result<Command, ProtocolError> {
    if raw_text.len() > max_bytes {
        return Err(ProtocolError::invalid("Frame is too large"));
    }

    let decoded: Value = serde_json::from_str(raw_text)
        .map_err(|_| ProtocolError::invalid("Invalid JSON payload"))?;
    if !decoded.is_object() {
        return Err(ProtocolError::invalid("Command payload must be an object"));
    }

    let op = decoded
        .get("op")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match op.as_str() {
        "subscribe" => {
            let frame: SubscribeFrame = serde_json::from_value(decoded)
                .map_err(|err| ProtocolError::invalid(err.to_string()))?;
            Ok(Command::Subscribe {
                conversation_ids: frame.conversation_ids,
            })
        }
        "unsubscribe" => {
            let frame: UnsubscribeFrame = serde_json::from_value(decoded)
                .map_err(|err| ProtocolError::invalid(err.to_string()))?;
            Ok(Command::Unsubscribe {
                conversation_ids: frame.conversation_ids,
            })
        }
        "ping" => {
            let frame: PingFrame = serde_json::from_value(decoded)
                .map_err(|err| ProtocolError::invalid(err.to_string()))?;
            if frame.ts.map(|ts| ts < 0).unwrap_or(false) {
                return Err(ProtocolError::invalid("ts must be non-negative"));
            }
            Ok(Command::Ping { ts: frame.ts })
        }
        _ => Err(ProtocolError::invalid("Unsupported command")),
    }
}

pub fn welcome_frame(connection_id: &str, user_id: &str, heartbeat_sec: u64) -> Value {
    json!({
        "type": "connection.welcome",
        "connection_id": connection_id,
        "user_id": user_id,
        "server_time": Utc::now().to_rfc3339(),
        "heartbeat_sec": heartbeat_sec,
        "protocol_version": PROTOCOL_VERSION,
    })
}

pub fn ack_frame(op: &str, details: Option<Value>) -> Value {
    let mut frame = json!({
        "type": "ack",
        "op": op,
        "ok": true,
    });
    if let Some(details) = details {
        frame["details"] = details;
    }
    frame
}

pub fn error_frame(code: &str, message: &str) -> Value {
    json!({
        "type": "error",
        "error": { "code": code, "message": message },
    })
}

pub fn pong_frame(ts: Option<i64>) -> Value {
    let mut frame = json!({ "type": "pong" });
    if let Some(ts) = ts {
        frame["ts"] = json!(ts);
    }
    frame
}

pub fn event_frame(
    event_type: &str,
    event_id: &str,
    conversation_id: &str,
    seq: i64,
    occurred_at: &str,
    payload: Value,
) -> Value {
    json!({
        "type": event_type,
        "event_id": event_id,
        "conversation_id": conversation_id,
        "seq": seq,
        "occurred_at": occurred_at,
        "payload": payload,
    })
}
