//! Engine.IO v4 / Socket.IO v4 text packet codec.
//!
//! Only the text packets the relay needs are modelled. Binary attachments are
//! rejected as malformed since the chat service never sends them.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{RelayError, RelayResult};

/// Engine.IO pong, sent in answer to a server ping
pub const PONG: &str = "3";

/// Socket.IO disconnect for the default namespace
pub const DISCONNECT: &str = "41";

/// Handshake payload of the Engine.IO open packet
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineHandshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    #[serde(default)]
    pub ping_interval: u64,
    #[serde(default)]
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: u64,
}

/// A decoded text packet
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Engine.IO open with the transport handshake
    Open(EngineHandshake),
    /// Engine.IO close
    Close,
    /// Engine.IO ping (server heartbeat)
    Ping,
    /// Engine.IO pong
    Pong,
    /// Engine.IO noop
    Noop,
    /// Socket.IO namespace connected; carries the socket id
    Connect { sid: Option<String> },
    /// Socket.IO namespace disconnected by the server
    Disconnect,
    /// Socket.IO event with its arguments
    Event { name: String, args: Vec<Value> },
    /// Socket.IO acknowledgement
    Ack { id: u64, args: Vec<Value> },
    /// Socket.IO connection refused by middleware
    ConnectError { message: String },
}

impl Packet {
    /// Decode one websocket text frame
    pub fn decode(text: &str) -> RelayResult<Self> {
        let mut chars = text.chars();
        let engine_type = chars
            .next()
            .ok_or_else(|| RelayError::codec("empty frame"))?;
        let rest = chars.as_str();

        match engine_type {
            '0' => {
                let handshake: EngineHandshake = serde_json::from_str(rest)
                    .map_err(|e| RelayError::codec(format!("bad open payload: {}", e)))?;
                Ok(Packet::Open(handshake))
            }
            '1' => Ok(Packet::Close),
            '2' => Ok(Packet::Ping),
            '3' => Ok(Packet::Pong),
            '4' => decode_socket(rest),
            '6' => Ok(Packet::Noop),
            other => Err(RelayError::codec(format!(
                "unsupported engine packet type '{}'",
                other
            ))),
        }
    }
}

fn decode_socket(text: &str) -> RelayResult<Packet> {
    let mut chars = text.chars();
    let socket_type = chars
        .next()
        .ok_or_else(|| RelayError::codec("empty socket packet"))?;
    let mut rest = chars.as_str();

    // Optional namespace: "/chat," prefix
    if rest.starts_with('/') {
        rest = match rest.find(',') {
            Some(idx) => &rest[idx + 1..],
            None => "",
        };
    }

    // Optional ack id digits before the payload
    let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    let ack_id = if digits > 0 {
        rest[..digits].parse::<u64>().ok()
    } else {
        None
    };
    let payload = &rest[digits..];

    match socket_type {
        '0' => {
            let sid = if payload.is_empty() {
                None
            } else {
                let value: Value = serde_json::from_str(payload)
                    .map_err(|e| RelayError::codec(format!("bad connect payload: {}", e)))?;
                value.get("sid").and_then(Value::as_str).map(str::to_string)
            };
            Ok(Packet::Connect { sid })
        }
        '1' => Ok(Packet::Disconnect),
        '2' => {
            let mut args = parse_array(payload)?;
            if args.is_empty() {
                return Err(RelayError::codec("event without a name"));
            }
            let name = match args.remove(0) {
                Value::String(name) => name,
                other => return Err(RelayError::codec(format!("event name is not a string: {}", other))),
            };
            Ok(Packet::Event { name, args })
        }
        '3' => {
            let id = ack_id.ok_or_else(|| RelayError::codec("ack without id"))?;
            Ok(Packet::Ack {
                id,
                args: parse_array(payload)?,
            })
        }
        '4' => {
            let message = match serde_json::from_str::<Value>(payload) {
                Ok(Value::Object(map)) => map
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("connection refused")
                    .to_string(),
                Ok(Value::String(message)) => message,
                _ => payload.to_string(),
            };
            Ok(Packet::ConnectError { message })
        }
        '5' | '6' => Err(RelayError::codec("binary packets are not supported")),
        other => Err(RelayError::codec(format!(
            "unsupported socket packet type '{}'",
            other
        ))),
    }
}

fn parse_array(payload: &str) -> RelayResult<Vec<Value>> {
    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Array(items)) => Ok(items),
        Ok(other) => Err(RelayError::codec(format!("expected array payload, got {}", other))),
        Err(e) => Err(RelayError::codec(format!("bad json payload: {}", e))),
    }
}

/// Encode a Socket.IO connect packet for the default namespace
pub fn encode_connect(auth: Option<&Value>) -> String {
    match auth {
        Some(auth) => format!("40{}", auth),
        None => "40".to_string(),
    }
}

/// Encode a Socket.IO event packet: `42["name",payload]`
pub fn encode_event(name: &str, payload: &Value) -> String {
    let frame = Value::Array(vec![Value::String(name.to_string()), payload.clone()]);
    format!("42{}", frame)
}
