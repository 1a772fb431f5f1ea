//! Upstream chat protocol: message model, inbound events, outbound requests.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::error::{RelayError, RelayResult};

/// One chat utterance as received from the upstream service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Message {
    /// Upstream message id
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    /// Room the message belongs to
    #[serde(alias = "room", deserialize_with = "string_or_number")]
    pub room_id: String,
    /// Author display name
    #[serde(alias = "displayName", alias = "author", deserialize_with = "string_or_number")]
    pub username: String,
    /// Author wallet/address, may be empty
    #[serde(alias = "address", alias = "walletAddress", deserialize_with = "string_or_number")]
    pub user_address: String,
    /// Message text
    #[serde(alias = "text", alias = "content", deserialize_with = "string_or_number")]
    pub message: String,
    /// Author profile image, may be empty
    #[serde(alias = "avatar", deserialize_with = "string_or_number")]
    pub profile_image: String,
    /// Origination timestamp as supplied by the service
    #[serde(alias = "createdAt", deserialize_with = "string_or_number")]
    pub timestamp: String,
    /// Message category tag
    #[serde(alias = "type", deserialize_with = "string_or_number")]
    pub message_type: String,
    /// Expiry epoch, passed through untouched
    #[serde(deserialize_with = "integer_or_zero")]
    pub expires_at: i64,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

fn integer_or_zero<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    })
}

/// Inbound events understood by the session
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    NewMessage(Message),
    MessageHistory(Vec<Message>),
    UserJoined {
        username: String,
        user_address: String,
    },
    UserLeft {
        user_address: String,
    },
    JoinRoomResponse {
        success: bool,
        message: Option<String>,
    },
    ServerError(String),
    /// Anything else the service emits
    Unknown {
        name: String,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserPresence {
    #[serde(default, deserialize_with = "string_or_number")]
    username: String,
    #[serde(default, alias = "address", deserialize_with = "string_or_number")]
    user_address: String,
}

#[derive(Deserialize)]
struct JoinResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct HistoryEnvelope {
    #[serde(default)]
    messages: Vec<Value>,
}

impl ServerEvent {
    /// Map a Socket.IO event name and its arguments to a typed event
    pub fn from_wire(name: &str, args: &[Value]) -> RelayResult<Self> {
        let first = args.first().cloned().unwrap_or(Value::Null);
        let event = match name {
            "newMessage" => ServerEvent::NewMessage(parse(name, first)?),
            "messageHistory" => {
                let entries = match first {
                    Value::Array(entries) => entries,
                    other => parse::<HistoryEnvelope>(name, other)?.messages,
                };
                ServerEvent::MessageHistory(decode_history(entries))
            }
            "userJoined" => {
                let presence: UserPresence = parse(name, first)?;
                ServerEvent::UserJoined {
                    username: presence.username,
                    user_address: presence.user_address,
                }
            }
            "userLeft" => {
                let presence: UserPresence = parse(name, first)?;
                ServerEvent::UserLeft {
                    user_address: presence.user_address,
                }
            }
            "joinRoomResponse" => {
                let response: JoinResponse = parse(name, first)?;
                ServerEvent::JoinRoomResponse {
                    success: response.success,
                    message: response.message,
                }
            }
            "serverError" => {
                let reason = match first {
                    Value::String(reason) => reason,
                    Value::Object(map) => map
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| Value::Object(map).to_string()),
                    Value::Null => "unknown server error".to_string(),
                    other => other.to_string(),
                };
                ServerEvent::ServerError(reason)
            }
            other => ServerEvent::Unknown {
                name: other.to_string(),
            },
        };
        Ok(event)
    }
}

/// Decode history entries one by one; a malformed entry is skipped
fn decode_history(entries: Vec<Value>) -> Vec<Message> {
    entries
        .into_iter()
        .enumerate()
        .filter_map(|(index, entry)| match serde_json::from_value::<Message>(entry) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(index, error = %e, "Skipping malformed history entry");
                None
            }
        })
        .collect()
}

fn parse<T: for<'de> Deserialize<'de>>(name: &str, value: Value) -> RelayResult<T> {
    serde_json::from_value(value)
        .map_err(|e| RelayError::codec(format!("bad '{}' payload: {}", name, e)))
}

/// Outbound requests the session emits
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    /// Primary join
    JoinRoom { room_id: String, username: String },
    /// Fallback join taking the bare room id
    Join { room_id: String },
    /// Fallback subscription
    Subscribe { room: String },
    /// Primary history request
    GetMessageHistory {
        room_id: String,
        before: Option<String>,
        limit: usize,
    },
    /// Fallback history variants
    MessageHistory { room_id: String },
    GetHistory { room: String, limit: usize },
    FetchMessages { room_id: String },
    /// Post a chat message
    SendMessage { room_id: String, message: String },
}

impl ClientRequest {
    /// Event name on the wire
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientRequest::JoinRoom { .. } => "joinRoom",
            ClientRequest::Join { .. } => "join",
            ClientRequest::Subscribe { .. } => "subscribe",
            ClientRequest::GetMessageHistory { .. } => "getMessageHistory",
            ClientRequest::MessageHistory { .. } => "messageHistory",
            ClientRequest::GetHistory { .. } => "getHistory",
            ClientRequest::FetchMessages { .. } => "fetchMessages",
            ClientRequest::SendMessage { .. } => "sendMessage",
        }
    }

    /// Event payload on the wire
    pub fn payload(&self) -> Value {
        match self {
            ClientRequest::JoinRoom { room_id, username } => {
                json!({ "roomId": room_id, "username": username })
            }
            ClientRequest::Join { room_id } => json!(room_id),
            ClientRequest::Subscribe { room } => json!({ "room": room }),
            ClientRequest::GetMessageHistory {
                room_id,
                before,
                limit,
            } => json!({ "roomId": room_id, "before": before, "limit": limit }),
            ClientRequest::MessageHistory { room_id } => json!({ "roomId": room_id }),
            ClientRequest::GetHistory { room, limit } => json!({ "room": room, "limit": limit }),
            ClientRequest::FetchMessages { room_id } => json!({ "roomId": room_id }),
            ClientRequest::SendMessage { room_id, message } => {
                json!({ "roomId": room_id, "message": message })
            }
        }
    }

    /// Whether this request is one of the history requests
    pub fn is_history_request(&self) -> bool {
        matches!(
            self,
            ClientRequest::GetMessageHistory { .. }
                | ClientRequest::MessageHistory { .. }
                | ClientRequest::GetHistory { .. }
                | ClientRequest::FetchMessages { .. }
        )
    }
}
