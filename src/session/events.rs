use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ErrorCategory;
use crate::protocol::Message;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    JoiningRoom,
    Active,
    Disconnected,
    ReconnectScheduled,
    /// Terminal; entered only through an explicit disconnect
    Stopped,
}

impl SessionState {
    /// Whether a transport is open or being opened
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Connected | Self::JoiningRoom | Self::Active
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::JoiningRoom => "joining_room",
            Self::Active => "active",
            Self::Disconnected => "disconnected",
            Self::ReconnectScheduled => "reconnect_scheduled",
            Self::Stopped => "stopped",
        };
        write!(f, "{}", name)
    }
}

/// Normalized events a session publishes to its subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum SessionEvent {
    #[serde(rename_all = "camelCase")]
    Connected { session_id: Option<String> },
    Disconnected { reason: String },
    Error {
        category: ErrorCategory,
        message: String,
    },
    Message(Message),
    MessageHistory(Vec<Message>),
    #[serde(rename_all = "camelCase")]
    UserJoined {
        username: String,
        user_address: String,
    },
    #[serde(rename_all = "camelCase")]
    UserLeft { user_address: String },
    ServerError { reason: String },
    MaxReconnectsReached { attempts: u32 },
}

impl SessionEvent {
    /// Stable event name used on the relay channel
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::Error { .. } => "error",
            Self::Message(_) => "message",
            Self::MessageHistory(_) => "messageHistory",
            Self::UserJoined { .. } => "userJoined",
            Self::UserLeft { .. } => "userLeft",
            Self::ServerError { .. } => "serverError",
            Self::MaxReconnectsReached { .. } => "maxReconnectsReached",
        }
    }
}

/// Diagnostic snapshot of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub state: SessionState,
    pub connected: bool,
    pub room_id: String,
    pub username: String,
    pub message_count: usize,
    pub socket_id: Option<String>,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
    pub is_reconnecting: bool,
    pub should_reconnect: bool,
}
