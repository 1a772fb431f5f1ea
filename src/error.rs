use std::fmt;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

/// Result alias used across the relay
pub type RelayResult<T> = Result<T, RelayError>;

/// Relay error types using thiserror
#[derive(Error, Debug, Clone)]
pub enum RelayError {
    /// The upstream socket could not be opened or failed while open
    #[error("Transport error: {message}")]
    Transport {
        /// Error message
        message: String,
    },

    /// The upstream service reported a logical failure (join, history)
    #[error("Protocol error: {message}")]
    Protocol {
        /// Error message
        message: String,
    },

    /// The connect watchdog expired before the transport opened
    #[error("Connect timed out after {}ms", .after.as_millis())]
    Timeout {
        /// How long we waited
        after: Duration,
    },

    /// Automatic reconnection gave up
    #[error("Gave up after {attempts} reconnect attempts")]
    Exhausted {
        /// Attempts made before giving up
        attempts: u32,
    },

    /// A wire frame could not be decoded
    #[error("Malformed frame: {reason}")]
    Codec {
        /// Why decoding failed
        reason: String,
    },

    #[error("No active session for room '{room}'")]
    NoActiveSession {
        room: String,
    },

    #[error("Session for room '{room}' is not connected")]
    NotConnected {
        room: String,
    },

    #[error("Invalid command: {reason}")]
    InvalidCommand {
        reason: String,
    },

    #[error("Invalid configuration value for '{key}': {reason}")]
    ConfigInvalid {
        key: String,
        reason: String,
    },

    #[error("Play store failure: {reason}")]
    Store {
        reason: String,
    },
}

/// Error categories, used for event payloads and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Connect failures, dropped sockets, gateway errors
    Network,
    /// Server-reported logical failures
    Protocol,
    /// Watchdog expiry
    Timeout,
    /// Reconnect budget used up
    Exhaustion,
    /// Bad input from a caller
    Validation,
    /// Bad configuration
    Configuration,
    /// Missing room/session
    NotFound,
    /// Persistence failures
    Storage,
}

impl ErrorCategory {
    /// Returns true if errors in this category are handled by reconnecting
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network | Self::Timeout | Self::Storage)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Network => "network",
            Self::Protocol => "protocol",
            Self::Timeout => "timeout",
            Self::Exhaustion => "exhaustion",
            Self::Validation => "validation",
            Self::Configuration => "configuration",
            Self::NotFound => "not_found",
            Self::Storage => "storage",
        };
        write!(f, "{}", name)
    }
}

impl RelayError {
    pub fn transport(message: impl fmt::Display) -> Self {
        Self::Transport {
            message: message.to_string(),
        }
    }

    pub fn protocol(message: impl fmt::Display) -> Self {
        Self::Protocol {
            message: message.to_string(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::Timeout { after }
    }

    pub fn exhausted(attempts: u32) -> Self {
        Self::Exhausted { attempts }
    }

    pub fn codec(reason: impl fmt::Display) -> Self {
        Self::Codec {
            reason: reason.to_string(),
        }
    }

    pub fn no_active_session(room: impl Into<String>) -> Self {
        Self::NoActiveSession { room: room.into() }
    }

    pub fn not_connected(room: impl Into<String>) -> Self {
        Self::NotConnected { room: room.into() }
    }

    pub fn invalid_command(reason: impl fmt::Display) -> Self {
        Self::InvalidCommand {
            reason: reason.to_string(),
        }
    }

    pub fn config_invalid(key: &str, reason: impl fmt::Display) -> Self {
        Self::ConfigInvalid {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn store(reason: impl fmt::Display) -> Self {
        Self::Store {
            reason: reason.to_string(),
        }
    }

    /// Get the category for this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Transport { .. } => ErrorCategory::Network,
            Self::Protocol { .. } => ErrorCategory::Protocol,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Exhausted { .. } => ErrorCategory::Exhaustion,
            Self::Codec { .. } | Self::InvalidCommand { .. } => ErrorCategory::Validation,
            Self::NoActiveSession { .. } | Self::NotConnected { .. } => ErrorCategory::NotFound,
            Self::ConfigInvalid { .. } => ErrorCategory::Configuration,
            Self::Store { .. } => ErrorCategory::Storage,
        }
    }

    /// HTTP status used when the error crosses the relay API
    pub fn status_code(&self) -> StatusCode {
        match self.category() {
            ErrorCategory::NotFound => StatusCode::NOT_FOUND,
            ErrorCategory::Validation => StatusCode::BAD_REQUEST,
            ErrorCategory::Network | ErrorCategory::Timeout | ErrorCategory::Exhaustion => {
                StatusCode::BAD_GATEWAY
            }
            ErrorCategory::Protocol => StatusCode::CONFLICT,
            ErrorCategory::Configuration | ErrorCategory::Storage => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let body = json!({
            "success": false,
            "error": self.to_string(),
            "category": self.category(),
        });
        (self.status_code(), Json(body)).into_response()
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        Self::store(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(RelayError::transport("502").category(), ErrorCategory::Network);
        assert_eq!(
            RelayError::timeout(Duration::from_secs(20)).category(),
            ErrorCategory::Timeout
        );
        assert_eq!(RelayError::exhausted(5).category(), ErrorCategory::Exhaustion);
        assert_eq!(
            RelayError::no_active_session("lobby").category(),
            ErrorCategory::NotFound
        );
        assert!(ErrorCategory::Network.is_retryable());
        assert!(!ErrorCategory::Protocol.is_retryable());
    }

    #[test]
    fn test_display() {
        let err = RelayError::timeout(Duration::from_millis(20_000));
        assert_eq!(err.to_string(), "Connect timed out after 20000ms");

        let err = RelayError::no_active_session("lobby");
        assert_eq!(err.to_string(), "No active session for room 'lobby'");
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }
}
