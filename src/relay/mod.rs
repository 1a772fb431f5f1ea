//! Browser-facing relay: frames, the per-viewer bridge and the HTTP server.

pub mod bridge;
pub mod server;

pub use bridge::{route_chat_message, PlaySink, RelayBridge};
pub use server::{router, serve, RelayState};

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::session::SessionEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Payload of a `log` frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub level: LogLevel,
    pub message: String,
}

/// One frame pushed to a viewer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayFrame {
    Log {
        timestamp: DateTime<Utc>,
        payload: LogLine,
    },
    Event {
        timestamp: DateTime<Utc>,
        payload: SessionEvent,
    },
}

impl RelayFrame {
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        Self::Log {
            timestamp: Utc::now(),
            payload: LogLine {
                level,
                message: message.into(),
            },
        }
    }

    pub fn event(event: SessionEvent) -> Self {
        Self::Event {
            timestamp: Utc::now(),
            payload: event,
        }
    }

    /// SSE event name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Log { .. } => "log",
            Self::Event { .. } => "event",
        }
    }
}

/// A relay log line kept for `/api/logs`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub room: String,
    pub level: LogLevel,
    pub message: String,
}

/// Bounded, process-wide book of relay log lines
#[derive(Debug)]
pub struct LogBook {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
}

impl LogBook {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    pub fn push(&self, room: &str, level: LogLevel, message: &str) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(LogEntry {
            timestamp: Utc::now(),
            room: room.to_string(),
            level,
            message: message.to_string(),
        });
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Empty the book, returning how many lines were dropped
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let count = entries.len();
        entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_shape() {
        let frame = RelayFrame::event(SessionEvent::Disconnected {
            reason: "transport close".into(),
        });
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "event");
        assert!(value["timestamp"].is_string());
        assert_eq!(
            value["payload"],
            json!({"event": "disconnected", "data": {"reason": "transport close"}})
        );

        let value = serde_json::to_value(RelayFrame::log(LogLevel::Warn, "lagging")).unwrap();
        assert_eq!(value["type"], "log");
        assert_eq!(value["payload"], json!({"level": "warn", "message": "lagging"}));
    }

    #[test]
    fn test_log_book_is_bounded() {
        let book = LogBook::new(2);
        book.push("a", LogLevel::Info, "one");
        book.push("a", LogLevel::Info, "two");
        book.push("a", LogLevel::Error, "three");

        let messages: Vec<_> = book.entries().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["two", "three"]);
        assert_eq!(book.clear(), 2);
        assert!(book.is_empty());
    }
}
