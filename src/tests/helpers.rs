//! Shared fixtures for unit tests

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

use crate::config::{SessionConfig, SessionDefaults, SessionTimings, UpstreamConfig};
use crate::protocol::Message;
use crate::session::SessionEvent;
use crate::transport::MemoryRemote;

pub fn upstream() -> UpstreamConfig {
    UpstreamConfig {
        endpoint: "ws://127.0.0.1:9".into(),
        path: "/socket.io/".into(),
        headers: BTreeMap::new(),
        auth: None,
    }
}

pub fn session_config(room: &str, max_reconnect_attempts: u32) -> SessionConfig {
    SessionConfig {
        room_id: room.into(),
        display_name: "tester".into(),
        history_capacity: 5,
        max_reconnect_attempts,
        logging_enabled: true,
        timings: SessionTimings::default(),
        upstream: upstream(),
    }
}

pub fn session_defaults(max_reconnect_attempts: u32) -> SessionDefaults {
    SessionDefaults {
        display_name: Some("tester".into()),
        history_capacity: 5,
        max_reconnect_attempts,
        logging_enabled: true,
        timings: SessionTimings::default(),
    }
}

pub fn chat(id: &str, username: &str, text: &str) -> Message {
    Message {
        id: id.into(),
        room_id: "lobby".into(),
        username: username.into(),
        message: text.into(),
        ..Default::default()
    }
}

/// Next session event, failing the test if none arrives in a minute of
/// (possibly virtual) time
pub async fn next_event(events: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    timeout(Duration::from_secs(60), events.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("event channel closed")
}

/// Next transport opened by a memory connector
pub async fn next_remote(remotes: &mut mpsc::UnboundedReceiver<MemoryRemote>) -> MemoryRemote {
    timeout(Duration::from_secs(60), remotes.recv())
        .await
        .expect("timed out waiting for a connect attempt")
        .expect("connector dropped")
}
