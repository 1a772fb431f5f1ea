//! Session actor tests, driven through the in-memory connector on virtual time

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

use super::helpers::{chat, next_event, next_remote, session_config};
use crate::error::ErrorCategory;
use crate::protocol::{ClientRequest, ServerEvent};
use crate::session::{SessionClient, SessionEvent, SessionState};
use crate::transport::{MemoryConnector, MemoryRemote};

async fn next_request(remote: &mut MemoryRemote) -> ClientRequest {
    timeout(Duration::from_secs(60), remote.next_request())
        .await
        .expect("timed out waiting for a request")
        .expect("transport closed")
}

/// Fails if the connector is asked for a transport within two virtual
/// minutes. A connector dropped with its stopped session counts as no attempt.
async fn assert_no_connect_attempt(remotes: &mut mpsc::UnboundedReceiver<MemoryRemote>) {
    if let Ok(Some(remote)) = timeout(Duration::from_secs(120), remotes.recv()).await {
        panic!("unexpected connect attempt for {}", remote.room_id);
    }
}

#[tokio::test(start_paused = true)]
async fn test_session_joins_and_loads_history() {
    let (connector, mut remotes) = MemoryConnector::new();
    let session = SessionClient::new(session_config("lobby", 3), Arc::new(connector)).unwrap();
    let mut events = session.subscribe();

    session.connect();
    let mut remote = next_remote(&mut remotes).await;
    assert_eq!(remote.room_id, "lobby");
    assert_eq!(session.state(), SessionState::Connecting);

    remote.open("sid-1");
    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::Connected {
            session_id: Some("sid-1".into())
        }
    );
    assert!(session.is_active());

    // Join goes out after the settle delay
    let opened_at = Instant::now();
    let join = next_request(&mut remote).await;
    assert!(opened_at.elapsed() >= Duration::from_millis(500));
    assert_eq!(
        join,
        ClientRequest::JoinRoom {
            room_id: "lobby".into(),
            username: "tester".into()
        }
    );

    remote.server(ServerEvent::JoinRoomResponse {
        success: true,
        message: None,
    });
    assert_eq!(next_request(&mut remote).await.event_name(), "getMessageHistory");

    remote.server(ServerEvent::MessageHistory(vec![
        chat("1", "alice", "first"),
        chat("2", "bob", "second"),
    ]));
    match next_event(&mut events).await {
        SessionEvent::MessageHistory(messages) => assert_eq!(messages.len(), 2),
        other => panic!("expected history, got {:?}", other),
    }
    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(session.get_messages(Some(1))[0].id, "2");
    assert_eq!(session.get_latest_message().unwrap().id, "2");

    remote.server(ServerEvent::NewMessage(chat("3", "carol", "third")));
    assert!(matches!(next_event(&mut events).await, SessionEvent::Message(m) if m.id == "3"));
    assert_eq!(session.connection_info().message_count, 3);

    session.clear_messages();
    assert!(session.get_messages(None).is_empty());

    let stats = session.event_stats().await;
    assert_eq!(stats.type_counts.get("message"), Some(&1));
}

#[tokio::test(start_paused = true)]
async fn test_send_message_reaches_transport() {
    let (connector, mut remotes) = MemoryConnector::new();
    let session = SessionClient::new(session_config("lobby", 3), Arc::new(connector)).unwrap();
    let mut events = session.subscribe();

    // Not connected yet
    assert!(!session.send_message("too early"));

    session.connect();
    let mut remote = next_remote(&mut remotes).await;
    remote.open("sid-1");
    next_event(&mut events).await;

    assert!(!session.send_message("   "));
    assert!(session.send_message("hello room"));

    loop {
        match next_request(&mut remote).await {
            ClientRequest::SendMessage { room_id, message } => {
                assert_eq!(room_id, "lobby");
                assert_eq!(message, "hello room");
                break;
            }
            // Join traffic may come first
            _ => continue,
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_drop_with_backoff() {
    let (connector, mut remotes) = MemoryConnector::new();
    let session = SessionClient::new(session_config("lobby", 3), Arc::new(connector)).unwrap();
    let mut events = session.subscribe();

    session.connect();
    let first = next_remote(&mut remotes).await;
    first.open("sid-1");
    next_event(&mut events).await;

    let dropped_at = Instant::now();
    first.close("transport close");
    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::Disconnected {
            reason: "transport close".into()
        }
    );
    assert_eq!(session.state(), SessionState::ReconnectScheduled);
    assert!(session.connection_info().is_reconnecting);
    assert!(!session.is_active());

    let second = next_remote(&mut remotes).await;
    assert!(dropped_at.elapsed() >= Duration::from_millis(1_000));
    assert!(first.is_closed());

    second.open("sid-2");
    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::Connected {
            session_id: Some("sid-2".into())
        }
    );
    let info = session.connection_info();
    assert_eq!(info.reconnect_attempts, 0);
    assert!(!info.is_reconnecting);
    assert_eq!(info.socket_id.as_deref(), Some("sid-2"));
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_max_reconnects() {
    let (connector, mut remotes) = MemoryConnector::new();
    let session = SessionClient::new(session_config("lobby", 2), Arc::new(connector)).unwrap();
    let mut events = session.subscribe();

    session.connect();
    for _ in 0..3 {
        let remote = next_remote(&mut remotes).await;
        remote.connect_error("refused");
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Error {
                category: ErrorCategory::Network,
                ..
            }
        ));
    }

    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::MaxReconnectsReached { attempts: 2 }
    );
    assert_eq!(session.state(), SessionState::Disconnected);

    // No further attempt until asked
    assert_no_connect_attempt(&mut remotes).await;

    session.connect();
    let remote = next_remote(&mut remotes).await;
    remote.open("sid-again");
    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_connect_watchdog_fires() {
    let (connector, mut remotes) = MemoryConnector::new();
    let session = SessionClient::new(session_config("lobby", 1), Arc::new(connector)).unwrap();
    let mut events = session.subscribe();

    session.connect();
    let silent = next_remote(&mut remotes).await;
    let started = Instant::now();

    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Error {
            category: ErrorCategory::Timeout,
            ..
        }
    ));
    assert!(started.elapsed() >= Duration::from_secs(20));
    assert!(silent.is_closed());

    // Backoff then a new attempt
    let _retry = next_remote(&mut remotes).await;
    assert_eq!(session.state(), SessionState::Connecting);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_is_idempotent() {
    let (connector, mut remotes) = MemoryConnector::new();
    let session = SessionClient::new(session_config("lobby", 3), Arc::new(connector)).unwrap();
    let mut events = session.subscribe();

    session.connect();
    let remote = next_remote(&mut remotes).await;
    remote.open("sid-1");
    next_event(&mut events).await;

    session.disconnect().await;
    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::Disconnected {
            reason: "io client disconnect".into()
        }
    );
    assert!(remote.is_closed());

    session.disconnect().await;
    assert_eq!(session.state(), SessionState::Stopped);

    // Stopped sessions never connect again
    session.connect();
    assert_no_connect_attempt(&mut remotes).await;
    assert!(!session.send_message("anyone?"));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_pending_reconnect() {
    let (connector, mut remotes) = MemoryConnector::new();
    let session = SessionClient::new(session_config("lobby", 3), Arc::new(connector)).unwrap();
    let mut events = session.subscribe();

    session.connect();
    let remote = next_remote(&mut remotes).await;
    remote.connect_error("refused");
    next_event(&mut events).await;
    assert_eq!(session.state(), SessionState::ReconnectScheduled);

    session.disconnect().await;
    assert_eq!(session.state(), SessionState::Stopped);
    assert_no_connect_attempt(&mut remotes).await;
}

#[tokio::test(start_paused = true)]
async fn test_dropping_handle_closes_transport() {
    let (connector, mut remotes) = MemoryConnector::new();
    let session = SessionClient::new(session_config("lobby", 3), Arc::new(connector)).unwrap();

    session.connect();
    let mut remote = next_remote(&mut remotes).await;
    remote.open("sid-1");

    drop(session);
    loop {
        if timeout(Duration::from_secs(60), remote.next_request())
            .await
            .expect("transport never closed")
            .is_none()
        {
            break;
        }
    }
    assert!(remote.is_closed());
}

#[tokio::test]
async fn test_rejects_invalid_config() {
    let (connector, _remotes) = MemoryConnector::new();
    let mut config = session_config("", 3);
    assert!(SessionClient::new(config.clone(), Arc::new(connector.clone())).is_err());

    config.room_id = "lobby".into();
    config.history_capacity = 0;
    assert!(SessionClient::new(config, Arc::new(connector)).is_err());
}
