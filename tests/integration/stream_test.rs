//! Viewer streams: session lifecycle seen through the SSE relay
use axum::http::{Method, StatusCode};
use serde_json::json;

use roomrelay_lib::protocol::{ClientRequest, ServerEvent};
use roomrelay_lib::Message;

use crate::harness::{eventually, wait_for_request, TestEnvironment};

fn chat(id: &str, username: &str, text: &str) -> Message {
    Message {
        id: id.into(),
        room_id: "lobby".into(),
        username: username.into(),
        user_address: format!("0x{}", username),
        message: text.into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_stream_relays_session_lifecycle() {
    let mut env = TestEnvironment::new().await;
    let (mut stream, mut remote) = env.open_stream("lobby", "alice").await;

    let first = stream.next_frame().await.unwrap();
    assert_eq!(first["type"], "log");
    assert_eq!(first["payload"]["level"], "info");
    assert!(first["payload"]["message"].as_str().unwrap().contains("lobby"));

    remote.open("sid-1");
    let connected = stream.next_event("connected").await;
    assert_eq!(connected["payload"]["data"]["sessionId"], "sid-1");

    let join = wait_for_request(&mut remote, |r| matches!(r, ClientRequest::JoinRoom { .. })).await;
    assert_eq!(
        join,
        ClientRequest::JoinRoom {
            room_id: "lobby".into(),
            username: "relay-bot".into()
        }
    );

    remote.server(ServerEvent::JoinRoomResponse {
        success: true,
        message: None,
    });
    wait_for_request(&mut remote, |r| r.is_history_request()).await;
    remote.server(ServerEvent::MessageHistory(vec![chat("1", "bob", "gm")]));
    let history = stream.next_event("messageHistory").await;
    assert_eq!(history["payload"]["data"][0]["message"], "gm");

    let (_, sessions) = env.json(Method::GET, "/api/sessions", None).await;
    assert_eq!(sessions["sessions"][0]["roomId"], "lobby");
    assert_eq!(sessions["sessions"][0]["viewer"], "alice");
    assert_eq!(sessions["sessions"][0]["connection"]["state"], "active");

    // Dropping the viewer stops the session and deregisters it
    drop(stream);
    env.wait_for_empty_registry().await;
    let remote = &remote;
    eventually(|| async move { remote.is_closed() }).await;
}

#[tokio::test]
async fn test_send_reaches_upstream() {
    let mut env = TestEnvironment::new().await;
    let (mut stream, mut remote) = env.open_stream("lobby", "alice").await;
    remote.open("sid-1");
    stream.next_event("connected").await;

    let (status, body) = env
        .json(
            Method::POST,
            "/api/send",
            Some(json!({ "room": "lobby", "text": "hello from the relay" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let sent = wait_for_request(&mut remote, |r| matches!(r, ClientRequest::SendMessage { .. })).await;
    assert_eq!(
        sent,
        ClientRequest::SendMessage {
            room_id: "lobby".into(),
            message: "hello from the relay".into()
        }
    );
}

#[tokio::test]
async fn test_chat_plays_are_recorded() {
    let mut env = TestEnvironment::new().await;
    let (mut stream, remote) = env.open_stream("lobby", "alice").await;
    remote.open("sid-1");
    stream.next_event("connected").await;

    remote.server(ServerEvent::NewMessage(chat("7", "carol", "going with #1234 tonight")));
    remote.server(ServerEvent::NewMessage(chat("8", "dave", "no numbers here")));
    let message = stream.next_event("message").await;
    assert_eq!(message["payload"]["data"]["username"], "carol");
    stream.next_event("message").await;

    let env = &env;
    eventually(|| async move {
        let (_, body) = env.json(Method::GET, "/api/plays", None).await;
        body["plays"].as_array().map_or(false, |plays| plays.len() == 1)
    })
    .await;
    let (_, body) = env.json(Method::GET, "/api/plays", None).await;
    assert_eq!(body["plays"][0]["code"], "1234");
    assert_eq!(body["plays"][0]["username"], "carol");

    let (status, _) = env.json(Method::DELETE, "/api/plays", None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = env.json(Method::GET, "/api/plays", None).await;
    assert_eq!(body["plays"], json!([]));
}

#[tokio::test]
async fn test_stop_room_ends_stream() {
    let mut env = TestEnvironment::new().await;
    let (mut stream, remote) = env.open_stream("lobby", "alice").await;
    remote.open("sid-1");
    stream.next_event("connected").await;

    let (status, body) = env.json(Method::POST, "/api/rooms/lobby/stop", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stopped"], 1);

    let disconnected = stream.next_event("disconnected").await;
    assert_eq!(disconnected["payload"]["data"]["reason"], "io client disconnect");
    while stream.next_frame().await.is_some() {}
    assert!(remote.is_closed());

    let (status, _) = env.json(Method::POST, "/api/rooms/lobby/stop", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_new_viewer_replaces_old_stream() {
    let mut env = TestEnvironment::new().await;
    let (mut first, first_remote) = env.open_stream("lobby", "alice").await;
    first_remote.open("sid-1");
    first.next_event("connected").await;

    let (mut second, second_remote) = env.open_stream("lobby", "bob").await;
    first.next_event("disconnected").await;
    while first.next_frame().await.is_some() {}
    assert!(first_remote.is_closed());

    second_remote.open("sid-2");
    second.next_event("connected").await;
    assert_eq!(env.registry().len().await, 1);
}

#[tokio::test]
async fn test_relay_logs_are_kept() {
    let mut env = TestEnvironment::new().await;
    let (mut stream, remote) = env.open_stream("lobby", "alice").await;
    remote.open("sid-1");
    stream.next_event("connected").await;

    let (_, body) = env.json(Method::GET, "/api/logs", None).await;
    let logs = body["logs"].as_array().unwrap();
    assert!(logs.len() >= 2);
    assert!(logs.iter().all(|entry| entry["room"] == "lobby"));

    let (_, body) = env.json(Method::DELETE, "/api/logs", None).await;
    assert_eq!(body["cleared"].as_u64().unwrap() as usize, logs.len());
}
