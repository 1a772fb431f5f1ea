//! HTTP endpoints that do not hold a viewer stream open
use axum::http::{Method, StatusCode};
use serde_json::json;

use crate::harness::TestEnvironment;

#[tokio::test]
async fn test_health() {
    let env = TestEnvironment::new().await;
    let (status, body) = env.json(Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_send_without_session_is_not_found() {
    let env = TestEnvironment::new().await;
    let (status, body) = env
        .json(
            Method::POST,
            "/api/send",
            Some(json!({ "room": "lobby", "text": "anyone here?" })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("lobby"));
}

#[tokio::test]
async fn test_send_rejects_blank_text() {
    let env = TestEnvironment::new().await;
    let (status, body) = env
        .json(Method::POST, "/api/send", Some(json!({ "room": "lobby", "text": "  " })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["category"], "validation");
}

#[tokio::test]
async fn test_stop_unknown_room_is_not_found() {
    let env = TestEnvironment::new().await;
    let (status, body) = env.json(Method::POST, "/api/rooms/nowhere/stop", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_empty_listings() {
    let env = TestEnvironment::new().await;

    let (status, body) = env.json(Method::GET, "/api/sessions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sessions"], json!([]));

    let (_, body) = env.json(Method::GET, "/api/plays", None).await;
    assert_eq!(body["plays"], json!([]));

    let (_, body) = env.json(Method::GET, "/api/logs", None).await;
    assert_eq!(body["logs"], json!([]));

    let (status, body) = env.json(Method::DELETE, "/api/logs", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cleared"], 0);
}
