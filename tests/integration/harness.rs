//! Test harness: a relay router backed by the in-memory connector

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tower::ServiceExt;

use roomrelay_lib::config::{AppConfig, PlayConfig, SessionTimings};
use roomrelay_lib::protocol::ClientRequest;
use roomrelay_lib::registry::ConnectionRegistry;
use roomrelay_lib::transport::MemoryRemote;
use roomrelay_lib::{build_state, relay, MemoryConnector, RelayState};

const WAIT: Duration = Duration::from_secs(5);

pub struct TestEnvironment {
    pub state: RelayState,
    pub app: Router,
    pub remotes: mpsc::UnboundedReceiver<MemoryRemote>,
}

impl TestEnvironment {
    pub async fn new() -> Self {
        let mut config = AppConfig::default();
        config.session.display_name = Some("relay-bot".into());
        config.session.max_reconnect_attempts = 2;
        config.session.logging_enabled = true;
        config.session.timings = SessionTimings {
            settle_delay_ms: 10,
            join_fallback_delay_ms: 200,
            history_fallback_delay_ms: 200,
            connect_timeout_ms: 2_000,
            reconnect_base_ms: 50,
            reconnect_cap_ms: 200,
        };
        config.plays = PlayConfig {
            enabled: true,
            pattern: roomrelay_lib::plays::DEFAULT_PLAY_PATTERN.into(),
            store_path: None,
        };

        let (connector, remotes) = MemoryConnector::new();
        let state = build_state(&config, Arc::new(connector))
            .await
            .expect("failed to build relay state");
        let app = relay::router(state.clone());
        Self { state, app, remotes }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.state.registry
    }

    pub async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> Response<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        self.app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap()
    }

    /// Issue a request and decode its JSON body
    pub async fn json(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let response = self.request(method, uri, body).await;
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    /// Open a viewer stream for a room and return it with its upstream remote
    pub async fn open_stream(&mut self, room: &str, viewer: &str) -> (SseReader, MemoryRemote) {
        let response = self
            .request(Method::GET, &format!("/api/rooms/{}/stream?viewer={}", room, viewer), None)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let remote = timeout(WAIT, self.remotes.recv())
            .await
            .expect("session never connected upstream")
            .expect("connector dropped");
        (SseReader::new(response.into_body()), remote)
    }

    /// Wait until the registry holds no sessions
    pub async fn wait_for_empty_registry(&self) {
        eventually(|| async move { self.registry().is_empty().await }).await;
    }
}

/// Poll `check` until it holds, failing after a few seconds
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Next upstream request, skipping anything that is not `wanted`
pub async fn wait_for_request<F>(remote: &mut MemoryRemote, mut wanted: F) -> ClientRequest
where
    F: FnMut(&ClientRequest) -> bool,
{
    loop {
        let request = timeout(WAIT, remote.next_request())
            .await
            .expect("timed out waiting for upstream request")
            .expect("upstream transport closed");
        if wanted(&request) {
            return request;
        }
    }
}

/// Reads server-sent events off a response body
pub struct SseReader {
    body: Body,
    buffer: String,
}

impl SseReader {
    fn new(body: Body) -> Self {
        Self {
            body,
            buffer: String::new(),
        }
    }

    /// Next relay frame, or `None` when the stream ended
    pub async fn next_frame(&mut self) -> Option<Value> {
        timeout(WAIT, self.read_frame())
            .await
            .expect("timed out waiting for relay frame")
    }

    /// Next frame of the given type (`log` or `event`)
    pub async fn next_of_type(&mut self, kind: &str) -> Value {
        loop {
            let frame = self.next_frame().await.expect("stream ended");
            if frame["type"] == kind {
                return frame;
            }
        }
    }

    /// Next event frame carrying the named session event
    pub async fn next_event(&mut self, name: &str) -> Value {
        loop {
            let frame = self.next_of_type("event").await;
            if frame["payload"]["event"] == name {
                return frame;
            }
        }
    }

    async fn read_frame(&mut self) -> Option<Value> {
        loop {
            if let Some(end) = self.buffer.find("\n\n") {
                let block: String = self.buffer.drain(..end + 2).collect();
                let data: Vec<&str> = block
                    .lines()
                    .filter_map(|line| line.strip_prefix("data:"))
                    .map(str::trim_start)
                    .collect();
                // Keep-alive comments carry no data
                if data.is_empty() {
                    continue;
                }
                return Some(serde_json::from_str(&data.join("\n")).expect("frame is not JSON"));
            }

            let frame = self.body.frame().await?.expect("body error");
            if let Ok(data) = frame.into_data() {
                self.buffer.push_str(&String::from_utf8_lossy(&data));
            }
        }
    }
}
