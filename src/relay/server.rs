use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::{RelayError, RelayResult};
use crate::plays::Play;
use crate::registry::{ConnectionRegistry, EntryInfo};

use super::bridge::{route_chat_message, PlaySink, RelayBridge};
use super::{LogBook, LogEntry, RelayFrame};

const SSE_KEEPALIVE: Duration = Duration::from_secs(15);

/// Shared state of the relay server
#[derive(Clone)]
pub struct RelayState {
    pub registry: Arc<ConnectionRegistry>,
    pub plays: Option<PlaySink>,
    pub log_book: Arc<LogBook>,
}

impl RelayState {
    pub fn new(registry: Arc<ConnectionRegistry>, plays: Option<PlaySink>, log_book: Arc<LogBook>) -> Self {
        Self {
            registry,
            plays,
            log_book,
        }
    }
}

/// API routes, without middleware
pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/rooms/:room/stream", get(stream_handler))
        .route("/api/rooms/:room/stop", post(stop_room_handler))
        .route("/api/send", post(send_handler))
        .route("/api/sessions", get(sessions_handler))
        .route("/api/plays", get(list_plays_handler).delete(clear_plays_handler))
        .route("/api/logs", get(list_logs_handler).delete(clear_logs_handler))
        .with_state(state)
}

/// Bind and serve until the process is interrupted
pub async fn serve(state: RelayState, addr: SocketAddr, cors_enabled: bool) -> anyhow::Result<()> {
    let registry = Arc::clone(&state.registry);

    let mut app = router(state).layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));
    if cors_enabled {
        app = app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Relay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    registry.shutdown().await;
    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    #[serde(default)]
    viewer: Option<String>,
}

async fn stream_handler(
    State(state): State<RelayState>,
    Path(room): Path<String>,
    Query(query): Query<StreamQuery>,
) -> RelayResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let viewer = query
        .viewer
        .filter(|viewer| !viewer.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let (bridge, events) = RelayBridge::open(
        Arc::clone(&state.registry),
        &room,
        &viewer,
        state.plays.clone(),
        Arc::clone(&state.log_book),
    )
    .await?;

    let stream = bridge
        .frames(events)
        .filter_map(|frame| async move { sse_event(&frame).map(Ok::<Event, Infallible>) });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(SSE_KEEPALIVE)))
}

fn sse_event(frame: &RelayFrame) -> Option<Event> {
    match serde_json::to_string(frame) {
        Ok(payload) => Some(Event::default().event(frame.name()).data(payload)),
        Err(e) => {
            warn!(error = %e, "Failed to serialize relay frame");
            None
        }
    }
}

#[derive(Debug, Deserialize)]
struct SendRequest {
    room: String,
    text: String,
}

/// Failures are reported through `RelayError` as `{success: false, error}`
#[derive(Debug, Serialize)]
struct SendResponse {
    success: bool,
}

async fn send_handler(
    State(state): State<RelayState>,
    Json(request): Json<SendRequest>,
) -> Result<Json<SendResponse>, RelayError> {
    route_chat_message(&state.registry, &request.room, &request.text).await?;
    Ok(Json(SendResponse { success: true }))
}

#[derive(Debug, Serialize)]
struct SessionsResponse {
    success: bool,
    sessions: Vec<EntryInfo>,
}

async fn sessions_handler(State(state): State<RelayState>) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        success: true,
        sessions: state.registry.entries().await,
    })
}

async fn stop_room_handler(
    State(state): State<RelayState>,
    Path(room): Path<String>,
) -> RelayResult<impl IntoResponse> {
    let stopped = state.registry.stop_room(&room).await;
    if stopped == 0 {
        return Err(RelayError::no_active_session(room));
    }
    Ok(Json(json!({ "success": true, "stopped": stopped })))
}

#[derive(Debug, Serialize)]
struct PlaysResponse {
    success: bool,
    plays: Vec<Play>,
}

async fn list_plays_handler(State(state): State<RelayState>) -> RelayResult<Json<PlaysResponse>> {
    let plays = match &state.plays {
        Some(sink) => sink.store.plays().await?,
        None => Vec::new(),
    };
    Ok(Json(PlaysResponse {
        success: true,
        plays,
    }))
}

async fn clear_plays_handler(State(state): State<RelayState>) -> RelayResult<impl IntoResponse> {
    if let Some(sink) = &state.plays {
        sink.store.clear().await?;
    }
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Serialize)]
struct LogsResponse {
    success: bool,
    logs: Vec<LogEntry>,
}

async fn list_logs_handler(State(state): State<RelayState>) -> Json<LogsResponse> {
    Json(LogsResponse {
        success: true,
        logs: state.log_book.entries(),
    })
}

async fn clear_logs_handler(State(state): State<RelayState>) -> impl IntoResponse {
    let cleared = state.log_book.clear();
    Json(json!({ "success": true, "cleared": cleared }))
}
