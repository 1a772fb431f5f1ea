use std::str::FromStr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use http::{HeaderName, HeaderValue};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

use crate::config::SessionConfig;
use crate::error::{RelayError, RelayResult};
use crate::protocol::frame::{DISCONNECT, PONG};
use crate::protocol::{encode_connect, encode_event, Packet, ServerEvent};

use super::{
    Connector, Outbound, TransportEvent, TransportHandle, PING_TIMEOUT_REASON,
    SERVER_DISCONNECT_REASON, TRANSPORT_CLOSE_REASON, TRANSPORT_ERROR_REASON,
};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Used until the server's handshake tells us its heartbeat interval
const DEFAULT_HEARTBEAT_WINDOW: Duration = Duration::from_secs(45);

/// Socket.IO over a real websocket
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WsConnector {
    fn open(&self, config: &SessionConfig) -> TransportHandle {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let config = config.clone();
        tokio::spawn(async move {
            run_transport(config, outbound_rx, inbound_tx).await;
        });

        TransportHandle::new(outbound_tx, inbound_rx)
    }
}

/// Build the upgrade request with the configured header profile
fn build_request(
    config: &SessionConfig,
) -> RelayResult<tokio_tungstenite::tungstenite::handshake::client::Request> {
    let url = config.upstream.socket_url();
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| RelayError::transport(format!("Failed to build websocket request: {}", e)))?;

    for (name, value) in &config.upstream.headers {
        let header_name = HeaderName::from_str(name)
            .map_err(|e| RelayError::config_invalid("upstream.headers", format!("{}: {}", name, e)))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|e| RelayError::config_invalid("upstream.headers", format!("{}: {}", name, e)))?;
        request.headers_mut().insert(header_name, header_value);
    }

    Ok(request)
}

async fn run_transport(
    config: SessionConfig,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    inbound: mpsc::UnboundedSender<TransportEvent>,
) {
    let room = config.room_id.clone();

    let request = match build_request(&config) {
        Ok(request) => request,
        Err(e) => {
            let _ = inbound.send(TransportEvent::ConnectError {
                message: e.to_string(),
            });
            return;
        }
    };

    info!(room = %room, url = %config.upstream.socket_url(), "Opening upstream websocket");

    // The session's own watchdog bounds how long this may take
    let mut ws = match connect_async(request).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            warn!(room = %room, error = %e, "Websocket connection failed");
            let _ = inbound.send(TransportEvent::ConnectError {
                message: format!("websocket connection failed: {}", e),
            });
            return;
        }
    };

    let mut opened = false;
    let mut heartbeat_window = DEFAULT_HEARTBEAT_WINDOW;
    let mut heartbeat_deadline = Instant::now() + heartbeat_window;

    loop {
        tokio::select! {
            command = outbound.recv() => {
                match command {
                    Some(Outbound::Request(request)) => {
                        let text = encode_event(request.event_name(), &request.payload());
                        trace!(room = %room, event = request.event_name(), "Sending request");
                        if let Err(e) = ws.send(WsMessage::text(text)).await {
                            error!(room = %room, error = %e, "Failed to send request");
                            let _ = inbound.send(TransportEvent::Error { message: e.to_string() });
                        }
                    }
                    Some(Outbound::Close) | None => {
                        debug!(room = %room, "Closing upstream websocket");
                        shutdown(&mut ws, opened).await;
                        return;
                    }
                }
            }
            frame = ws.next() => {
                let reason = match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        match handle_packet(&mut ws, &inbound, &config, text.as_str(), &mut opened).await {
                            PacketOutcome::Continue => continue,
                            PacketOutcome::Heartbeat(window) => {
                                if let Some(window) = window {
                                    heartbeat_window = window;
                                }
                                heartbeat_deadline = Instant::now() + heartbeat_window;
                                continue;
                            }
                            PacketOutcome::Closed(reason) => reason,
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = ws.send(WsMessage::Pong(data)).await;
                        continue;
                    }
                    Some(Ok(WsMessage::Binary(_))) => {
                        debug!(room = %room, "Ignoring binary frame");
                        continue;
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        debug!(room = %room, ?frame, "Websocket closed by server");
                        TRANSPORT_CLOSE_REASON.to_string()
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(WsError::ConnectionClosed)) | None => TRANSPORT_CLOSE_REASON.to_string(),
                    Some(Err(e)) => {
                        warn!(room = %room, error = %e, "Websocket error");
                        let _ = inbound.send(TransportEvent::Error { message: e.to_string() });
                        TRANSPORT_ERROR_REASON.to_string()
                    }
                };
                let _ = inbound.send(TransportEvent::Closed { reason });
                return;
            }
            _ = sleep_until(heartbeat_deadline) => {
                warn!(room = %room, "No heartbeat from upstream");
                let _ = ws.close(None).await;
                let _ = inbound.send(TransportEvent::Closed { reason: PING_TIMEOUT_REASON.to_string() });
                return;
            }
            _ = inbound.closed() => {
                // The session dropped its handle
                shutdown(&mut ws, opened).await;
                return;
            }
        }
    }
}

enum PacketOutcome {
    Continue,
    /// Server heartbeat seen; carries a new window from the handshake
    Heartbeat(Option<Duration>),
    Closed(String),
}

async fn handle_packet(
    ws: &mut WsStream,
    inbound: &mpsc::UnboundedSender<TransportEvent>,
    config: &SessionConfig,
    text: &str,
    opened: &mut bool,
) -> PacketOutcome {
    let room = &config.room_id;
    let packet = match Packet::decode(text) {
        Ok(packet) => packet,
        Err(e) => {
            warn!(room = %room, error = %e, "Dropping malformed packet");
            return PacketOutcome::Continue;
        }
    };

    match packet {
        Packet::Open(handshake) => {
            debug!(room = %room, sid = %handshake.sid, "Engine handshake received");
            if let Err(e) = ws
                .send(WsMessage::text(encode_connect(config.upstream.auth.as_ref())))
                .await
            {
                return PacketOutcome::Closed(format!("{}: {}", TRANSPORT_ERROR_REASON, e));
            }
            let window = Duration::from_millis(handshake.ping_interval + handshake.ping_timeout);
            PacketOutcome::Heartbeat((!window.is_zero()).then_some(window))
        }
        Packet::Ping => {
            let _ = ws.send(WsMessage::text(PONG)).await;
            PacketOutcome::Heartbeat(None)
        }
        Packet::Connect { sid } => {
            *opened = true;
            let _ = inbound.send(TransportEvent::Opened { session_id: sid });
            PacketOutcome::Continue
        }
        Packet::Event { name, args } => {
            match ServerEvent::from_wire(&name, &args) {
                Ok(event) => {
                    let _ = inbound.send(TransportEvent::Server(event));
                }
                Err(e) => warn!(room = %room, event = %name, error = %e, "Failed to decode server event"),
            }
            PacketOutcome::Continue
        }
        Packet::ConnectError { message } => {
            let event = if *opened {
                TransportEvent::Error { message }
            } else {
                TransportEvent::ConnectError { message }
            };
            let _ = inbound.send(event);
            PacketOutcome::Continue
        }
        Packet::Disconnect => PacketOutcome::Closed(SERVER_DISCONNECT_REASON.to_string()),
        Packet::Close => PacketOutcome::Closed(TRANSPORT_CLOSE_REASON.to_string()),
        Packet::Ack { id, .. } => {
            trace!(room = %room, id, "Ignoring acknowledgement");
            PacketOutcome::Continue
        }
        Packet::Pong | Packet::Noop => PacketOutcome::Continue,
    }
}

async fn shutdown(ws: &mut WsStream, opened: bool) {
    if opened {
        let _ = ws.send(WsMessage::text(DISCONNECT)).await;
    }
    let _ = ws.close(None).await;
}
