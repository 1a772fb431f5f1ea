//! Upstream transports.
//!
//! A [`Connector`] opens one transport per connect attempt. The transport runs
//! on its own task and talks to the session only through channels, so the
//! session can drop a stale transport simply by dropping its handle.

mod memory;
mod websocket;

pub use memory::{MemoryConnector, MemoryRemote};
pub use websocket::WsConnector;

use tokio::sync::mpsc;

use crate::config::SessionConfig;
use crate::protocol::{ClientRequest, ServerEvent};

/// Reason reported when the remote closes the socket
pub const TRANSPORT_CLOSE_REASON: &str = "transport close";
/// Reason reported when the server disconnects the namespace
pub const SERVER_DISCONNECT_REASON: &str = "io server disconnect";
/// Reason reported when the socket fails mid-stream
pub const TRANSPORT_ERROR_REASON: &str = "transport error";
/// Reason reported when the server stops sending heartbeats
pub const PING_TIMEOUT_REASON: &str = "ping timeout";

/// What a transport reports back to its session
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Namespace connected
    Opened { session_id: Option<String> },
    /// Decoded server event
    Server(ServerEvent),
    /// Connection refused before opening
    ConnectError { message: String },
    /// Non-fatal error on an open connection
    Error { message: String },
    /// Transport is gone
    Closed { reason: String },
}

/// Instructions from the session to its transport
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Request(ClientRequest),
    /// Disconnect the namespace and close the socket
    Close,
}

/// Session side of one open transport
#[derive(Debug)]
pub struct TransportHandle {
    outbound: mpsc::UnboundedSender<Outbound>,
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

impl TransportHandle {
    pub fn new(
        outbound: mpsc::UnboundedSender<Outbound>,
        inbound: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self { outbound, inbound }
    }

    /// Queue a request; returns false if the transport task is gone
    pub fn send(&self, request: ClientRequest) -> bool {
        self.outbound.send(Outbound::Request(request)).is_ok()
    }

    /// Ask the transport to shut down. The handle is consumed, so no event
    /// from this transport reaches the session afterwards.
    pub fn close(self) {
        let _ = self.outbound.send(Outbound::Close);
    }

    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.inbound.recv().await
    }
}

/// Opens transports for a session
pub trait Connector: Send + Sync {
    /// Start connecting. Must not block; progress is reported as
    /// [`TransportEvent`]s on the returned handle.
    fn open(&self, config: &SessionConfig) -> TransportHandle;
}
