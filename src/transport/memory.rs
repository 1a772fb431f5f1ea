use tokio::sync::mpsc;

use crate::config::SessionConfig;
use crate::protocol::{ClientRequest, ServerEvent};

use super::{Connector, Outbound, TransportEvent, TransportHandle};

/// In-process connector. Every `open` hands the far end of the new transport
/// to whoever holds the matching receiver, which then plays the server.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    remotes: mpsc::UnboundedSender<MemoryRemote>,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryRemote>) {
        let (remotes, rx) = mpsc::unbounded_channel();
        (Self { remotes }, rx)
    }
}

impl Connector for MemoryConnector {
    fn open(&self, config: &SessionConfig) -> TransportHandle {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let remote = MemoryRemote {
            room_id: config.room_id.clone(),
            requests: outbound_rx,
            events: inbound_tx,
            closed_by_client: false,
        };
        // Nobody listening just means the attempt never completes
        let _ = self.remotes.send(remote);

        TransportHandle::new(outbound_tx, inbound_rx)
    }
}

/// Server side of an in-memory transport
#[derive(Debug)]
pub struct MemoryRemote {
    pub room_id: String,
    requests: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<TransportEvent>,
    closed_by_client: bool,
}

impl MemoryRemote {
    fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Complete the namespace connect
    pub fn open(&self, session_id: &str) -> bool {
        self.emit(TransportEvent::Opened {
            session_id: Some(session_id.to_string()),
        })
    }

    pub fn server(&self, event: ServerEvent) -> bool {
        self.emit(TransportEvent::Server(event))
    }

    pub fn connect_error(&self, message: &str) -> bool {
        self.emit(TransportEvent::ConnectError {
            message: message.to_string(),
        })
    }

    pub fn error(&self, message: &str) -> bool {
        self.emit(TransportEvent::Error {
            message: message.to_string(),
        })
    }

    pub fn close(&self, reason: &str) -> bool {
        self.emit(TransportEvent::Closed {
            reason: reason.to_string(),
        })
    }

    /// Next request from the session, `None` once the session closed or
    /// dropped this transport
    pub async fn next_request(&mut self) -> Option<ClientRequest> {
        if self.closed_by_client {
            return None;
        }
        match self.requests.recv().await {
            Some(Outbound::Request(request)) => Some(request),
            Some(Outbound::Close) | None => {
                self.closed_by_client = true;
                None
            }
        }
    }

    /// Requests already queued, without waiting
    pub fn drain_requests(&mut self) -> Vec<ClientRequest> {
        let mut drained = Vec::new();
        while let Ok(outbound) = self.requests.try_recv() {
            match outbound {
                Outbound::Request(request) => drained.push(request),
                Outbound::Close => self.closed_by_client = true,
            }
        }
        drained
    }

    /// Whether the session asked to close or let go of this transport
    pub fn is_closed(&self) -> bool {
        self.closed_by_client || self.events.is_closed()
    }
}
