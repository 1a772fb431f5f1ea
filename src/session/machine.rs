//! Pure session state machine.
//!
//! The machine never touches a socket or a clock. Every input returns the list
//! of actions the session actor must perform, in order. This keeps every
//! transition testable without waiting on real time.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::common::retry::Backoff;
use crate::config::SessionConfig;
use crate::error::RelayError;
use crate::protocol::{ClientRequest, Message, ServerEvent};

use super::events::{ConnectionInfo, SessionEvent, SessionState};
use super::history::MessageHistory;

/// Close reason reported for a deliberate local disconnect
pub const CLIENT_DISCONNECT_REASON: &str = "io client disconnect";

/// Timers a session can arm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Connect watchdog
    ConnectTimeout,
    /// Delay between transport open and the join request
    Settle,
    /// Delay before the alternate join probes
    JoinFallback,
    /// Delay before the alternate history probes
    HistoryFallback,
    /// Backoff before the next connect attempt
    Reconnect,
}

impl TimerKind {
    /// Timers that only make sense while a transport exists
    const CONNECTION_SCOPED: [TimerKind; 4] = [
        TimerKind::ConnectTimeout,
        TimerKind::Settle,
        TimerKind::JoinFallback,
        TimerKind::HistoryFallback,
    ];
}

/// Everything that can happen to a session
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Connect,
    Disconnect,
    SendMessage(String),
    TransportOpened { session_id: Option<String> },
    TransportClosed { reason: String },
    TransportError { message: String },
    ConnectError { message: String },
    Server(ServerEvent),
    TimerFired(TimerKind),
}

/// Side effects requested by the machine
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    OpenTransport,
    CloseTransport,
    Send(ClientRequest),
    Arm(TimerKind, Duration),
    Cancel(TimerKind),
    Publish(SessionEvent),
}

/// State of one upstream session
#[derive(Debug, Clone)]
pub struct SessionMachine {
    config: SessionConfig,
    backoff: Backoff,
    state: SessionState,
    history: MessageHistory,
    connected: bool,
    reconnect_attempts: u32,
    reconnecting: bool,
    should_reconnect: bool,
    history_requested: bool,
    session_id: Option<String>,
}

impl SessionMachine {
    pub fn new(config: SessionConfig) -> Self {
        let backoff = Backoff::new(
            config.timings.reconnect_base_ms,
            config.timings.reconnect_cap_ms,
        );
        let history = MessageHistory::new(config.history_capacity);
        Self {
            config,
            backoff,
            state: SessionState::Idle,
            history,
            connected: false,
            reconnect_attempts: 0,
            reconnecting: false,
            should_reconnect: true,
            history_requested: false,
            session_id: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn room_id(&self) -> &str {
        &self.config.room_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting
    }

    pub fn should_reconnect(&self) -> bool {
        self.should_reconnect
    }

    pub fn history(&self) -> &MessageHistory {
        &self.history
    }

    /// Snapshot for diagnostics
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            state: self.state,
            connected: self.connected,
            room_id: self.config.room_id.clone(),
            username: self.config.display_name.clone(),
            message_count: self.history.len(),
            socket_id: self.session_id.clone(),
            reconnect_attempts: self.reconnect_attempts,
            max_reconnect_attempts: self.config.max_reconnect_attempts,
            is_reconnecting: self.reconnecting,
            should_reconnect: self.should_reconnect,
        }
    }

    /// Apply one input and return the actions to perform
    pub fn handle(&mut self, input: Input) -> Vec<Action> {
        if self.state == SessionState::Stopped {
            debug!(room = %self.config.room_id, ?input, "Session stopped, ignoring input");
            return Vec::new();
        }

        match input {
            Input::Connect => self.on_connect(),
            Input::Disconnect => self.on_disconnect(),
            Input::SendMessage(text) => self.on_send(text),
            Input::TransportOpened { session_id } => self.on_open(session_id),
            Input::TransportClosed { reason } => self.on_closed(reason),
            Input::TransportError { message } => self.on_transport_error(message),
            Input::ConnectError { message } => self.on_connect_error(message),
            Input::Server(event) => self.on_server_event(event),
            Input::TimerFired(kind) => self.on_timer(kind),
        }
    }

    fn on_connect(&mut self) -> Vec<Action> {
        if self.state.is_live() {
            debug!(room = %self.config.room_id, state = %self.state, "Connect ignored, already live");
            return Vec::new();
        }

        let mut actions = Vec::new();
        if self.state == SessionState::ReconnectScheduled {
            actions.push(Action::Cancel(TimerKind::Reconnect));
        }

        // A manual connect restarts the reconnect budget
        self.should_reconnect = true;
        self.reconnect_attempts = 0;
        self.reconnecting = false;

        info!(room = %self.config.room_id, "Connecting to upstream");
        actions.extend(self.begin_connect());
        actions
    }

    fn begin_connect(&mut self) -> Vec<Action> {
        self.state = SessionState::Connecting;
        self.history_requested = false;
        vec![
            Action::OpenTransport,
            Action::Arm(TimerKind::ConnectTimeout, self.config.timings.connect_timeout()),
        ]
    }

    fn on_disconnect(&mut self) -> Vec<Action> {
        info!(room = %self.config.room_id, state = %self.state, "Disconnect requested");
        let was_connected = self.connected;
        let had_transport = self.state.is_live();

        self.should_reconnect = false;
        self.connected = false;
        self.reconnecting = false;
        self.state = SessionState::Stopped;

        let mut actions: Vec<Action> = TimerKind::CONNECTION_SCOPED
            .iter()
            .chain(std::iter::once(&TimerKind::Reconnect))
            .map(|kind| Action::Cancel(*kind))
            .collect();
        if had_transport {
            actions.push(Action::CloseTransport);
        }
        if was_connected {
            actions.push(Action::Publish(SessionEvent::Disconnected {
                reason: CLIENT_DISCONNECT_REASON.to_string(),
            }));
        }
        actions
    }

    fn on_send(&mut self, text: String) -> Vec<Action> {
        if !self.connected {
            debug!(room = %self.config.room_id, "Not connected, dropping outgoing message");
            return Vec::new();
        }
        vec![Action::Send(ClientRequest::SendMessage {
            room_id: self.config.room_id.clone(),
            message: text,
        })]
    }

    fn on_open(&mut self, session_id: Option<String>) -> Vec<Action> {
        if self.state != SessionState::Connecting {
            warn!(room = %self.config.room_id, state = %self.state, "Unexpected transport open");
            return Vec::new();
        }

        info!(room = %self.config.room_id, socket_id = ?session_id, "Connected to upstream");
        self.state = SessionState::Connected;
        self.connected = true;
        self.reconnect_attempts = 0;
        self.reconnecting = false;
        self.session_id = session_id.clone();

        vec![
            Action::Cancel(TimerKind::ConnectTimeout),
            Action::Publish(SessionEvent::Connected { session_id }),
            Action::Arm(TimerKind::Settle, self.config.timings.settle_delay()),
        ]
    }

    fn on_closed(&mut self, reason: String) -> Vec<Action> {
        if !self.state.is_live() {
            debug!(room = %self.config.room_id, %reason, "Close for a transport we no longer own");
            return Vec::new();
        }

        warn!(room = %self.config.room_id, %reason, "Upstream disconnected");
        let mut actions = self.drop_connection();
        actions.push(Action::Publish(SessionEvent::Disconnected {
            reason: reason.clone(),
        }));

        if reason == CLIENT_DISCONNECT_REASON {
            return actions;
        }
        actions.extend(self.schedule_reconnect());
        actions
    }

    fn on_transport_error(&mut self, message: String) -> Vec<Action> {
        if self.state == SessionState::Connecting {
            return self.connect_failed(RelayError::transport(message));
        }
        if !self.state.is_live() {
            return Vec::new();
        }
        warn!(room = %self.config.room_id, %message, "Transport error");
        vec![publish_error(&RelayError::transport(message))]
    }

    fn on_connect_error(&mut self, message: String) -> Vec<Action> {
        if self.state != SessionState::Connecting {
            debug!(room = %self.config.room_id, %message, "Stale connect error");
            return Vec::new();
        }
        self.connect_failed(RelayError::transport(message))
    }

    fn connect_failed(&mut self, error: RelayError) -> Vec<Action> {
        warn!(room = %self.config.room_id, error = %error, "Connect attempt failed");
        let mut actions = self.drop_connection();
        actions.push(publish_error(&error));
        actions.extend(self.schedule_reconnect());
        actions
    }

    /// Release the transport and every timer tied to it
    fn drop_connection(&mut self) -> Vec<Action> {
        self.state = SessionState::Disconnected;
        self.connected = false;
        self.reconnecting = false;
        self.session_id = None;

        let mut actions: Vec<Action> = TimerKind::CONNECTION_SCOPED
            .iter()
            .map(|kind| Action::Cancel(*kind))
            .collect();
        actions.push(Action::CloseTransport);
        actions
    }

    fn schedule_reconnect(&mut self) -> Vec<Action> {
        if !self.should_reconnect {
            return Vec::new();
        }

        self.reconnect_attempts += 1;
        let max = self.config.max_reconnect_attempts;
        if self.reconnect_attempts > max {
            warn!(room = %self.config.room_id, attempts = max, "Max reconnect attempts reached");
            self.reconnecting = false;
            self.state = SessionState::Disconnected;
            return vec![Action::Publish(SessionEvent::MaxReconnectsReached {
                attempts: max,
            })];
        }

        let delay = self.backoff.delay_for_attempt(self.reconnect_attempts);
        info!(
            room = %self.config.room_id,
            attempt = self.reconnect_attempts,
            max_attempts = max,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        self.reconnecting = true;
        self.state = SessionState::ReconnectScheduled;
        vec![Action::Arm(TimerKind::Reconnect, delay)]
    }

    fn on_timer(&mut self, kind: TimerKind) -> Vec<Action> {
        match (kind, self.state) {
            (TimerKind::Reconnect, SessionState::ReconnectScheduled) => {
                debug!(room = %self.config.room_id, attempt = self.reconnect_attempts, "Reconnect timer fired");
                self.begin_connect()
            }
            (TimerKind::ConnectTimeout, SessionState::Connecting) => {
                self.connect_failed(RelayError::timeout(self.config.timings.connect_timeout()))
            }
            (TimerKind::Settle, SessionState::Connected) => {
                self.state = SessionState::JoiningRoom;
                vec![
                    Action::Send(ClientRequest::JoinRoom {
                        room_id: self.config.room_id.clone(),
                        username: self.config.display_name.clone(),
                    }),
                    Action::Arm(TimerKind::JoinFallback, self.config.timings.join_fallback_delay()),
                ]
            }
            (TimerKind::JoinFallback, SessionState::JoiningRoom | SessionState::Active) => {
                if self.state == SessionState::JoiningRoom {
                    self.state = SessionState::Active;
                }
                vec![
                    Action::Send(ClientRequest::Join {
                        room_id: self.config.room_id.clone(),
                    }),
                    Action::Send(ClientRequest::Subscribe {
                        room: self.config.room_id.clone(),
                    }),
                ]
            }
            (TimerKind::HistoryFallback, SessionState::Active) => vec![
                Action::Send(ClientRequest::MessageHistory {
                    room_id: self.config.room_id.clone(),
                }),
                Action::Send(ClientRequest::GetHistory {
                    room: self.config.room_id.clone(),
                    limit: self.history.capacity(),
                }),
                Action::Send(ClientRequest::FetchMessages {
                    room_id: self.config.room_id.clone(),
                }),
            ],
            (kind, state) => {
                debug!(room = %self.config.room_id, ?kind, %state, "Timer fired in unrelated state");
                Vec::new()
            }
        }
    }

    fn on_server_event(&mut self, event: ServerEvent) -> Vec<Action> {
        if !self.connected {
            debug!(room = %self.config.room_id, ?event, "Event without a connection, ignoring");
            return Vec::new();
        }
        if self.config.logging_enabled {
            debug!(room = %self.config.room_id, ?event, "Upstream event");
        }

        match event {
            ServerEvent::JoinRoomResponse { success: true, .. } => {
                self.state = SessionState::Active;
                self.request_history()
            }
            ServerEvent::JoinRoomResponse {
                success: false,
                message,
            } => {
                self.state = SessionState::Active;
                let reason = message.unwrap_or_else(|| "join rejected".to_string());
                warn!(room = %self.config.room_id, %reason, "Join rejected");
                vec![
                    Action::Cancel(TimerKind::JoinFallback),
                    Action::Publish(SessionEvent::ServerError { reason }),
                ]
            }
            ServerEvent::NewMessage(message) => {
                self.mark_active();
                self.history.push(message.clone());
                vec![Action::Publish(SessionEvent::Message(message))]
            }
            ServerEvent::MessageHistory(messages) => {
                self.mark_active();
                self.history.replace(messages);
                vec![Action::Publish(SessionEvent::MessageHistory(
                    self.history.recent(None),
                ))]
            }
            ServerEvent::UserJoined {
                username,
                user_address,
            } => vec![Action::Publish(SessionEvent::UserJoined {
                username,
                user_address,
            })],
            ServerEvent::UserLeft { user_address } => {
                vec![Action::Publish(SessionEvent::UserLeft { user_address })]
            }
            ServerEvent::ServerError(reason) => {
                vec![Action::Publish(SessionEvent::ServerError { reason })]
            }
            ServerEvent::Unknown { name } => {
                debug!(room = %self.config.room_id, event = %name, "Ignoring unknown upstream event");
                Vec::new()
            }
        }
    }

    fn mark_active(&mut self) {
        if self.state == SessionState::JoiningRoom {
            self.state = SessionState::Active;
        }
    }

    fn request_history(&mut self) -> Vec<Action> {
        if self.history_requested {
            return Vec::new();
        }
        self.history_requested = true;
        vec![
            Action::Send(ClientRequest::GetMessageHistory {
                room_id: self.config.room_id.clone(),
                before: None,
                limit: self.history.capacity(),
            }),
            Action::Arm(
                TimerKind::HistoryFallback,
                self.config.timings.history_fallback_delay(),
            ),
        ]
    }
}

fn publish_error(error: &RelayError) -> Action {
    Action::Publish(SessionEvent::Error {
        category: error.category(),
        message: error.to_string(),
    })
}

impl SessionMachine {
    /// Buffered messages, newest last
    pub fn messages(&self, limit: Option<usize>) -> Vec<Message> {
        self.history.recent(limit)
    }

    pub fn latest_message(&self) -> Option<Message> {
        self.history.latest()
    }

    pub fn clear_messages(&mut self) {
        self.history.clear();
    }
}
