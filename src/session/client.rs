use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, instrument, trace, warn};

use crate::config::SessionConfig;
use crate::error::RelayResult;
use crate::event_bus::{EventBus, EventBusStats};
use crate::protocol::Message;
use crate::transport::{Connector, TransportEvent, TransportHandle, TRANSPORT_CLOSE_REASON};

use super::events::{ConnectionInfo, SessionEvent, SessionState};
use super::machine::{Action, Input, SessionMachine, TimerKind};

enum Command {
    Input(Input),
    Disconnect(oneshot::Sender<()>),
}

/// Handle to one upstream session.
///
/// The session itself runs on a background task which owns the transport and
/// every timer. Dropping the handle stops the session.
pub struct SessionClient {
    room_id: String,
    machine: Arc<Mutex<SessionMachine>>,
    commands: mpsc::UnboundedSender<Command>,
    events: EventBus,
    transport_up: Arc<AtomicBool>,
}

impl SessionClient {
    /// Create a session in the `Idle` state. Must be called inside a tokio
    /// runtime.
    pub fn new(config: SessionConfig, connector: Arc<dyn Connector>) -> RelayResult<Self> {
        config.validate()?;

        let room_id = config.room_id.clone();
        let machine = Arc::new(Mutex::new(SessionMachine::new(config)));
        let events = EventBus::default();
        let transport_up = Arc::new(AtomicBool::new(false));
        let (commands, command_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            machine: Arc::clone(&machine),
            events: events.clone(),
            connector,
            commands: command_rx,
            transport: None,
            transport_up: Arc::clone(&transport_up),
            timers: TimerSet::default(),
        };
        tokio::spawn(driver.run());

        Ok(Self {
            room_id,
            machine,
            commands,
            events,
            transport_up,
        })
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn display_name(&self) -> String {
        self.machine.lock().config().display_name.clone()
    }

    /// Start connecting. No-op while a connection is live.
    #[instrument(skip(self), fields(room = %self.room_id))]
    pub fn connect(&self) {
        self.input(Input::Connect);
    }

    /// Stop the session for good. Resolves once it is `Stopped`.
    #[instrument(skip(self), fields(room = %self.room_id))]
    pub async fn disconnect(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Disconnect(ack)).is_err() {
            // Driver already gone, the session is stopped
            return;
        }
        let _ = done.await;
    }

    /// Post a chat message. Returns false if the session is not active or
    /// the text is blank.
    pub fn send_message(&self, text: impl Into<String>) -> bool {
        let text = text.into();
        if text.trim().is_empty() || !self.is_active() {
            return false;
        }
        self.input(Input::SendMessage(text))
    }

    fn input(&self, input: Input) -> bool {
        self.commands.send(Command::Input(input)).is_ok()
    }

    /// Logically connected and the transport agrees
    pub fn is_active(&self) -> bool {
        self.machine.lock().is_connected() && self.transport_up.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SessionState {
        self.machine.lock().state()
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        self.machine.lock().info()
    }

    pub fn get_messages(&self, limit: Option<usize>) -> Vec<Message> {
        self.machine.lock().messages(limit)
    }

    pub fn get_latest_message(&self) -> Option<Message> {
        self.machine.lock().latest_message()
    }

    pub fn clear_messages(&self) {
        self.machine.lock().clear_messages();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn event_stats(&self) -> EventBusStats {
        self.events.get_stats().await
    }
}

enum Wake {
    Command(Option<Command>),
    Transport(Option<TransportEvent>),
    Timer(TimerKind),
}

/// The session actor
struct Driver {
    machine: Arc<Mutex<SessionMachine>>,
    events: EventBus,
    connector: Arc<dyn Connector>,
    commands: mpsc::UnboundedReceiver<Command>,
    transport: Option<TransportHandle>,
    transport_up: Arc<AtomicBool>,
    timers: TimerSet,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let wake = tokio::select! {
                command = self.commands.recv() => Wake::Command(command),
                event = next_transport_event(self.transport.as_mut()) => Wake::Transport(event),
                kind = self.timers.next_expired() => Wake::Timer(kind),
            };

            match wake {
                Wake::Command(Some(Command::Input(input))) => self.apply(input).await,
                Wake::Command(Some(Command::Disconnect(ack))) => {
                    self.apply(Input::Disconnect).await;
                    let _ = ack.send(());
                    break;
                }
                Wake::Command(None) => {
                    debug!("Session handle dropped, stopping");
                    self.apply(Input::Disconnect).await;
                    break;
                }
                Wake::Transport(Some(event)) => {
                    let input = self.transport_input(event);
                    self.apply(input).await;
                }
                Wake::Transport(None) => {
                    // Transport task ended without saying why
                    self.transport = None;
                    self.transport_up.store(false, Ordering::SeqCst);
                    self.apply(Input::TransportClosed {
                        reason: TRANSPORT_CLOSE_REASON.to_string(),
                    })
                    .await;
                }
                Wake::Timer(kind) => self.apply(Input::TimerFired(kind)).await,
            }
        }

        self.timers.clear();
        trace!("Session driver finished");
    }

    fn transport_input(&mut self, event: TransportEvent) -> Input {
        match event {
            TransportEvent::Opened { session_id } => {
                self.transport_up.store(true, Ordering::SeqCst);
                Input::TransportOpened { session_id }
            }
            TransportEvent::Server(event) => Input::Server(event),
            TransportEvent::ConnectError { message } => Input::ConnectError { message },
            TransportEvent::Error { message } => Input::TransportError { message },
            TransportEvent::Closed { reason } => {
                self.transport = None;
                self.transport_up.store(false, Ordering::SeqCst);
                Input::TransportClosed { reason }
            }
        }
    }

    async fn apply(&mut self, input: Input) {
        // The lock is released before any action runs
        let actions = self.machine.lock().handle(input);
        for action in actions {
            self.execute(action).await;
        }
    }

    async fn execute(&mut self, action: Action) {
        match action {
            Action::OpenTransport => {
                if let Some(stale) = self.transport.take() {
                    stale.close();
                }
                self.transport_up.store(false, Ordering::SeqCst);
                let config = self.machine.lock().config().clone();
                self.transport = Some(self.connector.open(&config));
            }
            Action::CloseTransport => {
                if let Some(transport) = self.transport.take() {
                    transport.close();
                }
                self.transport_up.store(false, Ordering::SeqCst);
            }
            Action::Send(request) => match &self.transport {
                Some(transport) => {
                    if !transport.send(request) {
                        warn!("Transport task gone, request dropped");
                    }
                }
                None => debug!(event = request.event_name(), "No transport, request dropped"),
            },
            Action::Arm(kind, after) => self.timers.arm(kind, after),
            Action::Cancel(kind) => self.timers.cancel(kind),
            Action::Publish(event) => {
                self.events.publish(event).await;
            }
        }
    }
}

async fn next_transport_event(transport: Option<&mut TransportHandle>) -> Option<TransportEvent> {
    match transport {
        Some(transport) => transport.recv().await,
        None => std::future::pending().await,
    }
}

/// Pending deadlines, at most one per kind
#[derive(Debug, Default)]
struct TimerSet {
    deadlines: HashMap<TimerKind, Instant>,
}

impl TimerSet {
    fn arm(&mut self, kind: TimerKind, after: Duration) {
        self.deadlines.insert(kind, Instant::now() + after);
    }

    fn cancel(&mut self, kind: TimerKind) {
        self.deadlines.remove(&kind);
    }

    fn clear(&mut self) {
        self.deadlines.clear();
    }

    /// Wait for the earliest deadline and disarm it. Cancel safe: nothing is
    /// removed unless the deadline actually passed.
    async fn next_expired(&mut self) -> TimerKind {
        let Some((kind, deadline)) = self
            .deadlines
            .iter()
            .min_by_key(|(_, deadline)| **deadline)
            .map(|(kind, deadline)| (*kind, *deadline))
        else {
            return std::future::pending().await;
        };

        sleep_until(deadline).await;
        self.deadlines.remove(&kind);
        kind
    }
}
