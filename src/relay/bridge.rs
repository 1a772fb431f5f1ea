use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::Stream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{RelayError, RelayResult};
use crate::plays::{Play, PlayPattern, PlayStore, RecordOutcome};
use crate::protocol::Message;
use crate::registry::{ConnectionKey, ConnectionRegistry};
use crate::session::{SessionClient, SessionEvent, SessionState};

use super::{LogBook, LogLevel, RelayFrame};

/// How often an idle viewer stream checks whether its session was stopped
const STOPPED_POLL: Duration = Duration::from_secs(1);

/// Where extracted plays go.
///
/// Plays are recorded by one worker task per sink, in the order their
/// messages arrived, so a later play by an author always lands last.
#[derive(Clone)]
pub struct PlaySink {
    pub pattern: PlayPattern,
    pub store: Arc<dyn PlayStore>,
    queue: mpsc::UnboundedSender<Play>,
}

impl PlaySink {
    /// Start the recording worker. Must be called inside a tokio runtime.
    pub fn new(pattern: PlayPattern, store: Arc<dyn PlayStore>) -> Self {
        let (queue, plays) = mpsc::unbounded_channel();
        tokio::spawn(record_plays(Arc::clone(&store), plays));
        Self { pattern, store, queue }
    }

    /// Extract a play from a chat message and queue it for recording
    pub fn offer(&self, message: &Message) {
        let Some(play) = self.pattern.extract(message) else {
            return;
        };
        if self.queue.send(play).is_err() {
            warn!(message_id = %message.id, "Play recorder stopped, play dropped");
        }
    }
}

/// Records queued plays one at a time until every sink is dropped
async fn record_plays(store: Arc<dyn PlayStore>, mut plays: mpsc::UnboundedReceiver<Play>) {
    while let Some(play) = plays.recv().await {
        let author = play.username.clone();
        let code = play.code.clone();
        match store.record_play(play).await {
            Ok(RecordOutcome::Inserted) => info!(%author, %code, "Play recorded"),
            Ok(RecordOutcome::Replaced) => info!(%author, %code, "Play replaced"),
            Ok(RecordOutcome::Stale) => debug!(%author, %code, "Older play ignored"),
            Err(e) => warn!(%author, error = %e, "Failed to record play"),
        }
    }
    debug!("Play recorder finished");
}

/// Connects one viewer to one session
pub struct RelayBridge {
    key: ConnectionKey,
    room_id: String,
    session: Arc<SessionClient>,
    registry: Arc<ConnectionRegistry>,
    plays: Option<PlaySink>,
    log_book: Arc<LogBook>,
    logging_enabled: bool,
    closed: AtomicBool,
}

impl RelayBridge {
    /// Register a fresh session for the room, subscribe, then connect it
    pub async fn open(
        registry: Arc<ConnectionRegistry>,
        room_id: &str,
        viewer: &str,
        plays: Option<PlaySink>,
        log_book: Arc<LogBook>,
    ) -> RelayResult<(Arc<Self>, broadcast::Receiver<SessionEvent>)> {
        let entry = registry.start(room_id, viewer).await?;
        let logging_enabled = registry.defaults().logging_enabled;

        // Subscribe before connecting so no event is missed
        let events = entry.session.subscribe();
        entry.session.connect();

        info!(room = room_id, viewer, key = %entry.key, "Relay bridge opened");
        let bridge = Arc::new(Self {
            key: entry.key,
            room_id: room_id.to_string(),
            session: entry.session,
            registry,
            plays,
            log_book,
            logging_enabled,
            closed: AtomicBool::new(false),
        });
        Ok((bridge, events))
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn session(&self) -> &Arc<SessionClient> {
        &self.session
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop the session and deregister. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(room = %self.room_id, key = %self.key, "Closing relay bridge");
        self.session.disconnect().await;
        self.registry.remove(&self.key).await;
    }

    fn log(&self, level: LogLevel, message: String) -> Option<RelayFrame> {
        if !self.logging_enabled {
            return None;
        }
        self.log_book.push(&self.room_id, level, &message);
        Some(RelayFrame::log(level, message))
    }

    /// Log line accompanying an event, if any
    fn describe(&self, event: &SessionEvent) -> Option<RelayFrame> {
        match event {
            SessionEvent::Connected { session_id } => self.log(
                LogLevel::Info,
                format!(
                    "Connected to {} (socket {})",
                    self.room_id,
                    session_id.as_deref().unwrap_or("unknown")
                ),
            ),
            SessionEvent::Disconnected { reason } => {
                self.log(LogLevel::Warn, format!("Disconnected: {}", reason))
            }
            SessionEvent::Error { message, .. } => self.log(LogLevel::Error, message.clone()),
            SessionEvent::ServerError { reason } => {
                self.log(LogLevel::Error, format!("Server error: {}", reason))
            }
            SessionEvent::MessageHistory(messages) => self.log(
                LogLevel::Info,
                format!("Loaded {} messages of history", messages.len()),
            ),
            SessionEvent::MaxReconnectsReached { attempts } => self.log(
                LogLevel::Error,
                format!("Gave up after {} reconnect attempts", attempts),
            ),
            _ => None,
        }
    }

    /// Frames for the viewer. Dropping the stream closes the bridge.
    pub fn frames(
        self: Arc<Self>,
        mut events: broadcast::Receiver<SessionEvent>,
    ) -> impl Stream<Item = RelayFrame> + Send + 'static {
        // Created outside the generator so an unpolled stream still closes
        let guard = CloseOnDrop(Arc::clone(&self));
        stream! {
            let _guard = guard;

            if let Some(frame) = self.log(LogLevel::Info, format!("Joining room {}", self.room_id)) {
                yield frame;
            }

            loop {
                let received = match timeout(STOPPED_POLL, events.recv()).await {
                    Ok(received) => received,
                    // A session stopped before it ever connected publishes nothing
                    Err(_) if self.session.state() == SessionState::Stopped => {
                        self.close().await;
                        break;
                    }
                    Err(_) => continue,
                };
                match received {
                    Ok(event) => {
                        if let (SessionEvent::Message(message), Some(plays)) = (&event, &self.plays) {
                            plays.offer(message);
                        }
                        if let Some(frame) = self.describe(&event) {
                            yield frame;
                        }

                        let exhausted = matches!(event, SessionEvent::MaxReconnectsReached { .. });
                        yield RelayFrame::event(event);
                        // Stopped elsewhere, e.g. replaced by a newer viewer of the room
                        if exhausted || self.session.state() == SessionState::Stopped {
                            self.close().await;
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(room = %self.room_id, skipped, "Viewer lagging behind session");
                        if let Some(frame) = self.log(LogLevel::Warn, format!("Skipped {} events", skipped)) {
                            yield frame;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

/// Closes the bridge when the viewer's stream goes away
struct CloseOnDrop(Arc<RelayBridge>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        if self.0.is_closed() {
            return;
        }
        let bridge = Arc::clone(&self.0);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                debug!(key = %bridge.key, "Viewer went away");
                bridge.close().await;
            });
        }
    }
}

/// Route a chat message from a viewer to the room's live session
pub async fn route_chat_message(registry: &ConnectionRegistry, room_id: &str, text: &str) -> RelayResult<()> {
    if text.trim().is_empty() {
        return Err(RelayError::invalid_command("message text cannot be empty"));
    }
    let session = registry
        .find_by_room(room_id)
        .await
        .ok_or_else(|| RelayError::no_active_session(room_id))?;
    if !session.send_message(text) {
        return Err(RelayError::not_connected(room_id));
    }
    Ok(())
}
