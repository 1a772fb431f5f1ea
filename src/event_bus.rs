use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, trace};

use crate::session::SessionEvent;

/// Default number of events buffered per subscriber
pub const DEFAULT_EVENT_BUS_CAPACITY: usize = 256;

/// Counters kept by an [`EventBus`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventBusStats {
    /// Number of events delivered to at least one subscriber
    pub events_published: u64,
    /// Events published while nobody was subscribed
    pub events_dropped: u64,
    /// Count of events by name
    pub type_counts: HashMap<String, u64>,
}

/// Fan-out of one session's events to any number of subscribers
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
    capacity: usize,
    pub(crate) stats: Arc<RwLock<EventBusStats>>,
}

impl EventBus {
    /// A capacity of zero is raised to one
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        trace!(capacity, "Creating new event bus");
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            stats: Arc::new(RwLock::new(EventBusStats::default())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        trace!(subscribers = self.sender.receiver_count() + 1, "Session event subscriber added");
        self.sender.subscribe()
    }

    /// Publish an event to all subscribers, returning how many received it.
    ///
    /// Publishing with nobody listening is not an error; the event is counted
    /// as dropped.
    pub async fn publish(&self, event: SessionEvent) -> usize {
        let name = event.name();
        trace!(event = name, "Publishing event to bus");

        match self.sender.send(event) {
            Ok(receivers) => {
                let mut stats = self.stats.write().await;
                stats.events_published += 1;
                *stats.type_counts.entry(name.to_string()).or_insert(0) += 1;

                trace!(event = name, receivers, "Event delivered");
                receivers
            }
            Err(_) => {
                self.stats.write().await.events_dropped += 1;
                trace!(event = name, "No receivers for event, message dropped");
                0
            }
        }
    }

    /// Snapshot of the counters
    pub async fn get_stats(&self) -> EventBusStats {
        self.stats.read().await.clone()
    }

    pub async fn reset_stats(&self) {
        debug!("Session event counters reset");
        *self.stats.write().await = EventBusStats::default();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Live receivers, including lagging ones
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUS_CAPACITY)
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            capacity: self.capacity,
            stats: Arc::clone(&self.stats),
        }
    }
}
