use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::config::{SessionConfig, SessionDefaults, UpstreamConfig};
use crate::error::RelayResult;
use crate::session::{ConnectionInfo, SessionClient, SessionState};
use crate::transport::Connector;

/// Identifies one viewer's subscription to a room: `room:viewer:millis`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionKey(String);

impl ConnectionKey {
    pub fn new(room_id: &str, viewer: &str, created_at: DateTime<Utc>) -> Self {
        Self(format!(
            "{}:{}:{}",
            room_id,
            viewer,
            created_at.timestamp_millis()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A registered session
#[derive(Clone)]
pub struct RegistryEntry {
    pub key: ConnectionKey,
    pub room_id: String,
    pub viewer: String,
    pub created_at: DateTime<Utc>,
    pub session: Arc<SessionClient>,
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("key", &self.key)
            .field("state", &self.session.state())
            .finish()
    }
}

/// Serializable view of an entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryInfo {
    pub key: ConnectionKey,
    pub room_id: String,
    pub viewer: String,
    pub created_at: DateTime<Utc>,
    pub connection: ConnectionInfo,
}

impl From<&RegistryEntry> for EntryInfo {
    fn from(entry: &RegistryEntry) -> Self {
        Self {
            key: entry.key.clone(),
            room_id: entry.room_id.clone(),
            viewer: entry.viewer.clone(),
            created_at: entry.created_at,
            connection: entry.session.connection_info(),
        }
    }
}

/// Owns every session, keeping at most one per room
pub struct ConnectionRegistry {
    entries: RwLock<HashMap<ConnectionKey, RegistryEntry>>,
    connector: Arc<dyn Connector>,
    defaults: SessionDefaults,
    upstream: UpstreamConfig,
}

impl ConnectionRegistry {
    pub fn new(connector: Arc<dyn Connector>, defaults: SessionDefaults, upstream: UpstreamConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            connector,
            defaults,
            upstream,
        }
    }

    pub fn defaults(&self) -> &SessionDefaults {
        &self.defaults
    }

    /// Create a session for `room_id`, stopping whatever held the room before.
    /// The new session is registered but not yet connected.
    #[instrument(skip(self))]
    pub async fn start(&self, room_id: &str, viewer: &str) -> RelayResult<RegistryEntry> {
        let config = SessionConfig::for_room(room_id, &self.defaults, &self.upstream);
        config.validate()?;

        let mut entries = self.entries.write().await;

        let stale: Vec<ConnectionKey> = entries
            .values()
            .filter(|entry| entry.room_id == room_id)
            .map(|entry| entry.key.clone())
            .collect();
        for key in stale {
            if let Some(old) = entries.remove(&key) {
                info!(room = room_id, key = %key, "Replacing existing session");
                old.session.disconnect().await;
            }
        }

        let created_at = Utc::now();
        let entry = RegistryEntry {
            key: ConnectionKey::new(room_id, viewer, created_at),
            room_id: room_id.to_string(),
            viewer: viewer.to_string(),
            created_at,
            session: Arc::new(SessionClient::new(config, Arc::clone(&self.connector))?),
        };
        entries.insert(entry.key.clone(), entry.clone());

        info!(room = room_id, key = %entry.key, sessions = entries.len(), "Session registered");
        Ok(entry)
    }

    /// Remove an entry and stop its session
    pub async fn remove(&self, key: &ConnectionKey) -> Option<RegistryEntry> {
        let removed = self.entries.write().await.remove(key);
        if let Some(entry) = &removed {
            debug!(key = %key, "Session deregistered");
            entry.session.disconnect().await;
        }
        removed
    }

    /// Stop every session for a room; returns how many were stopped
    pub async fn stop_room(&self, room_id: &str) -> usize {
        let removed: Vec<RegistryEntry> = {
            let mut entries = self.entries.write().await;
            let keys: Vec<ConnectionKey> = entries
                .values()
                .filter(|entry| entry.room_id == room_id)
                .map(|entry| entry.key.clone())
                .collect();
            keys.iter().filter_map(|key| entries.remove(key)).collect()
        };

        for entry in &removed {
            entry.session.disconnect().await;
        }
        if !removed.is_empty() {
            info!(room = room_id, count = removed.len(), "Room stopped");
        }
        removed.len()
    }

    /// Newest session for a room that has not been stopped
    pub async fn find_by_room(&self, room_id: &str) -> Option<Arc<SessionClient>> {
        self.entries
            .read()
            .await
            .values()
            .filter(|entry| entry.room_id == room_id)
            .filter(|entry| entry.session.state() != SessionState::Stopped)
            .max_by_key(|entry| entry.created_at)
            .map(|entry| Arc::clone(&entry.session))
    }

    pub async fn get(&self, key: &ConnectionKey) -> Option<RegistryEntry> {
        self.entries.read().await.get(key).cloned()
    }

    /// Snapshot of all entries, oldest first
    pub async fn entries(&self) -> Vec<EntryInfo> {
        let entries = self.entries.read().await;
        let mut infos: Vec<EntryInfo> = entries.values().map(EntryInfo::from).collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    /// Drop entries whose session is already stopped
    pub async fn prune_stopped(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.session.state() != SessionState::Stopped);
        let pruned = before - entries.len();
        if pruned > 0 {
            debug!(pruned, "Pruned stopped sessions");
        }
        pruned
    }

    /// Stop and remove every session
    pub async fn shutdown(&self) {
        let drained: Vec<RegistryEntry> = self.entries.write().await.drain().map(|(_, entry)| entry).collect();
        info!(count = drained.len(), "Shutting down all sessions");
        for entry in drained {
            entry.session.disconnect().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
