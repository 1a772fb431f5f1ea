use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::common::retry::{exponential_backoff, with_retry_and_backoff};
use crate::error::{RelayError, RelayResult};

use super::Play;

const PERSIST_ATTEMPTS: usize = 3;
const PERSIST_BACKOFF_BASE_MS: u64 = 50;
const PERSIST_BACKOFF_MAX_MS: u64 = 500;

/// What recording a play did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    /// First play from this author
    Inserted,
    /// Replaced the author's previous play
    Replaced,
    /// The author already has a newer play, which was kept
    Stale,
}

/// Persistence for plays
#[async_trait]
pub trait PlayStore: Send + Sync {
    /// Store a play, replacing any older play by the same author
    async fn record_play(&self, play: Play) -> RelayResult<RecordOutcome>;

    /// All stored plays, oldest first
    async fn plays(&self) -> RelayResult<Vec<Play>>;

    async fn clear(&self) -> RelayResult<()>;
}

/// Plays kept in memory only
#[derive(Debug, Default)]
pub struct MemoryPlayStore {
    plays: DashMap<String, Play>,
}

impl MemoryPlayStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, play: Play) -> RecordOutcome {
        match self.plays.entry(play.author_key()) {
            Entry::Occupied(mut entry) => {
                if entry.get().recorded_at > play.recorded_at {
                    return RecordOutcome::Stale;
                }
                entry.insert(play);
                RecordOutcome::Replaced
            }
            Entry::Vacant(entry) => {
                entry.insert(play);
                RecordOutcome::Inserted
            }
        }
    }

    fn snapshot(&self) -> Vec<Play> {
        let mut plays: Vec<Play> = self.plays.iter().map(|entry| entry.value().clone()).collect();
        plays.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at));
        plays
    }

    pub fn len(&self) -> usize {
        self.plays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plays.is_empty()
    }
}

#[async_trait]
impl PlayStore for MemoryPlayStore {
    async fn record_play(&self, play: Play) -> RelayResult<RecordOutcome> {
        Ok(self.insert(play))
    }

    async fn plays(&self) -> RelayResult<Vec<Play>> {
        Ok(self.snapshot())
    }

    async fn clear(&self) -> RelayResult<()> {
        self.plays.clear();
        Ok(())
    }
}

/// On-disk snapshot format
#[derive(Debug, Default, Serialize, Deserialize)]
struct PlaySnapshot {
    plays: Vec<Play>,
}

/// Plays mirrored to a JSON file after every change
#[derive(Debug)]
pub struct JsonFilePlayStore {
    path: PathBuf,
    plays: MemoryPlayStore,
    /// Serializes snapshot writes
    write_lock: Mutex<()>,
}

impl JsonFilePlayStore {
    /// Open the store, loading an existing snapshot if there is one
    pub async fn open(path: impl Into<PathBuf>) -> RelayResult<Self> {
        let path = path.into();
        let plays = MemoryPlayStore::new();

        if path.exists() {
            let contents = tokio::fs::read_to_string(&path).await?;
            if !contents.trim().is_empty() {
                let snapshot: PlaySnapshot = serde_json::from_str(&contents).map_err(|e| {
                    RelayError::store(format!("corrupt play snapshot {}: {}", path.display(), e))
                })?;
                for play in snapshot.plays {
                    plays.insert(play);
                }
            }
            info!(path = %path.display(), count = plays.len(), "Loaded play snapshot");
        }

        Ok(Self {
            path,
            plays,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the current plays out. Callers hold `write_lock` so changes
    /// and writes land in the same order.
    async fn persist(&self) -> RelayResult<()> {
        let snapshot = PlaySnapshot {
            plays: self.plays.snapshot(),
        };
        let contents = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| RelayError::store(format!("failed to serialize plays: {}", e)))?;
        let path = self.path.clone();

        with_retry_and_backoff(
            || {
                let path = path.clone();
                let contents = contents.clone();
                async move { write_snapshot(&path, &contents).await }.boxed()
            },
            PERSIST_ATTEMPTS,
            "Persisting plays",
            exponential_backoff(PERSIST_BACKOFF_BASE_MS, Some(PERSIST_BACKOFF_MAX_MS)),
        )
        .await?;

        debug!(path = %self.path.display(), count = snapshot.plays.len(), "Persisted plays");
        Ok(())
    }
}

async fn write_snapshot(path: &Path, contents: &str) -> RelayResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    // Write then rename so readers never see a half-written file
    let staging = path.with_extension("json.tmp");
    tokio::fs::write(&staging, contents).await?;
    tokio::fs::rename(&staging, path).await?;
    Ok(())
}

#[async_trait]
impl PlayStore for JsonFilePlayStore {
    async fn record_play(&self, play: Play) -> RelayResult<RecordOutcome> {
        let _guard = self.write_lock.lock().await;
        let outcome = self.plays.insert(play);
        if outcome != RecordOutcome::Stale {
            self.persist().await?;
        }
        Ok(outcome)
    }

    async fn plays(&self) -> RelayResult<Vec<Play>> {
        Ok(self.plays.snapshot())
    }

    async fn clear(&self) -> RelayResult<()> {
        let _guard = self.write_lock.lock().await;
        self.plays.plays.clear();
        self.persist().await
    }
}
