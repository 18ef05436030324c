//! Sync state persistence
//!
//! The engine keeps its tables in memory and hands the store a full
//! snapshot after every change.

use crate::services::blobdb::BlobDatabase;
use crate::storage::{default_state_dir, read_json, write_json};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

/// Where a row stands relative to the watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobSyncStatus {
    PendingWrite,
    PendingDelete,
    SyncedToWatch,
}

impl BlobSyncStatus {
    pub fn is_pending(self) -> bool {
        !matches!(self, BlobSyncStatus::SyncedToWatch)
    }
}

/// One item's sync state for one watch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobDbItem {
    pub id: Uuid,
    pub database: BlobDatabase,
    pub watch_identifier: String,
    pub data: Vec<u8>,
    pub status: BlobSyncStatus,
    /// The item was deleted locally; a synced row means it is gone from the watch
    pub deleted: bool,
    /// Bumped on every local change
    pub revision: u64,
    /// Consecutive failed wire attempts for this revision
    pub attempts: u32,
    #[serde(skip)]
    pub next_attempt: Option<Instant>,
    #[serde(skip)]
    pub last_token: Option<u16>,
}

/// Latest local value of an item, independent of any watch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalItem {
    pub id: Uuid,
    pub database: BlobDatabase,
    pub data: Vec<u8>,
    pub deleted: bool,
}

/// A `Clear` still to be sent to a watch
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PendingClear {
    pub watch_identifier: String,
    pub database: BlobDatabase,
}

/// Everything the engine persists
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobDbSnapshot {
    #[serde(default)]
    pub watches: Vec<String>,
    #[serde(default)]
    pub local: Vec<LocalItem>,
    #[serde(default)]
    pub rows: Vec<BlobDbItem>,
    #[serde(default)]
    pub pending_clears: Vec<PendingClear>,
}

#[async_trait]
pub trait BlobDbStore: Send + Sync + std::fmt::Debug {
    async fn load(&self) -> Result<BlobDbSnapshot>;
    async fn save(&self, snapshot: &BlobDbSnapshot) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryBlobDbStore {
    snapshot: RwLock<BlobDbSnapshot>,
}

impl MemoryBlobDbStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobDbStore for MemoryBlobDbStore {
    async fn load(&self) -> Result<BlobDbSnapshot> {
        Ok(self.snapshot.read().await.clone())
    }

    async fn save(&self, snapshot: &BlobDbSnapshot) -> Result<()> {
        *self.snapshot.write().await = snapshot.clone();
        Ok(())
    }
}

/// Sync state in a JSON file
#[derive(Debug)]
pub struct JsonBlobDbStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonBlobDbStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// `<data_dir>/pebble/blobdb_sync.json`
    pub fn default_path() -> PathBuf {
        default_state_dir().join("blobdb_sync.json")
    }
}

#[async_trait]
impl BlobDbStore for JsonBlobDbStore {
    async fn load(&self) -> Result<BlobDbSnapshot> {
        let _guard = self.lock.lock().await;
        Ok(read_json(&self.path).await?.unwrap_or_default())
    }

    async fn save(&self, snapshot: &BlobDbSnapshot) -> Result<()> {
        let _guard = self.lock.lock().await;
        write_json(&self.path, snapshot).await
    }
}
