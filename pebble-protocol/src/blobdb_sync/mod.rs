//! BlobDB Sync Engine
//!
//! Reconciles locally persisted items with the key-value databases on each
//! watch. See [`BlobDbSync`] for the sync loop and [`BlobDbStore`] for
//! persistence.
//!
//! ## Retry policy
//!
//! A row whose command fails (non-success status or timeout) stays pending.
//! Each failure bumps its attempt counter and delays the next attempt with
//! exponential backoff. After `max_attempts` the row is parked until it
//! changes again or [`BlobDbSync::resync`] is called. Every wire attempt
//! uses a fresh token.

mod engine;
mod store;

pub use engine::{BlobDbSync, SYNCED_DATABASES};
pub use store::{
    BlobDbItem, BlobDbSnapshot, BlobDbStore, BlobSyncStatus, JsonBlobDbStore, LocalItem,
    MemoryBlobDbStore, PendingClear,
};
