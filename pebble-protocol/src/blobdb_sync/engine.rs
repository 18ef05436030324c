use super::store::{
    BlobDbItem, BlobDbSnapshot, BlobDbStore, BlobSyncStatus, LocalItem, PendingClear,
};
use crate::config::BlobDbConfig;
use crate::connector::{ConnectedMode, PebbleSession};
use crate::recovery::backoff_delay;
use crate::services::blobdb::{
    generate_token, BlobCommand, BlobDatabase, BlobOperation, BlobStatus,
};
use crate::watch_manager::WatchEvent;
use crate::{ProtocolError, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Databases cleared when a watch has to be synced from scratch
pub const SYNCED_DATABASES: [BlobDatabase; 7] = [
    BlobDatabase::Pin,
    BlobDatabase::App,
    BlobDatabase::Reminder,
    BlobDatabase::Notification,
    BlobDatabase::NotificationApps,
    BlobDatabase::AppConfigs,
    BlobDatabase::AppGlance,
];

type RowKey = (String, BlobDatabase, Uuid);

/// Retry bookkeeping of a pending clear; kept in memory only
#[derive(Debug, Default, Clone, Copy)]
struct ClearRetry {
    attempts: u32,
    next_attempt: Option<Instant>,
}

#[derive(Debug, Default)]
struct SyncState {
    watches: BTreeSet<String>,
    local: BTreeMap<(BlobDatabase, Uuid), LocalItem>,
    rows: BTreeMap<RowKey, BlobDbItem>,
    clears: BTreeSet<PendingClear>,
    clear_retries: BTreeMap<PendingClear, ClearRetry>,
}

impl SyncState {
    fn from_snapshot(snapshot: BlobDbSnapshot) -> Self {
        Self {
            watches: snapshot.watches.into_iter().collect(),
            local: snapshot
                .local
                .into_iter()
                .map(|item| ((item.database, item.id), item))
                .collect(),
            rows: snapshot
                .rows
                .into_iter()
                .map(|row| ((row.watch_identifier.clone(), row.database, row.id), row))
                .collect(),
            clears: snapshot.pending_clears.into_iter().collect(),
            clear_retries: BTreeMap::new(),
        }
    }

    fn queue_clear(&mut self, watch_identifier: &str, database: BlobDatabase) {
        let clear = PendingClear {
            watch_identifier: watch_identifier.to_string(),
            database,
        };
        self.clear_retries.remove(&clear);
        self.clears.insert(clear);
    }

    fn drop_clear(&mut self, clear: &PendingClear) {
        self.clears.remove(clear);
        self.clear_retries.remove(clear);
    }

    fn snapshot(&self) -> BlobDbSnapshot {
        BlobDbSnapshot {
            watches: self.watches.iter().cloned().collect(),
            local: self.local.values().cloned().collect(),
            rows: self.rows.values().cloned().collect(),
            pending_clears: self.clears.iter().cloned().collect(),
        }
    }

    /// Point the row of `watch` at the current local value of an item
    fn stage_row(&mut self, watch: &str, local: &LocalItem) {
        let key = (watch.to_string(), local.database, local.id);
        let status = if local.deleted {
            BlobSyncStatus::PendingDelete
        } else {
            BlobSyncStatus::PendingWrite
        };
        match self.rows.get_mut(&key) {
            Some(row) => {
                if row.status == BlobSyncStatus::SyncedToWatch
                    && row.deleted == local.deleted
                    && row.data == local.data
                {
                    return;
                }
                row.data = local.data.clone();
                row.deleted = local.deleted;
                row.status = status;
                row.revision += 1;
                row.attempts = 0;
                row.next_attempt = None;
            }
            None => {
                if local.deleted {
                    // Never reached this watch
                    return;
                }
                self.rows.insert(
                    key,
                    BlobDbItem {
                        id: local.id,
                        database: local.database,
                        watch_identifier: watch.to_string(),
                        data: local.data.clone(),
                        status,
                        deleted: false,
                        revision: 1,
                        attempts: 0,
                        next_attempt: None,
                        last_token: None,
                    },
                );
            }
        }
    }
}

/// Next thing to send to one watch
enum Work {
    Clear(BlobDatabase),
    Row {
        key: RowKey,
        revision: u64,
        operation: BlobOperation,
        last_token: Option<u16>,
    },
    Idle(Option<Instant>),
}

struct SyncInner {
    config: BlobDbConfig,
    store: Arc<dyn BlobDbStore>,
    state: Mutex<SyncState>,
    changes: watch::Sender<u64>,
}

/// Keeps watch-resident BlobDB databases in line with local data
///
/// Local changes are recorded as pending rows, one per item and watch, and
/// persisted before they are sent. Each attached watch has a sync task that
/// sends one command at a time and marks rows synced on `Success`.
pub struct BlobDbSync {
    inner: Arc<SyncInner>,
    tasks: std::sync::Mutex<HashMap<String, JoinHandle<()>>>,
}

impl std::fmt::Debug for BlobDbSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobDbSync")
            .field("config", &self.inner.config)
            .finish()
    }
}

impl BlobDbSync {
    /// Load persisted sync state
    pub async fn new(config: BlobDbConfig, store: Arc<dyn BlobDbStore>) -> Result<Self> {
        let state = SyncState::from_snapshot(store.load().await?);
        let pending = state.rows.values().filter(|r| r.status.is_pending()).count();
        info!(
            "BlobDB sync: {} watches, {} rows ({} pending)",
            state.watches.len(),
            state.rows.len(),
            pending
        );
        let (changes, _) = watch::channel(0);
        Ok(Self {
            inner: Arc::new(SyncInner {
                config,
                store,
                state: Mutex::new(state),
                changes,
            }),
            tasks: std::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Start tracking a watch; existing local items become pending for it
    pub async fn register_watch(&self, watch_identifier: &str) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if !state.watches.insert(watch_identifier.to_string()) {
            return Ok(());
        }
        let locals: Vec<LocalItem> = state.local.values().cloned().collect();
        for local in &locals {
            state.stage_row(watch_identifier, local);
        }
        debug!(
            "BlobDB: registered {} with {} items",
            watch_identifier,
            locals.len()
        );
        self.inner.persist(&state).await?;
        drop(state);
        self.inner.notify();
        Ok(())
    }

    /// Stop tracking a watch and drop its rows
    pub async fn forget_watch(&self, watch_identifier: &str) -> Result<()> {
        self.detach(watch_identifier);
        let mut state = self.inner.state.lock().await;
        state.watches.remove(watch_identifier);
        state.rows.retain(|(watch, _, _), _| watch != watch_identifier);
        state.clears.retain(|clear| clear.watch_identifier != watch_identifier);
        state
            .clear_retries
            .retain(|clear, _| clear.watch_identifier != watch_identifier);
        self.inner.persist(&state).await
    }

    /// Record a new value for an item
    pub async fn insert(&self, database: BlobDatabase, id: Uuid, value: Vec<u8>) -> Result<()> {
        self.apply(LocalItem {
            id,
            database,
            data: value,
            deleted: false,
        })
        .await
    }

    /// Record that an item is gone
    pub async fn delete(&self, database: BlobDatabase, id: Uuid) -> Result<()> {
        self.apply(LocalItem {
            id,
            database,
            data: Vec::new(),
            deleted: true,
        })
        .await
    }

    async fn apply(&self, local: LocalItem) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.local.get(&(local.database, local.id)) == Some(&local) {
            // Rows are already staged; just un-park them
            for row in state.rows.values_mut().filter(|r| {
                r.database == local.database && r.id == local.id && r.status.is_pending()
            }) {
                row.attempts = 0;
                row.next_attempt = None;
            }
        } else {
            let watches: Vec<String> = state.watches.iter().cloned().collect();
            for watch in &watches {
                state.stage_row(watch, &local);
            }
            state.local.insert((local.database, local.id), local);
        }
        self.inner.persist(&state).await?;
        drop(state);
        self.inner.notify();
        Ok(())
    }

    /// Remove every item of a database, locally and on all watches
    pub async fn clear(&self, database: BlobDatabase) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        state.local.retain(|(db, _), _| *db != database);
        state.rows.retain(|(_, db, _), _| *db != database);
        let watches: Vec<String> = state.watches.iter().cloned().collect();
        for watch_identifier in watches {
            state.queue_clear(&watch_identifier, database);
        }
        self.inner.persist(&state).await?;
        drop(state);
        info!("BlobDB: clearing {}", database);
        self.inner.notify();
        Ok(())
    }

    /// Un-park every pending row and clear, and retry now
    pub async fn resync(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        for row in state.rows.values_mut().filter(|r| r.status.is_pending()) {
            row.attempts = 0;
            row.next_attempt = None;
        }
        state.clear_retries.clear();
        self.inner.persist(&state).await?;
        drop(state);
        info!("BlobDB: resync requested");
        self.inner.notify();
        Ok(())
    }

    /// Begin syncing a connected watch
    ///
    /// With `reset` every synced database is cleared on the watch first and
    /// all rows for it are sent again.
    pub async fn attach(
        &self,
        watch_identifier: &str,
        session: Arc<PebbleSession>,
        reset: bool,
    ) -> Result<()> {
        self.register_watch(watch_identifier).await?;
        if reset {
            self.inner.reset_watch(watch_identifier).await?;
        }

        let inner = self.inner.clone();
        let identifier = watch_identifier.to_string();
        let task = tokio::spawn(async move { inner.sync_watch(identifier, session).await });
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(previous) = tasks.insert(watch_identifier.to_string(), task) {
                previous.abort();
            }
        }
        Ok(())
    }

    pub fn detach(&self, watch_identifier: &str) {
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(task) = tasks.remove(watch_identifier) {
                task.abort();
            }
        }
    }

    /// Attach watches as the watch manager reports sessions
    pub fn follow(self: &Arc<Self>, mut events: broadcast::Receiver<WatchEvent>) -> JoinHandle<()> {
        let sync = self.clone();
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("BlobDB sync missed {} watch events", missed);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                match event {
                    WatchEvent::SessionStarted {
                        transport,
                        pebble,
                        first_connection,
                    } => {
                        if pebble.mode == ConnectedMode::InPrf {
                            debug!("{}: recovery firmware, not syncing BlobDB", transport);
                            continue;
                        }
                        let unfaithful = pebble.watch_info.is_unfaithful == Some(true);
                        let reset = first_connection || unfaithful;
                        if let Err(e) = sync
                            .attach(&transport.identifier(), pebble.session.clone(), reset)
                            .await
                        {
                            warn!("{}: cannot start BlobDB sync: {}", transport, e);
                        }
                    }
                    WatchEvent::Forgotten { transport } => {
                        if let Err(e) = sync.forget_watch(&transport.identifier()).await {
                            warn!("{}: cannot drop BlobDB rows: {}", transport, e);
                        }
                    }
                    _ => {}
                }
            }
        })
    }

    /// Sync rows of one watch
    pub async fn items(&self, watch_identifier: &str) -> Vec<BlobDbItem> {
        let state = self.inner.state.lock().await;
        state
            .rows
            .values()
            .filter(|row| row.watch_identifier == watch_identifier)
            .cloned()
            .collect()
    }

    pub async fn item(
        &self,
        watch_identifier: &str,
        database: BlobDatabase,
        id: Uuid,
    ) -> Option<BlobDbItem> {
        let state = self.inner.state.lock().await;
        state
            .rows
            .get(&(watch_identifier.to_string(), database, id))
            .cloned()
    }

    pub async fn pending_count(&self, watch_identifier: &str) -> usize {
        let state = self.inner.state.lock().await;
        state
            .rows
            .values()
            .filter(|row| row.watch_identifier == watch_identifier && row.status.is_pending())
            .count()
            + state
                .clears
                .iter()
                .filter(|clear| clear.watch_identifier == watch_identifier)
                .count()
    }
}

impl Drop for BlobDbSync {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for (_, task) in tasks.drain() {
                task.abort();
            }
        }
    }
}

impl SyncInner {
    fn notify(&self) {
        self.changes.send_modify(|generation| *generation += 1);
    }

    async fn persist(&self, state: &SyncState) -> Result<()> {
        self.store.save(&state.snapshot()).await
    }

    async fn reset_watch(&self, watch_identifier: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut databases: BTreeSet<BlobDatabase> = SYNCED_DATABASES.into_iter().collect();
        for row in state
            .rows
            .values_mut()
            .filter(|row| row.watch_identifier == watch_identifier)
        {
            databases.insert(row.database);
            row.attempts = 0;
            row.next_attempt = None;
            if row.deleted {
                row.status = BlobSyncStatus::SyncedToWatch;
            } else if row.status == BlobSyncStatus::SyncedToWatch {
                row.status = BlobSyncStatus::PendingWrite;
                row.revision += 1;
            }
        }
        for database in databases {
            state.queue_clear(watch_identifier, database);
        }
        info!("{}: resetting BlobDB state on the watch", watch_identifier);
        self.persist(&state).await
    }

    async fn next_work(&self, watch_identifier: &str) -> Work {
        let state = self.state.lock().await;
        let now = Instant::now();
        let mut next_due: Option<Instant> = None;

        // Rows of a database wait for its clear unless the clear is parked
        let mut blocked = BTreeSet::new();
        for clear in state
            .clears
            .iter()
            .filter(|clear| clear.watch_identifier == watch_identifier)
        {
            let retry = state.clear_retries.get(clear).copied().unwrap_or_default();
            if retry.attempts >= self.config.max_attempts {
                continue;
            }
            blocked.insert(clear.database);
            match retry.next_attempt {
                Some(at) if at > now => {
                    next_due = Some(next_due.map_or(at, |due| due.min(at)));
                }
                _ => return Work::Clear(clear.database),
            }
        }

        for (key, row) in state.rows.iter() {
            if key.0 != watch_identifier
                || !row.status.is_pending()
                || row.attempts >= self.config.max_attempts
                || blocked.contains(&key.1)
            {
                continue;
            }
            match row.next_attempt {
                Some(at) if at > now => {
                    next_due = Some(next_due.map_or(at, |due| due.min(at)));
                }
                _ => {
                    let item_key = row.id.as_bytes().to_vec();
                    let operation = if row.status == BlobSyncStatus::PendingDelete {
                        BlobOperation::Delete { key: item_key }
                    } else {
                        BlobOperation::Insert {
                            key: item_key,
                            value: row.data.clone(),
                        }
                    };
                    return Work::Row {
                        key: key.clone(),
                        revision: row.revision,
                        operation,
                        last_token: row.last_token,
                    };
                }
            }
        }
        Work::Idle(next_due)
    }

    async fn sync_watch(self: Arc<Self>, watch_identifier: String, session: Arc<PebbleSession>) {
        info!("{}: BlobDB sync started", watch_identifier);
        let mut changes = self.changes.subscribe();
        let wait = Duration::from_millis(self.config.response_timeout_ms);
        let resync = Duration::from_secs(self.config.resync_interval_secs.max(1));

        loop {
            changes.borrow_and_update();
            let outcome = match self.next_work(&watch_identifier).await {
                Work::Clear(database) => {
                    let command = BlobCommand {
                        token: generate_token(),
                        database,
                        operation: BlobOperation::Clear,
                    };
                    let result = self.send(&session, command, wait).await;
                    match &result {
                        Ok(status) => {
                            self.finish_clear(&watch_identifier, database, *status)
                                .await
                        }
                        Err(ProtocolError::Cancelled(_)) => {}
                        Err(e) => {
                            self.record_clear_failure(&watch_identifier, database, &e.to_string())
                                .await
                        }
                    }
                    result.map(|_| ())
                }
                Work::Row {
                    key,
                    revision,
                    operation,
                    last_token,
                } => {
                    let mut token = generate_token();
                    while Some(token) == last_token {
                        token = generate_token();
                    }
                    let command = BlobCommand {
                        token,
                        database: key.1,
                        operation,
                    };
                    let is_delete = matches!(command.operation, BlobOperation::Delete { .. });
                    let result = self.send(&session, command, wait).await;
                    match &result {
                        Ok(status) => {
                            let success = status.is_success()
                                || (is_delete && *status == BlobStatus::KeyDoesNotExist);
                            if success {
                                self.mark_synced(&key, revision).await;
                            } else {
                                self.record_failure(&key, revision, token, &status.to_string())
                                    .await;
                            }
                        }
                        Err(ProtocolError::Cancelled(_)) => {}
                        Err(e) => {
                            self.record_failure(&key, revision, token, &e.to_string())
                                .await;
                        }
                    }
                    result.map(|_| ())
                }
                Work::Idle(next_due) => {
                    let resync_at = Instant::now() + resync;
                    let until = next_due.map_or(resync_at, |due| due.min(resync_at));
                    tokio::select! {
                        changed = changes.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = sleep_until(until) => {}
                        _ = session.wait_closed() => break,
                    }
                    Ok(())
                }
            };

            match outcome {
                Err(ProtocolError::Cancelled(_)) => break,
                Err(ProtocolError::Timeout(_)) | Ok(()) => {}
                Err(e) => warn!("{}: BlobDB command failed: {}", watch_identifier, e),
            }
        }
        info!("{}: BlobDB sync stopped", watch_identifier);
    }

    async fn send(
        &self,
        session: &PebbleSession,
        command: BlobCommand,
        wait: Duration,
    ) -> Result<BlobStatus> {
        tokio::select! {
            response = session.blobdb().send(command, wait) => response.map(|r| r.status),
            _ = session.wait_closed() => Err(ProtocolError::Cancelled("connection closed".to_string())),
        }
    }

    async fn finish_clear(&self, watch_identifier: &str, database: BlobDatabase, status: BlobStatus) {
        if !status.is_success() && status.is_retryable() {
            self.record_clear_failure(watch_identifier, database, &status.to_string())
                .await;
            return;
        }
        if status.is_success() {
            debug!("{}: cleared {}", watch_identifier, database);
        } else {
            warn!(
                "{}: watch refused to clear {} ({}), dropping the clear",
                watch_identifier, database, status
            );
        }
        let mut state = self.state.lock().await;
        state.drop_clear(&PendingClear {
            watch_identifier: watch_identifier.to_string(),
            database,
        });
        if let Err(e) = self.persist(&state).await {
            warn!("Failed to persist BlobDB state: {}", e);
        }
    }

    async fn record_clear_failure(&self, watch_identifier: &str, database: BlobDatabase, cause: &str) {
        let mut state = self.state.lock().await;
        let clear = PendingClear {
            watch_identifier: watch_identifier.to_string(),
            database,
        };
        if !state.clears.contains(&clear) {
            return;
        }
        let retry = state.clear_retries.entry(clear).or_default();
        retry.attempts += 1;
        if retry.attempts >= self.config.max_attempts {
            warn!(
                "{}: clearing {} parked after {} attempts ({})",
                watch_identifier, database, retry.attempts, cause
            );
            retry.next_attempt = None;
        } else {
            let delay = backoff_delay(
                Duration::from_millis(self.config.initial_backoff_ms),
                Duration::from_millis(self.config.max_backoff_ms),
                retry.attempts,
            );
            debug!(
                "{}: clearing {} failed ({}), retry in {:?}",
                watch_identifier, database, cause, delay
            );
            retry.next_attempt = Some(Instant::now() + delay);
        }
    }

    /// Only the revision that was sent can become synced
    async fn mark_synced(&self, key: &RowKey, revision: u64) {
        let mut state = self.state.lock().await;
        let Some(row) = state.rows.get_mut(key) else {
            return;
        };
        if row.revision != revision {
            debug!("{}: {} changed while in flight", key.0, key.2);
            return;
        }
        row.status = BlobSyncStatus::SyncedToWatch;
        row.attempts = 0;
        row.next_attempt = None;
        row.last_token = None;
        debug!("{}: {} {} synced", key.0, key.1, key.2);
        if let Err(e) = self.persist(&state).await {
            warn!("Failed to persist BlobDB state: {}", e);
        }
    }

    async fn record_failure(&self, key: &RowKey, revision: u64, token: u16, cause: &str) {
        let mut state = self.state.lock().await;
        let max_attempts = self.config.max_attempts;
        let initial = Duration::from_millis(self.config.initial_backoff_ms);
        let max = Duration::from_millis(self.config.max_backoff_ms);
        let Some(row) = state.rows.get_mut(key) else {
            return;
        };
        row.last_token = Some(token);
        if row.revision != revision {
            return;
        }
        row.attempts += 1;
        if row.attempts >= max_attempts {
            warn!(
                "{}: {} {} parked after {} attempts ({})",
                key.0, key.1, key.2, row.attempts, cause
            );
            row.next_attempt = None;
        } else {
            let delay = backoff_delay(initial, max, row.attempts);
            debug!(
                "{}: {} {} failed ({}), retry in {:?}",
                key.0, key.1, key.2, cause, delay
            );
            row.next_attempt = Some(Instant::now() + delay);
        }
        if let Err(e) = self.persist(&state).await {
            warn!("Failed to persist BlobDB state: {}", e);
        }
    }
}
