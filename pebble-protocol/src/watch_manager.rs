//! Watch Manager
//!
//! Top-level registry of watches. Merges persisted known watches with scan
//! sightings, keeps at most one live [`PebbleConnector`] per transport, and
//! reconnects watches whose connect goal is set.
//!
//! ## Reconnect policy
//!
//! A failed attempt is retried with exponential backoff. Once the attempts
//! are used up the watch waits for its next scan sighting, which resets the
//! backoff and retries immediately. A connection that was up and then lost
//! is retried right away.
//!
//! Bluetooth watches are only retried on the backoff timer while their last
//! sighting is younger than `scan_result_ttl_secs`; a watch that dropped out
//! of range waits for the scanner instead. Socket watches are never scanned
//! and keep retrying.
//!
//! ## Single connection
//!
//! Unless multiple-watches mode is on, requesting a connection clears the
//! connect goal of every other watch, and a new attempt only starts once
//! every other connector has been torn down.

use crate::config::WatchManagerConfig;
use crate::connector::{
    ConnectedPebble, ConnectingPebbleState, ConnectionStage, PebbleConnector,
    PebbleConnectorFactory,
};
use crate::recovery::{ReconnectionStrategy, RetryPlan};
use crate::storage::{default_state_dir, read_json, write_json};
use crate::transport::{ConnectionFailureReason, Transport};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

/// Capacity of the watch event broadcast
const EVENT_CAPACITY: usize = 256;

/// A watch seen while scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub transport: Transport,
    pub name: String,
    pub rssi: Option<i16>,
}

/// Last time the scanner reported a watch
#[derive(Debug, Clone, Copy)]
struct Sighting {
    rssi: Option<i16>,
    seen_at: Instant,
}

/// A watch we have connected to before
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownWatch {
    pub transport: Transport,
    pub name: String,
    pub last_firmware_version: Option<String>,
    pub serial: Option<String>,
    /// Whether the watch should be kept connected
    pub connect_goal: bool,
    pub last_connected: Option<DateTime<Utc>>,
}

/// Persistence for [`KnownWatch`] records
#[async_trait]
pub trait KnownWatchStore: Send + Sync + std::fmt::Debug {
    async fn load(&self) -> Result<Vec<KnownWatch>>;

    /// Insert or replace the record for `watch.transport`
    async fn save(&self, watch: &KnownWatch) -> Result<()>;

    async fn remove(&self, transport: &Transport) -> Result<()>;
}

/// Known watches kept in memory only
#[derive(Debug, Default)]
pub struct MemoryKnownWatchStore {
    watches: RwLock<HashMap<Transport, KnownWatch>>,
}

impl MemoryKnownWatchStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KnownWatchStore for MemoryKnownWatchStore {
    async fn load(&self) -> Result<Vec<KnownWatch>> {
        Ok(self.watches.read().await.values().cloned().collect())
    }

    async fn save(&self, watch: &KnownWatch) -> Result<()> {
        self.watches
            .write()
            .await
            .insert(watch.transport.clone(), watch.clone());
        Ok(())
    }

    async fn remove(&self, transport: &Transport) -> Result<()> {
        self.watches.write().await.remove(transport);
        Ok(())
    }
}

/// Known watches in a JSON file
#[derive(Debug)]
pub struct JsonKnownWatchStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonKnownWatchStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// `<data_dir>/pebble/known_watches.json`
    pub fn default_path() -> PathBuf {
        default_state_dir().join("known_watches.json")
    }

    async fn read_all(&self) -> Result<Vec<KnownWatch>> {
        Ok(read_json(&self.path).await?.unwrap_or_default())
    }
}

#[async_trait]
impl KnownWatchStore for JsonKnownWatchStore {
    async fn load(&self) -> Result<Vec<KnownWatch>> {
        let _guard = self.lock.lock().await;
        self.read_all().await
    }

    async fn save(&self, watch: &KnownWatch) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut watches = self.read_all().await?;
        watches.retain(|w| w.transport != watch.transport);
        watches.push(watch.clone());
        write_json(&self.path, &watches).await
    }

    async fn remove(&self, transport: &Transport) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut watches = self.read_all().await?;
        watches.retain(|w| &w.transport != transport);
        write_json(&self.path, &watches).await
    }
}

/// Where a watch is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStage {
    /// Seen while scanning, never connected
    ScannedOnly,
    Disconnected,
    Connecting,
    Negotiating,
    Connected,
}

/// Aggregate view of one watch
#[derive(Debug, Clone)]
pub struct WatchView {
    pub transport: Transport,
    pub name: String,
    pub stage: WatchStage,
    pub known: Option<KnownWatch>,
    pub connect_goal: bool,
    pub last_failure: Option<ConnectionFailureReason>,
    pub connected: Option<ConnectedPebble>,
    /// Currently in the scan results
    pub scanned: bool,
    pub rssi: Option<i16>,
}

/// Events emitted by the watch manager
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// A watch was seen for the first time in this process
    Discovered { transport: Transport, name: String },

    /// A connector moved to a new state
    StateChanged {
        transport: Transport,
        state: ConnectingPebbleState,
    },

    /// Negotiation finished; services are ready
    SessionStarted {
        transport: Transport,
        pebble: ConnectedPebble,
        /// The watch had never been connected before
        first_connection: bool,
    },

    ConnectionFailed {
        transport: Transport,
        reason: ConnectionFailureReason,
    },

    /// A watch was removed after `forget`
    Forgotten { transport: Transport },
}

#[derive(Debug)]
struct WatchEntry {
    transport: Transport,
    name: String,
    known: Option<KnownWatch>,
    connect_goal: bool,
    connector: Option<Arc<dyn PebbleConnector>>,
    tearing_down: bool,
    state: ConnectingPebbleState,
    backoff: ReconnectionStrategy,
    retry_at: Option<Instant>,
    awaiting_sighting: bool,
    sighting: Option<Sighting>,
    last_failure: Option<ConnectionFailureReason>,
    forget_requested: bool,
}

impl WatchEntry {
    fn new(transport: Transport, name: String, config: &WatchManagerConfig) -> Self {
        Self {
            transport,
            name,
            known: None,
            connect_goal: false,
            connector: None,
            tearing_down: false,
            state: ConnectingPebbleState::Inactive,
            backoff: ReconnectionStrategy::from_config(config),
            retry_at: None,
            awaiting_sighting: false,
            sighting: None,
            last_failure: None,
            forget_requested: false,
        }
    }

    fn view(&self) -> WatchView {
        let stage = match self.state.stage() {
            ConnectionStage::Connecting => WatchStage::Connecting,
            ConnectionStage::Negotiating => WatchStage::Negotiating,
            ConnectionStage::Connected => WatchStage::Connected,
            ConnectionStage::Inactive | ConnectionStage::Failed if self.known.is_none() => {
                WatchStage::ScannedOnly
            }
            ConnectionStage::Inactive | ConnectionStage::Failed => WatchStage::Disconnected,
        };
        WatchView {
            transport: self.transport.clone(),
            name: self.name.clone(),
            stage,
            known: self.known.clone(),
            connect_goal: self.connect_goal,
            last_failure: self.last_failure,
            connected: self.state.connected().cloned(),
            scanned: self.sighting.is_some(),
            rssi: self.sighting.and_then(|sighting| sighting.rssi),
        }
    }

    fn scan_result(&self) -> Option<ScanResult> {
        self.sighting.map(|sighting| ScanResult {
            transport: self.transport.clone(),
            name: self.name.clone(),
            rssi: sighting.rssi,
        })
    }

    /// Sighted within `ttl` of `now`
    fn recently_seen(&self, ttl: Duration, now: Instant) -> bool {
        self.sighting
            .is_some_and(|sighting| now.saturating_duration_since(sighting.seen_at) < ttl)
    }

    /// Nothing but a scan sighting keeps this entry around
    fn scan_only(&self) -> bool {
        self.known.is_none()
            && self.connector.is_none()
            && !self.connect_goal
            && !self.forget_requested
    }

    fn known_record(&self) -> KnownWatch {
        self.known.clone().unwrap_or_else(|| KnownWatch {
            transport: self.transport.clone(),
            name: self.name.clone(),
            last_firmware_version: None,
            serial: None,
            connect_goal: self.connect_goal,
            last_connected: None,
        })
    }
}

struct Inner {
    config: WatchManagerConfig,
    factory: Arc<dyn PebbleConnectorFactory>,
    store: Arc<dyn KnownWatchStore>,
    watches: Mutex<HashMap<Transport, WatchEntry>>,
    events: broadcast::Sender<WatchEvent>,
    wake: Notify,
    bluetooth_enabled: AtomicBool,
    multiple_watches: AtomicBool,
}

/// Registry and reconnect driver for all watches
pub struct WatchManager {
    inner: Arc<Inner>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for WatchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchManager")
            .field("config", &self.inner.config)
            .finish()
    }
}

impl WatchManager {
    pub fn new(
        config: WatchManagerConfig,
        factory: Arc<dyn PebbleConnectorFactory>,
        store: Arc<dyn KnownWatchStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let multiple_watches = config.multiple_watches;
        Self {
            inner: Arc::new(Inner {
                config,
                factory,
                store,
                watches: Mutex::new(HashMap::new()),
                events,
                wake: Notify::new(),
                bluetooth_enabled: AtomicBool::new(true),
                multiple_watches: AtomicBool::new(multiple_watches),
            }),
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Load known watches and start the reconnect loop
    pub async fn start(&self) -> Result<()> {
        let known = self.inner.store.load().await?;
        info!("Loaded {} known watches", known.len());
        {
            let mut watches = self.inner.watches.lock().await;
            for watch in known {
                let mut entry =
                    WatchEntry::new(watch.transport.clone(), watch.name.clone(), &self.inner.config);
                entry.connect_goal = watch.connect_goal;
                entry.known = Some(watch);
                watches.insert(entry.transport.clone(), entry);
            }
        }

        let inner = self.inner.clone();
        let task = tokio::spawn(async move { inner.run().await });
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        }
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.inner.events.subscribe()
    }

    /// Record a scan sighting
    ///
    /// A sighting resets the reconnect backoff of the watch.
    pub async fn add_scan_result(&self, scan: ScanResult) {
        let mut watches = self.inner.watches.lock().await;
        let config = &self.inner.config;
        let entry = watches.entry(scan.transport.clone()).or_insert_with(|| {
            debug!("Discovered {} ({})", scan.name, scan.transport);
            let _ = self.inner.events.send(WatchEvent::Discovered {
                transport: scan.transport.clone(),
                name: scan.name.clone(),
            });
            WatchEntry::new(scan.transport.clone(), scan.name.clone(), config)
        });
        if !scan.name.is_empty() {
            entry.name = scan.name;
        }
        // A connected watch is not in the scan results
        if entry.state.stage() != ConnectionStage::Connected {
            entry.sighting = Some(Sighting {
                rssi: scan.rssi,
                seen_at: Instant::now(),
            });
        }
        entry.backoff.reset();
        entry.retry_at = None;
        entry.awaiting_sighting = false;
        drop(watches);
        self.inner.wake.notify_one();
    }

    /// Watches currently in the scan results, sorted by identifier
    pub async fn scan_results(&self) -> Vec<ScanResult> {
        let watches = self.inner.watches.lock().await;
        let mut results: Vec<ScanResult> =
            watches.values().filter_map(WatchEntry::scan_result).collect();
        results.sort_by_key(|result| result.transport.identifier());
        results
    }

    /// Forget all sightings, dropping watches that were only ever scanned
    pub async fn clear_scan_results(&self) {
        let mut watches = self.inner.watches.lock().await;
        for entry in watches.values_mut() {
            entry.sighting = None;
        }
        let before = watches.len();
        watches.retain(|_, entry| !entry.scan_only());
        debug!(
            "Cleared scan results, dropped {} scanned watches",
            before - watches.len()
        );
    }

    /// Set the connect goal of a watch
    ///
    /// In single-watch mode every other watch loses its connect goal.
    pub async fn request_connection(&self, transport: &Transport) -> Result<()> {
        let mut changed = Vec::new();
        {
            let mut watches = self.inner.watches.lock().await;
            let config = &self.inner.config;
            let entry = watches
                .entry(transport.clone())
                .or_insert_with(|| WatchEntry::new(transport.clone(), String::new(), config));
            entry.connect_goal = true;
            entry.forget_requested = false;
            entry.awaiting_sighting = false;
            entry.retry_at = None;
            entry.backoff.reset();
            if let Some(known) = entry.known.as_mut() {
                known.connect_goal = true;
                changed.push(known.clone());
            }

            if !self.inner.multiple_watches.load(Ordering::SeqCst) {
                for other in watches.values_mut().filter(|w| &w.transport != transport) {
                    if other.connect_goal {
                        info!("Single watch mode: dropping {}", other.transport);
                        other.connect_goal = false;
                        if let Some(known) = other.known.as_mut() {
                            known.connect_goal = false;
                            changed.push(known.clone());
                        }
                    }
                }
            }
        }
        for known in changed {
            self.inner.store.save(&known).await?;
        }
        info!("Connection requested for {}", transport);
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Clear the connect goal and disconnect
    pub async fn request_disconnection(&self, transport: &Transport) -> Result<()> {
        let known = {
            let mut watches = self.inner.watches.lock().await;
            let Some(entry) = watches.get_mut(transport) else {
                return Ok(());
            };
            entry.connect_goal = false;
            entry.retry_at = None;
            entry.known.as_mut().map(|known| {
                known.connect_goal = false;
                known.clone()
            })
        };
        if let Some(known) = known {
            self.inner.store.save(&known).await?;
        }
        info!("Disconnection requested for {}", transport);
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Disconnect and remove the watch once it is disconnected
    pub async fn forget(&self, transport: &Transport) -> Result<()> {
        let remove_now = {
            let mut watches = self.inner.watches.lock().await;
            let Some(entry) = watches.get_mut(transport) else {
                return Ok(());
            };
            entry.connect_goal = false;
            entry.forget_requested = true;
            if entry.connector.is_none() {
                watches.remove(transport);
                true
            } else {
                false
            }
        };
        if remove_now {
            self.inner.finish_forget(transport).await;
        } else {
            self.inner.wake.notify_one();
        }
        Ok(())
    }

    pub fn set_multiple_watches(&self, enabled: bool) {
        self.inner.multiple_watches.store(enabled, Ordering::SeqCst);
        self.inner.wake.notify_one();
    }

    /// Bluetooth watches neither connect nor stay connected while disabled
    pub fn set_bluetooth_enabled(&self, enabled: bool) {
        let previous = self.inner.bluetooth_enabled.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            info!("Bluetooth {}", if enabled { "enabled" } else { "disabled" });
            self.inner.wake.notify_one();
        }
    }

    /// Follow a platform Bluetooth state feed
    pub fn follow_bluetooth_state(&self, mut enabled: watch::Receiver<bool>) {
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            loop {
                let value = *enabled.borrow_and_update();
                if inner.bluetooth_enabled.swap(value, Ordering::SeqCst) != value {
                    info!("Bluetooth {}", if value { "enabled" } else { "disabled" });
                    inner.wake.notify_one();
                }
                if enabled.changed().await.is_err() {
                    break;
                }
            }
        });
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        }
    }

    /// All watches, sorted by identifier
    pub async fn watches(&self) -> Vec<WatchView> {
        let watches = self.inner.watches.lock().await;
        let mut views: Vec<WatchView> = watches.values().map(WatchEntry::view).collect();
        views.sort_by_key(|view| view.transport.identifier());
        views
    }

    pub async fn watch(&self, transport: &Transport) -> Option<WatchView> {
        self.inner
            .watches
            .lock()
            .await
            .get(transport)
            .map(WatchEntry::view)
    }

    /// Stop reconnecting and disconnect everything
    pub async fn shutdown(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        let connectors: Vec<Arc<dyn PebbleConnector>> = {
            let mut watches = self.inner.watches.lock().await;
            watches
                .values_mut()
                .filter_map(|entry| {
                    entry.connect_goal = false;
                    entry.connector.clone()
                })
                .collect()
        };
        let wait = Duration::from_secs(self.inner.config.disconnect_timeout_secs);
        join_all(connectors.iter().map(|connector| async move {
            if timeout(wait, connector.disconnect()).await.is_err() {
                warn!("{}: disconnect timed out", connector.transport());
            }
        }))
        .await;
        info!("Watch manager stopped");
    }
}

impl Drop for WatchManager {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

impl Inner {
    async fn run(self: Arc<Self>) {
        loop {
            let next_retry = self.reconcile().await;
            match next_retry {
                Some(at) => {
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = sleep_until(at) => {}
                    }
                }
                None => self.wake.notified().await,
            }
        }
    }

    fn may_use(&self, transport: &Transport) -> bool {
        !transport.is_bluetooth() || self.bluetooth_enabled.load(Ordering::SeqCst)
    }

    /// Start and stop connectors to match the goals; returns the next retry time
    async fn reconcile(self: &Arc<Self>) -> Option<Instant> {
        let now = Instant::now();
        let multiple = self.multiple_watches.load(Ordering::SeqCst);
        let scan_ttl = Duration::from_secs(self.config.scan_result_ttl_secs);
        let mut watches = self.watches.lock().await;

        // Tear down connectors that should not be running
        for entry in watches.values_mut() {
            let keep = entry.connect_goal && self.may_use(&entry.transport);
            if let Some(connector) = entry.connector.clone() {
                if !keep && !entry.tearing_down {
                    entry.tearing_down = true;
                    info!("{}: tearing down connection", entry.transport);
                    let wait = Duration::from_secs(self.config.disconnect_timeout_secs);
                    tokio::spawn(async move {
                        if timeout(wait, connector.disconnect()).await.is_err() {
                            warn!("{}: disconnect timed out", connector.transport());
                        }
                    });
                }
            }
        }

        let mut live = watches.values().filter(|e| e.connector.is_some()).count();
        let mut next_retry: Option<Instant> = None;
        let candidates: Vec<Transport> = watches
            .values()
            .filter(|e| {
                e.connect_goal
                    && e.connector.is_none()
                    && !e.awaiting_sighting
                    && !e.forget_requested
                    && self.may_use(&e.transport)
            })
            .map(|e| e.transport.clone())
            .collect();

        for transport in candidates {
            let Some(entry) = watches.get_mut(&transport) else {
                continue;
            };
            if let Some(at) = entry.retry_at {
                if at > now {
                    next_retry = Some(next_retry.map_or(at, |next| next.min(at)));
                    continue;
                }
                if transport.is_bluetooth() && !entry.recently_seen(scan_ttl, now) {
                    info!(
                        "{}: not seen in {:?}, waiting for the watch to be seen again",
                        transport, scan_ttl
                    );
                    entry.retry_at = None;
                    entry.awaiting_sighting = true;
                    continue;
                }
            }
            if !multiple && live > 0 {
                debug!("{}: waiting for other connections to close", transport);
                continue;
            }

            let connector = match self.factory.create(&transport) {
                Ok(connector) => connector,
                Err(e) => {
                    error!("{}: cannot create connector: {}", transport, e);
                    entry.awaiting_sighting = true;
                    continue;
                }
            };
            entry.connector = Some(connector.clone());
            entry.tearing_down = false;
            entry.retry_at = None;
            live += 1;
            info!("{}: connecting ({})", transport, entry.backoff);

            let inner = self.clone();
            tokio::spawn(async move { inner.run_attempt(transport, connector).await });
        }
        next_retry
    }

    async fn run_attempt(self: Arc<Self>, transport: Transport, connector: Arc<dyn PebbleConnector>) {
        let mut transitions = connector.subscribe();
        let connect = connector.connect();
        tokio::pin!(connect);
        let mut connect_done = false;
        let mut failure = None;
        let mut was_connected = false;

        loop {
            tokio::select! {
                _ = &mut connect, if !connect_done => connect_done = true,
                transition = transitions.recv() => {
                    let state = match transition {
                        Ok(state) => state,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("{}: missed {} state transitions", transport, missed);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };
                    let stage = state.stage();
                    if let ConnectingPebbleState::Failed(reason) = state {
                        failure = Some(reason);
                    }
                    if stage == ConnectionStage::Connected {
                        was_connected = true;
                    }
                    self.on_state(&transport, state).await;
                    if matches!(stage, ConnectionStage::Failed | ConnectionStage::Inactive) {
                        break;
                    }
                }
            }
        }

        let wait = Duration::from_secs(self.config.disconnect_timeout_secs);
        if timeout(wait, connector.disconnect()).await.is_err() {
            warn!("{}: disconnect timed out", transport);
        }
        self.on_attempt_finished(&transport, failure, was_connected)
            .await;
    }

    async fn on_state(&self, transport: &Transport, state: ConnectingPebbleState) {
        let mut known_update = None;
        let mut session_started = None;
        let mut failed = None;
        {
            let mut watches = self.watches.lock().await;
            let Some(entry) = watches.get_mut(transport) else {
                return;
            };
            entry.state = state.clone();
            match &state {
                ConnectingPebbleState::Connected(pebble) => {
                    let first_connection = entry
                        .known
                        .as_ref()
                        .map_or(true, |known| known.last_connected.is_none());
                    entry.backoff.reset();
                    entry.awaiting_sighting = false;
                    entry.last_failure = None;
                    entry.sighting = None;

                    let mut known = entry.known_record();
                    known.last_firmware_version = Some(pebble.watch_info.running.to_string());
                    known.serial = Some(pebble.watch_info.serial.clone());
                    known.connect_goal = entry.connect_goal;
                    known.last_connected = Some(Utc::now());
                    if known.name.is_empty() {
                        known.name = pebble.watch_info.serial.clone();
                        entry.name = known.name.clone();
                    }
                    entry.known = Some(known.clone());
                    known_update = Some(known);
                    session_started = Some((pebble.clone(), first_connection));
                }
                ConnectingPebbleState::Failed(reason) => {
                    entry.last_failure = Some(*reason);
                    failed = Some(*reason);
                }
                _ => {}
            }
        }

        let _ = self.events.send(WatchEvent::StateChanged {
            transport: transport.clone(),
            state,
        });
        if let Some(reason) = failed {
            let _ = self.events.send(WatchEvent::ConnectionFailed {
                transport: transport.clone(),
                reason,
            });
        }
        if let Some(known) = known_update {
            if let Err(e) = self.store.save(&known).await {
                warn!("{}: failed to persist known watch: {}", transport, e);
            }
        }
        if let Some((pebble, first_connection)) = session_started {
            let _ = self.events.send(WatchEvent::SessionStarted {
                transport: transport.clone(),
                pebble,
                first_connection,
            });
        }
    }

    async fn on_attempt_finished(
        &self,
        transport: &Transport,
        failure: Option<ConnectionFailureReason>,
        was_connected: bool,
    ) {
        let forget = {
            let mut watches = self.watches.lock().await;
            let Some(entry) = watches.get_mut(transport) else {
                return;
            };
            let torn_down = entry.tearing_down;
            entry.connector = None;
            entry.tearing_down = false;
            entry.state = ConnectingPebbleState::Inactive;

            if entry.forget_requested {
                watches.remove(transport);
                true
            } else {
                if entry.connect_goal {
                    if torn_down {
                        // Goal came back while we were tearing down
                        debug!("{}: connection requested again, reconnecting", transport);
                        entry.retry_at = None;
                    } else if failure.is_some() || !was_connected {
                        match entry.backoff.on_failure() {
                            RetryPlan::RetryIn(delay) => {
                                info!("{}: retrying in {:?}", transport, delay);
                                entry.retry_at = Some(Instant::now() + delay);
                            }
                            RetryPlan::AwaitSighting => {
                                info!("{}: waiting for the watch to be seen again", transport);
                                entry.awaiting_sighting = true;
                            }
                        }
                    } else {
                        debug!("{}: connection lost, reconnecting", transport);
                        entry.retry_at = None;
                    }
                }
                false
            }
        };
        if forget {
            self.finish_forget(transport).await;
        }
        self.wake.notify_one();
    }

    async fn finish_forget(&self, transport: &Transport) {
        if let Err(e) = self.store.remove(transport).await {
            warn!("{}: failed to remove known watch: {}", transport, e);
        }
        info!("{}: forgotten", transport);
        let _ = self.events.send(WatchEvent::Forgotten {
            transport: transport.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socket(port: u16) -> Transport {
        Transport::Socket {
            address: format!("127.0.0.1:{}", port).parse().unwrap(),
        }
    }

    fn known(port: u16) -> KnownWatch {
        KnownWatch {
            transport: socket(port),
            name: format!("Pebble {}", port),
            last_firmware_version: Some("4.4.2".to_string()),
            serial: None,
            connect_goal: true,
            last_connected: None,
        }
    }

    #[tokio::test]
    async fn test_json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonKnownWatchStore::new(dir.path().join("watches.json"));
        assert!(store.load().await.unwrap().is_empty());

        store.save(&known(1)).await.unwrap();
        store.save(&known(2)).await.unwrap();
        let mut updated = known(1);
        updated.connect_goal = false;
        store.save(&updated).await.unwrap();

        let mut loaded = store.load().await.unwrap();
        loaded.sort_by_key(|w| w.transport.identifier());
        assert_eq!(loaded.len(), 2);
        assert!(!loaded[0].connect_goal);

        store.remove(&socket(2)).await.unwrap();
        assert_eq!(store.load().await.unwrap(), vec![updated]);
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryKnownWatchStore::new();
        store.save(&known(5)).await.unwrap();
        assert_eq!(store.load().await.unwrap().len(), 1);
        store.remove(&socket(5)).await.unwrap();
        assert!(store.load().await.unwrap().is_empty());
    }

    #[test]
    fn test_view_stages() {
        let config = WatchManagerConfig::default();
        let mut entry = WatchEntry::new(socket(9), "Pebble".to_string(), &config);
        assert_eq!(entry.view().stage, WatchStage::ScannedOnly);

        entry.known = Some(known(9));
        assert_eq!(entry.view().stage, WatchStage::Disconnected);

        entry.state = ConnectingPebbleState::Negotiating;
        assert_eq!(entry.view().stage, WatchStage::Negotiating);
    }

    #[test]
    fn test_sighting_freshness() {
        let config = WatchManagerConfig::default();
        let mut entry = WatchEntry::new(socket(10), "Pebble".to_string(), &config);
        let ttl = Duration::from_secs(30);
        let now = Instant::now();
        assert!(!entry.recently_seen(ttl, now));
        assert!(entry.scan_result().is_none());

        entry.sighting = Some(Sighting {
            rssi: Some(-71),
            seen_at: now,
        });
        assert!(entry.recently_seen(ttl, now + Duration::from_secs(29)));
        assert!(!entry.recently_seen(ttl, now + ttl));
        let view = entry.view();
        assert!(view.scanned);
        assert_eq!(view.rssi, Some(-71));
        assert_eq!(entry.scan_result().unwrap().rssi, Some(-71));
    }

    #[test]
    fn test_scan_only_entries() {
        let config = WatchManagerConfig::default();
        let mut entry = WatchEntry::new(socket(11), "Pebble".to_string(), &config);
        assert!(entry.scan_only());

        entry.connect_goal = true;
        assert!(!entry.scan_only());

        entry.connect_goal = false;
        entry.known = Some(known(11));
        assert!(!entry.scan_only());
    }
}
