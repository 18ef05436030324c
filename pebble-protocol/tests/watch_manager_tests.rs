//! Watch manager behavior over scripted connectors

mod common;

use async_trait::async_trait;
use pebble_protocol::config::{PutBytesConfig, WatchManagerConfig};
use pebble_protocol::connector::ConnectorState;
use pebble_protocol::services::system::ProtocolCapability;
use pebble_protocol::transport::{DisconnectSignal, STREAM_CHANNEL_CAPACITY};
use pebble_protocol::{
    ConnectedMode, ConnectedPebble, ConnectingPebbleState, ConnectionFailureReason,
    ConnectionStage, KnownWatch, KnownWatchStore, MemoryKnownWatchStore, PebbleConnector,
    PebbleConnectorFactory, PebbleSession, PebbleStreams, ProtocolHandler, Result, ScanResult,
    Transport, WatchEvent, WatchInfo, WatchManager, WatchStage,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::time::timeout;

/// What a connector does once asked to connect
#[derive(Debug, Clone, Copy)]
enum Script {
    /// Stay `Connecting` until torn down
    Hang,
    /// Reach `Connected`; the link drops on `release`
    Connect,
    /// Stop in `Negotiating`; the link drops on `release`
    DropWhileNegotiating,
    /// Fail straight away
    Fail,
}

#[derive(Debug, Default)]
struct Counters {
    live: AtomicUsize,
    max_live: AtomicUsize,
    created: AtomicUsize,
}

#[derive(Debug)]
struct ScriptedConnector {
    transport: Transport,
    script: Script,
    state: Arc<ConnectorState>,
    finished: DisconnectSignal,
    torn_down: AtomicBool,
    counters: Arc<Counters>,
    release: Arc<Notify>,
    // Keeps the far end of the session streams open
    wire: Mutex<Vec<(mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>)>>,
}

impl ScriptedConnector {
    fn connected_pebble(&self) -> ConnectedPebble {
        let (out_tx, out_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        self.wire.lock().unwrap().push((in_tx, out_rx));
        let handler = ProtocolHandler::new(
            &self.transport.identifier(),
            PebbleStreams {
                outbound: out_tx,
                inbound: in_rx,
            },
        );
        let session = PebbleSession::new(
            self.transport.clone(),
            handler,
            PutBytesConfig::default(),
        );
        ConnectedPebble {
            watch_info: WatchInfo::decode(&watch_version_payload()).unwrap(),
            mode: ConnectedMode::NotInPrf,
            session: Arc::new(session),
        }
    }

    /// Link loss once released
    fn drop_on_release(&self, reason: Option<ConnectionFailureReason>) {
        let release = self.release.clone();
        let state = self.state.clone();
        let finished = self.finished.clone();
        tokio::spawn(async move {
            release.notified().await;
            match reason {
                Some(reason) => state.set(ConnectingPebbleState::Failed(reason)),
                None => state.set(ConnectingPebbleState::Inactive),
            };
            finished.signal();
        });
    }
}

#[async_trait]
impl PebbleConnector for ScriptedConnector {
    fn transport(&self) -> &Transport {
        &self.transport
    }

    async fn connect(&self) {
        let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_live.fetch_max(live, Ordering::SeqCst);

        self.state.set(ConnectingPebbleState::Connecting);
        match self.script {
            Script::Hang => {}
            Script::Connect => {
                self.state.set(ConnectingPebbleState::Negotiating);
                self.state
                    .set(ConnectingPebbleState::Connected(self.connected_pebble()));
                self.drop_on_release(None);
                return;
            }
            Script::DropWhileNegotiating => {
                self.state.set(ConnectingPebbleState::Negotiating);
                self.drop_on_release(Some(ConnectionFailureReason::LinkDropped));
            }
            Script::Fail => {
                self.state.set(ConnectingPebbleState::Failed(
                    ConnectionFailureReason::GattConnect,
                ));
                return;
            }
        }
        self.finished.wait().await;
    }

    async fn disconnect(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.counters.live.fetch_sub(1, Ordering::SeqCst);
        if self.state.current().is_active() {
            self.state.set(ConnectingPebbleState::Inactive);
        }
        self.finished.signal();
    }

    async fn wait_disconnected(&self) {
        self.finished.wait().await;
    }

    fn state(&self) -> watch::Receiver<ConnectingPebbleState> {
        self.state.watch()
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectingPebbleState> {
        self.state.subscribe()
    }
}

/// Hands out connectors following a script queue; `Hang` once it runs out
#[derive(Debug, Default)]
struct ScriptedFactory {
    scripts: Mutex<VecDeque<Script>>,
    counters: Arc<Counters>,
    release: Arc<Notify>,
}

impl ScriptedFactory {
    fn with_scripts(scripts: &[Script]) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.iter().copied().collect()),
            ..Default::default()
        })
    }
}

impl PebbleConnectorFactory for ScriptedFactory {
    fn create(&self, transport: &Transport) -> Result<Arc<dyn PebbleConnector>> {
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Hang);
        Ok(Arc::new(ScriptedConnector {
            transport: transport.clone(),
            script,
            state: Arc::new(ConnectorState::new()),
            finished: DisconnectSignal::new(),
            torn_down: AtomicBool::new(false),
            counters: self.counters.clone(),
            release: self.release.clone(),
            wire: Mutex::new(Vec::new()),
        }))
    }
}

fn firmware_record(tag: &str, is_recovery: bool) -> Vec<u8> {
    let mut out = 1_600_000_000u32.to_be_bytes().to_vec();
    let mut tag_bytes = tag.as_bytes().to_vec();
    tag_bytes.resize(32, 0);
    out.extend(tag_bytes);
    out.extend_from_slice(b"0123abcd");
    out.extend_from_slice(&[is_recovery as u8, 14, 1]);
    out
}

fn watch_version_payload() -> Vec<u8> {
    let mut out = vec![0x01];
    out.extend(firmware_record("v4.4.2", false));
    out.extend(firmware_record("v4.0.0-prf", true));
    out.extend_from_slice(&1_500_000_000u32.to_be_bytes());
    out.extend_from_slice(b"snowy_dvt");
    out.extend_from_slice(b"Q402445E00D1");
    out.extend_from_slice(&[0xB0, 0xB4, 0x48, 0x01, 0x02, 0x03]);
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(&1_600_000_100u32.to_be_bytes());
    out.extend_from_slice(b"en_US\0");
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&ProtocolCapability::encode(&[ProtocolCapability::AppRunState]));
    out.push(0);
    out
}

fn socket(port: u16) -> Transport {
    Transport::Socket {
        address: format!("127.0.0.1:{}", port).parse().unwrap(),
    }
}

fn ble(identifier: &str) -> Transport {
    Transport::Ble {
        identifier: identifier.to_string(),
    }
}

fn scan(transport: &Transport) -> ScanResult {
    ScanResult {
        transport: transport.clone(),
        name: format!("Pebble {}", transport),
        rssi: Some(-60),
    }
}

fn config() -> WatchManagerConfig {
    common::init_tracing();
    WatchManagerConfig {
        multiple_watches: false,
        disconnect_timeout_secs: 1,
        initial_reconnect_delay_secs: 60,
        max_reconnect_delay_secs: 120,
        max_reconnect_attempts: 5,
        scan_result_ttl_secs: 30,
    }
}

/// Retries at 10s, then 20s later; sightings go stale after 15s
fn short_retry_config() -> WatchManagerConfig {
    WatchManagerConfig {
        initial_reconnect_delay_secs: 10,
        max_reconnect_delay_secs: 60,
        scan_result_ttl_secs: 15,
        ..config()
    }
}

/// Scan once, ask for a connection and let every attempt fail
///
/// Returns how many connectors were created after the first attempt, after
/// the 10s retry, and after the 30s retry.
async fn failing_retries(watch: Transport) -> [usize; 3] {
    let factory = ScriptedFactory::with_scripts(&[Script::Fail; 8]);
    let manager = WatchManager::new(
        short_retry_config(),
        factory.clone(),
        Arc::new(MemoryKnownWatchStore::new()),
    );
    manager.start().await.unwrap();
    let created = || factory.counters.created.load(Ordering::SeqCst);

    manager.add_scan_result(scan(&watch)).await;
    manager.request_connection(&watch).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    let first = created();
    tokio::time::sleep(Duration::from_secs(11)).await;
    let second = created();
    tokio::time::sleep(Duration::from_secs(28)).await;
    let third = created();

    manager.shutdown().await;
    [first, second, third]
}

/// Wait for the next event matching `pred`
async fn expect_event<F>(events: &mut broadcast::Receiver<WatchEvent>, pred: F) -> WatchEvent
where
    F: Fn(&WatchEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event did not arrive")
}

/// Next state change of `transport`
async fn next_stage(
    events: &mut broadcast::Receiver<WatchEvent>,
    transport: &Transport,
) -> ConnectingPebbleState {
    let event = expect_event(events, |event| {
        matches!(event, WatchEvent::StateChanged { transport: t, .. } if t == transport)
    })
    .await;
    match event {
        WatchEvent::StateChanged { state, .. } => state,
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_connect_drop_and_sighting_sequence() {
    let factory = ScriptedFactory::with_scripts(&[
        Script::Connect,
        Script::DropWhileNegotiating,
        Script::Hang,
    ]);
    let store = Arc::new(MemoryKnownWatchStore::new());
    let manager = WatchManager::new(config(), factory.clone(), store.clone());
    let mut events = manager.subscribe();
    manager.start().await.unwrap();

    let watch = socket(9001);
    manager.add_scan_result(scan(&watch)).await;
    assert_eq!(
        manager.watch(&watch).await.unwrap().stage,
        WatchStage::ScannedOnly
    );

    manager.request_connection(&watch).await.unwrap();
    assert_eq!(next_stage(&mut events, &watch).await.stage(), ConnectionStage::Connecting);
    assert_eq!(next_stage(&mut events, &watch).await.stage(), ConnectionStage::Negotiating);
    assert_eq!(next_stage(&mut events, &watch).await.stage(), ConnectionStage::Connected);

    let started = expect_event(&mut events, |e| matches!(e, WatchEvent::SessionStarted { .. })).await;
    match started {
        WatchEvent::SessionStarted {
            pebble,
            first_connection,
            ..
        } => {
            assert!(first_connection);
            assert_eq!(pebble.watch_info.serial, "Q402445E00D1");
        }
        _ => unreachable!(),
    }

    let view = manager.watch(&watch).await.unwrap();
    assert_eq!(view.stage, WatchStage::Connected);
    let known = view.known.unwrap();
    assert_eq!(known.serial.as_deref(), Some("Q402445E00D1"));
    assert!(known.last_connected.is_some());
    assert_eq!(store.load().await.unwrap().len(), 1);

    // Link loss: reconnect right away, this time the link drops mid-negotiation
    factory.release.notify_one();
    assert_eq!(next_stage(&mut events, &watch).await.stage(), ConnectionStage::Inactive);
    assert_eq!(next_stage(&mut events, &watch).await.stage(), ConnectionStage::Connecting);
    assert_eq!(next_stage(&mut events, &watch).await.stage(), ConnectionStage::Negotiating);

    factory.release.notify_one();
    assert!(matches!(
        next_stage(&mut events, &watch).await,
        ConnectingPebbleState::Failed(ConnectionFailureReason::LinkDropped)
    ));
    expect_event(&mut events, |e| {
        matches!(
            e,
            WatchEvent::ConnectionFailed {
                reason: ConnectionFailureReason::LinkDropped,
                ..
            }
        )
    })
    .await;

    // Backoff is a minute; a fresh sighting retries immediately
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(factory.counters.created.load(Ordering::SeqCst), 2);
    let view = manager.watch(&watch).await.unwrap();
    assert_eq!(view.stage, WatchStage::Disconnected);
    assert_eq!(view.last_failure, Some(ConnectionFailureReason::LinkDropped));

    manager.add_scan_result(scan(&watch)).await;
    assert_eq!(next_stage(&mut events, &watch).await.stage(), ConnectionStage::Connecting);
    assert_eq!(factory.counters.created.load(Ordering::SeqCst), 3);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_single_watch_mode_never_overlaps() {
    let factory = ScriptedFactory::with_scripts(&[]);
    let manager = WatchManager::new(
        config(),
        factory.clone(),
        Arc::new(MemoryKnownWatchStore::new()),
    );
    let mut events = manager.subscribe();
    manager.start().await.unwrap();

    let first = socket(9101);
    let second = socket(9102);
    manager.add_scan_result(scan(&first)).await;
    manager.add_scan_result(scan(&second)).await;

    for cycle in 0..20 {
        let target = if cycle % 2 == 0 { &first } else { &second };
        manager.request_connection(target).await.unwrap();
        let state = next_stage(&mut events, target).await;
        assert_eq!(state.stage(), ConnectionStage::Connecting, "cycle {}", cycle);
    }

    assert!(factory.counters.max_live.load(Ordering::SeqCst) <= 1);
    assert_eq!(factory.counters.created.load(Ordering::SeqCst), 20);

    let views = manager.watches().await;
    let goals: Vec<bool> = views.iter().map(|v| v.connect_goal).collect();
    assert_eq!(goals.iter().filter(|g| **g).count(), 1);

    manager.shutdown().await;
    assert_eq!(factory.counters.live.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_multiple_watch_mode_connects_all() {
    let factory = ScriptedFactory::with_scripts(&[]);
    let manager = WatchManager::new(
        config(),
        factory.clone(),
        Arc::new(MemoryKnownWatchStore::new()),
    );
    manager.set_multiple_watches(true);
    let mut events = manager.subscribe();
    manager.start().await.unwrap();

    let first = socket(9201);
    let second = socket(9202);
    manager.request_connection(&first).await.unwrap();
    manager.request_connection(&second).await.unwrap();

    timeout(Duration::from_secs(5), async {
        while factory.counters.live.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("both watches should be connecting");
    assert_eq!(factory.counters.max_live.load(Ordering::SeqCst), 2);

    manager.request_disconnection(&first).await.unwrap();
    assert_eq!(
        next_stage(&mut events, &first).await.stage(),
        ConnectionStage::Inactive
    );
    assert_eq!(factory.counters.live.load(Ordering::SeqCst), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_known_watch_reconnects_on_start() {
    let store = Arc::new(MemoryKnownWatchStore::new());
    let watch = socket(9301);
    store
        .save(&KnownWatch {
            transport: watch.clone(),
            name: "Pebble Time".to_string(),
            last_firmware_version: Some("v4.4.2".to_string()),
            serial: Some("Q402445E00D1".to_string()),
            connect_goal: true,
            last_connected: None,
        })
        .await
        .unwrap();

    let factory = ScriptedFactory::with_scripts(&[]);
    let manager = WatchManager::new(config(), factory.clone(), store);
    let mut events = manager.subscribe();
    manager.start().await.unwrap();

    assert_eq!(
        next_stage(&mut events, &watch).await.stage(),
        ConnectionStage::Connecting
    );
    let view = manager.watch(&watch).await.unwrap();
    assert_eq!(view.name, "Pebble Time");
    assert!(view.connect_goal);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_forget_disconnects_and_removes() {
    let store = Arc::new(MemoryKnownWatchStore::new());
    let factory = ScriptedFactory::with_scripts(&[Script::Connect]);
    let manager = WatchManager::new(config(), factory.clone(), store.clone());
    let mut events = manager.subscribe();
    manager.start().await.unwrap();

    let watch = socket(9401);
    manager.add_scan_result(scan(&watch)).await;
    manager.request_connection(&watch).await.unwrap();
    expect_event(&mut events, |e| matches!(e, WatchEvent::SessionStarted { .. })).await;
    assert_eq!(store.load().await.unwrap().len(), 1);

    manager.forget(&watch).await.unwrap();
    expect_event(&mut events, |e| matches!(e, WatchEvent::Forgotten { .. })).await;

    assert!(manager.watch(&watch).await.is_none());
    assert!(store.load().await.unwrap().is_empty());
    assert_eq!(factory.counters.live.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_bluetooth_retry_waits_for_fresh_sighting() {
    let watch = ble("C0:FF:EE:00:00:01");
    assert_eq!(failing_retries(watch.clone()).await, [1, 2, 2]);

    // Same again, but the scanner keeps reporting the watch
    let factory = ScriptedFactory::with_scripts(&[Script::Fail; 8]);
    let manager = WatchManager::new(
        short_retry_config(),
        factory.clone(),
        Arc::new(MemoryKnownWatchStore::new()),
    );
    manager.start().await.unwrap();
    manager.add_scan_result(scan(&watch)).await;
    manager.request_connection(&watch).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(factory.counters.created.load(Ordering::SeqCst), 1);

    // A sighting restarts the round straight away
    manager.add_scan_result(scan(&watch)).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(factory.counters.created.load(Ordering::SeqCst), 2);

    // The timer retry 10s later still finds a fresh sighting
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(factory.counters.created.load(Ordering::SeqCst), 3);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_socket_retry_needs_no_sighting() {
    assert_eq!(failing_retries(socket(9601)).await, [1, 2, 3]);
}

#[tokio::test]
async fn test_scan_results_tracking() {
    let factory = ScriptedFactory::with_scripts(&[Script::Connect]);
    let manager = WatchManager::new(
        config(),
        factory.clone(),
        Arc::new(MemoryKnownWatchStore::new()),
    );
    let mut events = manager.subscribe();
    manager.start().await.unwrap();

    let nearby = ble("C0:FF:EE:00:00:02");
    let watch = socket(9701);
    manager
        .add_scan_result(ScanResult {
            rssi: Some(-80),
            ..scan(&nearby)
        })
        .await;
    manager
        .add_scan_result(ScanResult {
            rssi: Some(-55),
            ..scan(&nearby)
        })
        .await;
    manager.add_scan_result(scan(&watch)).await;

    let results = manager.scan_results().await;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].transport, watch);
    assert_eq!(results[1].transport, nearby);
    assert_eq!(results[1].rssi, Some(-55));
    let view = manager.watch(&nearby).await.unwrap();
    assert!(view.scanned);
    assert_eq!(view.rssi, Some(-55));

    // Connecting takes the watch out of the scan results, and so does a
    // sighting while it stays connected
    manager.request_connection(&watch).await.unwrap();
    expect_event(&mut events, |e| matches!(e, WatchEvent::SessionStarted { .. })).await;
    manager.add_scan_result(scan(&watch)).await;
    let results = manager.scan_results().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].transport, nearby);
    let view = manager.watch(&watch).await.unwrap();
    assert!(!view.scanned);
    assert_eq!(view.rssi, None);

    // Only the watch that was merely scanned goes away
    manager.clear_scan_results().await;
    assert!(manager.scan_results().await.is_empty());
    assert!(manager.watch(&nearby).await.is_none());
    assert_eq!(
        manager.watch(&watch).await.unwrap().stage,
        WatchStage::Connected
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn test_repeated_connections_on_one_transport() {
    const CYCLES: usize = 25;
    let factory = ScriptedFactory::with_scripts(&[Script::Connect; CYCLES]);
    let manager = WatchManager::new(
        config(),
        factory.clone(),
        Arc::new(MemoryKnownWatchStore::new()),
    );
    let mut events = manager.subscribe();
    manager.start().await.unwrap();

    let watch = socket(9801);
    manager.add_scan_result(scan(&watch)).await;
    for cycle in 0..CYCLES {
        manager.request_connection(&watch).await.unwrap();
        for stage in [
            ConnectionStage::Connecting,
            ConnectionStage::Negotiating,
            ConnectionStage::Connected,
        ] {
            let state = next_stage(&mut events, &watch).await;
            assert_eq!(state.stage(), stage, "cycle {}", cycle);
        }

        manager.request_disconnection(&watch).await.unwrap();
        let state = next_stage(&mut events, &watch).await;
        assert_eq!(state.stage(), ConnectionStage::Inactive, "cycle {}", cycle);
    }

    timeout(Duration::from_secs(5), async {
        while factory.counters.live.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("last connection should close");
    assert_eq!(factory.counters.created.load(Ordering::SeqCst), CYCLES);
    assert_eq!(factory.counters.max_live.load(Ordering::SeqCst), 1);

    let view = manager.watch(&watch).await.unwrap();
    assert_eq!(view.stage, WatchStage::Disconnected);
    assert!(!view.connect_goal);
    assert!(view.connected.is_none());
    assert!(!view.known.unwrap().connect_goal);

    manager.shutdown().await;
}
