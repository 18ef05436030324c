//! Connection State Machine
//!
//! A [`PebbleConnector`] takes one [`Transport`] from nothing to a fully
//! negotiated session:
//!
//! ```text
//! Inactive -> Connecting -> Negotiating -> Connected{InPrf | NotInPrf}
//!                 |              |
//!                 +--------------+--> Failed(reason)
//! ```
//!
//! `Connected` and `Failed` return to `Inactive` on disconnect. A connector
//! serves a single attempt; the watch manager creates a fresh one for every
//! reconnect and tears the old one down first.

use crate::config::{ProtocolConfig, PutBytesConfig};
use crate::negotiation::Negotiator;
use crate::packet::PebblePacket;
use crate::protocol_handler::{PacketSender, ProtocolHandler};
use crate::putbytes_session::PutBytesSession;
use crate::services::blobdb::BlobDbService;
use crate::services::putbytes::PutBytesService;
use crate::services::system::{SystemService, WatchInfo};
use crate::transport::{
    ConnectionFailureReason, DisconnectSignal, Transport, TransportConnector,
    TransportConnectorFactory,
};
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Whether the watch runs recovery firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectedMode {
    /// Recovery firmware; only firmware updates make sense
    InPrf,
    NotInPrf,
}

/// A negotiated connection and the services running on it
#[derive(Debug, Clone)]
pub struct ConnectedPebble {
    pub watch_info: WatchInfo,
    pub mode: ConnectedMode,
    pub session: Arc<PebbleSession>,
}

/// Lifecycle of one connection attempt
#[derive(Debug, Clone)]
pub enum ConnectingPebbleState {
    Inactive,
    Connecting,
    Negotiating,
    Connected(ConnectedPebble),
    Failed(ConnectionFailureReason),
}

/// Payload-free view of [`ConnectingPebbleState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStage {
    Inactive,
    Connecting,
    Negotiating,
    Connected,
    Failed,
}

impl ConnectingPebbleState {
    pub fn stage(&self) -> ConnectionStage {
        match self {
            ConnectingPebbleState::Inactive => ConnectionStage::Inactive,
            ConnectingPebbleState::Connecting => ConnectionStage::Connecting,
            ConnectingPebbleState::Negotiating => ConnectionStage::Negotiating,
            ConnectingPebbleState::Connected(_) => ConnectionStage::Connected,
            ConnectingPebbleState::Failed(_) => ConnectionStage::Failed,
        }
    }

    /// Connecting, negotiating or connected
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectingPebbleState::Connecting
                | ConnectingPebbleState::Negotiating
                | ConnectingPebbleState::Connected(_)
        )
    }

    pub fn connected(&self) -> Option<&ConnectedPebble> {
        match self {
            ConnectingPebbleState::Connected(connected) => Some(connected),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConnectingPebbleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectingPebbleState::Connected(connected) => {
                write!(f, "Connected({:?})", connected.mode)
            }
            ConnectingPebbleState::Failed(reason) => write!(f, "Failed({})", reason),
            other => write!(f, "{:?}", other.stage()),
        }
    }
}

/// Services of one negotiated connection
///
/// Dropping the session stops packet dispatch for the connection.
#[derive(Debug)]
pub struct PebbleSession {
    transport: Transport,
    handler: ProtocolHandler,
    system: SystemService,
    blobdb: BlobDbService,
    putbytes: PutBytesSession,
}

impl PebbleSession {
    /// Register the services, then start dispatching so no early packet is lost
    pub fn new(
        transport: Transport,
        mut handler: ProtocolHandler,
        putbytes_config: PutBytesConfig,
    ) -> Self {
        let system = SystemService::new(&handler);
        let blobdb = BlobDbService::new(&handler);
        let putbytes = PutBytesSession::new(PutBytesService::new(&handler), putbytes_config);
        handler.start();
        Self {
            transport,
            handler,
            system,
            blobdb,
            putbytes,
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn system(&self) -> &SystemService {
        &self.system
    }

    pub fn blobdb(&self) -> &BlobDbService {
        &self.blobdb
    }

    pub fn putbytes(&self) -> &PutBytesSession {
        &self.putbytes
    }

    /// Raw packet sender for endpoints without a dedicated service
    pub fn sender(&self) -> PacketSender {
        self.handler.sender()
    }

    /// Decoded packets for endpoints without a dedicated service
    pub fn app_packets(&self) -> broadcast::Receiver<PebblePacket> {
        self.handler.app_packets()
    }

    /// Resolves when the inbound byte stream ends
    pub async fn wait_closed(&self) {
        self.handler.wait_closed().await;
    }
}

/// Drives one connection attempt for one transport
#[async_trait]
pub trait PebbleConnector: Send + Sync + Debug {
    fn transport(&self) -> &Transport;

    /// Run the attempt; returns once connected, failed or disconnected
    async fn connect(&self);

    /// Tear down whatever is up and move to `Inactive`; idempotent
    async fn disconnect(&self);

    /// Resolves once this connector is finished (failed or disconnected)
    async fn wait_disconnected(&self);

    /// Latest state
    fn state(&self) -> watch::Receiver<ConnectingPebbleState>;

    /// Every transition, in order
    fn subscribe(&self) -> broadcast::Receiver<ConnectingPebbleState>;
}

/// Capacity of the per-connector transition broadcast
const TRANSITION_CAPACITY: usize = 16;

/// Current state plus an ordered feed of transitions
#[derive(Debug)]
pub struct ConnectorState {
    latest: watch::Sender<ConnectingPebbleState>,
    transitions: broadcast::Sender<ConnectingPebbleState>,
}

impl Default for ConnectorState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectorState {
    pub fn new() -> Self {
        let (latest, _) = watch::channel(ConnectingPebbleState::Inactive);
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        Self {
            latest,
            transitions,
        }
    }

    /// Publish `state`, returning the one it replaced
    pub fn set(&self, state: ConnectingPebbleState) -> ConnectingPebbleState {
        // No subscribers is fine
        let _ = self.transitions.send(state.clone());
        self.latest.send_replace(state)
    }

    pub fn current(&self) -> ConnectingPebbleState {
        self.latest.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectingPebbleState> {
        self.latest.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectingPebbleState> {
        self.transitions.subscribe()
    }
}

/// Creates a connector per connection attempt
pub trait PebbleConnectorFactory: Send + Sync + Debug {
    fn create(&self, transport: &Transport) -> Result<Arc<dyn PebbleConnector>>;
}

/// Connector over a real [`TransportConnector`]
#[derive(Debug)]
pub struct RealPebbleConnector {
    transport: Transport,
    transport_connector: Arc<dyn TransportConnector>,
    negotiator: Negotiator,
    putbytes_config: PutBytesConfig,
    state: Arc<ConnectorState>,
    finished: DisconnectSignal,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl RealPebbleConnector {
    pub fn new(transport_connector: Arc<dyn TransportConnector>, config: &ProtocolConfig) -> Self {
        Self {
            transport: transport_connector.transport().clone(),
            transport_connector,
            negotiator: Negotiator::new(config.negotiation.clone()),
            putbytes_config: config.putbytes.clone(),
            state: Arc::new(ConnectorState::new()),
            finished: DisconnectSignal::new(),
            monitor: Mutex::new(None),
        }
    }

    /// State changes are ignored once the connector has finished
    fn set_state(&self, state: ConnectingPebbleState) {
        if self.finished.is_signalled() {
            return;
        }
        info!("{}: {}", self.transport, state);
        self.state.set(state);
    }

    async fn fail(&self, reason: ConnectionFailureReason) {
        error!("{}: connection failed: {}", self.transport, reason);
        self.set_state(ConnectingPebbleState::Failed(reason));
        self.transport_connector.disconnect().await;
        self.finished.signal();
    }

    async fn run(&self) {
        self.set_state(ConnectingPebbleState::Connecting);

        let streams = match self.transport_connector.connect().await {
            Ok(streams) => streams,
            Err(reason) => {
                self.fail(reason).await;
                return;
            }
        };

        let handler = ProtocolHandler::new(&self.transport.identifier(), streams);
        let session = PebbleSession::new(
            self.transport.clone(),
            handler,
            self.putbytes_config.clone(),
        );
        self.set_state(ConnectingPebbleState::Negotiating);

        let negotiated = tokio::select! {
            result = self.negotiator.negotiate(&session.system) => Some(result),
            _ = self.transport_connector.wait_disconnected() => None,
        };

        let watch_info = match negotiated {
            Some(Ok(watch_info)) => watch_info,
            Some(Err(ProtocolError::Cancelled(_))) | None => {
                self.fail(ConnectionFailureReason::LinkDropped).await;
                return;
            }
            Some(Err(e)) => {
                warn!("{}: negotiation failed: {}", self.transport, e);
                self.fail(ConnectionFailureReason::NegotiationFailed).await;
                return;
            }
        };

        let mode = if watch_info.in_recovery_mode() {
            ConnectedMode::InPrf
        } else {
            ConnectedMode::NotInPrf
        };
        let session = Arc::new(session);
        self.set_state(ConnectingPebbleState::Connected(ConnectedPebble {
            watch_info,
            mode,
            session: session.clone(),
        }));

        let transport_connector = self.transport_connector.clone();
        let state = self.state.clone();
        let finished = self.finished.clone();
        let transport = self.transport.clone();
        let monitor = tokio::spawn(async move {
            tokio::select! {
                _ = transport_connector.wait_disconnected() => {}
                _ = session.wait_closed() => {}
            }
            if finished.is_signalled() {
                return;
            }
            info!("{}: connection lost", transport);
            transport_connector.disconnect().await;
            state.set(ConnectingPebbleState::Inactive);
            finished.signal();
        });
        if let Ok(mut slot) = self.monitor.lock() {
            *slot = Some(monitor);
        }
    }
}

#[async_trait]
impl PebbleConnector for RealPebbleConnector {
    fn transport(&self) -> &Transport {
        &self.transport
    }

    async fn connect(&self) {
        if self.state.current().stage() != ConnectionStage::Inactive
            || self.finished.is_signalled()
        {
            warn!("{}: connector already used", self.transport);
            return;
        }
        tokio::select! {
            _ = self.run() => {}
            _ = self.finished.wait() => debug!("{}: connect cancelled", self.transport),
        }
    }

    async fn disconnect(&self) {
        let monitor = self.monitor.lock().ok().and_then(|mut slot| slot.take());
        if let Some(monitor) = monitor {
            monitor.abort();
        }
        self.finished.signal();
        self.transport_connector.disconnect().await;
        let previous = self.state.set(ConnectingPebbleState::Inactive);
        if previous.stage() != ConnectionStage::Inactive {
            info!("{}: disconnected (was {})", self.transport, previous);
        }
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

impl Drop for RealPebbleConnector {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.monitor.lock() {
            if let Some(monitor) = slot.take() {
                monitor.abort();
            }
        }
    }
}

/// Creates [`RealPebbleConnector`]s over a transport connector factory
#[derive(Debug, Clone)]
pub struct RealPebbleConnectorFactory {
    transports: Arc<dyn TransportConnectorFactory>,
    config: ProtocolConfig,
}

impl RealPebbleConnectorFactory {
    pub fn new(transports: Arc<dyn TransportConnectorFactory>, config: ProtocolConfig) -> Self {
        Self { transports, config }
    }
}

impl PebbleConnectorFactory for RealPebbleConnectorFactory {
    fn create(&self, transport: &Transport) -> Result<Arc<dyn PebbleConnector>> {
        let transport_connector = self.transports.create(transport)?;
        Ok(Arc::new(RealPebbleConnector::new(
            transport_connector,
            &self.config,
        )))
    }
}
