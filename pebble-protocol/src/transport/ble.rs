//! BLE Transport
//!
//! Brings a Pebble up over Bluetooth LE and layers PPoG on top.
//!
//! ## Connection Flow
//!
//! 1. Register with the phone's GATT server (skipped in reversed mode)
//! 2. GATT connect and service discovery
//! 3. Connection parameters and MTU
//! 4. Subscribe to the connectivity characteristic and read the status
//! 5. Pair if the watch or the phone lacks the bond
//! 6. PPoG reset handshake; the link's byte streams are returned

use super::gatt::{
    GattClient, GattError, GattPlatform, GattServerManager, GattWriteType,
    CONNECTION_PARAMETERS_CHARACTERISTIC, CONNECTIVITY_CHARACTERISTIC, PAIRING_SERVICE_UUID,
    PPOG_CLIENT_READ_CHARACTERISTIC, PPOG_CLIENT_SERVICE_UUID, PPOG_CLIENT_WRITE_CHARACTERISTIC,
};
use super::{
    ConnectionFailureReason, DisconnectSignal, PebbleStreams, Transport, TransportConnector,
    STREAM_CHANNEL_CAPACITY,
};
use crate::config::ProtocolConfig;
use crate::pairing::{self, ConnectivityStatus, PairingOptions};
use crate::ppog::{PpogFrameSender, PpogLink, PpogRole};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Time allowed for the closing `ResetRequest` to go out
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Sends PPoG frames as notifications from the phone's GATT server
struct ServerFrameSender {
    server: Arc<GattServerManager>,
    identifier: String,
}

#[async_trait]
impl PpogFrameSender for ServerFrameSender {
    async fn send_frame(&self, frame: Vec<u8>) -> Result<()> {
        self.server
            .send_data(&self.identifier, &frame)
            .await
            .map_err(Into::into)
    }
}

/// Writes PPoG frames to the watch-hosted service (reversed mode)
struct ClientFrameSender {
    client: Arc<dyn GattClient>,
}

#[async_trait]
impl PpogFrameSender for ClientFrameSender {
    async fn send_frame(&self, frame: Vec<u8>) -> Result<()> {
        self.client
            .write_characteristic(
                PPOG_CLIENT_SERVICE_UUID,
                PPOG_CLIENT_WRITE_CHARACTERISTIC,
                &frame,
                GattWriteType::NoResponse,
            )
            .await
            .map_err(Into::into)
    }
}

struct BleSession {
    client: Arc<dyn GattClient>,
    link: Option<Arc<PpogLink>>,
    tasks: Vec<JoinHandle<()>>,
}

/// Connector for [`Transport::Ble`]
pub struct BleTransportConnector {
    transport: Transport,
    identifier: String,
    config: ProtocolConfig,
    platform: Arc<dyn GattPlatform>,
    server: Option<Arc<GattServerManager>>,
    session: Mutex<Option<BleSession>>,
    disconnected: DisconnectSignal,
}

impl std::fmt::Debug for BleTransportConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleTransportConnector")
            .field("identifier", &self.identifier)
            .field("reversed_ppog", &self.config.ble.reversed_ppog)
            .finish()
    }
}

impl BleTransportConnector {
    pub fn new(
        identifier: String,
        config: ProtocolConfig,
        platform: Arc<dyn GattPlatform>,
        server: Option<Arc<GattServerManager>>,
    ) -> Self {
        Self {
            transport: Transport::Ble {
                identifier: identifier.clone(),
            },
            identifier,
            config,
            platform,
            server,
            session: Mutex::new(None),
            disconnected: DisconnectSignal::new(),
        }
    }

    async fn track(&self, task: JoinHandle<()>) {
        if let Some(session) = self.session.lock().await.as_mut() {
            session.tasks.push(task);
        } else {
            task.abort();
        }
    }

    async fn configure_connection_params(&self, client: &Arc<dyn GattClient>) {
        match client
            .subscribe(PAIRING_SERVICE_UUID, CONNECTION_PARAMETERS_CHARACTERISTIC)
            .await
        {
            Ok(mut updates) => {
                let identifier = self.identifier.clone();
                self.track(tokio::spawn(async move {
                    while let Some(value) = updates.recv().await {
                        debug!("{}: connection params changed: {}", identifier, hex::encode(value));
                    }
                }))
                .await;
            }
            Err(e) => {
                // Older (recovery) firmwares don't have it
                info!("{}: error subscribing to connection params: {}", self.identifier, e);
                return;
            }
        }
        if let Err(e) = client
            .write_characteristic(
                PAIRING_SERVICE_UUID,
                CONNECTION_PARAMETERS_CHARACTERISTIC,
                &[0, 1],
                GattWriteType::WithResponse,
            )
            .await
        {
            info!("{}: error configuring connection params: {}", self.identifier, e);
        }
    }

    /// Read the status explicitly; fall back to the first notification
    async fn connectivity_status(
        &self,
        client: &Arc<dyn GattClient>,
        notifications: &mut mpsc::Receiver<Vec<u8>>,
    ) -> std::result::Result<ConnectivityStatus, ConnectionFailureReason> {
        match client
            .read_characteristic(PAIRING_SERVICE_UUID, CONNECTIVITY_CHARACTERISTIC)
            .await
        {
            Ok(value) => {
                if let Some(status) = ConnectivityStatus::decode(&value) {
                    return Ok(status);
                }
                debug!("{}: empty connectivity read", self.identifier);
            }
            Err(e) => debug!("{}: connectivity read failed: {}", self.identifier, e),
        }

        let wait = Duration::from_secs(self.config.ble.connectivity_timeout_secs);
        let first = timeout(wait, async {
            while let Some(value) = notifications.recv().await {
                if let Some(status) = ConnectivityStatus::decode(&value) {
                    return Some(status);
                }
            }
            None
        })
        .await;
        match first {
            Ok(Some(status)) => Ok(status),
            _ => {
                warn!("{}: failed to get connection status", self.identifier);
                Err(ConnectionFailureReason::ConnectionStatus)
            }
        }
    }

    async fn connect_inner(&self) -> std::result::Result<PebbleStreams, ConnectionFailureReason> {
        let ble = &self.config.ble;
        debug!("{}: connect() reversed_ppog = {}", self.identifier, ble.reversed_ppog);
        let (frames_tx, frames_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        let server = if ble.reversed_ppog {
            None
        } else {
            let server = self.server.clone().ok_or_else(|| {
                error!("{}: no GATT server available", self.identifier);
                ConnectionFailureReason::RegisterGattServer
            })?;
            server
                .register_device(&self.identifier, frames_tx.clone())
                .await
                .map_err(|e| {
                    error!("{}: GATT server registration failed: {}", self.identifier, e);
                    ConnectionFailureReason::RegisterGattServer
                })?;
            Some(server)
        };

        let client = self.platform.client(&self.identifier).map_err(|e| {
            warn!("{}: no GATT client: {}", self.identifier, e);
            ConnectionFailureReason::GattConnect
        })?;
        client.connect().await.map_err(|e| {
            warn!("{}: GATT connect failed: {}", self.identifier, e);
            ConnectionFailureReason::GattConnect
        })?;

        *self.session.lock().await = Some(BleSession {
            client: client.clone(),
            link: None,
            tasks: Vec::new(),
        });
        {
            let client = client.clone();
            let signal = self.disconnected.clone();
            self.track(tokio::spawn(async move {
                client.wait_disconnected().await;
                signal.signal();
            }))
            .await;
        }

        let services = client.discover_services().await.map_err(|e| {
            warn!("{}: service discovery failed: {}", self.identifier, e);
            ConnectionFailureReason::ServiceDiscovery
        })?;
        debug!("{}: {} services", self.identifier, services.len());

        self.configure_connection_params(&client).await;

        let mtu = client.request_mtu(ble.target_mtu).await.map_err(|e| {
            warn!("{}: error setting MTU: {}", self.identifier, e);
            ConnectionFailureReason::MtuGattError
        })?;
        debug!("{}: MTU {}", self.identifier, mtu);

        let mut connectivity = client
            .subscribe(PAIRING_SERVICE_UUID, CONNECTIVITY_CHARACTERISTIC)
            .await
            .map_err(|e| {
                warn!("{}: failed to subscribe to connectivity: {}", self.identifier, e);
                ConnectionFailureReason::SubscribeConnectivity
            })?;
        let status = self.connectivity_status(&client, &mut connectivity).await?;
        debug!("{}: connectivity {:?}", self.identifier, status);
        {
            let identifier = self.identifier.clone();
            self.track(tokio::spawn(async move {
                while let Some(value) = connectivity.recv().await {
                    if let Some(status) = ConnectivityStatus::decode(&value) {
                        debug!("{}: connectivity {:?}", identifier, status);
                    }
                }
            }))
            .await;
        }

        if pairing::needs_pairing(&status, client.is_bonded().await) {
            let options = PairingOptions {
                pin_address: ble.pin_address,
                phone_requires_pairing: ble.phone_requires_pairing,
                watch_as_gatt_server: ble.reversed_ppog,
                bond_timeout: Duration::from_secs(ble.pairing_timeout_secs),
            };
            pairing::request_pairing(client.as_ref(), &services, &status, &options).await?;
        }

        let sender: Arc<dyn PpogFrameSender> = match server {
            Some(server) => Arc::new(ServerFrameSender {
                server,
                identifier: self.identifier.clone(),
            }),
            None => {
                let mut notifications = client
                    .subscribe(PPOG_CLIENT_SERVICE_UUID, PPOG_CLIENT_READ_CHARACTERISTIC)
                    .await
                    .map_err(|e| {
                        warn!("{}: failed to subscribe to PPoG: {}", self.identifier, e);
                        match e {
                            GattError::InsufficientAuthentication => {
                                ConnectionFailureReason::GattInsufficientAuth
                            }
                            _ => ConnectionFailureReason::ServiceDiscovery,
                        }
                    })?;
                self.track(tokio::spawn(async move {
                    while let Some(frame) = notifications.recv().await {
                        if frames_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                }))
                .await;
                Arc::new(ClientFrameSender {
                    client: client.clone(),
                })
            }
        };

        let mut link_config = self.config.ppog_link_config();
        link_config.initial_mtu = mtu as usize;
        let (link, streams) = PpogLink::establish(link_config, PpogRole::Responder, sender, frames_rx)
            .await
            .map_err(|e| {
                warn!("{}: PPoG init failed: {}", self.identifier, e);
                ConnectionFailureReason::PpogInitTimeout
            })?;
        let link = Arc::new(link);

        {
            let link = link.clone();
            let mut mtu_updates = client.mtu();
            let identifier = self.identifier.clone();
            self.track(tokio::spawn(async move {
                while mtu_updates.changed().await.is_ok() {
                    let mtu = *mtu_updates.borrow_and_update();
                    if let Err(e) = link.update_mtu(mtu as usize) {
                        debug!("{}: ignoring MTU update: {}", identifier, e);
                    }
                }
            }))
            .await;
        }
        {
            let link = link.clone();
            let signal = self.disconnected.clone();
            let identifier = self.identifier.clone();
            self.track(tokio::spawn(async move {
                let state = link.wait_terminated().await;
                info!("{}: PPoG link ended: {:?}", identifier, state);
                signal.signal();
            }))
            .await;
        }

        if let Some(session) = self.session.lock().await.as_mut() {
            session.link = Some(link);
        }
        info!("{}: BLE transport up", self.identifier);
        Ok(streams)
    }
}

#[async_trait]
impl TransportConnector for BleTransportConnector {
    fn transport(&self) -> &Transport {
        &self.transport
    }

    async fn connect(&self) -> std::result::Result<PebbleStreams, ConnectionFailureReason> {
        let result = self.connect_inner().await;
        if result.is_err() {
            self.disconnect().await;
        }
        result
    }

    async fn disconnect(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            if let Some(link) = &session.link {
                if timeout(CLOSE_TIMEOUT, link.close()).await.is_err() {
                    debug!("{}: PPoG close timed out", self.identifier);
                }
            }
            for task in session.tasks {
                task.abort();
            }
            session.client.disconnect().await;
        }
        if let Some(server) = &self.server {
            server.unregister_device(&self.identifier).await;
        }
        self.disconnected.signal();
    }

    async fn wait_disconnected(&self) {
        self.disconnected.wait().await;
    }
}
