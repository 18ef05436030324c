//! GATT Primitives
//!
//! The platform Bluetooth stack is consumed through these traits only. A
//! platform backend implements [`GattPlatform`]; everything above it (PPoG,
//! pairing, the BLE connect flow) is platform independent.

use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, OnceCell};
use tracing::{debug, info};
use uuid::Uuid;

/// Pebble pairing service, carrying connectivity and pairing characteristics
pub const PAIRING_SERVICE_UUID: Uuid = uuid::uuid!("0000fed9-0000-1000-8000-00805f9b34fb");

/// Connection state and pairing flags, notified by the watch
pub const CONNECTIVITY_CHARACTERISTIC: Uuid = uuid::uuid!("00000001-328e-0fbb-c642-1aa6699bdada");

/// Written (or read) to kick off pairing
pub const PAIRING_TRIGGER_CHARACTERISTIC: Uuid =
    uuid::uuid!("00000002-328e-0fbb-c642-1aa6699bdada");

pub const MTU_CHARACTERISTIC: Uuid = uuid::uuid!("00000003-328e-0fbb-c642-1aa6699bdada");

pub const CONNECTION_PARAMETERS_CHARACTERISTIC: Uuid =
    uuid::uuid!("00000005-328e-0fbb-c642-1aa6699bdada");

/// PPoG service hosted by the watch (reversed mode)
pub const PPOG_CLIENT_SERVICE_UUID: Uuid = uuid::uuid!("30000003-328e-0fbb-c642-1aa6699bdada");

/// Watch-to-phone frames in reversed mode (notify)
pub const PPOG_CLIENT_READ_CHARACTERISTIC: Uuid =
    uuid::uuid!("30000004-328e-0fbb-c642-1aa6699bdada");

/// Phone-to-watch frames in reversed mode (write without response)
pub const PPOG_CLIENT_WRITE_CHARACTERISTIC: Uuid =
    uuid::uuid!("30000006-328e-0fbb-c642-1aa6699bdada");

/// PPoG service hosted by the phone (normal mode)
pub const PPOG_SERVER_SERVICE_UUID: Uuid = uuid::uuid!("10000000-328e-0fbb-c642-1aa6699bdada");

/// Data characteristic of the phone-hosted service; the watch writes, we notify
pub const PPOG_SERVER_DATA_CHARACTERISTIC: Uuid =
    uuid::uuid!("10000001-328e-0fbb-c642-1aa6699bdada");

/// Meta characteristic the watch reads before starting PPoG
pub const PPOG_SERVER_META_CHARACTERISTIC: Uuid =
    uuid::uuid!("10000002-328e-0fbb-c642-1aa6699bdada");

/// Answer to meta characteristic reads: min and max PPoG version, then flags
pub const SERVER_META_RESPONSE: [u8; 19] = [0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];

pub const PROPERTY_READ: u32 = 0x02;
pub const PROPERTY_WRITE_NO_RESPONSE: u32 = 0x04;
pub const PROPERTY_WRITE: u32 = 0x08;
pub const PROPERTY_NOTIFY: u32 = 0x10;

/// Failure of a single GATT operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("GATT connect failed: {0}")]
    ConnectFailed(String),

    /// Encryption/bond is missing for the attribute
    #[error("Insufficient authentication")]
    InsufficientAuthentication,

    #[error("Attribute not found: {0}")]
    NotFound(Uuid),

    #[error("GATT status {0}")]
    Status(u8),

    #[error("Device disconnected")]
    Disconnected,

    #[error("{0}")]
    Other(String),
}

impl From<GattError> for crate::ProtocolError {
    fn from(error: GattError) -> Self {
        crate::ProtocolError::Transport(error.to_string())
    }
}

/// How a characteristic write is acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattWriteType {
    WithResponse,
    NoResponse,
}

/// A discovered characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub properties: u32,
}

impl GattCharacteristic {
    pub fn is_writable(&self) -> bool {
        self.properties & PROPERTY_WRITE != 0
    }
}

/// A discovered service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

/// Find a characteristic in a discovered service list
pub fn find_characteristic<'a>(
    services: &'a [GattService],
    service: Uuid,
    characteristic: Uuid,
) -> Option<&'a GattCharacteristic> {
    services
        .iter()
        .find(|s| s.uuid == service)?
        .characteristics
        .iter()
        .find(|c| c.uuid == characteristic)
}

/// Central-role connection to one peripheral
#[async_trait]
pub trait GattClient: Send + Sync + Debug {
    async fn connect(&self) -> Result<(), GattError>;

    async fn discover_services(&self) -> Result<Vec<GattService>, GattError>;

    async fn read_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, GattError>;

    async fn write_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        write_type: GattWriteType,
    ) -> Result<(), GattError>;

    /// Enable notifications; each notified value arrives on the receiver
    async fn subscribe(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<mpsc::Receiver<Vec<u8>>, GattError>;

    /// Request an ATT MTU and return the one granted
    async fn request_mtu(&self, mtu: u16) -> Result<u16, GattError>;

    /// Current MTU, updated when the peer renegotiates
    fn mtu(&self) -> watch::Receiver<u16>;

    async fn is_bonded(&self) -> bool;

    /// Ask the platform to start bonding; completion is reported by [`bond_state`](Self::bond_state)
    async fn create_bond(&self) -> Result<(), GattError>;

    /// `true` once the platform reports the device as bonded
    fn bond_state(&self) -> watch::Receiver<bool>;

    async fn disconnect(&self);

    /// Resolves when the link drops for any reason
    async fn wait_disconnected(&self);
}

/// Peripheral-role server hosting the phone's PPoG service
#[async_trait]
pub trait GattServer: Send + Sync + Debug {
    /// Publish the PPoG service; meta reads must be answered with `meta_response`
    async fn add_services(&self, meta_response: &[u8]) -> Result<(), GattError>;

    /// Route writes from `identifier` to the data characteristic into `inbound`
    async fn register_device(
        &self,
        identifier: &str,
        inbound: mpsc::Sender<Vec<u8>>,
    ) -> Result<(), GattError>;

    async fn unregister_device(&self, identifier: &str);

    /// Notify `identifier` with `data` on a hosted characteristic
    async fn send_data(
        &self,
        identifier: &str,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), GattError>;
}

/// Platform Bluetooth backend
pub trait GattPlatform: Send + Sync + Debug {
    /// Client for the peripheral with this platform identifier
    fn client(&self, identifier: &str) -> Result<Arc<dyn GattClient>, GattError>;

    /// Shared GATT server, if the platform can host one
    fn server(&self) -> Option<Arc<dyn GattServer>>;

    /// Whether the radio is on
    fn bluetooth_enabled(&self) -> watch::Receiver<bool>;
}

/// Owns the phone's GATT server and publishes its services once
#[derive(Debug)]
pub struct GattServerManager {
    server: Arc<dyn GattServer>,
    services_added: OnceCell<()>,
    registered: Mutex<HashSet<String>>,
}

impl GattServerManager {
    pub fn new(server: Arc<dyn GattServer>) -> Self {
        Self {
            server,
            services_added: OnceCell::new(),
            registered: Mutex::new(HashSet::new()),
        }
    }

    pub async fn register_device(
        &self,
        identifier: &str,
        inbound: mpsc::Sender<Vec<u8>>,
    ) -> Result<(), GattError> {
        self.services_added
            .get_or_try_init(|| async {
                info!("Publishing PPoG GATT service");
                self.server.add_services(&SERVER_META_RESPONSE).await
            })
            .await?;

        self.server.register_device(identifier, inbound).await?;
        self.registered.lock().await.insert(identifier.to_string());
        debug!("Registered {} with GATT server", identifier);
        Ok(())
    }

    pub async fn unregister_device(&self, identifier: &str) {
        if self.registered.lock().await.remove(identifier) {
            self.server.unregister_device(identifier).await;
            debug!("Unregistered {} from GATT server", identifier);
        }
    }

    pub async fn send_data(&self, identifier: &str, data: &[u8]) -> Result<(), GattError> {
        self.server
            .send_data(
                identifier,
                PPOG_SERVER_SERVICE_UUID,
                PPOG_SERVER_DATA_CHARACTERISTIC,
                data,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_characteristic() {
        let services = vec![GattService {
            uuid: PAIRING_SERVICE_UUID,
            characteristics: vec![
                GattCharacteristic {
                    uuid: CONNECTIVITY_CHARACTERISTIC,
                    properties: PROPERTY_READ | PROPERTY_NOTIFY,
                },
                GattCharacteristic {
                    uuid: PAIRING_TRIGGER_CHARACTERISTIC,
                    properties: PROPERTY_READ | PROPERTY_WRITE,
                },
            ],
        }];

        let trigger =
            find_characteristic(&services, PAIRING_SERVICE_UUID, PAIRING_TRIGGER_CHARACTERISTIC)
                .unwrap();
        assert!(trigger.is_writable());

        let connectivity =
            find_characteristic(&services, PAIRING_SERVICE_UUID, CONNECTIVITY_CHARACTERISTIC)
                .unwrap();
        assert!(!connectivity.is_writable());

        assert!(find_characteristic(&services, PPOG_CLIENT_SERVICE_UUID, MTU_CHARACTERISTIC)
            .is_none());
    }

    #[test]
    fn test_uuid_case_insensitive() {
        assert_eq!(
            PPOG_CLIENT_WRITE_CHARACTERISTIC,
            Uuid::parse_str("30000006-328E-0FBB-C642-1AA6699BDADA").unwrap()
        );
    }
}
