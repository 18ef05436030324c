//! Pebble Transport Layer
//!
//! Every transport ends in the same place: a reliable, ordered byte stream
//! carrying Pebble Protocol packets. BLE gets there through PPoG; sockets
//! pass bytes straight through.

mod r#trait;
pub mod ble;
pub mod gatt;
pub mod socket;

pub use ble::BleTransportConnector;
pub use gatt::{GattClient, GattError, GattPlatform, GattServer, GattServerManager};
pub use r#trait::{
    ConnectionFailureReason, DisconnectSignal, PebbleStreams, Transport, TransportConnector,
    TransportConnectorFactory, TransportType, STREAM_CHANNEL_CAPACITY,
};
pub use socket::SocketTransportConnector;

use crate::config::ProtocolConfig;
use crate::{ProtocolError, Result};
use std::sync::Arc;
use tracing::warn;

/// Creates the connector matching each [`Transport`] variant
#[derive(Debug, Clone)]
pub struct DefaultTransportConnectorFactory {
    config: ProtocolConfig,
    platform: Option<Arc<dyn GattPlatform>>,
    server: Option<Arc<GattServerManager>>,
}

impl DefaultTransportConnectorFactory {
    /// Factory without Bluetooth; only socket transports can connect
    pub fn socket_only(config: ProtocolConfig) -> Self {
        Self {
            config,
            platform: None,
            server: None,
        }
    }

    /// Factory backed by a platform Bluetooth stack
    pub fn with_bluetooth(config: ProtocolConfig, platform: Arc<dyn GattPlatform>) -> Self {
        let server = platform
            .server()
            .map(|server| Arc::new(GattServerManager::new(server)));
        Self {
            config,
            platform: Some(platform),
            server,
        }
    }
}

impl TransportConnectorFactory for DefaultTransportConnectorFactory {
    fn create(&self, transport: &Transport) -> Result<Arc<dyn TransportConnector>> {
        match transport {
            Transport::Socket { address } => Ok(Arc::new(SocketTransportConnector::new(*address))),
            Transport::Ble { identifier } => match &self.platform {
                Some(platform) => Ok(Arc::new(BleTransportConnector::new(
                    identifier.clone(),
                    self.config.clone(),
                    platform.clone(),
                    self.server.clone(),
                ))),
                None => {
                    warn!("No Bluetooth backend for {}", transport);
                    Err(ProtocolError::ConnectionFailed(
                        ConnectionFailureReason::UnsupportedTransport,
                    ))
                }
            },
            Transport::BtClassic { .. } => Err(ProtocolError::ConnectionFailed(
                ConnectionFailureReason::UnsupportedTransport,
            )),
        }
    }
}
