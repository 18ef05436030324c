//! Transport Abstractions
//!
//! A [`Transport`] names a physical watch together with the medium used to
//! reach it. A [`TransportConnector`] turns that name into a reliable,
//! ordered Pebble Protocol byte stream ([`PebbleStreams`]).

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Capacity of the byte channels between a transport and the packet codec
pub const STREAM_CHANNEL_CAPACITY: usize = 100;

/// Identifies a watch and the medium used to reach it
///
/// Immutable; used as a key for known watches, active connections and
/// BlobDB sync rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transport {
    /// Bluetooth Low Energy peripheral (address or platform identifier)
    Ble { identifier: String },

    /// Bluetooth classic (serial) device
    BtClassic { address: String },

    /// Raw TCP socket (developer connection / emulator)
    Socket { address: SocketAddr },
}

impl Transport {
    /// Stable string form of the identifier, used as the watch identifier
    pub fn identifier(&self) -> String {
        match self {
            Transport::Ble { identifier } => identifier.clone(),
            Transport::BtClassic { address } => address.clone(),
            Transport::Socket { address } => address.to_string(),
        }
    }

    /// Medium of this transport
    pub fn transport_type(&self) -> TransportType {
        match self {
            Transport::Ble { .. } => TransportType::BluetoothLe,
            Transport::BtClassic { .. } => TransportType::BluetoothClassic,
            Transport::Socket { .. } => TransportType::Socket,
        }
    }

    /// Rebuild a transport from its persisted parts
    pub fn from_parts(transport_type: TransportType, identifier: &str) -> Result<Self> {
        Ok(match transport_type {
            TransportType::BluetoothLe => Transport::Ble {
                identifier: identifier.to_string(),
            },
            TransportType::BluetoothClassic => Transport::BtClassic {
                address: identifier.to_string(),
            },
            TransportType::Socket => Transport::Socket {
                address: identifier.parse().map_err(|e| {
                    crate::ProtocolError::Configuration(format!(
                        "invalid socket address '{}': {}",
                        identifier, e
                    ))
                })?,
            },
        })
    }

    /// Whether this transport goes over the Bluetooth radio
    pub fn is_bluetooth(&self) -> bool {
        !matches!(self, Transport::Socket { .. })
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Ble { identifier } => write!(f, "ble://{}", identifier),
            Transport::BtClassic { address } => write!(f, "bt://{}", address),
            Transport::Socket { address } => write!(f, "tcp://{}", address),
        }
    }
}

/// Transport medium
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    BluetoothLe,
    BluetoothClassic,
    Socket,
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportType::BluetoothLe => write!(f, "Bluetooth LE"),
            TransportType::BluetoothClassic => write!(f, "Bluetooth Classic"),
            TransportType::Socket => write!(f, "Socket"),
        }
    }
}

/// Why a connection attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionFailureReason {
    RegisterGattServer,
    GattConnect,
    ServiceDiscovery,
    MtuGattError,
    SubscribeConnectivity,
    ConnectionStatus,
    ReadPairingTrigger,
    CreateBondFailed,
    PairingTimedOut,
    GattInsufficientAuth,
    PpogInitTimeout,
    SocketConnect,
    NegotiationFailed,
    LinkDropped,
    UnsupportedTransport,
}

impl ConnectionFailureReason {
    /// Failures that will not go away by retrying on their own
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            ConnectionFailureReason::CreateBondFailed
                | ConnectionFailureReason::PairingTimedOut
                | ConnectionFailureReason::GattInsufficientAuth
                | ConnectionFailureReason::UnsupportedTransport
        )
    }
}

impl std::fmt::Display for ConnectionFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Reliable byte pipes produced by a successful transport connect
///
/// `outbound` accepts serialized Pebble packets; `inbound` yields received
/// bytes in order, with arbitrary chunking.
#[derive(Debug)]
pub struct PebbleStreams {
    pub outbound: mpsc::Sender<Vec<u8>>,
    pub inbound: mpsc::Receiver<Vec<u8>>,
}

/// One-shot "transport is gone" signal that can be awaited many times
#[derive(Debug, Clone)]
pub struct DisconnectSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for DisconnectSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl DisconnectSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Mark as disconnected; waiters are released
    pub fn signal(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_signalled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until [`signal`](Self::signal) has been called
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as self, so this only returns once signalled.
        let _ = rx.wait_for(|disconnected| *disconnected).await;
    }
}

/// Connects a single transport and exposes its byte streams
///
/// One connector instance serves one connection attempt.
#[async_trait]
pub trait TransportConnector: Send + Sync + Debug {
    /// Transport this connector reaches
    fn transport(&self) -> &Transport;

    /// Bring the transport up to a reliable byte stream
    async fn connect(&self) -> std::result::Result<PebbleStreams, ConnectionFailureReason>;

    /// Tear the transport down; idempotent
    async fn disconnect(&self);

    /// Resolves once the transport has gone away for any reason
    async fn wait_disconnected(&self);
}

/// Creates transport connectors
pub trait TransportConnectorFactory: Send + Sync + Debug {
    /// Create a connector for one connection attempt to `transport`
    fn create(&self, transport: &Transport) -> Result<Arc<dyn TransportConnector>>;
}
