//! Pebble Protocol Implementation
//!
//! This library implements the companion side of the Pebble watch protocol
//! stack: the PPoG reliable link over BLE GATT, the endpoint-tagged packet
//! codec, connection negotiation, the watch manager, BlobDB synchronization
//! and PutBytes transfers.

pub mod blobdb_sync;
pub mod config;
pub mod connector;
pub mod crc32;
pub mod negotiation;
pub mod packet;
pub mod pairing;
pub mod ppog;
pub mod protocol_handler;
pub mod putbytes_session;
pub mod recovery;
pub mod services;
pub mod storage;
pub mod transport;
pub mod watch_manager;

mod error;

pub use blobdb_sync::{
    BlobDbItem, BlobDbStore, BlobDbSync, BlobSyncStatus, JsonBlobDbStore, MemoryBlobDbStore,
};
pub use config::ProtocolConfig;
pub use connector::{
    ConnectedMode, ConnectedPebble, ConnectingPebbleState, ConnectionStage, PebbleConnector,
    PebbleConnectorFactory, PebbleSession, RealPebbleConnector, RealPebbleConnectorFactory,
};
pub use crc32::{stm32_crc32, Stm32Crc32};
pub use error::{ProtocolError, Result};
pub use negotiation::Negotiator;
pub use packet::{Endpoint, PacketReassembler, PebblePacket};
pub use ppog::{PpogLink, PpogLinkConfig, PpogRole};
pub use protocol_handler::{PacketSender, ProtocolHandler};
pub use putbytes_session::{PutBytesProgress, PutBytesSession, PutBytesTarget, PutBytesTransfer};
pub use recovery::{ReconnectionStrategy, RetryPlan};
pub use services::{BlobDatabase, BlobStatus, ObjectType, ProtocolCapability, WatchInfo};
pub use transport::{
    ConnectionFailureReason, DefaultTransportConnectorFactory, PebbleStreams, Transport,
    TransportConnector, TransportConnectorFactory, TransportType,
};
pub use watch_manager::{
    JsonKnownWatchStore, KnownWatch, KnownWatchStore, MemoryKnownWatchStore, ScanResult,
    WatchEvent, WatchManager, WatchStage, WatchView,
};
