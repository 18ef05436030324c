//! Pebble Packet over GATT
//!
//! Windowed reliable delivery over a pair of BLE characteristics.

mod link;
mod packet;

pub use link::{LinkState, PpogFrameSender, PpogLink, PpogLinkConfig, PpogParams, PpogRole};
pub use packet::{
    next_sequence, sequence_distance, PpogPacket, PpogVersion, DATA_HEADER_OVERHEAD,
    MAX_SUPPORTED_WINDOW_SIZE, SEQUENCE_MODULO, V0_WINDOW_SIZE,
};
