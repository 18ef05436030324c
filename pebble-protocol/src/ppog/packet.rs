//! PPoG frame codec
//!
//! One header byte: the 5-bit sequence number in the top bits, the 3-bit
//! frame type in the bottom bits, followed by a type-specific body.

use crate::{ProtocolError, Result};

/// Sequence numbers wrap modulo this value
pub const SEQUENCE_MODULO: u8 = 32;

/// Largest window either side may negotiate
pub const MAX_SUPPORTED_WINDOW_SIZE: u8 = 25;

/// Window implied by a version 0 peer
pub const V0_WINDOW_SIZE: u8 = 4;

/// Bytes of each GATT write not available to frame payload
pub const DATA_HEADER_OVERHEAD: usize = 4;

const SEQUENCE_MASK: u8 = 0b1111_1000;
const TYPE_MASK: u8 = 0b0000_0111;

const TYPE_DATA: u8 = 0b000;
const TYPE_ACK: u8 = 0b001;
const TYPE_RESET_REQUEST: u8 = 0b010;
const TYPE_RESET_COMPLETE: u8 = 0b011;

/// PPoG protocol revision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PpogVersion {
    Zero,
    One,
}

impl PpogVersion {
    pub fn as_u8(self) -> u8 {
        match self {
            PpogVersion::Zero => 0,
            PpogVersion::One => 1,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PpogVersion::Zero),
            1 => Some(PpogVersion::One),
            _ => None,
        }
    }

    /// `ResetComplete` carries window sizes
    pub fn supports_window_negotiation(self) -> bool {
        matches!(self, PpogVersion::One)
    }
}

/// A single PPoG frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PpogPacket {
    Data { sequence: u8, data: Vec<u8> },
    Ack { sequence: u8 },
    ResetRequest { sequence: u8, version: PpogVersion },
    ResetComplete { sequence: u8, rx_window: u8, tx_window: u8 },
}

impl PpogPacket {
    pub fn sequence(&self) -> u8 {
        match self {
            PpogPacket::Data { sequence, .. }
            | PpogPacket::Ack { sequence }
            | PpogPacket::ResetRequest { sequence, .. }
            | PpogPacket::ResetComplete { sequence, .. } => *sequence,
        }
    }

    fn type_bits(&self) -> u8 {
        match self {
            PpogPacket::Data { .. } => TYPE_DATA,
            PpogPacket::Ack { .. } => TYPE_ACK,
            PpogPacket::ResetRequest { .. } => TYPE_RESET_REQUEST,
            PpogPacket::ResetComplete { .. } => TYPE_RESET_COMPLETE,
        }
    }

    /// Serialize for the wire; `version` decides whether windows are sent
    pub fn encode(&self, version: PpogVersion) -> Vec<u8> {
        let header = ((self.sequence() << 3) & SEQUENCE_MASK) | self.type_bits();
        let mut out = vec![header];
        match self {
            PpogPacket::Data { data, .. } => out.extend_from_slice(data),
            PpogPacket::Ack { .. } => {}
            PpogPacket::ResetRequest { version, .. } => out.push(version.as_u8()),
            PpogPacket::ResetComplete {
                rx_window,
                tx_window,
                ..
            } => {
                if version.supports_window_negotiation() {
                    out.push(*rx_window);
                    out.push(*tx_window);
                }
            }
        }
        out
    }

    /// Parse a frame received from the wire
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = *bytes
            .first()
            .ok_or_else(|| ProtocolError::InvalidPacket("empty PPoG frame".to_string()))?;
        let sequence = (header & SEQUENCE_MASK) >> 3;
        let body = &bytes[1..];

        match header & TYPE_MASK {
            TYPE_DATA => Ok(PpogPacket::Data {
                sequence,
                data: body.to_vec(),
            }),
            TYPE_ACK => Ok(PpogPacket::Ack { sequence }),
            TYPE_RESET_REQUEST => {
                let raw = *body.first().ok_or_else(|| {
                    ProtocolError::InvalidPacket("ResetRequest without version".to_string())
                })?;
                let version = PpogVersion::from_u8(raw).ok_or_else(|| {
                    ProtocolError::InvalidPacket(format!("unknown PPoG version {}", raw))
                })?;
                Ok(PpogPacket::ResetRequest { sequence, version })
            }
            TYPE_RESET_COMPLETE => {
                let (rx_window, tx_window) = match body {
                    [rx, tx, ..] => (*rx, *tx),
                    _ => (V0_WINDOW_SIZE, V0_WINDOW_SIZE),
                };
                Ok(PpogPacket::ResetComplete {
                    sequence,
                    rx_window,
                    tx_window,
                })
            }
            other => Err(ProtocolError::InvalidPacket(format!(
                "unknown PPoG frame type {}",
                other
            ))),
        }
    }
}

/// Distance from `from` forward to `to` in sequence space
pub fn sequence_distance(from: u8, to: u8) -> u8 {
    (to + SEQUENCE_MODULO - from) % SEQUENCE_MODULO
}

/// Next sequence number after `sequence`
pub fn next_sequence(sequence: u8) -> u8 {
    (sequence + 1) % SEQUENCE_MODULO
}
