//! Pebble Protocol Packet
//!
//! Every higher protocol (system messages, BlobDB, PutBytes, AppMessage) is
//! a sub-format of the payload of an endpoint-tagged packet.
//!
//! ## Packet Structure
//!
//! ```text
//! +----------------+----------------+------------------+
//! | length: u16 BE | endpoint: u16 BE | payload (length) |
//! +----------------+----------------+------------------+
//! ```
//!
//! `length` counts payload bytes only. Packets travel over a byte stream with
//! arbitrary chunking, so the receiving side reassembles them with
//! [`PacketReassembler`].

use crate::{ProtocolError, Result};
use tracing::warn;

/// Size of the length + endpoint header
pub const PACKET_HEADER_SIZE: usize = 4;

/// Largest payload the 16-bit length field can describe
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Endpoint identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint(pub u16);

impl Endpoint {
    pub const TIME: Endpoint = Endpoint(11);
    pub const VERSION: Endpoint = Endpoint(16);
    pub const PHONE_VERSION: Endpoint = Endpoint(17);
    pub const SYSTEM_MESSAGE: Endpoint = Endpoint(18);
    pub const MUSIC_CONTROL: Endpoint = Endpoint(32);
    pub const PHONE_CONTROL: Endpoint = Endpoint(33);
    pub const APP_MESSAGE: Endpoint = Endpoint(48);
    pub const APP_LAUNCHER: Endpoint = Endpoint(49);
    pub const APP_RUN_STATE: Endpoint = Endpoint(52);
    pub const HEALTH_SYNC: Endpoint = Endpoint(911);
    pub const LOGS: Endpoint = Endpoint(2000);
    pub const PING: Endpoint = Endpoint(2001);
    pub const LOG_DUMP: Endpoint = Endpoint(2002);
    pub const RESET: Endpoint = Endpoint(2003);
    pub const APP_LOGS: Endpoint = Endpoint(2006);
    pub const APP_FETCH: Endpoint = Endpoint(6001);
    pub const DATA_LOG: Endpoint = Endpoint(6778);
    pub const SCREENSHOT: Endpoint = Endpoint(8000);
    pub const GET_BYTES: Endpoint = Endpoint(9000);
    pub const VOICE_CONTROL: Endpoint = Endpoint(11000);
    pub const TIMELINE_ACTIONS: Endpoint = Endpoint(11440);
    pub const APP_REORDER: Endpoint = Endpoint(0xABCD);
    pub const BLOB_DB: Endpoint = Endpoint(0xB1DB);
    pub const BLOB_DB_V2: Endpoint = Endpoint(0xB2DB);
    pub const PUT_BYTES: Endpoint = Endpoint(0xBEEF);

    fn name(&self) -> Option<&'static str> {
        Some(match *self {
            Endpoint::TIME => "Time",
            Endpoint::VERSION => "Version",
            Endpoint::PHONE_VERSION => "PhoneVersion",
            Endpoint::SYSTEM_MESSAGE => "SystemMessage",
            Endpoint::MUSIC_CONTROL => "MusicControl",
            Endpoint::PHONE_CONTROL => "PhoneControl",
            Endpoint::APP_MESSAGE => "AppMessage",
            Endpoint::APP_LAUNCHER => "AppLauncher",
            Endpoint::APP_RUN_STATE => "AppRunState",
            Endpoint::HEALTH_SYNC => "HealthSync",
            Endpoint::LOGS => "Logs",
            Endpoint::PING => "Ping",
            Endpoint::LOG_DUMP => "LogDump",
            Endpoint::RESET => "Reset",
            Endpoint::APP_LOGS => "AppLogs",
            Endpoint::APP_FETCH => "AppFetch",
            Endpoint::DATA_LOG => "DataLog",
            Endpoint::SCREENSHOT => "Screenshot",
            Endpoint::GET_BYTES => "GetBytes",
            Endpoint::VOICE_CONTROL => "VoiceControl",
            Endpoint::TIMELINE_ACTIONS => "TimelineActions",
            Endpoint::APP_REORDER => "AppReorder",
            Endpoint::BLOB_DB => "BlobDB",
            Endpoint::BLOB_DB_V2 => "BlobDB2",
            Endpoint::PUT_BYTES => "PutBytes",
            _ => return None,
        })
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}({})", name, self.0),
            None => write!(f, "Unknown({})", self.0),
        }
    }
}

/// An endpoint-tagged Pebble Protocol packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PebblePacket {
    pub endpoint: Endpoint,
    pub payload: Vec<u8>,
}

impl PebblePacket {
    pub fn new(endpoint: Endpoint, payload: Vec<u8>) -> Self {
        Self { endpoint, payload }
    }

    /// Serialize with the length/endpoint header
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PacketSizeExceeded(
                self.payload.len(),
                MAX_PAYLOAD_SIZE,
            ));
        }
        let mut out = Vec::with_capacity(PACKET_HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.endpoint.0.to_be_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Parse exactly one packet from `bytes`
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PACKET_HEADER_SIZE {
            return Err(ProtocolError::InvalidPacket(format!(
                "packet shorter than header: {} bytes",
                bytes.len()
            )));
        }
        let length = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        let endpoint = Endpoint(u16::from_be_bytes([bytes[2], bytes[3]]));
        let payload = &bytes[PACKET_HEADER_SIZE..];
        if payload.len() != length {
            return Err(ProtocolError::InvalidPacket(format!(
                "length field {} but {} payload bytes",
                length,
                payload.len()
            )));
        }
        Ok(Self {
            endpoint,
            payload: payload.to_vec(),
        })
    }
}

/// Reassembles whole packets from an arbitrarily chunked byte stream
#[derive(Debug, Default)]
pub struct PacketReassembler {
    buffer: Vec<u8>,
}

impl PacketReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed received bytes and return every packet completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<PebblePacket> {
        self.buffer.extend_from_slice(bytes);
        let mut packets = Vec::new();

        while self.buffer.len() >= PACKET_HEADER_SIZE {
            let length = u16::from_be_bytes([self.buffer[0], self.buffer[1]]) as usize;
            let total = PACKET_HEADER_SIZE + length;
            if self.buffer.len() < total {
                break;
            }
            let raw: Vec<u8> = self.buffer.drain(..total).collect();
            match PebblePacket::from_bytes(&raw) {
                Ok(packet) => packets.push(packet),
                Err(e) => warn!("Dropping undecodable packet: {}", e),
            }
        }
        packets
    }

    /// Bytes held waiting for the rest of a packet
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Cursor over a payload with bounds-checked reads
pub(crate) struct ByteReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.offset.checked_add(len).filter(|end| *end <= self.bytes.len());
        match end {
            Some(end) => {
                let slice = &self.bytes[self.offset..end];
                self.offset = end;
                Ok(slice)
            }
            None => Err(ProtocolError::InvalidPacket(format!(
                "needed {} bytes at offset {}, only {} available",
                len,
                self.offset,
                self.bytes.len() - self.offset
            ))),
        }
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16_be(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn u16_le(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32_be(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn u64_be(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    /// Fixed-width, NUL-padded string field
    pub(crate) fn fixed_str(&mut self, len: usize) -> Result<String> {
        let raw = self.take(len)?;
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    pub(crate) fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }
}
