//! BlobDB Wire Protocol
//!
//! ## Command
//!
//! ```text
//! command: u8 | token: u16 LE | database: u8 | key_len: u8 | key | value_len: u16 LE | value
//! ```
//!
//! `Delete` stops after the key and `Clear` after the database id.
//!
//! ## Response
//!
//! ```text
//! token: u16 LE | status: u8
//! ```
//!
//! Responses are matched to commands by token only; a response nobody is
//! waiting for is logged and dropped.

use crate::packet::{ByteReader, Endpoint, PebblePacket};
use crate::protocol_handler::{PacketSender, ProtocolHandler};
use crate::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

const COMMAND_INSERT: u8 = 0x01;
const COMMAND_DELETE: u8 = 0x04;
const COMMAND_CLEAR: u8 = 0x05;

/// Watch-resident database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BlobDatabase {
    Test,
    Pin,
    App,
    Reminder,
    Notification,
    Weather,
    NotificationApps,
    Settings,
    Contacts,
    AppConfigs,
    Health,
    AppGlance,
}

impl BlobDatabase {
    pub fn id(self) -> u8 {
        match self {
            BlobDatabase::Test => 0,
            BlobDatabase::Pin => 1,
            BlobDatabase::App => 2,
            BlobDatabase::Reminder => 3,
            BlobDatabase::Notification => 4,
            BlobDatabase::Weather => 5,
            BlobDatabase::NotificationApps => 6,
            BlobDatabase::Settings => 7,
            BlobDatabase::Contacts => 8,
            BlobDatabase::AppConfigs => 9,
            BlobDatabase::Health => 10,
            BlobDatabase::AppGlance => 11,
        }
    }
}

impl std::fmt::Display for BlobDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Result code of a BlobDB command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobStatus {
    Success,
    GeneralFailure,
    InvalidOperation,
    InvalidDatabaseId,
    InvalidData,
    KeyDoesNotExist,
    DatabaseFull,
    DataStale,
    NotSupported,
    Locked,
    TryLater,
    Unknown(u8),
}

impl BlobStatus {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x01 => BlobStatus::Success,
            0x02 => BlobStatus::GeneralFailure,
            0x03 => BlobStatus::InvalidOperation,
            0x04 => BlobStatus::InvalidDatabaseId,
            0x05 => BlobStatus::InvalidData,
            0x06 => BlobStatus::KeyDoesNotExist,
            0x07 => BlobStatus::DatabaseFull,
            0x08 => BlobStatus::DataStale,
            0x09 => BlobStatus::NotSupported,
            0x0A => BlobStatus::Locked,
            0x0B => BlobStatus::TryLater,
            other => BlobStatus::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            BlobStatus::Success => 0x01,
            BlobStatus::GeneralFailure => 0x02,
            BlobStatus::InvalidOperation => 0x03,
            BlobStatus::InvalidDatabaseId => 0x04,
            BlobStatus::InvalidData => 0x05,
            BlobStatus::KeyDoesNotExist => 0x06,
            BlobStatus::DatabaseFull => 0x07,
            BlobStatus::DataStale => 0x08,
            BlobStatus::NotSupported => 0x09,
            BlobStatus::Locked => 0x0A,
            BlobStatus::TryLater => 0x0B,
            BlobStatus::Unknown(code) => code,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, BlobStatus::Success)
    }

    /// Another attempt may succeed without the row changing
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            BlobStatus::GeneralFailure
                | BlobStatus::DatabaseFull
                | BlobStatus::DataStale
                | BlobStatus::Locked
                | BlobStatus::TryLater
        )
    }
}

impl std::fmt::Display for BlobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlobStatus::Unknown(code) => write!(f, "Unknown({:#04x})", code),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Operation carried by a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobOperation {
    Insert { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    Clear,
}

/// A BlobDB command ready for the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobCommand {
    pub token: u16,
    pub database: BlobDatabase,
    pub operation: BlobOperation,
}

impl BlobCommand {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let command = match self.operation {
            BlobOperation::Insert { .. } => COMMAND_INSERT,
            BlobOperation::Delete { .. } => COMMAND_DELETE,
            BlobOperation::Clear => COMMAND_CLEAR,
        };
        out.push(command);
        out.extend_from_slice(&self.token.to_le_bytes());
        out.push(self.database.id());

        match &self.operation {
            BlobOperation::Insert { key, value } => {
                push_key(&mut out, key)?;
                let len = u16::try_from(value.len()).map_err(|_| {
                    ProtocolError::PacketSizeExceeded(value.len(), u16::MAX as usize)
                })?;
                out.extend_from_slice(&len.to_le_bytes());
                out.extend_from_slice(value);
            }
            BlobOperation::Delete { key } => push_key(&mut out, key)?,
            BlobOperation::Clear => {}
        }
        Ok(out)
    }
}

fn push_key(out: &mut Vec<u8>, key: &[u8]) -> Result<()> {
    let len = u8::try_from(key.len())
        .map_err(|_| ProtocolError::PacketSizeExceeded(key.len(), u8::MAX as usize))?;
    out.push(len);
    out.extend_from_slice(key);
    Ok(())
}

/// Response to a [`BlobCommand`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobResponse {
    pub token: u16,
    pub status: BlobStatus,
}

impl BlobResponse {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(payload);
        let token = reader.u16_le()?;
        let status = BlobStatus::from_u8(reader.u8()?);
        Ok(Self { token, status })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.token.to_le_bytes().to_vec();
        out.push(self.status.as_u8());
        out
    }
}

/// Random 16-bit correlation token
pub fn generate_token() -> u16 {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    u16::from_le_bytes([bytes[0], bytes[1]])
}

type PendingResponses = Arc<Mutex<HashMap<u16, oneshot::Sender<BlobResponse>>>>;

/// Sends BlobDB commands and matches responses by token
#[derive(Debug)]
pub struct BlobDbService {
    sender: PacketSender,
    pending: PendingResponses,
    task: JoinHandle<()>,
}

impl BlobDbService {
    pub fn new(handler: &ProtocolHandler) -> Self {
        let mut responses = handler.register(Endpoint::BLOB_DB);
        let pending: PendingResponses = Arc::new(Mutex::new(HashMap::new()));
        let identifier = handler.sender().identifier().to_string();

        let task = {
            let pending = pending.clone();
            tokio::spawn(async move {
                while let Some(packet) = responses.recv().await {
                    let response = match BlobResponse::decode(&packet.payload) {
                        Ok(response) => response,
                        Err(e) => {
                            warn!("{}: bad BlobDB response: {}", identifier, e);
                            continue;
                        }
                    };
                    let waiter = pending
                        .lock()
                        .ok()
                        .and_then(|mut pending| pending.remove(&response.token));
                    match waiter {
                        Some(waiter) => {
                            let _ = waiter.send(response);
                        }
                        None => warn!(
                            "{}: {}",
                            identifier,
                            ProtocolError::UnexpectedToken(response.token)
                        ),
                    }
                }
            })
        };

        Self {
            sender: handler.sender(),
            pending,
            task,
        }
    }

    /// Send `command` and wait for the response carrying its token
    pub async fn send(&self, command: BlobCommand, wait: Duration) -> Result<BlobResponse> {
        let token = command.token;
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(token, tx);
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            token,
        };

        debug!(
            "{}: BlobDB {:?} on {} (token {:#06x})",
            self.sender.identifier(),
            std::mem::discriminant(&command.operation),
            command.database,
            token
        );
        self.sender
            .send(PebblePacket::new(Endpoint::BLOB_DB, command.encode()?))
            .await?;

        match timeout(wait, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ProtocolError::Cancelled(
                "BlobDB service stopped".to_string(),
            )),
            Err(_) => Err(ProtocolError::Timeout(format!(
                "BlobDB response for token {:#06x}",
                token
            ))),
        }
    }
}

/// Removes a waiter whose request timed out or was cancelled
struct PendingGuard<'a> {
    pending: &'a PendingResponses,
    token: u16,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.token);
        }
    }
}

impl Drop for BlobDbService {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{PebbleStreams, STREAM_CHANNEL_CAPACITY};
    use tokio::sync::mpsc;

    #[test]
    fn test_insert_layout() {
        let command = BlobCommand {
            token: 0x1234,
            database: BlobDatabase::Notification,
            operation: BlobOperation::Insert {
                key: vec![0xAA, 0xBB],
                value: vec![1, 2, 3],
            },
        };
        assert_eq!(
            command.encode().unwrap(),
            vec![0x01, 0x34, 0x12, 4, 2, 0xAA, 0xBB, 3, 0, 1, 2, 3]
        );
    }

    #[test]
    fn test_delete_and_clear_layout() {
        let delete = BlobCommand {
            token: 1,
            database: BlobDatabase::Pin,
            operation: BlobOperation::Delete { key: vec![7] },
        };
        assert_eq!(delete.encode().unwrap(), vec![0x04, 1, 0, 1, 1, 7]);

        let clear = BlobCommand {
            token: 2,
            database: BlobDatabase::App,
            operation: BlobOperation::Clear,
        };
        assert_eq!(clear.encode().unwrap(), vec![0x05, 2, 0, 2]);
    }

    #[test]
    fn test_oversized_key_rejected() {
        let command = BlobCommand {
            token: 0,
            database: BlobDatabase::Test,
            operation: BlobOperation::Delete { key: vec![0; 256] },
        };
        assert!(command.encode().is_err());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(BlobStatus::from_u8(1), BlobStatus::Success);
        assert_eq!(BlobStatus::from_u8(0x0B), BlobStatus::TryLater);
        assert_eq!(BlobStatus::from_u8(0x42), BlobStatus::Unknown(0x42));
        assert!(BlobStatus::Locked.is_retryable());
        assert!(!BlobStatus::InvalidData.is_retryable());
        assert_eq!(BlobStatus::TryLater.to_string(), "TryLater");
    }

    #[test]
    fn test_response_layout() {
        // Token echo first, status byte last
        let response = BlobResponse::decode(&[0x34, 0x12, 0x0B]).unwrap();
        assert_eq!(response.token, 0x1234);
        assert_eq!(response.status, BlobStatus::TryLater);
        assert!(BlobResponse::decode(&[0x34, 0x12]).is_err());

        let encoded = BlobResponse {
            token: 0xBEEF,
            status: BlobStatus::InvalidDatabaseId,
        }
        .encode();
        assert_eq!(encoded, vec![0xEF, 0xBE, 0x04]);
    }

    #[test]
    fn test_status_byte_round_trip() {
        for code in 0..=0x0Cu8 {
            assert_eq!(BlobStatus::from_u8(code).as_u8(), code);
        }
    }

    #[tokio::test]
    async fn test_response_matched_by_token() {
        let (out_tx, mut out_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let mut handler = ProtocolHandler::new(
            "test",
            PebbleStreams {
                outbound: out_tx,
                inbound: in_rx,
            },
        );
        let service = BlobDbService::new(&handler);
        handler.start();

        let watch = tokio::spawn(async move {
            let bytes = out_rx.recv().await.unwrap();
            let packet = PebblePacket::from_bytes(&bytes).unwrap();
            let token = u16::from_le_bytes([packet.payload[1], packet.payload[2]]);
            // A stray response first, then the real one
            for (token, status) in [(token.wrapping_add(1), 0x01), (token, 0x0B)] {
                let response = BlobResponse {
                    token,
                    status: BlobStatus::from_u8(status),
                }
                .encode();
                in_tx
                    .send(PebblePacket::new(Endpoint::BLOB_DB, response).to_bytes().unwrap())
                    .await
                    .unwrap();
            }
            in_tx
        });

        let response = service
            .send(
                BlobCommand {
                    token: 0xBEEF,
                    database: BlobDatabase::Pin,
                    operation: BlobOperation::Clear,
                },
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(response.token, 0xBEEF);
        assert_eq!(response.status, BlobStatus::TryLater);
        let _in_tx = watch.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_timeout() {
        let (out_tx, _out_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let (_in_tx, in_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let mut handler = ProtocolHandler::new(
            "test",
            PebbleStreams {
                outbound: out_tx,
                inbound: in_rx,
            },
        );
        let service = BlobDbService::new(&handler);
        handler.start();

        let result = service
            .send(
                BlobCommand {
                    token: 7,
                    database: BlobDatabase::Pin,
                    operation: BlobOperation::Clear,
                },
                Duration::from_secs(5),
            )
            .await;
        assert!(matches!(result, Err(ProtocolError::Timeout(_))));
        assert!(service.pending.lock().unwrap().is_empty());
    }
}
