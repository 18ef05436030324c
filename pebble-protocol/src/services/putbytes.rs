//! PutBytes Wire Protocol
//!
//! Chunked binary transfer to the watch. Every request is answered with a
//! response carrying an ACK/NACK byte and the session cookie.
//!
//! ```text
//! Init:     0x01 | size u32 | object_type u8 | bank u8 | filename\0
//! AppInit:  0x01 | size u32 | object_type|0x80 u8 | app_id u32
//! Put:      0x02 | cookie u32 | len u32 | data
//! Commit:   0x03 | cookie u32 | crc u32
//! Abort:    0x04 | cookie u32
//! Install:  0x05 | cookie u32
//! Response: result u8 | cookie u32
//! ```
//!
//! All integers are big-endian.

use crate::packet::{ByteReader, Endpoint, PebblePacket};
use crate::protocol_handler::{PacketSender, ProtocolHandler};
use crate::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, trace};

const COMMAND_INIT: u8 = 0x01;
const COMMAND_PUT: u8 = 0x02;
const COMMAND_COMMIT: u8 = 0x03;
const COMMAND_ABORT: u8 = 0x04;
const COMMAND_INSTALL: u8 = 0x05;

const RESULT_ACK: u8 = 0x01;
const RESULT_NACK: u8 = 0x02;

/// Marks an Init as addressed by app id instead of bank and filename
const APP_INIT_FLAG: u8 = 0x80;

/// Kind of object being transferred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectType {
    Firmware,
    Recovery,
    SystemResources,
    AppResources,
    AppExecutable,
    File,
    Worker,
}

impl ObjectType {
    pub fn code(self) -> u8 {
        match self {
            ObjectType::Firmware => 1,
            ObjectType::Recovery => 2,
            ObjectType::SystemResources => 3,
            ObjectType::AppResources => 4,
            ObjectType::AppExecutable => 5,
            ObjectType::File => 6,
            ObjectType::Worker => 7,
        }
    }
}

/// Request sent to the PutBytes endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutBytesRequest {
    Init {
        size: u32,
        object_type: ObjectType,
        bank: u8,
        filename: String,
    },
    AppInit {
        size: u32,
        object_type: ObjectType,
        app_id: u32,
    },
    Put {
        cookie: u32,
        data: Vec<u8>,
    },
    Commit {
        cookie: u32,
        crc: u32,
    },
    Abort {
        cookie: u32,
    },
    Install {
        cookie: u32,
    },
}

impl PutBytesRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            PutBytesRequest::Init {
                size,
                object_type,
                bank,
                filename,
            } => {
                out.push(COMMAND_INIT);
                out.extend_from_slice(&size.to_be_bytes());
                out.push(object_type.code());
                out.push(*bank);
                out.extend_from_slice(filename.as_bytes());
                out.push(0);
            }
            PutBytesRequest::AppInit {
                size,
                object_type,
                app_id,
            } => {
                out.push(COMMAND_INIT);
                out.extend_from_slice(&size.to_be_bytes());
                out.push(object_type.code() | APP_INIT_FLAG);
                out.extend_from_slice(&app_id.to_be_bytes());
            }
            PutBytesRequest::Put { cookie, data } => {
                out.push(COMMAND_PUT);
                out.extend_from_slice(&cookie.to_be_bytes());
                out.extend_from_slice(&(data.len() as u32).to_be_bytes());
                out.extend_from_slice(data);
            }
            PutBytesRequest::Commit { cookie, crc } => {
                out.push(COMMAND_COMMIT);
                out.extend_from_slice(&cookie.to_be_bytes());
                out.extend_from_slice(&crc.to_be_bytes());
            }
            PutBytesRequest::Abort { cookie } => {
                out.push(COMMAND_ABORT);
                out.extend_from_slice(&cookie.to_be_bytes());
            }
            PutBytesRequest::Install { cookie } => {
                out.push(COMMAND_INSTALL);
                out.extend_from_slice(&cookie.to_be_bytes());
            }
        }
        out
    }

    fn name(&self) -> &'static str {
        match self {
            PutBytesRequest::Init { .. } | PutBytesRequest::AppInit { .. } => "Init",
            PutBytesRequest::Put { .. } => "Put",
            PutBytesRequest::Commit { .. } => "Commit",
            PutBytesRequest::Abort { .. } => "Abort",
            PutBytesRequest::Install { .. } => "Install",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutBytesResult {
    Ack,
    Nack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutBytesResponse {
    pub result: PutBytesResult,
    pub cookie: u32,
}

impl PutBytesResponse {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(payload);
        let result = match reader.u8()? {
            RESULT_ACK => PutBytesResult::Ack,
            RESULT_NACK => PutBytesResult::Nack,
            other => {
                return Err(ProtocolError::InvalidPacket(format!(
                    "unknown PutBytes result {:#04x}",
                    other
                )))
            }
        };
        let cookie = reader.u32_be()?;
        Ok(Self { result, cookie })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![match self.result {
            PutBytesResult::Ack => RESULT_ACK,
            PutBytesResult::Nack => RESULT_NACK,
        }];
        out.extend_from_slice(&self.cookie.to_be_bytes());
        out
    }
}

/// Request/response access to the PutBytes endpoint
#[derive(Debug)]
pub struct PutBytesService {
    sender: PacketSender,
    responses: Mutex<mpsc::UnboundedReceiver<PebblePacket>>,
}

impl PutBytesService {
    pub fn new(handler: &ProtocolHandler) -> Self {
        Self {
            sender: handler.sender(),
            responses: Mutex::new(handler.register(Endpoint::PUT_BYTES)),
        }
    }

    pub fn identifier(&self) -> &str {
        self.sender.identifier()
    }

    pub(crate) fn sender(&self) -> PacketSender {
        self.sender.clone()
    }

    /// Send a request and wait for its response; a NACK is an error
    pub async fn send_and_wait(
        &self,
        request: PutBytesRequest,
        wait: Duration,
    ) -> Result<PutBytesResponse> {
        let mut responses = self.responses.lock().await;
        // Stale responses from an earlier, abandoned exchange
        while responses.try_recv().is_ok() {}

        trace!("{}: PutBytes {}", self.sender.identifier(), request.name());
        self.sender
            .send(PebblePacket::new(Endpoint::PUT_BYTES, request.encode()))
            .await?;

        let packet = match timeout(wait, responses.recv()).await {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                return Err(ProtocolError::Cancelled(
                    "connection closed".to_string(),
                ))
            }
            Err(_) => {
                return Err(ProtocolError::Timeout(format!(
                    "PutBytes {} response",
                    request.name()
                )))
            }
        };
        let response = PutBytesResponse::decode(&packet.payload)?;
        match response.result {
            PutBytesResult::Ack => Ok(response),
            PutBytesResult::Nack => {
                debug!(
                    "{}: PutBytes {} NACKed",
                    self.sender.identifier(),
                    request.name()
                );
                Err(ProtocolError::PutBytesNack {
                    cookie: response.cookie,
                })
            }
        }
    }

    /// Send a request without waiting for an answer
    pub async fn send(&self, request: PutBytesRequest) -> Result<()> {
        self.sender
            .send(PebblePacket::new(Endpoint::PUT_BYTES, request.encode()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_layouts() {
        let init = PutBytesRequest::Init {
            size: 0x0102,
            object_type: ObjectType::File,
            bank: 3,
            filename: "lang".to_string(),
        };
        assert_eq!(
            init.encode(),
            vec![0x01, 0, 0, 1, 2, 6, 3, b'l', b'a', b'n', b'g', 0]
        );

        let app_init = PutBytesRequest::AppInit {
            size: 10,
            object_type: ObjectType::AppExecutable,
            app_id: 7,
        };
        assert_eq!(app_init.encode(), vec![0x01, 0, 0, 0, 10, 0x85, 0, 0, 0, 7]);
    }

    #[test]
    fn test_put_and_commit_layouts() {
        let put = PutBytesRequest::Put {
            cookie: 0xAABBCCDD,
            data: vec![9, 8],
        };
        assert_eq!(
            put.encode(),
            vec![0x02, 0xAA, 0xBB, 0xCC, 0xDD, 0, 0, 0, 2, 9, 8]
        );

        let commit = PutBytesRequest::Commit {
            cookie: 1,
            crc: 0x11223344,
        };
        assert_eq!(commit.encode(), vec![0x03, 0, 0, 0, 1, 0x11, 0x22, 0x33, 0x44]);
        assert_eq!(
            PutBytesRequest::Install { cookie: 2 }.encode(),
            vec![0x05, 0, 0, 0, 2]
        );
    }

    #[test]
    fn test_response_decode() {
        let response = PutBytesResponse::decode(&[0x01, 0, 0, 0x10, 0x01]).unwrap();
        assert_eq!(response.result, PutBytesResult::Ack);
        assert_eq!(response.cookie, 0x1001);

        assert!(PutBytesResponse::decode(&[0x07, 0, 0, 0, 0]).is_err());
        assert!(PutBytesResponse::decode(&[0x01, 0]).is_err());
    }
}
