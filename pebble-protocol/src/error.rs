//! Error handling for the Pebble protocol stack
//!
//! This module provides a single error type for all protocol operations.
//! Errors are converted from underlying library errors using `thiserror`.
//!
//! ## Error Handling Patterns
//!
//! ```rust
//! use pebble_protocol::{ProtocolError, Result};
//!
//! fn parse_window(byte: u8) -> Result<u8> {
//!     if byte == 0 {
//!         return Err(ProtocolError::InvalidPacket("window size of zero".to_string()));
//!     }
//!     Ok(byte)
//! }
//! ```
//!
//! ## Error Categories
//!
//! ### Transport failures
//! Connect timeouts, GATT errors, socket resets. Always fatal to the current
//! connection attempt; the watch manager decides whether to reconnect.
//!
//! ### Protocol decode errors
//! Malformed packets, unexpected tokens, cookie mismatches. The offending
//! exchange fails but the link stays up.
//!
//! ### BlobDB and PutBytes failures
//! Non-success responses and response timeouts. Recoverable: BlobDB rows stay
//! pending and PutBytes sessions abort and surface a typed failure.

use crate::services::blobdb::BlobStatus;
use crate::transport::ConnectionFailureReason;
use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur during protocol operations
///
/// # Examples
///
/// ```rust
/// use pebble_protocol::ProtocolError;
///
/// let error = ProtocolError::NotPaired;
/// assert_eq!(error.to_string(), "Not paired");
///
/// let error = ProtocolError::InvalidPacket("short header".to_string());
/// assert_eq!(error.to_string(), "Invalid packet: short header");
/// ```
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O error (sockets, persisted state files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file could not be parsed
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Transport primitive failure (GATT operation, socket write)
    #[error("Transport error: {0}")]
    Transport(String),

    /// A connection attempt ended without a usable session
    #[error("Connection failed: {0}")]
    ConnectionFailed(ConnectionFailureReason),

    /// The reliable link gave up (retransmissions exhausted, malformed frames, reset)
    #[error("Link failure: {0}")]
    LinkFailure(String),

    /// Watch and phone are not bonded
    #[error("Not paired")]
    NotPaired,

    /// Pairing or bonding did not complete
    #[error("Pairing failed: {0}")]
    PairingFailed(String),

    /// Invalid or malformed packet
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// A response carried a token nobody was waiting for
    #[error("Unexpected token: {0:#06x}")]
    UnexpectedToken(u16),

    /// BlobDB command answered with a non-success status
    #[error("BlobDB command failed: {0}")]
    BlobDb(BlobStatus),

    /// PutBytes request was NACKed by the watch
    #[error("PutBytes NACK (cookie {cookie:#010x})")]
    PutBytesNack { cookie: u32 },

    /// PutBytes response did not carry the session cookie
    #[error("PutBytes cookie mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CookieMismatch { expected: u32, actual: u32 },

    /// Transferred bytes do not match the expected checksum
    #[error("CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch { expected: u32, actual: u32 },

    /// Another PutBytes session already holds the transfer lock
    #[error("PutBytes session already active")]
    SessionBusy,

    /// Operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Operation cancelled, usually because the connection went away
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Operation attempted in an invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration is invalid
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Packet exceeds the maximum encodable size
    #[error("Packet size exceeded: {0} bytes (max: {1})")]
    PacketSizeExceeded(usize, usize),
}

impl ProtocolError {
    /// Convert an I/O error into a more specific variant where possible
    ///
    /// ```rust
    /// use pebble_protocol::ProtocolError;
    /// use std::io::{Error, ErrorKind};
    ///
    /// let error = ProtocolError::from_io_error(
    ///     Error::new(ErrorKind::TimedOut, "no answer"),
    ///     "connecting to emulator",
    /// );
    /// assert!(matches!(error, ProtocolError::Timeout(_)));
    /// ```
    pub fn from_io_error(error: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(format!("{}: {}", context, error)),
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => {
                ProtocolError::Transport(format!("{}: {}", context, error))
            }
            _ => ProtocolError::Io(error),
        }
    }

    /// Check if this error is transient and the operation may be retried
    ///
    /// ```rust
    /// use pebble_protocol::ProtocolError;
    ///
    /// assert!(ProtocolError::Timeout("blobdb".to_string()).is_recoverable());
    /// assert!(!ProtocolError::NotPaired.is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        match self {
            ProtocolError::Timeout(_)
            | ProtocolError::Transport(_)
            | ProtocolError::LinkFailure(_)
            | ProtocolError::Io(_)
            | ProtocolError::Cancelled(_)
            | ProtocolError::UnexpectedToken(_)
            | ProtocolError::SessionBusy => true,
            ProtocolError::BlobDb(status) => status.is_retryable(),
            ProtocolError::ConnectionFailed(reason) => !reason.requires_user_action(),
            _ => false,
        }
    }

    /// Check if this error cannot be resolved without the user
    pub fn requires_user_action(&self) -> bool {
        match self {
            ProtocolError::NotPaired
            | ProtocolError::PairingFailed(_)
            | ProtocolError::Configuration(_)
            | ProtocolError::Toml(_) => true,
            ProtocolError::ConnectionFailed(reason) => reason.requires_user_action(),
            _ => false,
        }
    }

    /// Get a message suitable for display in a UI
    pub fn user_message(&self) -> String {
        match self {
            ProtocolError::NotPaired => {
                "Watch not paired. Pair the watch from the phone settings first.".to_string()
            }
            ProtocolError::PairingFailed(msg) => {
                format!("Pairing failed: {}. Forget the watch and pair again.", msg)
            }
            ProtocolError::Timeout(msg) => {
                format!("Timeout: {}. The watch may be out of range.", msg)
            }
            ProtocolError::ConnectionFailed(reason) => {
                format!("Could not connect to the watch ({}).", reason)
            }
            ProtocolError::LinkFailure(msg) => {
                format!("Connection to the watch was lost: {}.", msg)
            }
            ProtocolError::SessionBusy => {
                "Another transfer is in progress. Try again when it finishes.".to_string()
            }
            ProtocolError::PutBytesNack { .. }
            | ProtocolError::CookieMismatch { .. }
            | ProtocolError::CrcMismatch { .. } => {
                "The watch rejected the transfer.".to_string()
            }
            ProtocolError::Configuration(msg) => {
                format!("Configuration error: {}. Check your settings.", msg)
            }
            other => other.to_string(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        ProtocolError::InvalidState(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        ProtocolError::Transport(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ProtocolError::NotPaired;
        assert_eq!(error.to_string(), "Not paired");

        let error = ProtocolError::UnexpectedToken(0x12);
        assert_eq!(error.to_string(), "Unexpected token: 0x0012");

        let error = ProtocolError::PutBytesNack { cookie: 0xdead };
        assert_eq!(error.to_string(), "PutBytes NACK (cookie 0x0000dead)");

        let error = ProtocolError::BlobDb(BlobStatus::TryLater);
        assert_eq!(error.to_string(), "BlobDB command failed: TryLater");
    }

    #[test]
    fn test_io_error_conversion() {
        use std::io::{Error, ErrorKind};

        let protocol_error: ProtocolError = Error::new(ErrorKind::NotFound, "missing").into();
        assert!(matches!(protocol_error, ProtocolError::Io(_)));

        let reset = ProtocolError::from_io_error(
            Error::new(ErrorKind::ConnectionReset, "reset"),
            "reading socket",
        );
        assert!(matches!(reset, ProtocolError::Transport(_)));
        assert!(reset.is_recoverable());
    }

    #[test]
    fn test_classification() {
        assert!(ProtocolError::BlobDb(BlobStatus::TryLater).is_recoverable());
        assert!(!ProtocolError::BlobDb(BlobStatus::InvalidDatabaseId).is_recoverable());
        assert!(ProtocolError::ConnectionFailed(ConnectionFailureReason::PairingTimedOut)
            .requires_user_action());
        assert!(ProtocolError::ConnectionFailed(ConnectionFailureReason::GattConnect)
            .is_recoverable());
        assert!(!ProtocolError::InvalidPacket("x".into()).is_recoverable());
    }
}
