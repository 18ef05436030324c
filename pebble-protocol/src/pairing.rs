//! Pairing and Bonding
//!
//! The watch reports its view of the link on the connectivity characteristic.
//! When either side is missing the bond, pairing is kicked off through the
//! pairing trigger characteristic and, where the platform needs it, an
//! explicit bond request. Protocol traffic only starts once the platform
//! reports the device bonded.

use crate::transport::gatt::{
    find_characteristic, GattClient, GattService, GattWriteType, PAIRING_SERVICE_UUID,
    PAIRING_TRIGGER_CHARACTERISTIC,
};
use crate::transport::ConnectionFailureReason;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Error reported by the watch for its last pairing attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingErrorCode {
    NoError,
    PasskeyEntryFailed,
    OobNotAvailable,
    AuthenticationRequirements,
    ConfirmValueFailed,
    PairingNotSupported,
    EncryptionKeySize,
    CommandNotSupported,
    UnspecifiedReason,
    RepeatedAttempts,
    InvalidParameters,
    DhKeyCheckFailed,
    NumericComparisonFailed,
    BrEdrPairingInProgress,
    CrossTransportKeyDerivationNotAllowed,
    Unknown(u8),
}

impl From<u8> for PairingErrorCode {
    fn from(value: u8) -> Self {
        match value {
            0 => PairingErrorCode::NoError,
            1 => PairingErrorCode::PasskeyEntryFailed,
            2 => PairingErrorCode::OobNotAvailable,
            3 => PairingErrorCode::AuthenticationRequirements,
            4 => PairingErrorCode::ConfirmValueFailed,
            5 => PairingErrorCode::PairingNotSupported,
            6 => PairingErrorCode::EncryptionKeySize,
            7 => PairingErrorCode::CommandNotSupported,
            8 => PairingErrorCode::UnspecifiedReason,
            9 => PairingErrorCode::RepeatedAttempts,
            10 => PairingErrorCode::InvalidParameters,
            11 => PairingErrorCode::DhKeyCheckFailed,
            12 => PairingErrorCode::NumericComparisonFailed,
            13 => PairingErrorCode::BrEdrPairingInProgress,
            14 => PairingErrorCode::CrossTransportKeyDerivationNotAllowed,
            other => PairingErrorCode::Unknown(other),
        }
    }
}

/// Decoded connectivity characteristic value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityStatus {
    pub connected: bool,
    pub paired: bool,
    pub encrypted: bool,
    pub has_bonded_gateway: bool,
    pub supports_pinning_without_security: bool,
    pub remote_attempted_stale_pairing: bool,
    pub pairing_error: PairingErrorCode,
}

impl ConnectivityStatus {
    /// Flags in byte 0, pairing error code in byte 3
    pub fn decode(value: &[u8]) -> Option<Self> {
        let flags = *value.first()?;
        let pairing_error = value
            .get(3)
            .copied()
            .map_or(PairingErrorCode::NoError, PairingErrorCode::from);
        Some(Self {
            connected: flags & 0b0000_0001 != 0,
            paired: flags & 0b0000_0010 != 0,
            encrypted: flags & 0b0000_0100 != 0,
            has_bonded_gateway: flags & 0b0000_1000 != 0,
            supports_pinning_without_security: flags & 0b0001_0000 != 0,
            remote_attempted_stale_pairing: flags & 0b0010_0000 != 0,
            pairing_error,
        })
    }
}

/// Value written to the pairing trigger characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingTrigger {
    pub pin_address: bool,
    /// The phone will request the bond itself; otherwise the watch sends a security request
    pub no_security_request: bool,
    pub auto_accept_future_pairing: bool,
    pub watch_as_gatt_server: bool,
}

impl PairingTrigger {
    pub fn encode(&self) -> u8 {
        let mut value = 0u8;
        if self.pin_address {
            value |= 1 << 0;
        }
        if self.no_security_request {
            value |= 1 << 1;
        } else {
            value |= 1 << 2;
        }
        if self.auto_accept_future_pairing {
            value |= 1 << 3;
        }
        if self.watch_as_gatt_server {
            value |= 1 << 4;
        }
        value
    }
}

/// Platform pairing behaviour
#[derive(Debug, Clone)]
pub struct PairingOptions {
    pub pin_address: bool,
    pub phone_requires_pairing: bool,
    /// Watch hosts PPoG (reversed mode)
    pub watch_as_gatt_server: bool,
    pub bond_timeout: Duration,
}

/// Whether a pairing round is needed before PPoG
///
/// Only skipped when both the watch and the phone agree they are bonded.
pub fn needs_pairing(status: &ConnectivityStatus, phone_bonded: bool) -> bool {
    match (status.paired, phone_bonded) {
        (true, true) => {
            debug!("Already paired");
            false
        }
        (true, false) => {
            debug!("Watch thinks it is paired, phone does not");
            true
        }
        (false, true) => {
            debug!("Phone thinks it is paired, watch does not");
            true
        }
        (false, false) => true,
    }
}

/// Run one pairing round and wait for the platform to report the bond
pub async fn request_pairing(
    client: &dyn GattClient,
    services: &[GattService],
    status: &ConnectivityStatus,
    options: &PairingOptions,
) -> Result<(), ConnectionFailureReason> {
    info!("Requesting pairing");
    let trigger =
        find_characteristic(services, PAIRING_SERVICE_UUID, PAIRING_TRIGGER_CHARACTERISTIC)
            .ok_or_else(|| {
                error!("Pairing trigger characteristic not found");
                ConnectionFailureReason::ServiceDiscovery
            })?;

    // Subscribe before triggering so a fast bond isn't missed
    let mut bond_state = client.bond_state();

    let mut needs_explicit_bond = true;
    if trigger.is_writable() {
        needs_explicit_bond = if options.pin_address {
            status.supports_pinning_without_security && options.phone_requires_pairing
        } else {
            options.phone_requires_pairing
        };
        let value = PairingTrigger {
            pin_address: options.pin_address,
            no_security_request: needs_explicit_bond,
            auto_accept_future_pairing: false,
            watch_as_gatt_server: options.watch_as_gatt_server,
        };
        debug!("Writing pairing trigger {:?}", value);
        if let Err(e) = client
            .write_characteristic(
                PAIRING_SERVICE_UUID,
                PAIRING_TRIGGER_CHARACTERISTIC,
                &[value.encode()],
                GattWriteType::WithResponse,
            )
            .await
        {
            // Some firmwares reject the write but pair anyway
            warn!("Failed to write pairing trigger: {}", e);
        }
    } else if let Err(e) = client
        .read_characteristic(PAIRING_SERVICE_UUID, PAIRING_TRIGGER_CHARACTERISTIC)
        .await
    {
        error!("Failed to read pairing trigger: {}", e);
        return Err(ConnectionFailureReason::ReadPairingTrigger);
    }

    if needs_explicit_bond {
        debug!("Explicit bond required");
        if let Err(e) = client.create_bond().await {
            error!("Failed to request bond: {}", e);
            return Err(ConnectionFailureReason::CreateBondFailed);
        }
    }

    debug!("Waiting for bond state");
    let result = match timeout(options.bond_timeout, bond_state.wait_for(|bonded| *bonded)).await {
        Ok(Ok(_)) => {
            info!("Bonded");
            Ok(())
        }
        Ok(Err(_)) => Err(ConnectionFailureReason::CreateBondFailed),
        Err(_) => {
            error!("Failed to bond in time");
            Err(ConnectionFailureReason::PairingTimedOut)
        }
    };
    result
}
