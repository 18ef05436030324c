//! Protocol Configuration
//!
//! Tunables for every layer of the stack, loadable from TOML. Every field has
//! a default so a partial file (or no file at all) is valid.

use crate::ppog::{PpogLinkConfig, MAX_SUPPORTED_WINDOW_SIZE};
use crate::services::system::ProtocolCapability;
use crate::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Configuration for the whole protocol stack
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProtocolConfig {
    #[serde(default)]
    pub ble: BleConfig,

    #[serde(default)]
    pub ppog: PpogConfig,

    #[serde(default)]
    pub negotiation: NegotiationConfig,

    #[serde(default)]
    pub blobdb: BlobDbConfig,

    #[serde(default)]
    pub putbytes: PutBytesConfig,

    #[serde(default)]
    pub watch_manager: WatchManagerConfig,
}

/// BLE connection setup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BleConfig {
    /// Phone acts as GATT client to the watch's PPoG service and may start the reset
    #[serde(default = "default_false")]
    pub reversed_ppog: bool,

    #[serde(default = "default_initial_mtu")]
    pub initial_mtu: u16,

    #[serde(default = "default_target_mtu")]
    pub target_mtu: u16,

    #[serde(default = "default_window")]
    pub desired_rx_window: u8,

    #[serde(default = "default_window")]
    pub desired_tx_window: u8,

    /// Ask the watch to remember this phone's address
    #[serde(default = "default_true")]
    pub pin_address: bool,

    /// Phone platform needs an explicit bond request
    #[serde(default = "default_true")]
    pub phone_requires_pairing: bool,

    #[serde(default = "default_pairing_timeout")]
    pub pairing_timeout_secs: u64,

    #[serde(default = "default_connectivity_timeout")]
    pub connectivity_timeout_secs: u64,
}

/// PPoG link timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PpogConfig {
    #[serde(default = "default_reset_wait")]
    pub reset_wait_secs: u64,

    #[serde(default = "default_reversed_reset_wait")]
    pub reversed_reset_wait_secs: u64,

    #[serde(default = "default_retransmit_timeout")]
    pub retransmit_timeout_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_max_malformed")]
    pub max_malformed_frames: u32,
}

/// What the phone advertises during negotiation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NegotiationConfig {
    #[serde(default = "default_negotiation_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_app_major")]
    pub app_version_major: u8,

    #[serde(default = "default_app_minor")]
    pub app_version_minor: u8,

    #[serde(default = "default_app_bugfix")]
    pub app_version_bugfix: u8,

    #[serde(default)]
    pub platform_flags: u32,

    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<ProtocolCapability>,
}

/// BlobDB sync engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlobDbConfig {
    #[serde(default = "default_blobdb_timeout")]
    pub response_timeout_ms: u64,

    /// Consecutive failures before a row is parked until its next change
    #[serde(default = "default_blobdb_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_blobdb_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_blobdb_max_backoff")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_resync_interval")]
    pub resync_interval_secs: u64,
}

/// PutBytes transfers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PutBytesConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_putbytes_timeout")]
    pub response_timeout_secs: u64,
}

/// Watch manager policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchManagerConfig {
    /// Allow more than one watch connected at a time
    #[serde(default = "default_false")]
    pub multiple_watches: bool,

    #[serde(default = "default_disconnect_timeout")]
    pub disconnect_timeout_secs: u64,

    #[serde(default = "default_initial_reconnect_delay")]
    pub initial_reconnect_delay_secs: u64,

    #[serde(default = "default_max_reconnect_delay")]
    pub max_reconnect_delay_secs: u64,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// How long a Bluetooth sighting keeps backoff retries going
    #[serde(default = "default_scan_result_ttl")]
    pub scan_result_ttl_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

fn default_initial_mtu() -> u16 {
    23
}

fn default_target_mtu() -> u16 {
    339
}

fn default_window() -> u8 {
    MAX_SUPPORTED_WINDOW_SIZE
}

fn default_pairing_timeout() -> u64 {
    60
}

fn default_connectivity_timeout() -> u64 {
    10
}

fn default_reset_wait() -> u64 {
    12
}

fn default_reversed_reset_wait() -> u64 {
    5
}

fn default_retransmit_timeout() -> u64 {
    800
}

fn default_max_retries() -> u32 {
    2
}

fn default_max_malformed() -> u32 {
    5
}

fn default_negotiation_timeout() -> u64 {
    20
}

fn default_app_major() -> u8 {
    4
}

fn default_app_minor() -> u8 {
    4
}

fn default_app_bugfix() -> u8 {
    2
}

fn default_capabilities() -> Vec<ProtocolCapability> {
    vec![
        ProtocolCapability::AppRunState,
        ProtocolCapability::ExtendedMusic,
        ProtocolCapability::ExtendedNotifications,
        ProtocolCapability::AppMessage8k,
    ]
}

fn default_blobdb_timeout() -> u64 {
    5000
}

fn default_blobdb_attempts() -> u32 {
    5
}

fn default_blobdb_initial_backoff() -> u64 {
    1000
}

fn default_blobdb_max_backoff() -> u64 {
    60_000
}

fn default_resync_interval() -> u64 {
    60
}

fn default_chunk_size() -> usize {
    2000
}

fn default_putbytes_timeout() -> u64 {
    20
}

fn default_disconnect_timeout() -> u64 {
    3
}

fn default_initial_reconnect_delay() -> u64 {
    2
}

fn default_max_reconnect_delay() -> u64 {
    60
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_scan_result_ttl() -> u64 {
    30
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            reversed_ppog: false,
            initial_mtu: default_initial_mtu(),
            target_mtu: default_target_mtu(),
            desired_rx_window: default_window(),
            desired_tx_window: default_window(),
            pin_address: true,
            phone_requires_pairing: true,
            pairing_timeout_secs: default_pairing_timeout(),
            connectivity_timeout_secs: default_connectivity_timeout(),
        }
    }
}

impl Default for PpogConfig {
    fn default() -> Self {
        Self {
            reset_wait_secs: default_reset_wait(),
            reversed_reset_wait_secs: default_reversed_reset_wait(),
            retransmit_timeout_ms: default_retransmit_timeout(),
            max_retries: default_max_retries(),
            max_malformed_frames: default_max_malformed(),
        }
    }
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_negotiation_timeout(),
            app_version_major: default_app_major(),
            app_version_minor: default_app_minor(),
            app_version_bugfix: default_app_bugfix(),
            platform_flags: 0,
            capabilities: default_capabilities(),
        }
    }
}

impl Default for BlobDbConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: default_blobdb_timeout(),
            max_attempts: default_blobdb_attempts(),
            initial_backoff_ms: default_blobdb_initial_backoff(),
            max_backoff_ms: default_blobdb_max_backoff(),
            resync_interval_secs: default_resync_interval(),
        }
    }
}

impl Default for PutBytesConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            response_timeout_secs: default_putbytes_timeout(),
        }
    }
}

impl Default for WatchManagerConfig {
    fn default() -> Self {
        Self {
            multiple_watches: false,
            disconnect_timeout_secs: default_disconnect_timeout(),
            initial_reconnect_delay_secs: default_initial_reconnect_delay(),
            max_reconnect_delay_secs: default_max_reconnect_delay(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            scan_result_ttl_secs: default_scan_result_ttl(),
        }
    }
}

impl ProtocolConfig {
    /// `<config_dir>/pebble/protocol.toml`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("pebble")
            .join("protocol.toml")
    }

    /// Load from `path`; a missing file yields the defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ProtocolError::from_io_error(e, &format!("reading {}", path.display())))?;
        let config: ProtocolConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::Configuration(format!("serializing config: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Reject values the protocol cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.putbytes.chunk_size == 0 {
            return Err(ProtocolError::Configuration(
                "putbytes.chunk_size must be positive".to_string(),
            ));
        }
        if self.ble.desired_rx_window == 0 || self.ble.desired_tx_window == 0 {
            return Err(ProtocolError::Configuration(
                "PPoG windows must be at least 1".to_string(),
            ));
        }
        if (self.ble.initial_mtu as usize) <= crate::ppog::DATA_HEADER_OVERHEAD {
            return Err(ProtocolError::Configuration(format!(
                "ble.initial_mtu {} leaves no room for data",
                self.ble.initial_mtu
            )));
        }
        Ok(())
    }

    /// Settings for a PPoG link
    pub fn ppog_link_config(&self) -> PpogLinkConfig {
        PpogLinkConfig {
            reset_wait: Duration::from_secs(self.ppog.reset_wait_secs),
            initiator_reset_wait: Duration::from_secs(self.ppog.reversed_reset_wait_secs),
            fallback_to_initiator: self.ble.reversed_ppog,
            retransmit_timeout: Duration::from_millis(self.ppog.retransmit_timeout_ms),
            max_retries: self.ppog.max_retries,
            max_malformed_frames: self.ppog.max_malformed_frames,
            desired_rx_window: self.ble.desired_rx_window,
            desired_tx_window: self.ble.desired_tx_window,
            initial_mtu: self.ble.initial_mtu as usize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: ProtocolConfig = toml::from_str(
            r#"
            [ble]
            reversed_ppog = true

            [blobdb]
            max_attempts = 9
            "#,
        )
        .unwrap();

        assert!(config.ble.reversed_ppog);
        assert_eq!(config.ble.target_mtu, 339);
        assert_eq!(config.blobdb.max_attempts, 9);
        assert_eq!(config.blobdb.response_timeout_ms, 5000);
        assert_eq!(config.putbytes.chunk_size, 2000);
        assert!(!config.watch_manager.multiple_watches);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("protocol.toml");

        let mut config = ProtocolConfig::default();
        config.watch_manager.multiple_watches = true;
        config.save(&path).unwrap();

        assert_eq!(ProtocolConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = TempDir::new().unwrap();
        let config = ProtocolConfig::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, ProtocolConfig::default());
    }

    #[test]
    fn test_validation() {
        let mut config = ProtocolConfig::default();
        config.putbytes.chunk_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ProtocolError::Configuration(_))
        ));
    }

    #[test]
    fn test_ppog_link_config() {
        let mut config = ProtocolConfig::default();
        config.ble.reversed_ppog = true;
        let link = config.ppog_link_config();
        assert!(link.fallback_to_initiator);
        assert_eq!(link.initial_mtu, 23);
        assert_eq!(link.retransmit_timeout, Duration::from_millis(800));
    }
}
