//! Daemon Configuration
//!
//! Configuration management for the Pebble daemon.

use anyhow::{Context, Result};
use pebble_protocol::{ProtocolConfig, Transport};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Protocol stack settings
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Logging defaults (overridden by the command line)
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Socket-connected watches (emulators, developer connections)
    #[serde(default)]
    pub watches: Vec<SocketWatchConfig>,

    /// Storage paths
    #[serde(default)]
    pub paths: PathConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of plain text
    #[serde(default = "default_false")]
    pub json: bool,

    #[serde(default = "default_true")]
    pub timestamps: bool,
}

/// A watch reachable over TCP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketWatchConfig {
    /// Display name
    pub name: String,

    /// `host:port` of the emulator or developer connection
    pub address: SocketAddr,

    /// Connect as soon as the daemon starts
    #[serde(default = "default_true")]
    pub auto_connect: bool,
}

impl SocketWatchConfig {
    pub fn transport(&self) -> Transport {
        Transport::Socket {
            address: self.address,
        }
    }
}

/// Storage paths configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    /// Configuration directory
    pub config_dir: PathBuf,

    /// Data directory (known watches, BlobDB sync state)
    pub data_dir: PathBuf,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            timestamps: true,
        }
    }
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from(".local/share"))
                .join("pebble"),
        }
    }
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join("pebble")
}

impl Config {
    /// `<config_dir>/pebble/daemon.toml`
    pub fn default_path() -> PathBuf {
        default_config_dir().join("daemon.toml")
    }

    /// Load configuration from the default location, creating it if not found
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load configuration from `path`, creating a default file if not found
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config
                .protocol
                .validate()
                .context("Invalid protocol configuration")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.config_dir).context("Failed to create config directory")?;
        fs::create_dir_all(&self.paths.data_dir).context("Failed to create data directory")?;
        Ok(())
    }

    pub fn known_watches_path(&self) -> PathBuf {
        self.paths.data_dir.join("known_watches.json")
    }

    pub fn blobdb_path(&self) -> PathBuf {
        self.paths.data_dir.join("blobdb_sync.json")
    }

    /// Look up a configured watch by name or address
    pub fn find_watch(&self, name_or_address: &str) -> Option<&SocketWatchConfig> {
        self.watches.iter().find(|watch| {
            watch.name == name_or_address || watch.address.to_string() == name_or_address
        })
    }
}
