//! Diagnostics and Debug Logging
//!
//! Command-line interface, logging setup and the one-shot diagnostic
//! commands of the Pebble daemon.

use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pebble_protocol::config::NegotiationConfig;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// Pebble daemon command-line interface
#[derive(Parser, Debug)]
#[command(name = "pebble-daemon")]
#[command(about = "Companion daemon for Pebble smartwatches", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Set log level (error, warn, info, debug, trace); defaults to the config file
    #[arg(short, long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Enable JSON structured logging
    #[arg(long)]
    pub json_logs: bool,

    /// Hide timestamps in logs
    #[arg(long)]
    pub no_timestamps: bool,

    /// Use this configuration file instead of the default
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Diagnostic subcommand
    #[command(subcommand)]
    pub command: Option<DiagnosticCommand>,
}

/// Diagnostic commands for troubleshooting
#[derive(Subcommand, Debug)]
pub enum DiagnosticCommand {
    /// Show daemon version and build information
    Version {
        /// Show detailed build information
        #[arg(long)]
        verbose: bool,
    },

    /// List all known watches
    ListWatches {
        /// Show detailed watch information
        #[arg(long)]
        verbose: bool,
    },

    /// Show BlobDB rows still waiting to reach each watch
    SyncStatus,

    /// Show current configuration
    DumpConfig,

    /// Connect to a configured socket watch and push a file with PutBytes
    PushFile {
        /// Watch name or address from the configuration
        watch: String,

        /// Local file to send
        file: PathBuf,

        /// Storage bank on the watch
        #[arg(short, long, default_value = "0")]
        bank: u8,

        /// Filename on the watch (defaults to the local file name)
        #[arg(short, long)]
        name: Option<String>,
    },
}

/// Initialize logging from the command line, falling back to the config file
pub fn init_logging(cli: &Cli, config: &LoggingConfig) -> Result<()> {
    let requested = cli.log_level.as_deref().unwrap_or(&config.level);
    let log_level = requested.parse::<Level>().with_context(|| {
        format!(
            "Invalid log level '{}'. Valid levels: error, warn, info, debug, trace",
            requested
        )
    })?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level.as_str()))
        .context("Failed to create log filter")?;

    let json = cli.json_logs || config.json;
    let timestamps = !cli.no_timestamps && config.timestamps;

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(true)
        .with_line_number(true);

    match (json, timestamps) {
        (true, true) => subscriber.json().init(),
        (true, false) => subscriber.without_time().json().init(),
        (false, true) => subscriber.init(),
        (false, false) => subscriber.without_time().init(),
    }

    info!(
        "Logging initialized: level={}, json={}, timestamps={}",
        log_level, json, timestamps
    );

    Ok(())
}

/// Build information for diagnostics
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: Option<&'static str>,
}

impl BuildInfo {
    pub fn get() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            git_hash: option_env!("GIT_HASH"),
        }
    }

    pub fn display(&self, verbose: bool, negotiation: &NegotiationConfig) {
        println!("Pebble Daemon v{}", self.version);

        if verbose {
            if let Some(hash) = self.git_hash {
                println!("Git commit: {}", hash);
            }
            println!(
                "Reported app version: {}.{}.{}",
                negotiation.app_version_major,
                negotiation.app_version_minor,
                negotiation.app_version_bugfix
            );
            println!("Platform: {}", std::env::consts::OS);
            println!("Architecture: {}", std::env::consts::ARCH);
        }
    }
}

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit_index = 0;

    while value >= 1024.0 && unit_index < UNITS.len() - 1 {
        value /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit_index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }

    #[test]
    fn test_cli_parses_push_file() {
        let cli = Cli::parse_from([
            "pebble-daemon",
            "push-file",
            "emulator",
            "/tmp/data.bin",
            "--bank",
            "2",
        ]);
        match cli.command {
            Some(DiagnosticCommand::PushFile {
                watch, bank, name, ..
            }) => {
                assert_eq!(watch, "emulator");
                assert_eq!(bank, 2);
                assert!(name.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["pebble-daemon"]);
        assert!(cli.log_level.is_none());
        assert!(!cli.json_logs);
        assert!(!cli.no_timestamps);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_build_info() {
        assert!(!BuildInfo::get().version.is_empty());
    }
}
