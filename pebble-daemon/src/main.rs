mod config;
mod diagnostics;

use anyhow::{bail, Context, Result};
use clap::Parser;
use config::Config;
use diagnostics::{BuildInfo, Cli, DiagnosticCommand};
use pebble_protocol::blobdb_sync::BlobDbStore;
use pebble_protocol::transport::SocketTransportConnector;
use pebble_protocol::{
    BlobDbSync, ConnectingPebbleState, DefaultTransportConnectorFactory, JsonBlobDbStore,
    JsonKnownWatchStore, KnownWatchStore, ObjectType, PebbleConnector, RealPebbleConnector,
    RealPebbleConnectorFactory, ScanResult, WatchEvent, WatchManager,
};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Pebble daemon state
struct Daemon {
    config: Config,
    manager: Arc<WatchManager>,
    sync: Arc<BlobDbSync>,
    tasks: Vec<JoinHandle<()>>,
}

impl Daemon {
    async fn new(config: Config) -> Result<Self> {
        config.ensure_directories()?;

        let transports = Arc::new(DefaultTransportConnectorFactory::socket_only(
            config.protocol.clone(),
        ));
        let connectors = Arc::new(RealPebbleConnectorFactory::new(
            transports,
            config.protocol.clone(),
        ));
        let known_watches = Arc::new(JsonKnownWatchStore::new(config.known_watches_path()));
        let manager = Arc::new(WatchManager::new(
            config.protocol.watch_manager.clone(),
            connectors,
            known_watches,
        ));

        let blobdb_store = Arc::new(JsonBlobDbStore::new(config.blobdb_path()));
        let sync = Arc::new(
            BlobDbSync::new(config.protocol.blobdb.clone(), blobdb_store)
                .await
                .context("Failed to load BlobDB sync state")?,
        );

        Ok(Self {
            config,
            manager,
            sync,
            tasks: Vec::new(),
        })
    }

    /// Start the watch manager and hand it the configured socket watches
    async fn start(&mut self) -> Result<()> {
        self.tasks.push(self.sync.follow(self.manager.subscribe()));
        self.tasks.push(spawn_event_logger(self.manager.subscribe()));

        self.manager
            .start()
            .await
            .context("Failed to start watch manager")?;

        // Socket watches are never scanned, so report each one as sighted
        for watch in &self.config.watches {
            let transport = watch.transport();
            self.manager
                .add_scan_result(ScanResult {
                    transport: transport.clone(),
                    name: watch.name.clone(),
                    rssi: None,
                })
                .await;
            if watch.auto_connect {
                if let Err(e) = self.manager.request_connection(&transport).await {
                    warn!("Cannot request connection to {}: {}", watch.name, e);
                }
            }
        }

        info!(
            "Watch manager started with {} configured watches",
            self.config.watches.len()
        );
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        info!("Daemon initialized successfully");
        info!("Press Ctrl+C to stop");

        tokio::signal::ctrl_c().await?;

        info!("Received shutdown signal");
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down daemon...");
        self.manager.shutdown().await;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("Daemon stopped");
        Ok(())
    }
}

/// Log watch manager events as they happen
fn spawn_event_logger(mut events: broadcast::Receiver<WatchEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(WatchEvent::Discovered { transport, name }) => {
                    info!("Discovered {} ({})", name, transport);
                }
                Ok(WatchEvent::StateChanged { transport, state }) => {
                    info!("{}: {}", transport, state);
                }
                Ok(WatchEvent::SessionStarted {
                    transport,
                    pebble,
                    first_connection,
                }) => {
                    info!(
                        "{}: session started with {} running {}{}",
                        transport,
                        pebble.watch_info.serial,
                        pebble.watch_info.running,
                        if first_connection {
                            " (first connection)"
                        } else {
                            ""
                        }
                    );
                }
                Ok(WatchEvent::ConnectionFailed { transport, reason }) => {
                    warn!("{}: connection failed: {}", transport, reason);
                }
                Ok(WatchEvent::Forgotten { transport }) => {
                    info!("{}: forgotten", transport);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Event logger missed {} events", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Handle diagnostic commands
async fn handle_diagnostic_command(command: &DiagnosticCommand, config: &Config) -> Result<()> {
    match command {
        DiagnosticCommand::Version { verbose } => {
            BuildInfo::get().display(*verbose, &config.protocol.negotiation);
        }

        DiagnosticCommand::ListWatches { verbose } => {
            let store = JsonKnownWatchStore::new(config.known_watches_path());
            let watches = store.load().await.context("Failed to load known watches")?;

            if watches.is_empty() {
                println!("No known watches");
                return Ok(());
            }

            println!("Known watches: {}", watches.len());
            for watch in watches {
                println!(
                    "  {} [{}]{}",
                    watch.name,
                    watch.transport,
                    if watch.connect_goal {
                        " (auto-connect)"
                    } else {
                        ""
                    }
                );
                if *verbose {
                    if let Some(version) = &watch.last_firmware_version {
                        println!("    Firmware: {}", version);
                    }
                    if let Some(serial) = &watch.serial {
                        println!("    Serial: {}", serial);
                    }
                    if let Some(last) = watch.last_connected {
                        println!("    Last connected: {}", last.to_rfc3339());
                    }
                }
            }
        }

        DiagnosticCommand::SyncStatus => {
            let store = JsonBlobDbStore::new(config.blobdb_path());
            let snapshot = store.load().await.context("Failed to load BlobDB state")?;

            println!("Local items: {}", snapshot.local.len());
            println!("Pending clears: {}", snapshot.pending_clears.len());
            for watch in &snapshot.watches {
                let rows: Vec<_> = snapshot
                    .rows
                    .iter()
                    .filter(|row| &row.watch_identifier == watch)
                    .collect();
                let pending = rows.iter().filter(|row| row.status.is_pending()).count();
                println!("  {}: {} rows, {} pending", watch, rows.len(), pending);
            }
        }

        DiagnosticCommand::DumpConfig => {
            let contents =
                toml::to_string_pretty(config).context("Failed to serialize config")?;
            println!("{}", contents);
        }

        DiagnosticCommand::PushFile {
            watch,
            file,
            bank,
            name,
        } => {
            push_file(config, watch, file, *bank, name.as_deref()).await?;
        }
    }

    Ok(())
}

/// Connect to one socket watch and send a file through PutBytes
async fn push_file(
    config: &Config,
    watch: &str,
    file: &Path,
    bank: u8,
    name: Option<&str>,
) -> Result<()> {
    let target = config
        .find_watch(watch)
        .with_context(|| format!("No configured watch named '{}'", watch))?;

    let filename = match name {
        Some(name) => name.to_string(),
        None => file
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .context("File has no usable name; pass --name")?,
    };

    let source = tokio::fs::File::open(file)
        .await
        .with_context(|| format!("Failed to open {}", file.display()))?;
    let length = source.metadata().await?.len();
    let size = u32::try_from(length).context("File too large for PutBytes")?;

    let connector = RealPebbleConnector::new(
        Arc::new(SocketTransportConnector::new(target.address)),
        &config.protocol,
    );
    connector.connect().await;

    let state = connector.state().borrow().clone();
    let pebble = match state {
        ConnectingPebbleState::Connected(pebble) => pebble,
        ConnectingPebbleState::Failed(reason) => {
            bail!("Connection to {} failed: {}", target.name, reason)
        }
        other => bail!("Connection to {} ended in state {}", target.name, other),
    };

    println!(
        "Connected to {} ({}), sending {} ({})",
        target.name,
        pebble.watch_info.running,
        filename,
        diagnostics::format_bytes(length)
    );

    let (progress_tx, mut progress_rx) = mpsc::channel::<pebble_protocol::PutBytesProgress>(16);
    let printer = tokio::spawn(async move {
        while let Some(progress) = progress_rx.recv().await {
            println!("  {}/{} bytes", progress.count, progress.total);
        }
    });

    let result = pebble
        .session
        .putbytes()
        .begin_session(
            size,
            ObjectType::File,
            bank,
            &filename,
            source,
            Some(progress_tx),
        )
        .await;

    connector.disconnect().await;
    let _ = printer.await;

    let cookie = result.with_context(|| format!("Failed to send {}", filename))?;
    println!("Transfer complete (cookie {:#010x})", cookie);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    // Handle diagnostic commands (non-daemon mode)
    if let Some(command) = &cli.command {
        return handle_diagnostic_command(command, &config).await;
    }

    diagnostics::init_logging(&cli, &config.logging).context("Failed to initialize logging")?;

    info!("Starting Pebble daemon...");
    info!("Data directory: {}", config.paths.data_dir.display());

    let mut daemon = Daemon::new(config)
        .await
        .context("Failed to create daemon")?;

    daemon.start().await?;

    let result = daemon.run().await;

    daemon.shutdown().await?;

    result
}
