//! Per-connection Packet Router
//!
//! Reassembles inbound bytes into [`PebblePacket`]s and hands each one to the
//! service registered for its endpoint. Packets for endpoints no service
//! claimed go to the application packet stream.

use crate::packet::{Endpoint, PacketReassembler, PebblePacket};
use crate::transport::{DisconnectSignal, PebbleStreams};
use crate::{ProtocolError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Capacity of the application packet broadcast
const APP_PACKET_CAPACITY: usize = 64;

type Routes = Arc<Mutex<HashMap<Endpoint, mpsc::UnboundedSender<PebblePacket>>>>;

/// Cloneable handle for sending packets on one connection
#[derive(Debug, Clone)]
pub struct PacketSender {
    identifier: Arc<str>,
    outbound: mpsc::Sender<Vec<u8>>,
}

impl PacketSender {
    pub async fn send(&self, packet: PebblePacket) -> Result<()> {
        let bytes = packet.to_bytes()?;
        debug!(
            "{}: sending {} ({} bytes)",
            self.identifier,
            packet.endpoint,
            packet.payload.len()
        );
        trace!("{}: >> {}", self.identifier, hex::encode(&bytes));
        self.outbound
            .send(bytes)
            .await
            .map_err(|_| ProtocolError::Cancelled("connection closed".to_string()))
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }
}

/// Routes packets between one connection's byte streams and its services
pub struct ProtocolHandler {
    sender: PacketSender,
    routes: Routes,
    app_packets: broadcast::Sender<PebblePacket>,
    inbound: Option<mpsc::Receiver<Vec<u8>>>,
    closed: DisconnectSignal,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ProtocolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolHandler")
            .field("identifier", &self.sender.identifier)
            .field("started", &self.task.is_some())
            .finish()
    }
}

impl ProtocolHandler {
    pub fn new(identifier: &str, streams: PebbleStreams) -> Self {
        let (app_packets, _) = broadcast::channel(APP_PACKET_CAPACITY);
        Self {
            sender: PacketSender {
                identifier: Arc::from(identifier),
                outbound: streams.outbound,
            },
            routes: Arc::new(Mutex::new(HashMap::new())),
            app_packets,
            inbound: Some(streams.inbound),
            closed: DisconnectSignal::new(),
            task: None,
        }
    }

    /// Claim an endpoint; a later registration for the same endpoint replaces this one
    pub fn register(&self, endpoint: Endpoint) -> mpsc::UnboundedReceiver<PebblePacket> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut routes) = self.routes.lock() {
            if routes.insert(endpoint, tx).is_some() {
                warn!("{}: replacing handler for {}", self.sender.identifier, endpoint);
            }
        }
        rx
    }

    pub fn sender(&self) -> PacketSender {
        self.sender.clone()
    }

    /// Packets for endpoints without a registered service
    pub fn app_packets(&self) -> broadcast::Receiver<PebblePacket> {
        self.app_packets.subscribe()
    }

    /// Start dispatching; call after the services have registered
    pub fn start(&mut self) {
        let Some(mut inbound) = self.inbound.take() else {
            return;
        };
        let routes = self.routes.clone();
        let app_packets = self.app_packets.clone();
        let closed = self.closed.clone();
        let identifier = self.sender.identifier.clone();

        self.task = Some(tokio::spawn(async move {
            let mut reassembler = PacketReassembler::new();
            while let Some(bytes) = inbound.recv().await {
                trace!("{}: << {}", identifier, hex::encode(&bytes));
                for packet in reassembler.push(&bytes) {
                    debug!(
                        "{}: received {} ({} bytes)",
                        identifier,
                        packet.endpoint,
                        packet.payload.len()
                    );
                    let route = routes
                        .lock()
                        .ok()
                        .and_then(|routes| routes.get(&packet.endpoint).cloned());
                    match route {
                        Some(route) => {
                            if route.send(packet).is_err() {
                                trace!("{}: service gone, packet dropped", identifier);
                            }
                        }
                        // No subscribers is fine
                        None => {
                            let _ = app_packets.send(packet);
                        }
                    }
                }
            }
            if reassembler.pending() > 0 {
                warn!(
                    "{}: stream ended with {} bytes of a partial packet",
                    identifier,
                    reassembler.pending()
                );
            }
            debug!("{}: inbound stream closed", identifier);
            closed.signal();
        }));
    }

    /// Resolves once the inbound stream has ended
    pub async fn wait_closed(&self) {
        self.closed.wait().await;
    }
}

impl Drop for ProtocolHandler {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::STREAM_CHANNEL_CAPACITY;

    fn handler() -> (ProtocolHandler, mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
        let (out_tx, out_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let handler = ProtocolHandler::new(
            "test",
            PebbleStreams {
                outbound: out_tx,
                inbound: in_rx,
            },
        );
        (handler, in_tx, out_rx)
    }

    #[tokio::test]
    async fn test_routes_by_endpoint() {
        let (mut handler, wire_in, _wire_out) = handler();
        let mut pings = handler.register(Endpoint::PING);
        let mut app = handler.app_packets();
        handler.start();

        let ping = PebblePacket::new(Endpoint::PING, vec![0, 0, 0, 0, 1]);
        let unknown = PebblePacket::new(Endpoint(4242), vec![9]);
        let mut bytes = ping.to_bytes().unwrap();
        bytes.extend(unknown.to_bytes().unwrap());

        // Split mid-header of the second packet
        wire_in.send(bytes[..11].to_vec()).await.unwrap();
        wire_in.send(bytes[11..].to_vec()).await.unwrap();

        assert_eq!(pings.recv().await.unwrap(), ping);
        assert_eq!(app.recv().await.unwrap(), unknown);

        drop(wire_in);
        handler.wait_closed().await;
    }

    #[tokio::test]
    async fn test_sender_serializes() {
        let (handler, _wire_in, mut wire_out) = handler();
        handler
            .sender()
            .send(PebblePacket::new(Endpoint::TIME, vec![0x03]))
            .await
            .unwrap();
        assert_eq!(wire_out.recv().await.unwrap(), vec![0, 1, 0, 11, 0x03]);

        drop(wire_out);
        let result = handler
            .sender()
            .send(PebblePacket::new(Endpoint::TIME, vec![]))
            .await;
        assert!(matches!(result, Err(ProtocolError::Cancelled(_))));
    }
}
