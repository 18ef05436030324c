//! Socket Transport
//!
//! Emulators and developer connections speak the Pebble Protocol directly
//! over TCP, so the stream is passed through without PPoG.

use super::{
    ConnectionFailureReason, DisconnectSignal, PebbleStreams, Transport, TransportConnector,
    STREAM_CHANNEL_CAPACITY,
};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Default timeout for the TCP connect
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const READ_BUFFER_SIZE: usize = 4096;

/// Pass-through connector for [`Transport::Socket`]
#[derive(Debug)]
pub struct SocketTransportConnector {
    transport: Transport,
    address: SocketAddr,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    disconnected: DisconnectSignal,
}

impl SocketTransportConnector {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            transport: Transport::Socket { address },
            address,
            tasks: Mutex::new(Vec::new()),
            disconnected: DisconnectSignal::new(),
        }
    }
}

#[async_trait]
impl TransportConnector for SocketTransportConnector {
    fn transport(&self) -> &Transport {
        &self.transport
    }

    async fn connect(&self) -> Result<PebbleStreams, ConnectionFailureReason> {
        debug!("Connecting to {}", self.address);
        let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(self.address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("Socket connect to {} failed: {}", self.address, e);
                return Err(ConnectionFailureReason::SocketConnect);
            }
            Err(_) => {
                warn!("Socket connect to {} timed out", self.address);
                return Err(ConnectionFailureReason::SocketConnect);
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Couldn't set TCP_NODELAY: {}", e);
        }
        info!("Connected to {}", self.address);

        let (mut reader, mut writer) = stream.into_split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(STREAM_CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        let read_signal = self.disconnected.clone();
        let address = self.address;
        let read_task = tokio::spawn(async move {
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buffer).await {
                    Ok(0) => {
                        info!("{} closed the connection", address);
                        break;
                    }
                    Ok(n) => {
                        if inbound_tx.send(buffer[..n].to_vec()).await.is_err() {
                            debug!("Inbound stream for {} dropped", address);
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Read from {} failed: {}", address, e);
                        break;
                    }
                }
            }
            read_signal.signal();
        });

        let write_signal = self.disconnected.clone();
        let write_task = tokio::spawn(async move {
            while let Some(bytes) = outbound_rx.recv().await {
                if let Err(e) = writer.write_all(&bytes).await {
                    error!("Write to {} failed: {}", address, e);
                    break;
                }
            }
            let _ = writer.shutdown().await;
            write_signal.signal();
        });

        self.tasks.lock().await.extend([read_task, write_task]);

        Ok(PebbleStreams {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }

    async fn disconnect(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.disconnected.signal();
    }

    async fn wait_disconnected(&self) {
        self.disconnected.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_socket_pass_through() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let peer = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 3];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&[buf[2], buf[1], buf[0]]).await.unwrap();
        });

        let connector = SocketTransportConnector::new(address);
        let mut streams = connector.connect().await.unwrap();
        streams.outbound.send(vec![1, 2, 3]).await.unwrap();

        let mut received = Vec::new();
        while received.len() < 3 {
            received.extend(streams.inbound.recv().await.unwrap());
        }
        assert_eq!(received, vec![3, 2, 1]);

        peer.await.unwrap();
        // Peer dropped its socket
        connector.wait_disconnected().await;
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let connector = SocketTransportConnector::new(address);
        assert_eq!(
            connector.connect().await.unwrap_err(),
            ConnectionFailureReason::SocketConnect
        );
    }
}
