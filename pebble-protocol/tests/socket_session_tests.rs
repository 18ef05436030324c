//! Full sessions over a TCP socket against a simulated watch

mod common;

use pebble_protocol::services::system::ProtocolCapability;
use pebble_protocol::transport::SocketTransportConnector;
use pebble_protocol::{
    stm32_crc32, ConnectedMode, ConnectingPebbleState, ConnectionFailureReason,
    ConnectionStage, Endpoint, ObjectType, PacketReassembler, PebbleConnector, PebblePacket,
    ProtocolConfig, ProtocolError, RealPebbleConnector,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};

const COOKIE: u32 = 0x1234_5678;

/// What the simulated watch received over PutBytes
#[derive(Debug, Default)]
struct Received {
    size: u32,
    filename: String,
    data: Vec<u8>,
    crc: Option<u32>,
    installed: bool,
    aborted: bool,
}

#[derive(Debug, Clone, Copy)]
struct WatchBehavior {
    /// Close the connection right after negotiation
    hang_up_after_negotiation: bool,
    /// Reject `Put` chunks after this many bytes
    nack_after: Option<usize>,
}

fn firmware_record(tag: &str, is_recovery: bool) -> Vec<u8> {
    let mut out = 1_600_000_000u32.to_be_bytes().to_vec();
    let mut tag_bytes = tag.as_bytes().to_vec();
    tag_bytes.resize(32, 0);
    out.extend(tag_bytes);
    out.extend_from_slice(b"0123abcd");
    out.extend_from_slice(&[is_recovery as u8, 14, 1]);
    out
}

fn watch_version_payload() -> Vec<u8> {
    let mut out = vec![0x01];
    out.extend(firmware_record("v4.4.2", false));
    out.extend(firmware_record("v4.0.0-prf", true));
    out.extend_from_slice(&1_500_000_000u32.to_be_bytes());
    out.extend_from_slice(b"snowy_dvt");
    out.extend_from_slice(b"Q402445E00D1");
    out.extend_from_slice(&[0xB0, 0xB4, 0x48, 0x01, 0x02, 0x03]);
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(&1_600_000_100u32.to_be_bytes());
    out.extend_from_slice(b"en_US\0");
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&ProtocolCapability::encode(&[ProtocolCapability::AppRunState]));
    out.push(0);
    out
}

async fn send(writer: &mut OwnedWriteHalf, endpoint: Endpoint, payload: Vec<u8>) {
    let bytes = PebblePacket::new(endpoint, payload).to_bytes().unwrap();
    writer.write_all(&bytes).await.unwrap();
}

async fn reply(writer: &mut OwnedWriteHalf, ack: bool, cookie: u32) {
    let mut payload = vec![if ack { 1 } else { 2 }];
    payload.extend_from_slice(&cookie.to_be_bytes());
    send(writer, Endpoint::PUT_BYTES, payload).await;
}

fn be32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Accept one connection and play the watch side of negotiation and PutBytes
async fn spawn_watch(behavior: WatchBehavior) -> (SocketAddr, oneshot::Receiver<Received>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let (done_tx, done_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        let mut reassembler = PacketReassembler::new();
        let mut received = Received::default();
        let mut buffer = vec![0u8; 4096];

        // The watch opens by asking for the phone app version
        send(&mut writer, Endpoint::PHONE_VERSION, vec![0x00]).await;

        'session: loop {
            let n = match reader.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            for packet in reassembler.push(&buffer[..n]) {
                let p = &packet.payload;
                match packet.endpoint {
                    Endpoint::VERSION if p.first() == Some(&0x00) => {
                        send(&mut writer, Endpoint::VERSION, watch_version_payload()).await;
                    }
                    Endpoint::TIME if behavior.hang_up_after_negotiation => {
                        break 'session;
                    }
                    Endpoint::PUT_BYTES => match p[0] {
                        0x01 => {
                            received.size = be32(&p[1..5]);
                            let name = &p[7..p.len() - 1];
                            received.filename = String::from_utf8_lossy(name).into_owned();
                            reply(&mut writer, true, COOKIE).await;
                        }
                        0x02 => {
                            assert_eq!(be32(&p[1..5]), COOKIE);
                            let len = be32(&p[5..9]) as usize;
                            let rejected = behavior
                                .nack_after
                                .is_some_and(|limit| received.data.len() >= limit);
                            if rejected {
                                reply(&mut writer, false, COOKIE).await;
                            } else {
                                received.data.extend_from_slice(&p[9..9 + len]);
                                reply(&mut writer, true, COOKIE).await;
                            }
                        }
                        0x03 => {
                            received.crc = Some(be32(&p[5..9]));
                            reply(&mut writer, true, COOKIE).await;
                        }
                        0x04 => {
                            received.aborted = true;
                            reply(&mut writer, true, COOKIE).await;
                            break 'session;
                        }
                        0x05 => {
                            received.installed = true;
                            reply(&mut writer, true, COOKIE).await;
                            break 'session;
                        }
                        other => panic!("unexpected PutBytes command {}", other),
                    },
                    _ => {}
                }
            }
        }
        let _ = done_tx.send(received);
        if behavior.hang_up_after_negotiation {
            return;
        }
        // Keep the socket open until the phone hangs up
        let _ = reader.read(&mut buffer).await;
    });

    (address, done_rx)
}

async fn connect(address: SocketAddr) -> (RealPebbleConnector, ConnectingPebbleState) {
    common::init_tracing();
    let connector = RealPebbleConnector::new(
        Arc::new(SocketTransportConnector::new(address)),
        &ProtocolConfig::default(),
    );
    timeout(Duration::from_secs(10), connector.connect())
        .await
        .expect("connect did not finish");
    let state = connector.state().borrow().clone();
    (connector, state)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

#[tokio::test]
async fn test_negotiate_and_push_file() {
    let (address, done) = spawn_watch(WatchBehavior {
        hang_up_after_negotiation: false,
        nack_after: None,
    })
    .await;

    let (connector, state) = connect(address).await;
    let pebble = match state {
        ConnectingPebbleState::Connected(pebble) => pebble,
        other => panic!("expected Connected, got {}", other),
    };
    assert_eq!(pebble.mode, ConnectedMode::NotInPrf);
    assert_eq!(pebble.watch_info.serial, "Q402445E00D1");
    assert_eq!(pebble.watch_info.running.major, 4);

    let data = pattern(5000);
    let (progress_tx, mut progress_rx) = mpsc::channel(16);
    let cookie = assert_ok!(
        pebble
            .session
            .putbytes()
            .begin_session(
                data.len() as u32,
                ObjectType::File,
                3,
                "notes.txt",
                &data[..],
                Some(progress_tx),
            )
            .await
    );
    assert_eq!(cookie, COOKIE);

    let mut last = None;
    while let Some(progress) = progress_rx.recv().await {
        last = Some(progress);
    }
    let last = last.unwrap();
    assert_eq!(last.count, 5000);
    assert_eq!(last.total, 5000);

    let received = done.await.unwrap();
    assert_eq!(received.size, 5000);
    assert_eq!(received.filename, "notes.txt");
    assert_eq!(received.data, data);
    assert_eq!(received.crc, Some(stm32_crc32(&data)));
    assert!(received.installed);

    connector.disconnect().await;
    assert_eq!(connector.state().borrow().stage(), ConnectionStage::Inactive);
}

#[tokio::test]
async fn test_nack_aborts_transfer() {
    let (address, done) = spawn_watch(WatchBehavior {
        hang_up_after_negotiation: false,
        nack_after: Some(2000),
    })
    .await;

    let (connector, state) = connect(address).await;
    let pebble = state.connected().cloned().expect("connected");

    let data = pattern(5000);
    let result = pebble
        .session
        .putbytes()
        .begin_session(data.len() as u32, ObjectType::File, 0, "big.bin", &data[..], None)
        .await;
    let error = assert_err!(result);
    assert!(matches!(error, ProtocolError::PutBytesNack { .. }));

    let received = done.await.unwrap();
    assert!(received.aborted);
    assert!(!received.installed);
    assert!(received.crc.is_none());

    connector.disconnect().await;
}

#[tokio::test]
async fn test_watch_hang_up_ends_session() {
    let (address, _done) = spawn_watch(WatchBehavior {
        hang_up_after_negotiation: true,
        nack_after: None,
    })
    .await;

    let (connector, state) = connect(address).await;
    assert_eq!(state.stage(), ConnectionStage::Connected);

    timeout(Duration::from_secs(5), connector.wait_disconnected())
        .await
        .expect("link loss not noticed");
    assert_eq!(connector.state().borrow().stage(), ConnectionStage::Inactive);
}

#[tokio::test]
async fn test_refused_socket_fails_attempt() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);

    let (_connector, state) = connect(address).await;
    assert!(matches!(
        state,
        ConnectingPebbleState::Failed(ConnectionFailureReason::SocketConnect)
    ));
}
