//! PPoG reliable link
//!
//! Turns an unreliable, unordered-on-loss characteristic channel into an
//! ordered byte stream. Outbound bytes are split into `Data` frames sized to
//! the MTU, at most `tx_window` frames are unacknowledged at any time, and
//! frames are retransmitted on timeout or on a duplicate cumulative ack.
//!
//! ## Handshake
//!
//! ```text
//! Responder (phone, normal)          Initiator (watch, or phone when reversed)
//!        <---- ResetRequest(version) ----
//!        ---- ResetComplete(rx, tx) ---->
//!        <---- ResetComplete(rx', tx') --
//! ```
//!
//! Window fields are from the sender's perspective, so the responder's
//! transmit window is the initiator's receive window.

use super::packet::{
    next_sequence, sequence_distance, PpogPacket, PpogVersion, DATA_HEADER_OVERHEAD,
    MAX_SUPPORTED_WINDOW_SIZE, V0_WINDOW_SIZE,
};
use crate::transport::{PebbleStreams, STREAM_CHANNEL_CAPACITY};
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, trace, warn};

/// Writes one frame to the underlying characteristic
#[async_trait]
pub trait PpogFrameSender: Send + Sync {
    async fn send_frame(&self, frame: Vec<u8>) -> Result<()>;
}

/// Which side starts the reset handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PpogRole {
    /// Wait for the peer's `ResetRequest`
    Responder,
    /// Send the `ResetRequest`
    Initiator,
}

/// Link tuning
#[derive(Debug, Clone)]
pub struct PpogLinkConfig {
    /// How long a responder waits for the peer's `ResetRequest`
    pub reset_wait: Duration,
    /// How long an initiator waits for `ResetComplete`
    pub initiator_reset_wait: Duration,
    /// A responder that hears nothing falls back to initiating
    pub fallback_to_initiator: bool,
    pub retransmit_timeout: Duration,
    /// Resends of a single frame before the link is declared dead
    pub max_retries: u32,
    /// Undecodable frames tolerated before the link is declared dead
    pub max_malformed_frames: u32,
    pub desired_rx_window: u8,
    pub desired_tx_window: u8,
    pub initial_mtu: usize,
}

impl Default for PpogLinkConfig {
    fn default() -> Self {
        Self {
            reset_wait: Duration::from_secs(12),
            initiator_reset_wait: Duration::from_secs(5),
            fallback_to_initiator: false,
            retransmit_timeout: Duration::from_millis(800),
            max_retries: 2,
            max_malformed_frames: 5,
            desired_rx_window: MAX_SUPPORTED_WINDOW_SIZE,
            desired_tx_window: MAX_SUPPORTED_WINDOW_SIZE,
            initial_mtu: 23,
        }
    }
}

/// Parameters agreed during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PpogParams {
    pub rx_window: u8,
    pub tx_window: u8,
    pub version: PpogVersion,
}

/// Lifecycle of a running link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Running,
    Closed,
    Failed(String),
}

impl LinkState {
    pub fn is_terminated(&self) -> bool {
        !matches!(self, LinkState::Running)
    }
}

enum LinkControl {
    Close,
}

/// Handle to an established PPoG link
///
/// Dropping the handle stops the link task.
pub struct PpogLink {
    params: PpogParams,
    mtu: Arc<AtomicUsize>,
    control_tx: mpsc::UnboundedSender<LinkControl>,
    state_rx: watch::Receiver<LinkState>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for PpogLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PpogLink")
            .field("params", &self.params)
            .field("mtu", &self.mtu.load(Ordering::Relaxed))
            .field("state", &*self.state_rx.borrow())
            .finish()
    }
}

impl PpogLink {
    /// Run the reset handshake and start the link
    ///
    /// `frames` carries raw frames received from the peer. On success returns
    /// the link handle and the byte streams for the packet codec.
    pub async fn establish(
        config: PpogLinkConfig,
        role: PpogRole,
        sender: Arc<dyn PpogFrameSender>,
        mut frames: mpsc::Receiver<Vec<u8>>,
    ) -> Result<(PpogLink, PebbleStreams)> {
        let params = match role {
            PpogRole::Initiator => timeout(
                config.initiator_reset_wait,
                initiate(&config, sender.as_ref(), &mut frames),
            )
            .await
            .map_err(|_| ProtocolError::Timeout("waiting for PPoG ResetComplete".to_string()))??,
            PpogRole::Responder => {
                match timeout(
                    config.reset_wait,
                    respond(&config, sender.as_ref(), &mut frames),
                )
                .await
                {
                    Ok(result) => result?,
                    Err(_) if config.fallback_to_initiator => {
                        info!("No PPoG ResetRequest from watch; initiating reset ourselves");
                        timeout(
                            config.initiator_reset_wait,
                            initiate(&config, sender.as_ref(), &mut frames),
                        )
                        .await
                        .map_err(|_| {
                            ProtocolError::Timeout("initializing PPoG".to_string())
                        })??
                    }
                    Err(_) => {
                        return Err(ProtocolError::Timeout(
                            "waiting for PPoG ResetRequest".to_string(),
                        ))
                    }
                }
            }
        };

        info!(
            "PPoG link up: version {:?}, rx window {}, tx window {}",
            params.version, params.rx_window, params.tx_window
        );

        let (outbound_tx, outbound_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(LinkState::Running);
        let mtu = Arc::new(AtomicUsize::new(config.initial_mtu));

        let runner = LinkRunner {
            params,
            config,
            sender,
            mtu: mtu.clone(),
            queue: VecDeque::new(),
            inflight: VecDeque::new(),
            next_outbound: 0,
            expected_inbound: 0,
            last_sent_ack: None,
            last_received_ack: None,
            fast_resent_for: None,
            retransmit_deadline: None,
            malformed: 0,
        };

        let task = tokio::spawn(async move {
            let final_state = match runner.run(frames, outbound_rx, inbound_tx, control_rx).await {
                Ok(()) => LinkState::Closed,
                Err(e) => {
                    warn!("PPoG link failed: {}", e);
                    LinkState::Failed(e.to_string())
                }
            };
            state_tx.send_replace(final_state);
        });

        let link = PpogLink {
            params,
            mtu,
            control_tx,
            state_rx,
            task,
        };
        let streams = PebbleStreams {
            outbound: outbound_tx,
            inbound: inbound_rx,
        };
        Ok((link, streams))
    }

    pub fn params(&self) -> PpogParams {
        self.params
    }

    pub fn mtu(&self) -> usize {
        self.mtu.load(Ordering::Relaxed)
    }

    /// Raise the MTU used for future chunking; it can never shrink
    pub fn update_mtu(&self, mtu: usize) -> Result<()> {
        let current = self.mtu.load(Ordering::Relaxed);
        if mtu < current {
            return Err(ProtocolError::invalid_state(format!(
                "cannot reduce PPoG MTU from {} to {}",
                current, mtu
            )));
        }
        self.mtu.store(mtu, Ordering::Relaxed);
        debug!("PPoG MTU now {}", mtu);
        Ok(())
    }

    pub fn state(&self) -> LinkState {
        self.state_rx.borrow().clone()
    }

    /// Ask the peer to drop its state and stop the link
    pub async fn close(&self) {
        if self.control_tx.send(LinkControl::Close).is_ok() {
            self.wait_terminated().await;
        }
    }

    /// Wait for the link task to finish and report how it ended
    pub async fn wait_terminated(&self) -> LinkState {
        let mut rx = self.state_rx.clone();
        let state = match rx.wait_for(LinkState::is_terminated).await {
            Ok(state) => state.clone(),
            Err(_) => LinkState::Closed,
        };
        state
    }
}

impl Drop for PpogLink {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn send_packet(
    sender: &dyn PpogFrameSender,
    packet: &PpogPacket,
    version: PpogVersion,
) -> Result<()> {
    trace!("PPoG >> {:?}", packet);
    sender
        .send_frame(packet.encode(version))
        .await
        .map_err(|e| ProtocolError::LinkFailure(format!("couldn't send frame: {}", e)))
}

async fn next_frame(frames: &mut mpsc::Receiver<Vec<u8>>) -> Result<PpogPacket> {
    loop {
        let bytes = frames
            .recv()
            .await
            .ok_or_else(|| ProtocolError::LinkFailure("frame channel closed".to_string()))?;
        match PpogPacket::decode(&bytes) {
            Ok(packet) => return Ok(packet),
            Err(e) => warn!("Ignoring undecodable frame during handshake: {}", e),
        }
    }
}

fn clamp_window(window: u8) -> u8 {
    window.clamp(1, MAX_SUPPORTED_WINDOW_SIZE)
}

async fn respond(
    config: &PpogLinkConfig,
    sender: &dyn PpogFrameSender,
    frames: &mut mpsc::Receiver<Vec<u8>>,
) -> Result<PpogParams> {
    debug!("Waiting for PPoG ResetRequest");
    let version = loop {
        match next_frame(frames).await? {
            PpogPacket::ResetRequest { version, .. } => break version,
            // Stale frames from a previous session can show up after a quick reconnect
            other => warn!("Unexpected {:?} while waiting for ResetRequest", other),
        }
    };

    send_packet(
        sender,
        &PpogPacket::ResetComplete {
            sequence: 0,
            rx_window: clamp_window(config.desired_rx_window),
            tx_window: clamp_window(config.desired_tx_window),
        },
        version,
    )
    .await?;

    match next_frame(frames).await? {
        PpogPacket::ResetComplete {
            rx_window,
            tx_window,
            ..
        } => {
            if !version.supports_window_negotiation() {
                return Ok(PpogParams {
                    rx_window: V0_WINDOW_SIZE,
                    tx_window: V0_WINDOW_SIZE,
                    version,
                });
            }
            Ok(PpogParams {
                rx_window: clamp_window(tx_window),
                tx_window: clamp_window(rx_window),
                version,
            })
        }
        other => Err(ProtocolError::LinkFailure(format!(
            "expected ResetComplete, got {:?}",
            other
        ))),
    }
}

async fn initiate(
    config: &PpogLinkConfig,
    sender: &dyn PpogFrameSender,
    frames: &mut mpsc::Receiver<Vec<u8>>,
) -> Result<PpogParams> {
    let version = PpogVersion::One;
    send_packet(
        sender,
        &PpogPacket::ResetRequest {
            sequence: 0,
            version,
        },
        version,
    )
    .await?;

    let (peer_rx, peer_tx) = loop {
        match next_frame(frames).await? {
            PpogPacket::ResetComplete {
                rx_window,
                tx_window,
                ..
            } => break (rx_window, tx_window),
            other => warn!("Unexpected {:?} while waiting for ResetComplete", other),
        }
    };

    let rx_window = clamp_window(peer_tx.min(config.desired_rx_window));
    let tx_window = clamp_window(peer_rx.min(config.desired_tx_window));
    send_packet(
        sender,
        &PpogPacket::ResetComplete {
            sequence: 0,
            rx_window,
            tx_window,
        },
        version,
    )
    .await?;

    Ok(PpogParams {
        rx_window,
        tx_window,
        version,
    })
}

struct Outgoing {
    sequence: u8,
    data: Vec<u8>,
    attempts: u32,
}

/// State owned by the link task; never shared
struct LinkRunner {
    params: PpogParams,
    config: PpogLinkConfig,
    sender: Arc<dyn PpogFrameSender>,
    mtu: Arc<AtomicUsize>,
    /// Frames waiting for window space; resends go to the front
    queue: VecDeque<Outgoing>,
    /// Sent and not yet acknowledged, oldest first
    inflight: VecDeque<Outgoing>,
    next_outbound: u8,
    expected_inbound: u8,
    last_sent_ack: Option<u8>,
    last_received_ack: Option<u8>,
    /// Duplicate ack we already retransmitted for
    fast_resent_for: Option<u8>,
    retransmit_deadline: Option<Instant>,
    malformed: u32,
}

impl LinkRunner {
    async fn run(
        mut self,
        mut frames: mpsc::Receiver<Vec<u8>>,
        mut outbound: mpsc::Receiver<Vec<u8>>,
        inbound: mpsc::Sender<Vec<u8>>,
        mut control: mpsc::UnboundedReceiver<LinkControl>,
    ) -> Result<()> {
        let window = self.params.tx_window as usize;

        loop {
            let deadline = self.retransmit_deadline;
            tokio::select! {
                biased;

                cmd = control.recv() => {
                    match cmd {
                        Some(LinkControl::Close) | None => {
                            debug!("Closing PPoG link");
                            // Puts the watch's state machine into "needs reset"
                            let reset = PpogPacket::ResetRequest { sequence: 0, version: PpogVersion::One };
                            if let Err(e) = send_packet(self.sender.as_ref(), &reset, PpogVersion::One).await {
                                debug!("Couldn't send closing ResetRequest: {}", e);
                            }
                            return Ok(());
                        }
                    }
                }

                frame = frames.recv() => {
                    let bytes = frame.ok_or_else(|| {
                        ProtocolError::LinkFailure("frame channel closed".to_string())
                    })?;
                    if !self.handle_frame(&bytes, &inbound).await? {
                        return Ok(());
                    }
                }

                bytes = outbound.recv(), if self.queue.len() < window => {
                    match bytes {
                        Some(bytes) => self.enqueue(bytes),
                        None => {
                            debug!("PPoG outbound stream closed");
                            return Ok(());
                        }
                    }
                }

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    warn!("PPoG retransmission timeout, {} frames in flight", self.inflight.len());
                    self.retransmit_deadline = None;
                    self.resend_inflight()?;
                }
            }

            self.drain(window).await?;
        }
    }

    fn max_data_bytes(&self) -> usize {
        self.mtu
            .load(Ordering::Relaxed)
            .saturating_sub(DATA_HEADER_OVERHEAD)
            .max(1)
    }

    fn enqueue(&mut self, bytes: Vec<u8>) {
        let chunk_size = self.max_data_bytes();
        for chunk in bytes.chunks(chunk_size) {
            let sequence = self.next_outbound;
            self.next_outbound = next_sequence(sequence);
            self.queue.push_back(Outgoing {
                sequence,
                data: chunk.to_vec(),
                attempts: 0,
            });
        }
    }

    async fn drain(&mut self, window: usize) -> Result<()> {
        // Everything resent after a timeout was in flight before, so it always fits here
        while self.inflight.len() < window {
            let Some(frame) = self.queue.pop_front() else {
                break;
            };
            let packet = PpogPacket::Data {
                sequence: frame.sequence,
                data: frame.data.clone(),
            };
            send_packet(self.sender.as_ref(), &packet, self.params.version).await?;
            self.retransmit_deadline = Some(Instant::now() + self.config.retransmit_timeout);
            self.inflight.push_back(frame);
        }
        Ok(())
    }

    fn resend_inflight(&mut self) -> Result<()> {
        while let Some(mut frame) = self.inflight.pop_back() {
            frame.attempts += 1;
            if frame.attempts > self.config.max_retries {
                return Err(ProtocolError::LinkFailure(format!(
                    "frame {} exceeded {} retries",
                    frame.sequence, self.config.max_retries
                )));
            }
            self.queue.push_front(frame);
        }
        Ok(())
    }

    /// Returns `false` when the consumer has gone away
    async fn handle_frame(&mut self, bytes: &[u8], inbound: &mpsc::Sender<Vec<u8>>) -> Result<bool> {
        let packet = match PpogPacket::decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                self.malformed += 1;
                warn!("Malformed PPoG frame ({}): {}", self.malformed, e);
                if self.malformed > self.config.max_malformed_frames {
                    return Err(ProtocolError::LinkFailure(
                        "too many malformed frames".to_string(),
                    ));
                }
                return Ok(true);
            }
        };
        trace!("PPoG << {:?}", packet);

        match packet {
            PpogPacket::Ack { sequence } => self.handle_ack(sequence)?,
            PpogPacket::Data { sequence, data } => {
                if sequence != self.expected_inbound {
                    debug!(
                        "Data {} out of sequence (expected {}); resending last ack",
                        sequence, self.expected_inbound
                    );
                    if let Some(ack) = self.last_sent_ack {
                        send_packet(
                            self.sender.as_ref(),
                            &PpogPacket::Ack { sequence: ack },
                            self.params.version,
                        )
                        .await?;
                    }
                    return Ok(true);
                }

                if inbound.send(data).await.is_err() {
                    return Ok(false);
                }
                self.expected_inbound = next_sequence(sequence);
                send_packet(
                    self.sender.as_ref(),
                    &PpogPacket::Ack { sequence },
                    self.params.version,
                )
                .await?;
                self.last_sent_ack = Some(sequence);
            }
            PpogPacket::ResetRequest { .. } | PpogPacket::ResetComplete { .. } => {
                return Err(ProtocolError::LinkFailure(
                    "peer reset the link mid-session".to_string(),
                ));
            }
        }
        Ok(true)
    }

    /// Index of `sequence` among the in-flight frames, which are consecutive
    fn inflight_index(&self, sequence: u8) -> Option<usize> {
        let oldest = self.inflight.front()?.sequence;
        let index = sequence_distance(oldest, sequence) as usize;
        (index < self.inflight.len()).then_some(index)
    }

    fn handle_ack(&mut self, sequence: u8) -> Result<()> {
        if let Some(index) = self.inflight_index(sequence) {
            self.inflight.drain(..=index);
            self.last_received_ack = Some(sequence);
            self.fast_resent_for = None;
            self.retransmit_deadline = if self.inflight.is_empty() {
                None
            } else {
                Some(Instant::now() + self.config.retransmit_timeout)
            };
            return Ok(());
        }

        if self.last_received_ack == Some(sequence) {
            if self.fast_resent_for != Some(sequence) && !self.inflight.is_empty() {
                debug!("Duplicate ack {}; resending in-flight frames", sequence);
                self.fast_resent_for = Some(sequence);
                self.resend_inflight()?;
            }
        } else {
            debug!("Ignoring stale ack {}", sequence);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSender {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl PpogFrameSender for RecordingSender {
        async fn send_frame(&self, frame: Vec<u8>) -> Result<()> {
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }
    }

    impl RecordingSender {
        fn decoded(&self) -> Vec<PpogPacket> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .map(|f| PpogPacket::decode(f).unwrap())
                .collect()
        }
    }

    fn enc(packet: PpogPacket) -> Vec<u8> {
        packet.encode(PpogVersion::One)
    }

    async fn established(
        config: PpogLinkConfig,
    ) -> (
        PpogLink,
        PebbleStreams,
        Arc<RecordingSender>,
        mpsc::Sender<Vec<u8>>,
    ) {
        let sender = Arc::new(RecordingSender::default());
        let (frames_tx, frames_rx) = mpsc::channel(64);
        frames_tx
            .send(enc(PpogPacket::ResetRequest {
                sequence: 0,
                version: PpogVersion::One,
            }))
            .await
            .unwrap();
        frames_tx
            .send(enc(PpogPacket::ResetComplete {
                sequence: 0,
                rx_window: 10,
                tx_window: 3,
            }))
            .await
            .unwrap();
        let (link, streams) =
            PpogLink::establish(config, PpogRole::Responder, sender.clone(), frames_rx)
                .await
                .unwrap();
        (link, streams, sender, frames_tx)
    }

    #[tokio::test]
    async fn test_responder_handshake_swaps_windows() {
        let (link, _streams, sender, _frames) = established(PpogLinkConfig::default()).await;

        // Watch said rx=10, tx=3 from its side
        assert_eq!(link.params().tx_window, 10);
        assert_eq!(link.params().rx_window, 3);
        assert_eq!(
            sender.decoded()[0],
            PpogPacket::ResetComplete {
                sequence: 0,
                rx_window: 25,
                tx_window: 25
            }
        );
    }

    #[tokio::test]
    async fn test_inbound_data_is_acked_and_delivered() {
        let (_link, mut streams, sender, frames) = established(PpogLinkConfig::default()).await;

        frames
            .send(enc(PpogPacket::Data {
                sequence: 0,
                data: vec![1, 2, 3],
            }))
            .await
            .unwrap();
        assert_eq!(streams.inbound.recv().await.unwrap(), vec![1, 2, 3]);

        // Out of order: last ack is repeated, nothing delivered
        frames
            .send(enc(PpogPacket::Data {
                sequence: 5,
                data: vec![9],
            }))
            .await
            .unwrap();
        frames
            .send(enc(PpogPacket::Data {
                sequence: 1,
                data: vec![4],
            }))
            .await
            .unwrap();
        assert_eq!(streams.inbound.recv().await.unwrap(), vec![4]);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let acks: Vec<_> = sender
            .decoded()
            .into_iter()
            .filter(|p| matches!(p, PpogPacket::Ack { .. }))
            .collect();
        assert_eq!(
            acks,
            vec![
                PpogPacket::Ack { sequence: 0 },
                PpogPacket::Ack { sequence: 0 },
                PpogPacket::Ack { sequence: 1 },
            ]
        );
    }

    #[tokio::test]
    async fn test_outbound_chunked_to_mtu_and_window_bounded() {
        let config = PpogLinkConfig {
            initial_mtu: 8,
            ..Default::default()
        };
        let (_link, streams, sender, frames) = established(config).await;

        // 4 bytes per frame, window of 10 → 12 chunks, only 10 go out
        streams.outbound.send(vec![7u8; 48]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let data_frames = |s: &RecordingSender| {
            s.decoded()
                .into_iter()
                .filter(|p| matches!(p, PpogPacket::Data { .. }))
                .count()
        };
        assert_eq!(data_frames(&sender), 10);

        frames
            .send(enc(PpogPacket::Ack { sequence: 1 }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(data_frames(&sender), 12);
    }

    #[tokio::test]
    async fn test_coalesced_ack_across_sequence_wrap() {
        let config = PpogLinkConfig {
            initial_mtu: 8,
            ..Default::default()
        };
        let (_link, streams, sender, frames) = established(config).await;
        let data_frames = |s: &RecordingSender| {
            s.decoded()
                .into_iter()
                .filter(|p| matches!(p, PpogPacket::Data { .. }))
                .count()
        };

        // 46 chunks through a window of 10
        streams.outbound.send(vec![3u8; 184]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(data_frames(&sender), 10);
        for (ack, sent) in [(9, 20), (19, 30), (29, 40)] {
            frames.send(enc(PpogPacket::Ack { sequence: ack })).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(data_frames(&sender), sent);
        }

        // 30, 31, 0, 1, 2 leave the window in one ack
        frames.send(enc(PpogPacket::Ack { sequence: 2 })).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(data_frames(&sender), 45);

        // An ack for a frame that already left is ignored
        frames.send(enc(PpogPacket::Ack { sequence: 29 })).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(data_frames(&sender), 45);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_fails_link() {
        let (link, streams, _sender, _frames) = established(PpogLinkConfig::default()).await;
        streams.outbound.send(vec![1]).await.unwrap();

        let state = link.wait_terminated().await;
        assert!(matches!(state, LinkState::Failed(_)));
    }

    #[tokio::test]
    async fn test_mid_session_reset_fails_link() {
        let (link, _streams, _sender, frames) = established(PpogLinkConfig::default()).await;
        frames
            .send(enc(PpogPacket::ResetRequest {
                sequence: 0,
                version: PpogVersion::One,
            }))
            .await
            .unwrap();
        assert!(matches!(link.wait_terminated().await, LinkState::Failed(_)));
    }

    #[tokio::test]
    async fn test_mtu_only_grows() {
        let (link, _streams, _sender, _frames) = established(PpogLinkConfig::default()).await;
        link.update_mtu(185).unwrap();
        assert_eq!(link.mtu(), 185);
        assert!(link.update_mtu(23).is_err());
    }

    #[tokio::test]
    async fn test_close_sends_reset_request() {
        let (link, _streams, sender, _frames) = established(PpogLinkConfig::default()).await;
        link.close().await;
        assert_eq!(link.state(), LinkState::Closed);
        assert_eq!(
            sender.decoded().last().unwrap(),
            &PpogPacket::ResetRequest {
                sequence: 0,
                version: PpogVersion::One
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_responder_times_out_without_reset_request() {
        let sender = Arc::new(RecordingSender::default());
        let (_frames_tx, frames_rx) = mpsc::channel(4);
        let result =
            PpogLink::establish(PpogLinkConfig::default(), PpogRole::Responder, sender, frames_rx)
                .await;
        assert!(matches!(result, Err(ProtocolError::Timeout(_))));
    }
}
