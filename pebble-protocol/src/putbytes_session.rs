//! PutBytes Transfer Sessions
//!
//! Pushes one object (app binary, resources, firmware, file) to the watch:
//! `Init` obtains a cookie, the data follows in acknowledged `Put` chunks,
//! then `Commit` carries the CRC of exactly the bytes sent and `Install`
//! finalizes the object.
//!
//! Only one session runs per connection; the watch appends every chunk to
//! a single buffer, so a second caller fails fast with
//! [`ProtocolError::SessionBusy`] instead of queueing.

use crate::config::PutBytesConfig;
use crate::crc32::Stm32Crc32;
use crate::packet::{Endpoint, PebblePacket};
use crate::protocol_handler::PacketSender;
use crate::services::putbytes::{ObjectType, PutBytesRequest, PutBytesService};
use crate::{ProtocolError, Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Where the watch should store the object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutBytesTarget {
    /// Part of an installed app
    App { app_id: u32 },
    /// Firmware, resources or a named file in a storage bank
    Bank { bank: u8, filename: String },
}

/// Description of one transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutBytesTransfer {
    pub size: u32,
    pub object_type: ObjectType,
    pub target: PutBytesTarget,
    /// Checksum the object must have; checked before committing
    pub expected_crc: Option<u32>,
}

/// Transfer progress after each acknowledged chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutBytesProgress {
    pub count: u32,
    pub total: u32,
    pub delta: u32,
    pub cookie: u32,
}

/// Per-connection PutBytes sessions
#[derive(Debug)]
pub struct PutBytesSession {
    service: PutBytesService,
    config: PutBytesConfig,
    lock: Mutex<()>,
}

impl PutBytesSession {
    pub fn new(service: PutBytesService, config: PutBytesConfig) -> Self {
        Self {
            service,
            config,
            lock: Mutex::new(()),
        }
    }

    /// Whether a transfer is running right now
    pub fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    /// Send part of an app; returns the cookie the watch issued
    pub async fn begin_app_session<R>(
        &self,
        app_id: u32,
        size: u32,
        object_type: ObjectType,
        source: R,
        progress: Option<mpsc::Sender<PutBytesProgress>>,
    ) -> Result<u32>
    where
        R: AsyncRead + Unpin + Send,
    {
        let transfer = PutBytesTransfer {
            size,
            object_type,
            target: PutBytesTarget::App { app_id },
            expected_crc: None,
        };
        self.transfer(transfer, source, progress).await
    }

    /// Send firmware, system resources or a file into `bank`
    pub async fn begin_session<R>(
        &self,
        size: u32,
        object_type: ObjectType,
        bank: u8,
        filename: &str,
        source: R,
        progress: Option<mpsc::Sender<PutBytesProgress>>,
    ) -> Result<u32>
    where
        R: AsyncRead + Unpin + Send,
    {
        let transfer = PutBytesTransfer {
            size,
            object_type,
            target: PutBytesTarget::Bank {
                bank,
                filename: filename.to_string(),
            },
            expected_crc: None,
        };
        self.transfer(transfer, source, progress).await
    }

    /// Run a full transfer
    ///
    /// On any failure after the watch issued a cookie, `Abort` is sent
    /// before the error is returned. Dropping the future mid-transfer sends
    /// `Abort` best-effort.
    pub async fn transfer<R>(
        &self,
        transfer: PutBytesTransfer,
        mut source: R,
        progress: Option<mpsc::Sender<PutBytesProgress>>,
    ) -> Result<u32>
    where
        R: AsyncRead + Unpin + Send,
    {
        let _guard = self.lock.try_lock().map_err(|_| ProtocolError::SessionBusy)?;
        let mut abort = AbortOnDrop {
            sender: self.service.sender(),
            cookie: None,
        };

        let result = self
            .run(&transfer, &mut source, progress.as_ref(), &mut abort)
            .await;

        match &result {
            Ok(cookie) => info!(
                "{}: PutBytes {:?} complete ({} bytes, cookie {:#010x})",
                self.service.identifier(),
                transfer.object_type,
                transfer.size,
                cookie
            ),
            Err(e) => {
                warn!(
                    "{}: PutBytes {:?} failed: {}",
                    self.service.identifier(),
                    transfer.object_type,
                    e
                );
                if let Some(cookie) = abort.cookie.take() {
                    if let Err(e) = self.service.send(PutBytesRequest::Abort { cookie }).await {
                        debug!("Abort not sent: {}", e);
                    }
                }
            }
        }
        result
    }

    async fn run<R>(
        &self,
        transfer: &PutBytesTransfer,
        source: &mut R,
        progress: Option<&mpsc::Sender<PutBytesProgress>>,
        abort: &mut AbortOnDrop,
    ) -> Result<u32>
    where
        R: AsyncRead + Unpin + Send,
    {
        let wait = Duration::from_secs(self.config.response_timeout_secs);
        let init = match &transfer.target {
            PutBytesTarget::App { app_id } => PutBytesRequest::AppInit {
                size: transfer.size,
                object_type: transfer.object_type,
                app_id: *app_id,
            },
            PutBytesTarget::Bank { bank, filename } => PutBytesRequest::Init {
                size: transfer.size,
                object_type: transfer.object_type,
                bank: *bank,
                filename: filename.clone(),
            },
        };
        let cookie = self.service.send_and_wait(init, wait).await?.cookie;
        abort.cookie = Some(cookie);
        debug!(
            "{}: PutBytes session {:#010x} for {} bytes",
            self.service.identifier(),
            cookie,
            transfer.size
        );

        let mut crc = Stm32Crc32::new();
        let mut sent: u32 = 0;
        let mut buffer = vec![0u8; self.config.chunk_size.max(1)];

        while sent < transfer.size {
            let want = buffer.len().min((transfer.size - sent) as usize);
            let read = source.read(&mut buffer[..want]).await?;
            if read == 0 {
                return Err(ProtocolError::InvalidState(format!(
                    "source ended after {} of {} bytes",
                    sent, transfer.size
                )));
            }
            let chunk = buffer[..read].to_vec();
            crc.update(&chunk);

            let response = self
                .service
                .send_and_wait(PutBytesRequest::Put { cookie, data: chunk }, wait)
                .await?;
            check_cookie(cookie, response.cookie)?;

            sent += read as u32;
            if let Some(progress) = progress {
                let _ = progress
                    .send(PutBytesProgress {
                        count: sent,
                        total: transfer.size,
                        delta: read as u32,
                        cookie,
                    })
                    .await;
            }
        }

        let crc = crc.finalize();
        if let Some(expected) = transfer.expected_crc {
            if expected != crc {
                return Err(ProtocolError::CrcMismatch {
                    expected,
                    actual: crc,
                });
            }
        }

        let response = self
            .service
            .send_and_wait(PutBytesRequest::Commit { cookie, crc }, wait)
            .await?;
        check_cookie(cookie, response.cookie)?;

        let response = self
            .service
            .send_and_wait(PutBytesRequest::Install { cookie }, wait)
            .await?;
        check_cookie(cookie, response.cookie)?;

        abort.cookie = None;
        Ok(cookie)
    }
}

fn check_cookie(expected: u32, actual: u32) -> Result<()> {
    if expected != actual {
        return Err(ProtocolError::CookieMismatch { expected, actual });
    }
    Ok(())
}

/// Sends `Abort` for a session whose future was dropped mid-transfer
struct AbortOnDrop {
    sender: PacketSender,
    cookie: Option<u32>,
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        let Some(cookie) = self.cookie.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let sender = self.sender.clone();
        runtime.spawn(async move {
            let packet = PebblePacket::new(
                Endpoint::PUT_BYTES,
                PutBytesRequest::Abort { cookie }.encode(),
            );
            let _ = sender.send(packet).await;
        });
    }
}
