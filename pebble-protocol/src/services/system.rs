//! System Services
//!
//! The handful of system endpoints used while negotiating a connection:
//! phone app version (endpoint 17), watch version (16), time (11) and
//! ping (2001). All multi-byte fields are big-endian.

use crate::packet::{ByteReader, Endpoint, PebblePacket};
use crate::protocol_handler::{PacketSender, ProtocolHandler};
use crate::{ProtocolError, Result};
use chrono::{DateTime, Local, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

const PHONE_VERSION_REQUEST: u8 = 0x00;
const PHONE_VERSION_RESPONSE: u8 = 0x01;
const WATCH_VERSION_REQUEST: u8 = 0x00;
const WATCH_VERSION_RESPONSE: u8 = 0x01;
const TIME_SET_UTC: u8 = 0x03;
const PING: u8 = 0x00;
const PONG: u8 = 0x01;

/// Protocol version we claim in the phone version response
pub const PHONE_PROTOCOL_VERSION: u32 = 0xFFFF_FFFF;

/// Version of the phone version response layout
pub const PHONE_RESPONSE_VERSION: u8 = 2;

/// Size of one firmware version record in the watch version response
const FIRMWARE_RECORD_SIZE: usize = 47;

/// Protocol extension flags exchanged during negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolCapability {
    AppRunState,
    InfiniteLogDump,
    ExtendedMusic,
    ExtendedNotifications,
    LanguagePacks,
    AppMessage8k,
    HealthInsights,
    AppDictation,
    UnreadCoreDump,
    WeatherApp,
    Reminders,
    Workout,
    SmoothFirmwareInstallProgress,
    FirmwareUpdateAcrossDisconnection,
}

impl ProtocolCapability {
    pub const ALL: [ProtocolCapability; 14] = [
        ProtocolCapability::AppRunState,
        ProtocolCapability::InfiniteLogDump,
        ProtocolCapability::ExtendedMusic,
        ProtocolCapability::ExtendedNotifications,
        ProtocolCapability::LanguagePacks,
        ProtocolCapability::AppMessage8k,
        ProtocolCapability::HealthInsights,
        ProtocolCapability::AppDictation,
        ProtocolCapability::UnreadCoreDump,
        ProtocolCapability::WeatherApp,
        ProtocolCapability::Reminders,
        ProtocolCapability::Workout,
        ProtocolCapability::SmoothFirmwareInstallProgress,
        ProtocolCapability::FirmwareUpdateAcrossDisconnection,
    ];

    /// Bit index in the 8-byte capability field
    pub fn bit(self) -> u8 {
        match self {
            ProtocolCapability::AppRunState => 0,
            ProtocolCapability::InfiniteLogDump => 1,
            ProtocolCapability::ExtendedMusic => 2,
            ProtocolCapability::ExtendedNotifications => 3,
            ProtocolCapability::LanguagePacks => 4,
            ProtocolCapability::AppMessage8k => 5,
            ProtocolCapability::HealthInsights => 6,
            ProtocolCapability::AppDictation => 7,
            ProtocolCapability::UnreadCoreDump => 8,
            ProtocolCapability::WeatherApp => 9,
            ProtocolCapability::Reminders => 10,
            ProtocolCapability::Workout => 11,
            ProtocolCapability::SmoothFirmwareInstallProgress => 12,
            ProtocolCapability::FirmwareUpdateAcrossDisconnection => 21,
        }
    }

    pub fn encode(capabilities: &[ProtocolCapability]) -> [u8; 8] {
        let mut out = [0u8; 8];
        for capability in capabilities {
            let bit = capability.bit();
            out[(bit / 8) as usize] |= 1 << (bit % 8);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Vec<ProtocolCapability> {
        Self::ALL
            .into_iter()
            .filter(|capability| {
                let bit = capability.bit();
                bytes
                    .get((bit / 8) as usize)
                    .is_some_and(|byte| byte & (1 << (bit % 8)) != 0)
            })
            .collect()
    }
}

/// What the phone tells the watch about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneAppVersion {
    pub protocol_version: u32,
    pub session_capabilities: u32,
    pub platform_flags: u32,
    pub response_version: u8,
    pub major: u8,
    pub minor: u8,
    pub bugfix: u8,
    pub capabilities: Vec<ProtocolCapability>,
}

impl PhoneAppVersion {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(25);
        out.push(PHONE_VERSION_RESPONSE);
        out.extend_from_slice(&self.protocol_version.to_be_bytes());
        out.extend_from_slice(&self.session_capabilities.to_be_bytes());
        out.extend_from_slice(&self.platform_flags.to_be_bytes());
        out.push(self.response_version);
        out.push(self.major);
        out.push(self.minor);
        out.push(self.bugfix);
        out.extend_from_slice(&ProtocolCapability::encode(&self.capabilities));
        out
    }
}

fn firmware_tag_regex() -> Option<&'static Regex> {
    static REGEX: OnceLock<Option<Regex>> = OnceLock::new();
    REGEX
        .get_or_init(|| Regex::new(r"v?([0-9]+)\.([0-9]+)\.([0-9]+)(?:-(.*))?").ok())
        .as_ref()
}

/// One firmware image as described by the watch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub tag: String,
    pub timestamp: DateTime<Utc>,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub suffix: Option<String>,
    pub git_hash: String,
    pub is_recovery: bool,
    pub hardware_platform: u8,
    pub metadata_version: u8,
}

impl FirmwareVersion {
    /// Split a version tag such as `v4.4.2-rc1` into its numeric parts
    pub fn parse_tag(tag: &str) -> Option<(u32, u32, u32, Option<String>)> {
        let captures = firmware_tag_regex()?.captures(tag)?;
        let major = captures.get(1)?.as_str().parse().ok()?;
        let minor = captures.get(2)?.as_str().parse().ok()?;
        let patch = captures.get(3)?.as_str().parse().ok()?;
        let suffix = captures
            .get(4)
            .map(|m| m.as_str().to_string())
            .filter(|s| !s.is_empty());
        Some((major, minor, patch, suffix))
    }

    /// Decode a 47-byte firmware record; `None` when the tag is unparseable (absent image)
    fn read(reader: &mut ByteReader<'_>) -> Result<Option<Self>> {
        let timestamp = reader.u32_be()?;
        let tag = reader.fixed_str(32)?;
        let git_hash = reader.fixed_str(8)?;
        let is_recovery = reader.u8()? != 0;
        let hardware_platform = reader.u8()?;
        let metadata_version = reader.u8()?;

        let Some((major, minor, patch, suffix)) = Self::parse_tag(&tag) else {
            if !tag.is_empty() {
                warn!("Couldn't decode firmware version '{}'", tag);
            }
            return Ok(None);
        };
        Ok(Some(Self {
            timestamp: Utc
                .timestamp_opt(timestamp as i64, 0)
                .single()
                .unwrap_or_default(),
            tag,
            major,
            minor,
            patch,
            suffix,
            git_hash,
            is_recovery,
            hardware_platform,
            metadata_version,
        }))
    }

    pub fn is_older_than(&self, major: u32, minor: u32, patch: u32) -> bool {
        (self.major, self.minor, self.patch) < (major, minor, patch)
    }
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(suffix) = &self.suffix {
            write!(f, "-{}", suffix)?;
        }
        Ok(())
    }
}

/// Watch metadata from the watch version response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchInfo {
    pub running: FirmwareVersion,
    pub recovery: Option<FirmwareVersion>,
    pub bootloader_timestamp: DateTime<Utc>,
    pub board: String,
    pub serial: String,
    pub bt_address: String,
    pub resource_crc: u32,
    pub resource_timestamp: DateTime<Utc>,
    pub language: String,
    pub language_version: u16,
    pub capabilities: Vec<ProtocolCapability>,
    pub is_unfaithful: Option<bool>,
    pub health_insights_version: Option<u16>,
    pub javascript_version: Option<u16>,
}

impl WatchInfo {
    /// Decode the payload of a watch version response (command byte included)
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(payload);
        let command = reader.u8()?;
        if command != WATCH_VERSION_RESPONSE {
            return Err(ProtocolError::InvalidPacket(format!(
                "expected watch version response, got command {:#04x}",
                command
            )));
        }
        if reader.remaining() < 2 * FIRMWARE_RECORD_SIZE {
            return Err(ProtocolError::InvalidPacket(
                "watch version response too short".to_string(),
            ));
        }
        let running = FirmwareVersion::read(&mut reader)?.ok_or_else(|| {
            ProtocolError::InvalidPacket("running firmware version unparseable".to_string())
        })?;
        let recovery = FirmwareVersion::read(&mut reader)?;
        let bootloader_timestamp = reader.u32_be()?;
        let board = reader.fixed_str(9)?;
        let serial = reader.fixed_str(12)?;
        let bt_address = reader
            .take(6)?
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":");
        let resource_crc = reader.u32_be()?;
        let resource_timestamp = reader.u32_be()?;
        let language = reader.fixed_str(6)?;
        let language_version = reader.u16_be()?;
        let capabilities = ProtocolCapability::decode(reader.take(8)?);

        // Trailing fields were added in later firmwares
        let is_unfaithful = if reader.remaining() >= 1 {
            Some(reader.u8()? != 0)
        } else {
            None
        };
        let health_insights_version = if reader.remaining() >= 2 {
            Some(reader.u16_be()?)
        } else {
            None
        };
        let javascript_version = if reader.remaining() >= 2 {
            Some(reader.u16_be()?)
        } else {
            None
        };

        Ok(Self {
            running,
            recovery,
            bootloader_timestamp: epoch(bootloader_timestamp),
            board,
            serial,
            bt_address,
            resource_crc,
            resource_timestamp: epoch(resource_timestamp),
            language,
            language_version,
            capabilities,
            is_unfaithful,
            health_insights_version,
            javascript_version,
        })
    }

    /// Recovery firmware (PRF) is running, or the watch is too old for normal sessions
    pub fn in_recovery_mode(&self) -> bool {
        self.running.is_recovery || self.recovery.is_none() || self.running.is_older_than(3, 0, 0)
    }
}

fn epoch(seconds: u32) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds as i64, 0)
        .single()
        .unwrap_or_default()
}

/// Time endpoint `SetUTC` message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetUtc {
    pub unix_time: u32,
    pub utc_offset_minutes: i16,
    pub tz_name: String,
}

impl SetUtc {
    pub fn new(now: DateTime<Utc>, utc_offset_minutes: i16, tz_name: &str) -> Self {
        Self {
            unix_time: now.timestamp().clamp(0, u32::MAX as i64) as u32,
            utc_offset_minutes,
            tz_name: tz_name.to_string(),
        }
    }

    /// The host clock and offset
    pub fn now() -> Self {
        let now = Local::now();
        let offset_minutes = (now.offset().local_minus_utc() / 60) as i16;
        let tz_name = std::env::var("TZ").unwrap_or_else(|_| now.format("%:z").to_string());
        Self::new(now.with_timezone(&Utc), offset_minutes, &tz_name)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut end = self.tz_name.len().min(u8::MAX as usize);
        while !self.tz_name.is_char_boundary(end) {
            end -= 1;
        }
        let name = self.tz_name[..end].as_bytes();
        let mut out = Vec::with_capacity(8 + name.len());
        out.push(TIME_SET_UTC);
        out.extend_from_slice(&self.unix_time.to_be_bytes());
        out.extend_from_slice(&self.utc_offset_minutes.to_be_bytes());
        out.push(name.len() as u8);
        out.extend_from_slice(name);
        out
    }
}

/// System endpoints of one connection
#[derive(Debug)]
pub struct SystemService {
    sender: PacketSender,
    phone_version: Mutex<mpsc::UnboundedReceiver<PebblePacket>>,
    watch_version: Mutex<mpsc::UnboundedReceiver<PebblePacket>>,
    ping: Mutex<mpsc::UnboundedReceiver<PebblePacket>>,
}

impl SystemService {
    pub fn new(handler: &ProtocolHandler) -> Self {
        Self {
            sender: handler.sender(),
            phone_version: Mutex::new(handler.register(Endpoint::PHONE_VERSION)),
            watch_version: Mutex::new(handler.register(Endpoint::VERSION)),
            ping: Mutex::new(handler.register(Endpoint::PING)),
        }
    }

    /// Wait for the watch to ask who we are; it opens every negotiation
    pub async fn await_app_version_request(&self) -> Result<()> {
        let mut rx = self.phone_version.lock().await;
        loop {
            let packet = rx.recv().await.ok_or_else(closed)?;
            match packet.payload.first() {
                Some(&PHONE_VERSION_REQUEST) => {
                    debug!("{}: app version request", self.sender.identifier());
                    return Ok(());
                }
                other => debug!("Ignoring phone version command {:?}", other),
            }
        }
    }

    pub async fn send_phone_version_response(&self, version: &PhoneAppVersion) -> Result<()> {
        self.sender
            .send(PebblePacket::new(Endpoint::PHONE_VERSION, version.encode()))
            .await
    }

    pub async fn request_watch_version(&self) -> Result<WatchInfo> {
        let mut rx = self.watch_version.lock().await;
        self.sender
            .send(PebblePacket::new(
                Endpoint::VERSION,
                vec![WATCH_VERSION_REQUEST],
            ))
            .await?;
        loop {
            let packet = rx.recv().await.ok_or_else(closed)?;
            if packet.payload.first() != Some(&WATCH_VERSION_RESPONSE) {
                continue;
            }
            let info = WatchInfo::decode(&packet.payload)?;
            info!(
                "{}: firmware {} ({}), serial {}",
                self.sender.identifier(),
                info.running,
                info.board,
                info.serial
            );
            return Ok(info);
        }
    }

    pub async fn send_time(&self, time: &SetUtc) -> Result<()> {
        debug!(
            "{}: setting time {} offset {}",
            self.sender.identifier(),
            time.unix_time,
            time.utc_offset_minutes
        );
        self.sender
            .send(PebblePacket::new(Endpoint::TIME, time.encode()))
            .await
    }

    /// Ping the watch and return the cookie echoed in its pong
    pub async fn ping(&self, cookie: u32) -> Result<u32> {
        let mut rx = self.ping.lock().await;
        let mut payload = vec![PING];
        payload.extend_from_slice(&cookie.to_be_bytes());
        self.sender
            .send(PebblePacket::new(Endpoint::PING, payload))
            .await?;
        loop {
            let packet = rx.recv().await.ok_or_else(closed)?;
            let mut reader = ByteReader::new(&packet.payload);
            match reader.u8()? {
                PONG => return reader.u32_be(),
                PING => {
                    // Watch pinged us while we wait; answer it
                    let echoed = reader.u32_be()?;
                    let mut pong = vec![PONG];
                    pong.extend_from_slice(&echoed.to_be_bytes());
                    self.sender
                        .send(PebblePacket::new(Endpoint::PING, pong))
                        .await?;
                }
                other => debug!("Ignoring ping command {:#04x}", other),
            }
        }
    }
}

fn closed() -> ProtocolError {
    ProtocolError::Cancelled("connection closed".to_string())
}
