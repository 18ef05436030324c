//! Session Negotiation
//!
//! Once a byte stream is up the watch speaks first: it asks for the phone
//! app version, we answer with our capabilities, then ask for its version
//! and set its clock.

use crate::config::NegotiationConfig;
use crate::services::system::{
    PhoneAppVersion, SetUtc, SystemService, WatchInfo, PHONE_PROTOCOL_VERSION,
    PHONE_RESPONSE_VERSION,
};
use crate::{ProtocolError, Result};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

/// Runs the negotiation exchange on a fresh connection
#[derive(Debug, Clone)]
pub struct Negotiator {
    config: NegotiationConfig,
}

impl Negotiator {
    pub fn new(config: NegotiationConfig) -> Self {
        Self { config }
    }

    /// Our answer to the watch's app version request
    pub fn phone_app_version(&self) -> PhoneAppVersion {
        PhoneAppVersion {
            protocol_version: PHONE_PROTOCOL_VERSION,
            session_capabilities: 0,
            platform_flags: self.config.platform_flags,
            response_version: PHONE_RESPONSE_VERSION,
            major: self.config.app_version_major,
            minor: self.config.app_version_minor,
            bugfix: self.config.app_version_bugfix,
            capabilities: self.config.capabilities.clone(),
        }
    }

    /// Negotiate within the configured timeout
    pub async fn negotiate(&self, system: &SystemService) -> Result<WatchInfo> {
        let limit = Duration::from_secs(self.config.timeout_secs);
        match timeout(limit, self.exchange(system)).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Timeout("negotiation".to_string())),
        }
    }

    async fn exchange(&self, system: &SystemService) -> Result<WatchInfo> {
        system.await_app_version_request().await?;
        system
            .send_phone_version_response(&self.phone_app_version())
            .await?;
        debug!("Sent phone app version, requesting watch version");

        let watch_info = system.request_watch_version().await?;
        system.send_time(&SetUtc::now()).await?;

        info!(
            "Negotiated with {} running {}{}",
            watch_info.serial,
            watch_info.running,
            if watch_info.in_recovery_mode() {
                " (recovery)"
            } else {
                ""
            }
        );
        Ok(watch_info)
    }
}
