//! JSON state files
//!
//! Small helpers shared by the persisted stores (known watches, BlobDB sync
//! rows). Files are rewritten whole through a temporary sibling and a rename.

use crate::{ProtocolError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Directory for persisted protocol state (`<data_dir>/pebble`)
pub fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pebble")
}

/// Read a JSON file; `None` when it does not exist yet
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !fs::try_exists(path).await.unwrap_or(false) {
        debug!("No state file at {}, starting fresh", path.display());
        return Ok(None);
    }
    let json = fs::read_to_string(path)
        .await
        .map_err(|e| ProtocolError::from_io_error(e, &format!("reading {}", path.display())))?;
    Ok(Some(serde_json::from_str(&json)?))
}

pub async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(|e| {
            ProtocolError::from_io_error(e, &format!("creating directory {}", parent.display()))
        })?;
    }

    let temp = path.with_extension("json.tmp");
    fs::write(&temp, json)
        .await
        .map_err(|e| ProtocolError::from_io_error(e, &format!("writing {}", temp.display())))?;
    fs::rename(&temp, path)
        .await
        .map_err(|e| ProtocolError::from_io_error(e, &format!("replacing {}", path.display())))?;
    Ok(())
}
