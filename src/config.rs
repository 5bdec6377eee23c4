use anyhow::{Context, Result};
use log::warn;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// UDP port presence announcements are broadcast on.
pub const DISCOVERY_PORT: u16 = 50000;
/// TCP port file requests are served on.
pub const TRANSFER_PORT: u16 = 50010;
/// Size of the segments a file is streamed in.
pub const SEGMENT_SIZE: usize = 4096;
/// Exact payload of a presence announcement.
pub const DISCOVERY_TOKEN: &[u8] = b"CNL_DISCOVERY";
/// Leading bytes of a server response that signals failure instead of file data.
pub const ERROR_MARKER: &[u8] = b"ERROR";
/// How often the beacon announces this node.
pub const BEACON_INTERVAL: Duration = Duration::from_secs(5);
/// Directory served to peers when none is configured.
pub const DEFAULT_SHARED_DIR: &str = "shared";
/// Prefix prepended to the original name when a fetched file is saved.
pub const DOWNLOAD_PREFIX: &str = "downloaded-";

/// Runtime configuration for a share node.
#[derive(Debug, Clone)]
pub struct ShareConfig {
    pub discovery_port: u16,
    pub transfer_port: u16,
    pub shared_dir: PathBuf,
    pub download_prefix: String,
    pub beacon_interval: Duration,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            discovery_port: DISCOVERY_PORT,
            transfer_port: TRANSFER_PORT,
            shared_dir: PathBuf::from(DEFAULT_SHARED_DIR),
            download_prefix: DOWNLOAD_PREFIX.to_string(),
            beacon_interval: BEACON_INTERVAL,
        }
    }
}

impl ShareConfig {
    /// Build a config from environment variables, falling back to the
    /// protocol defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            discovery_port: env_port("DISCOVERY_PORT", defaults.discovery_port),
            transfer_port: env_port("TRANSFER_PORT", defaults.transfer_port),
            shared_dir: env::var("SHARE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.shared_dir),
            download_prefix: env::var("DOWNLOAD_PREFIX").unwrap_or(defaults.download_prefix),
            beacon_interval: defaults.beacon_interval,
        }
    }

    /// Create the shared directory if it does not exist yet.
    pub fn ensure_shared_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.shared_dir).with_context(|| {
            format!(
                "failed to create shared directory {}",
                self.shared_dir.display()
            )
        })
    }
}

fn env_port(key: &str, fallback: u16) -> u16 {
    match env::var(key) {
        Ok(value) => value.parse().unwrap_or_else(|_| {
            warn!("ignoring invalid {}={}", key, value);
            fallback
        }),
        Err(_) => fallback,
    }
}
