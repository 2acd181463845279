// SPDX-License-Identifier: GPL-3.0-only

//! Tunables shared by every driver

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use storage_sys::RetryPolicy;
use tracing::warn;

use crate::error::{Result, VolumeError};

/// Environment override for [`VolumeConfig::btrfs_rollback_timeout_secs`]
pub const BTRFS_ROLLBACK_TIMEOUT_ENV: &str = "SERVICED_BTRFS_ROLLBACK_TIMEOUT";

/// Floor for the btrfs rollback timeout, in seconds
pub const MIN_BTRFS_ROLLBACK_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// How long thin-pool block accounting stays cached
    pub stats_ttl_secs: u64,
    /// Deadline for subprocess calls that do not set their own
    pub command_timeout_secs: u64,
    pub rsync_snapshot_timeout_secs: u64,
    pub rsync_snapshot_attempts: u32,
    pub btrfs_rollback_timeout_secs: u64,
    /// Pause between attempts to delete a busy btrfs subvolume
    pub btrfs_busy_retry_secs: u64,
    pub metadata_retry_attempts: u32,
    pub metadata_retry_backoff_ms: u64,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            stats_ttl_secs: 300,
            command_timeout_secs: 120,
            rsync_snapshot_timeout_secs: 30,
            rsync_snapshot_attempts: 3,
            btrfs_rollback_timeout_secs: 300,
            btrfs_busy_retry_secs: 5,
            metadata_retry_attempts: 3,
            metadata_retry_backoff_ms: 500,
        }
    }
}

impl VolumeConfig {
    /// Load from a TOML file; missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|error| VolumeError::InvalidConfig {
            path: path.to_path_buf(),
            reason: error.to_string(),
        })
    }

    pub fn stats_ttl(&self) -> Duration {
        Duration::from_secs(self.stats_ttl_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn rsync_snapshot_timeout(&self) -> Duration {
        Duration::from_secs(self.rsync_snapshot_timeout_secs)
    }

    pub fn btrfs_busy_retry(&self) -> Duration {
        Duration::from_secs(self.btrfs_busy_retry_secs)
    }

    pub fn metadata_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.metadata_retry_attempts,
            Duration::from_millis(self.metadata_retry_backoff_ms),
        )
    }

    /// Rollback deadline, honouring [`BTRFS_ROLLBACK_TIMEOUT_ENV`].
    pub fn btrfs_rollback_timeout(&self) -> Duration {
        let configured = self
            .btrfs_rollback_timeout_secs
            .max(MIN_BTRFS_ROLLBACK_TIMEOUT_SECS);
        let secs = match std::env::var(BTRFS_ROLLBACK_TIMEOUT_ENV) {
            Ok(value) => rollback_timeout_override(&value, configured),
            Err(_) => configured,
        };
        Duration::from_secs(secs)
    }
}

fn rollback_timeout_override(value: &str, configured: u64) -> u64 {
    match value.trim().parse::<u64>() {
        Ok(secs) if secs >= MIN_BTRFS_ROLLBACK_TIMEOUT_SECS => secs,
        Ok(secs) => {
            warn!(
                secs,
                minimum = MIN_BTRFS_ROLLBACK_TIMEOUT_SECS,
                "{BTRFS_ROLLBACK_TIMEOUT_ENV} is below the minimum; ignoring it"
            );
            configured
        }
        Err(_) => {
            warn!(
                value,
                "{BTRFS_ROLLBACK_TIMEOUT_ENV} is not a number of seconds; using the minimum"
            );
            MIN_BTRFS_ROLLBACK_TIMEOUT_SECS
        }
    }
}
