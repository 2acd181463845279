// SPDX-License-Identifier: GPL-3.0-only

//! Device-mapper thin-pool accounting
//!
//! Per-device block ownership is read from a userspace snapshot of the pool
//! metadata, so the pool keeps serving I/O while it is inspected:
//!
//! 1. [`MetadataSnapshot`] reserves the metadata snapshot and finds the block
//!    it is exposed at through `dmsetup status`
//! 2. `thin_dump` renders the snapshot as XML, which [`parse_metadata`] folds
//!    into one balanced interval set per thin device
//! 3. the reservation is released whether or not the dump succeeded
//!
//! [`UsageCache`] wraps the sequence with a TTL and a per-pool lock.

mod cache;
mod parser;
mod snapshot;
mod status;

pub use cache::UsageCache;
pub use parser::{DeviceBlocks, DeviceMap, parse_metadata, snapshot_unique_blocks};
pub use snapshot::{MetadataSnapshot, ReservedMetadata};
pub use status::{METADATA_BLOCK_SIZE, PoolStatus, PoolTable, SECTOR_SIZE};

const MAPPER_DIR: &str = "/dev/mapper/";

/// Canonical `/dev/mapper/<name>` form of a pool or thin device name.
pub fn mapper_path(name: &str) -> String {
    format!("{MAPPER_DIR}{}", name.trim_start_matches(MAPPER_DIR))
}

/// A thin pool and the devices backing it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThinPool {
    /// Always in `/dev/mapper/<name>` form
    pub name: String,
    pub metadata_device: String,
    pub data_device: String,
}

impl ThinPool {
    pub fn new(
        name: &str,
        metadata_device: impl Into<String>,
        data_device: impl Into<String>,
    ) -> Self {
        Self {
            name: mapper_path(name),
            metadata_device: metadata_device.into(),
            data_device: data_device.into(),
        }
    }

    /// Name as known to `dmsetup create`, without the mapper directory.
    pub fn device_name(&self) -> &str {
        self.name.trim_start_matches(MAPPER_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_names_normalize_to_mapper_paths() {
        let bare = ThinPool::new("docker-thinpool", "/dev/vg/meta", "/dev/vg/data");
        let full = ThinPool::new("/dev/mapper/docker-thinpool", "/dev/vg/meta", "/dev/vg/data");

        assert_eq!(bare, full);
        assert_eq!(bare.name, "/dev/mapper/docker-thinpool");
        assert_eq!(bare.device_name(), "docker-thinpool");
    }
}
