// SPDX-License-Identifier: GPL-3.0-only

use tracing::{debug, error, info, warn};

use super::ThinPool;
use super::parser::{DeviceMap, parse_metadata};
use super::status::PoolStatus;
use crate::retry::RetryPolicy;
use crate::runner::{CommandLine, CommandRunner};
use crate::{Result, SysError};

/// Reserves and reads userspace snapshots of a pool's metadata device.
///
/// The kernel allows one outstanding reservation per pool, so callers must
/// serialize access per pool (see [`super::UsageCache`]).
pub struct MetadataSnapshot<'a> {
    runner: &'a dyn CommandRunner,
    pool: &'a ThinPool,
    policy: RetryPolicy,
}

/// A held metadata snapshot. Released on [`ReservedMetadata::release`] or drop.
pub struct ReservedMetadata<'a> {
    snapshot: MetadataSnapshot<'a>,
    block: u64,
    released: bool,
}

impl<'a> MetadataSnapshot<'a> {
    pub fn new(runner: &'a dyn CommandRunner, pool: &'a ThinPool, policy: RetryPolicy) -> Self {
        Self {
            runner,
            pool,
            policy,
        }
    }

    fn message(&self, message: &str) -> Result<()> {
        let command = CommandLine::new("dmsetup").args(["message", self.pool.name.as_str(), "0", message]);
        self.policy.run(message, || self.runner.run(&command)?.check().map(drop))
    }

    fn status(&self) -> Result<PoolStatus> {
        self.policy
            .run("dmsetup status", || PoolStatus::query(self.runner, &self.pool.name))
    }

    /// Block of a reservation left behind by an earlier holder, if any.
    pub fn held_block(&self) -> Result<Option<u64>> {
        Ok(self.status()?.held_metadata_root)
    }

    pub fn reserve(self) -> Result<ReservedMetadata<'a>> {
        if let Some(block) = self.held_block()? {
            warn!(pool = %self.pool.name, block, "releasing stale metadata snapshot");
            self.message("release_metadata_snap")?;
        }

        self.message("reserve_metadata_snap")?;
        // From here on the guard owns the reservation, even if the lookup fails.
        let mut reserved = ReservedMetadata {
            snapshot: self,
            block: 0,
            released: false,
        };
        reserved.block = reserved.snapshot.held_block()?.ok_or_else(|| {
            SysError::parse(format!(
                "{} reports no held metadata root after reserve",
                reserved.snapshot.pool.name
            ))
        })?;
        debug!(pool = %reserved.snapshot.pool.name, block = reserved.block, "reserved metadata snapshot");
        Ok(reserved)
    }

    /// Reserve, dump and release in one step.
    ///
    /// The reservation is always released. A failed release after a
    /// successful dump is logged only: the next reservation clears it.
    pub fn read_devices(self) -> Result<DeviceMap> {
        let reserved = self.reserve()?;
        let dumped = reserved.dump();
        let pool = reserved.snapshot.pool.name.clone();
        let released = reserved.release();

        let devices = dumped?;
        if let Err(err) = released {
            warn!(pool = %pool, "could not release metadata snapshot: {err}");
        }
        info!(pool = %pool, devices = devices.len(), "read thin pool metadata");
        Ok(devices)
    }
}

impl ReservedMetadata<'_> {
    pub fn block(&self) -> u64 {
        self.block
    }

    pub fn dump(&self) -> Result<DeviceMap> {
        let snapshot = &self.snapshot;
        let command = CommandLine::new("thin_dump").args([
            "-f".to_string(),
            "xml".to_string(),
            snapshot.pool.metadata_device.clone(),
            "-m".to_string(),
            self.block.to_string(),
        ]);
        let xml = snapshot
            .policy
            .run("thin_dump", || snapshot.runner.capture(&command))?;
        parse_metadata(xml.as_bytes())
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.snapshot.message("release_metadata_snap")
    }
}

impl Drop for ReservedMetadata<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.snapshot.message("release_metadata_snap") {
            error!(pool = %self.snapshot.pool.name, "metadata snapshot left reserved: {err}");
        }
    }
}
