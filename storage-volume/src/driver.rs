// SPDX-License-Identifier: GPL-3.0-only

use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use storage_sys::{CommandLine, CommandOutput, CommandRunner, SystemRunner, UsageCache};
use storage_types::{Capability, DriverType, SnapshotInfo, Status};
use tracing::debug;

use crate::config::VolumeConfig;
use crate::error::Result;

/// A storage backend rooted at one directory, handing out [`Volume`]s.
///
/// Backends that cannot perform an operation return
/// [`VolumeError::NotSupported`](crate::VolumeError::NotSupported);
/// [`Driver::supports`] answers the same question without side effects.
pub trait Driver: Send + Sync {
    fn root(&self) -> &Path;

    fn driver_type(&self) -> DriverType;

    /// Create a volume; fails with `VolumeExists` if it is already there.
    fn create(&self, name: &str) -> Result<Box<dyn Volume>>;

    fn get(&self, name: &str) -> Result<Box<dyn Volume>>;

    /// The tenant (base) volume owning `name`.
    fn get_tenant(&self, name: &str) -> Result<Box<dyn Volume>>;

    fn list(&self) -> Vec<String>;

    fn exists(&self, name: &str) -> bool;

    /// Let go of whatever keeps the volume attached (mounts, active devices).
    fn release(&self, name: &str) -> Result<()>;

    /// Destroy the volume and all of its snapshots.
    fn remove(&self, name: &str) -> Result<()>;

    fn resize(&self, name: &str, size: u64) -> Result<()>;

    fn status(&self) -> Result<Status>;

    /// Shut the driver down; called once before it is dropped by the registry.
    fn cleanup(&self) -> Result<()>;

    fn supports(&self, capability: Capability) -> bool;
}

/// A named volume and its snapshots.
///
/// Labels may be passed with or without the `<tenant>_` prefix; snapshot
/// listings always return the prefixed (raw) form.
pub trait Volume: Send + Sync {
    fn name(&self) -> &str;

    fn path(&self) -> &Path;

    fn driver(&self) -> &dyn Driver;

    fn tenant(&self) -> &str;

    /// Open a metadata file that travels with snapshot `label`.
    fn write_metadata(&self, label: &str, name: &str) -> Result<Box<dyn Write + Send>>;

    fn read_metadata(&self, label: &str, name: &str) -> Result<Box<dyn Read + Send>>;

    fn snapshot(&self, label: &str, message: &str, tags: &[String]) -> Result<()>;

    fn snapshot_info(&self, label: &str) -> Result<SnapshotInfo>;

    /// Raw snapshot labels, oldest first.
    fn snapshots(&self) -> Result<Vec<String>>;

    fn remove_snapshot(&self, label: &str) -> Result<()>;

    /// Replace the volume's contents with those of snapshot `label`.
    fn rollback(&self, label: &str) -> Result<()>;

    fn tag_snapshot(&self, label: &str, tag: &str) -> Result<()>;

    /// Remove `tag` from whichever snapshot carries it, returning that
    /// snapshot's label.
    fn untag_snapshot(&self, tag: &str) -> Result<String>;

    fn get_snapshot_with_tag(&self, tag: &str) -> Result<SnapshotInfo>;

    /// Stream snapshot `label`, optionally as a delta against `parent`.
    fn export(&self, label: &str, parent: &str, writer: &mut dyn Write) -> Result<()>;

    fn import(&self, label: &str, reader: &mut dyn Read) -> Result<()>;

    fn supports(&self, capability: Capability) -> bool {
        self.driver().supports(capability)
    }
}

/// Collaborators handed to every driver at initialization
#[derive(Clone)]
pub struct DriverContext {
    pub runner: Arc<dyn CommandRunner>,
    pub config: VolumeConfig,
    pub usage: Arc<UsageCache>,
}

impl Default for DriverContext {
    fn default() -> Self {
        Self::system(VolumeConfig::default())
    }
}

impl DriverContext {
    pub fn new(runner: Arc<dyn CommandRunner>, config: VolumeConfig) -> Self {
        let usage = UsageCache::new(config.stats_ttl()).with_retry(config.metadata_retry());
        Self {
            runner,
            config,
            usage: Arc::new(usage),
        }
    }

    /// Context running real processes.
    pub fn system(config: VolumeConfig) -> Self {
        let runner = Arc::new(SystemRunner::new(config.command_timeout()));
        Self::new(runner, config)
    }

    /// Run `command`, failing on a non-zero exit.
    pub(crate) fn run(&self, command: CommandLine) -> Result<CommandOutput> {
        Ok(self.run_unchecked(command)?.check()?)
    }

    /// Run `command`, leaving the exit status for the caller to inspect.
    pub(crate) fn run_unchecked(&self, command: CommandLine) -> Result<CommandOutput> {
        debug!(command = %command, "running");
        Ok(self.runner.run(&command)?)
    }
}

/// Constructor registered for a driver type
pub type DriverInit =
    Arc<dyn Fn(&DriverContext, &Path, &[String]) -> Result<Arc<dyn Driver>> + Send + Sync>;
