// SPDX-License-Identifier: GPL-3.0-only

//! Passthrough backend over a directory shared by a network filesystem
//!
//! Volumes are subdirectories of an existing root. Snapshots and every
//! other mutation belong to the host exporting the share, so they are not
//! supported here. Mounting the share itself is left to the host.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use storage_types::{Capability, DriverType, SnapshotInfo, Status};
use tracing::debug;

use crate::driver::{Driver, DriverContext, Volume};
use crate::error::{Result, VolumeError};
use crate::snapshot::tenant_of;

/// Driver argument disabling network mounts
pub const NETWORK_DISABLED: &str = "network_disabled";

fn unsupported<T>(capability: Capability) -> Result<T> {
    Err(VolumeError::not_supported(DriverType::Nfs, capability))
}

#[derive(Clone)]
pub struct NfsDriver {
    inner: Arc<Shared>,
}

struct Shared {
    root: PathBuf,
    network_disabled: bool,
}

impl NfsDriver {
    pub fn new(root: &Path, args: &[String]) -> Result<Self> {
        if !fs::metadata(root)?.is_dir() {
            return Err(VolumeError::NotADirectory(root.to_path_buf()));
        }
        let network_disabled = args.iter().any(|arg| arg == NETWORK_DISABLED);
        debug!(root = %root.display(), network_disabled, "nfs driver root");
        Ok(Self {
            inner: Arc::new(Shared {
                root: root.to_path_buf(),
                network_disabled,
            }),
        })
    }

    pub fn init(_context: &DriverContext, root: &Path, args: &[String]) -> Result<Arc<dyn Driver>> {
        Ok(Arc::new(Self::new(root, args)?))
    }

    pub fn network_disabled(&self) -> bool {
        self.inner.network_disabled
    }
}

impl Driver for NfsDriver {
    fn root(&self) -> &Path {
        &self.inner.root
    }

    fn driver_type(&self) -> DriverType {
        DriverType::Nfs
    }

    fn create(&self, _name: &str) -> Result<Box<dyn Volume>> {
        unsupported(Capability::Create)
    }

    fn get(&self, name: &str) -> Result<Box<dyn Volume>> {
        Ok(Box::new(NfsVolume {
            driver: self.clone(),
            name: name.to_string(),
            path: self.inner.root.join(name),
            tenant: tenant_of(name).to_string(),
        }))
    }

    /// There are no snapshots, so there is no tenant volume to resolve.
    fn get_tenant(&self, _name: &str) -> Result<Box<dyn Volume>> {
        unsupported(Capability::Snapshot)
    }

    fn list(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.inner.root) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_dir()))
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    fn exists(&self, name: &str) -> bool {
        self.inner.root.join(name).is_dir()
    }

    fn release(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    fn remove(&self, _name: &str) -> Result<()> {
        unsupported(Capability::Remove)
    }

    fn resize(&self, _name: &str, _size: u64) -> Result<()> {
        unsupported(Capability::Resize)
    }

    fn status(&self) -> Result<Status> {
        unsupported(Capability::Status)
    }

    fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    fn supports(&self, _capability: Capability) -> bool {
        false
    }
}

pub struct NfsVolume {
    driver: NfsDriver,
    name: String,
    path: PathBuf,
    tenant: String,
}

impl Volume for NfsVolume {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn driver(&self) -> &dyn Driver {
        &self.driver
    }

    fn tenant(&self) -> &str {
        &self.tenant
    }

    fn write_metadata(&self, _label: &str, _name: &str) -> Result<Box<dyn Write + Send>> {
        unsupported(Capability::Metadata)
    }

    fn read_metadata(&self, _label: &str, _name: &str) -> Result<Box<dyn Read + Send>> {
        unsupported(Capability::Metadata)
    }

    fn snapshot(&self, _label: &str, _message: &str, _tags: &[String]) -> Result<()> {
        unsupported(Capability::Snapshot)
    }

    fn snapshot_info(&self, _label: &str) -> Result<SnapshotInfo> {
        unsupported(Capability::Snapshot)
    }

    fn snapshots(&self) -> Result<Vec<String>> {
        unsupported(Capability::Snapshot)
    }

    fn remove_snapshot(&self, _label: &str) -> Result<()> {
        unsupported(Capability::Snapshot)
    }

    fn rollback(&self, _label: &str) -> Result<()> {
        unsupported(Capability::Rollback)
    }

    fn tag_snapshot(&self, _label: &str, _tag: &str) -> Result<()> {
        unsupported(Capability::Tag)
    }

    fn untag_snapshot(&self, _tag: &str) -> Result<String> {
        unsupported(Capability::Tag)
    }

    fn get_snapshot_with_tag(&self, _tag: &str) -> Result<SnapshotInfo> {
        unsupported(Capability::Tag)
    }

    fn export(&self, _label: &str, _parent: &str, _writer: &mut dyn Write) -> Result<()> {
        unsupported(Capability::Export)
    }

    fn import(&self, _label: &str, _reader: &mut dyn Read) -> Result<()> {
        unsupported(Capability::Import)
    }
}
