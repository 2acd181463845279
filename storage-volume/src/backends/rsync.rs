// SPDX-License-Identifier: GPL-3.0-only

//! Directory-copy backend
//!
//! Volumes are plain directories under the root. A snapshot is an
//! `rsync -a` copy next to them and its metadata lives under
//! `<root>/.rsync/volumes/<label>`. Writers are not quiesced while a copy
//! runs, so a snapshot of a busy volume is only crash-consistent per file.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use storage_sys::CommandLine;
use storage_sys::archive::{ArchiveWriter, Route, import_archive, strip_entry_prefix};
use storage_sys::df::df;
use storage_types::{
    Capability, DriverType, SNAPSHOT_INFO_FILE, SimpleStatus, SnapshotInfo, Status, Usage,
};
use tracing::{debug, info, warn};

use crate::driver::{Driver, DriverContext, Volume};
use crate::error::{Result, VolumeError};
use crate::snapshot::{
    by_creation, ensure_tags_unused, find_tagged, is_snapshot, new_info, raw_label, read_info,
    tenant_of, without_tag, write_info,
};

/// rsync exit status for "some source files vanished during the transfer"
const RSYNC_VANISHED_SOURCE: i32 = 24;

const POOL_DIR: &str = ".rsync";

#[derive(Clone)]
pub struct RsyncDriver {
    inner: Arc<Shared>,
}

struct Shared {
    root: PathBuf,
    context: DriverContext,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RsyncDriver {
    pub fn new(context: &DriverContext, root: &Path) -> Result<Self> {
        let driver = Self {
            inner: Arc::new(Shared {
                root: root.to_path_buf(),
                context: context.clone(),
                locks: Mutex::new(HashMap::new()),
            }),
        };
        fs::create_dir_all(driver.metadata_dir())?;
        Ok(driver)
    }

    pub fn init(context: &DriverContext, root: &Path, _args: &[String]) -> Result<Arc<dyn Driver>> {
        Ok(Arc::new(Self::new(context, root)?))
    }

    fn metadata_dir(&self) -> PathBuf {
        self.inner.root.join(POOL_DIR).join("volumes")
    }

    fn volume(&self, name: &str) -> RsyncVolume {
        let lock = {
            let mut locks = self.inner.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(name.to_string()).or_default())
        };
        RsyncVolume {
            driver: self.clone(),
            name: name.to_string(),
            path: self.inner.root.join(name),
            tenant: tenant_of(name).to_string(),
            lock,
        }
    }
}

impl Driver for RsyncDriver {
    fn root(&self) -> &Path {
        &self.inner.root
    }

    fn driver_type(&self) -> DriverType {
        DriverType::Rsync
    }

    fn create(&self, name: &str) -> Result<Box<dyn Volume>> {
        if self.exists(name) {
            return Err(VolumeError::VolumeExists(name.to_string()));
        }
        fs::create_dir_all(self.metadata_dir().join(name))?;
        fs::create_dir_all(self.inner.root.join(name))?;
        info!(volume = name, root = %self.inner.root.display(), "created rsync volume");
        Ok(Box::new(self.volume(name)))
    }

    fn get(&self, name: &str) -> Result<Box<dyn Volume>> {
        Ok(Box::new(self.volume(name)))
    }

    fn get_tenant(&self, name: &str) -> Result<Box<dyn Volume>> {
        if !self.exists(name) {
            return Err(VolumeError::VolumeNotExists(name.to_string()));
        }
        self.get(tenant_of(name))
    }

    fn list(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(self.metadata_dir()) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_dir()))
            // snapshot metadata shares the directory
            .filter(|entry| !entry.path().join(SNAPSHOT_INFO_FILE).exists())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    fn exists(&self, name: &str) -> bool {
        self.metadata_dir().join(name).is_dir()
    }

    fn release(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        let volume = self.volume(name);
        for label in volume.snapshots()? {
            volume.remove_snapshot(&label)?;
        }

        let _guard = volume.guard();
        for dir in [self.metadata_dir().join(name), volume.path.clone()] {
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(VolumeError::RemovingVolume {
                        volume: name.to_string(),
                        reason: format!("{}: {err}", dir.display()),
                    });
                }
            }
        }
        info!(volume = name, "removed rsync volume");
        Ok(())
    }

    fn resize(&self, name: &str, size: u64) -> Result<()> {
        debug!(volume = name, size, "rsync volumes are not size limited");
        Ok(())
    }

    fn status(&self) -> Result<Status> {
        let context = &self.inner.context;
        let rows = df(context.runner.as_ref(), &self.inner.root)?;
        let root = self.inner.root.display().to_string();

        let mut usage_data = Vec::new();
        for row in rows {
            let label = format!("{root} on {}", row.source);
            usage_data.push(Usage::new(label.clone(), "Total Bytes", row.size));
            usage_data.push(Usage::new(label.clone(), "Used Bytes", row.used));
            usage_data.push(Usage::new(label, "Available Bytes", row.available));
        }

        Ok(Status::Simple(SimpleStatus {
            driver: DriverType::Rsync,
            driver_data: BTreeMap::from([("DataFile".to_string(), root)]),
            usage_data,
        }))
    }

    fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    fn supports(&self, _capability: Capability) -> bool {
        true
    }
}

pub struct RsyncVolume {
    driver: RsyncDriver,
    name: String,
    path: PathBuf,
    tenant: String,
    lock: Arc<Mutex<()>>,
}

impl RsyncVolume {
    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn context(&self) -> &DriverContext {
        &self.driver.inner.context
    }

    fn snapshot_path(&self, raw: &str) -> PathBuf {
        self.driver.inner.root.join(raw)
    }

    fn metadata_path(&self, raw: &str) -> PathBuf {
        self.driver.metadata_dir().join(raw)
    }

    fn snapshot_exists(&self, raw: &str) -> bool {
        self.snapshot_path(raw).is_dir()
    }

    fn info(&self, label: &str) -> Result<SnapshotInfo> {
        let raw = raw_label(&self.tenant, label);
        read_info(
            &self.tenant,
            label,
            &self.metadata_path(&raw).join(SNAPSHOT_INFO_FILE),
            self.snapshot_exists(&raw),
        )
    }

    fn list_snapshots(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(self.driver.metadata_dir()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut found = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type()?.is_dir()
                && is_snapshot(&self.tenant, &name)
                && self.snapshot_exists(&name)
            {
                found.push((name, entry.path()));
            }
        }
        Ok(by_creation(found))
    }

    /// Copy `source` into `destination`, retrying transfers that raced with
    /// files disappearing from the source.
    fn copy_tree(&self, source: &Path, destination: &Path) -> Result<()> {
        let config = &self.context().config;
        let attempts = config.rsync_snapshot_attempts.max(1);
        for attempt in 1..=attempts {
            let command = CommandLine::new("rsync")
                .args([
                    "-a".to_string(),
                    format!("{}/", source.display()),
                    format!("{}/", destination.display()),
                ])
                .timeout(config.rsync_snapshot_timeout());
            let output = self.context().run_unchecked(command)?;
            if output.exit_code != Some(RSYNC_VANISHED_SOURCE) {
                output.check()?;
                return Ok(());
            }
            if attempt == attempts {
                warn!(
                    volume = %self.name,
                    "files vanished during every snapshot attempt; keeping the last copy"
                );
                return Ok(());
            }
            warn!(volume = %self.name, attempt, attempts, "files vanished during snapshot; retrying");
        }
        Ok(())
    }
}

impl Volume for RsyncVolume {
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

    fn write_metadata(&self, label: &str, name: &str) -> Result<Box<dyn Write + Send>> {
        let path = self.metadata_path(&raw_label(&self.tenant, label)).join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Box::new(File::create(path)?))
    }

    fn read_metadata(&self, label: &str, name: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.metadata_path(&raw_label(&self.tenant, label)).join(name);
        Ok(Box::new(File::open(path)?))
    }

    fn snapshot(&self, label: &str, message: &str, tags: &[String]) -> Result<()> {
        let raw = raw_label(&self.tenant, label);
        let _guard = self.guard();
        if self.snapshot_exists(&raw) {
            return Err(VolumeError::SnapshotExists(raw));
        }
        ensure_tags_unused(&self.list_snapshots()?, tags, |label| self.info(label))?;

        let info = new_info(&self.tenant, &raw, message, tags);
        write_info(&self.metadata_path(&raw).join(SNAPSHOT_INFO_FILE), &info)?;
        self.copy_tree(&self.path, &self.snapshot_path(&raw))?;
        info!(volume = %self.name, snapshot = %raw, "created rsync snapshot");
        Ok(())
    }

    fn snapshot_info(&self, label: &str) -> Result<SnapshotInfo> {
        self.info(label)
    }

    fn snapshots(&self) -> Result<Vec<String>> {
        let _guard = self.guard();
        self.list_snapshots()
    }

    fn remove_snapshot(&self, label: &str) -> Result<()> {
        let raw = raw_label(&self.tenant, label);
        let _guard = self.guard();
        if !self.snapshot_exists(&raw) {
            return Err(VolumeError::SnapshotDoesNotExist(raw));
        }
        for dir in [self.metadata_path(&raw), self.snapshot_path(&raw)] {
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(VolumeError::RemovingSnapshot {
                        snapshot: raw,
                        reason: format!("{}: {err}", dir.display()),
                    });
                }
            }
        }
        info!(volume = %self.name, snapshot = %raw, "removed rsync snapshot");
        Ok(())
    }

    fn rollback(&self, label: &str) -> Result<()> {
        let raw = raw_label(&self.tenant, label);
        let _guard = self.guard();
        if !self.snapshot_exists(&raw) {
            return Err(VolumeError::SnapshotDoesNotExist(raw));
        }
        self.info(&raw)?;
        let command = CommandLine::new("rsync").args([
            "-a".to_string(),
            "--del".to_string(),
            "--force".to_string(),
            format!("{}/", self.snapshot_path(&raw).display()),
            format!("{}/", self.path.display()),
        ]);
        self.context().run(command)?;
        info!(volume = %self.name, snapshot = %raw, "rolled back rsync volume");
        Ok(())
    }

    fn tag_snapshot(&self, label: &str, tag: &str) -> Result<()> {
        let _guard = self.guard();
        let mut info = self.info(label)?;
        ensure_tags_unused(&self.list_snapshots()?, &[tag.to_string()], |label| {
            self.info(label)
        })?;
        info.tags.push(tag.to_string());
        write_info(&self.metadata_path(&info.name).join(SNAPSHOT_INFO_FILE), &info)
    }

    fn untag_snapshot(&self, tag: &str) -> Result<String> {
        let _guard = self.guard();
        let info = find_tagged(&self.list_snapshots()?, tag, |label| self.info(label))?;
        let info = without_tag(info, tag);
        write_info(&self.metadata_path(&info.name).join(SNAPSHOT_INFO_FILE), &info)?;
        Ok(info.label)
    }

    fn get_snapshot_with_tag(&self, tag: &str) -> Result<SnapshotInfo> {
        let _guard = self.guard();
        find_tagged(&self.list_snapshots()?, tag, |label| self.info(label))
    }

    fn export(&self, label: &str, parent: &str, writer: &mut dyn Write) -> Result<()> {
        let label = label.trim();
        if label.is_empty() {
            return Err(VolumeError::InvalidLabel(label.to_string()));
        }
        if !parent.is_empty() {
            debug!(parent, "rsync exports are always full; ignoring parent");
        }
        let raw = raw_label(&self.tenant, label);
        let _guard = self.guard();
        if !self.snapshot_exists(&raw) {
            return Err(VolumeError::SnapshotDoesNotExist(raw));
        }

        let mut archive = ArchiveWriter::new(writer);
        archive.append_bytes(&format!("{raw}-driver"), DriverType::Rsync.as_str().as_bytes())?;
        let metadata = self.metadata_path(&raw);
        if metadata.is_dir() {
            archive.append_directory(&metadata, &format!("{raw}-metadata"))?;
        }
        archive.append_directory(&self.snapshot_path(&raw), &format!("{raw}-volume"))?;
        archive.finish()?;
        info!(volume = %self.name, snapshot = %raw, "exported rsync snapshot");
        Ok(())
    }

    fn import(&self, label: &str, reader: &mut dyn Read) -> Result<()> {
        let raw = raw_label(&self.tenant, label);
        let _guard = self.guard();
        if self.snapshot_exists(&raw) {
            return Err(VolumeError::SnapshotExists(raw));
        }

        let driver_entry = PathBuf::from(format!("{raw}-driver"));
        let volume_entry = format!("{raw}-volume");
        let metadata_entry = format!("{raw}-metadata");
        let snapshot_path = self.snapshot_path(&raw);
        let metadata_path = self.metadata_path(&raw);

        let imported = import_archive(reader, |name| {
            if name == driver_entry {
                Route::Capture
            } else if let Some(rest) = strip_entry_prefix(name, &volume_entry) {
                Route::Extract(snapshot_path.join(rest))
            } else if let Some(rest) = strip_entry_prefix(name, &metadata_entry) {
                Route::Extract(metadata_path.join(rest))
            } else {
                Route::Skip
            }
        })
        .map_err(VolumeError::from)
        .and_then(|captured| {
            let driver_type = captured
                .get(&driver_entry)
                .map(|bytes| String::from_utf8_lossy(bytes).trim().to_string())
                .unwrap_or_default();
            if driver_type.is_empty() {
                return Err(VolumeError::IncompatibleSnapshot(raw.clone()));
            }
            Ok(driver_type)
        });

        let driver_type = match imported {
            Ok(driver_type) => driver_type,
            Err(err) => {
                for dir in [&snapshot_path, &metadata_path] {
                    if let Err(cleanup) = fs::remove_dir_all(dir)
                        && cleanup.kind() != ErrorKind::NotFound
                    {
                        warn!(path = %dir.display(), "could not clean up failed import: {cleanup}");
                    }
                }
                return Err(err);
            }
        };
        info!(volume = %self.name, snapshot = %raw, from = %driver_type, "imported rsync snapshot");
        Ok(())
    }
}
