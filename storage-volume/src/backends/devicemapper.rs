// SPDX-License-Identifier: GPL-3.0-only

//! Thin-provisioned volume backend
//!
//! Every volume is an ext4 filesystem on a thin device of an existing pool,
//! mounted at `<root>/<volume>`. Snapshots are thin snapshots of the live
//! device; rolling back creates a new live device from the snapshot and
//! swaps the mount over to it.
//!
//! The pool and its devices are named with `dm.*` driver options:
//!
//! | option            | meaning                                   |
//! |-------------------|-------------------------------------------|
//! | `dm.thinpooldev`  | pool name, bare or under `/dev/mapper`    |
//! | `dm.metadatadev`  | metadata device read by `thin_dump`       |
//! | `dm.datadev`      | data device, reported only                |
//! | `dm.basesize`     | virtual size of new volumes (`10GiB`)     |
//!
//! Volume state lives in `<root>/.devicemapper/volumes/<volume>/metadata.json`
//! and the next free device id in `<root>/.devicemapper/pool.json`.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use storage_sys::df::filesystem_stats;
use storage_sys::thinpool::{
    METADATA_BLOCK_SIZE, PoolStatus, PoolTable, mapper_path, snapshot_unique_blocks,
};
use storage_sys::{CommandLine, ThinPool};
use storage_types::{
    Capability, DeviceMapperStatus, DriverType, SNAPSHOT_INFO_FILE, SnapshotInfo, Status,
    TenantStorageStats, Usage, pretty_to_bytes,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::driver::{Driver, DriverContext, Volume};
use crate::error::{Result, VolumeError};
use crate::snapshot::{
    by_creation, ensure_tags_unused, find_tagged, is_snapshot, new_info, raw_label, read_info,
    tenant_of, without_tag, write_info,
};

const POOL_DIR: &str = ".devicemapper";
const METADATA_FILE: &str = "metadata.json";
const POOL_FILE: &str = "pool.json";

/// Virtual size of new volumes unless `dm.basesize` says otherwise
pub const DEFAULT_BASE_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Pool settings parsed from `dm.*` driver arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolOptions {
    pub pool: ThinPool,
    pub base_size: u64,
}

impl PoolOptions {
    pub fn parse(args: &[String]) -> Result<Self> {
        let mut pool = None;
        let mut metadata_device = None;
        let mut data_device = String::new();
        let mut base_size = DEFAULT_BASE_SIZE;

        for arg in args {
            let Some((key, value)) = arg.split_once('=') else {
                return Err(VolumeError::InvalidOption {
                    option: arg.clone(),
                    reason: "expected key=value".to_string(),
                });
            };
            let value = value.trim();
            match key.trim() {
                "dm.thinpooldev" => pool = Some(value.to_string()),
                "dm.metadatadev" => metadata_device = Some(value.to_string()),
                "dm.datadev" => data_device = value.to_string(),
                "dm.basesize" => {
                    base_size = value
                        .parse()
                        .ok()
                        .or_else(|| pretty_to_bytes(value))
                        .filter(|size| *size > 0)
                        .ok_or_else(|| VolumeError::InvalidOption {
                            option: arg.clone(),
                            reason: "not a size".to_string(),
                        })?;
                }
                other => warn!(option = other, "ignoring unknown devicemapper option"),
            }
        }

        let missing = |option: &str| VolumeError::InvalidOption {
            option: option.to_string(),
            reason: "required".to_string(),
        };
        let pool = pool.filter(|name| !name.is_empty()).ok_or_else(|| missing("dm.thinpooldev"))?;
        let metadata_device = metadata_device
            .filter(|device| !device.is_empty())
            .ok_or_else(|| missing("dm.metadatadev"))?;

        Ok(Self {
            pool: ThinPool::new(&pool, metadata_device, data_device),
            base_size,
        })
    }
}

/// A thin device of the pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ThinDevice {
    hash: String,
    device_id: u32,
    size: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct VolumeMetadata {
    current: Option<ThinDevice>,
    #[serde(default)]
    snapshots: BTreeMap<String, ThinDevice>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PoolMetadata {
    next_device_id: u32,
}

impl Default for PoolMetadata {
    fn default() -> Self {
        // device 0 is left to whoever created the pool
        Self { next_device_id: 1 }
    }
}

fn read_json<T: Default + DeserializeOwned>(path: &Path) -> Result<T> {
    match fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(T::default()),
        Err(err) => Err(err.into()),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let staging = path.with_extension("json.new");
    fs::write(&staging, serde_json::to_vec_pretty(value)?)?;
    fs::rename(&staging, path)?;
    Ok(())
}

#[derive(Clone)]
pub struct DeviceMapperDriver {
    inner: Arc<Shared>,
}

struct Shared {
    root: PathBuf,
    context: DriverContext,
    options: PoolOptions,
    /// Held while allocating device ids and messaging the pool
    pool_lock: Mutex<()>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DeviceMapperDriver {
    pub fn new(context: &DriverContext, root: &Path, options: PoolOptions) -> Result<Self> {
        let driver = Self {
            inner: Arc::new(Shared {
                root: root.to_path_buf(),
                context: context.clone(),
                options,
                pool_lock: Mutex::new(()),
                locks: Mutex::new(HashMap::new()),
            }),
        };
        fs::create_dir_all(driver.metadata_dir())?;
        debug!(
            root = %root.display(),
            pool = %driver.pool().name,
            base_size = driver.inner.options.base_size,
            "devicemapper driver root"
        );
        Ok(driver)
    }

    pub fn init(context: &DriverContext, root: &Path, args: &[String]) -> Result<Arc<dyn Driver>> {
        Ok(Arc::new(Self::new(context, root, PoolOptions::parse(args)?)?))
    }

    pub fn pool(&self) -> &ThinPool {
        &self.inner.options.pool
    }

    fn context(&self) -> &DriverContext {
        &self.inner.context
    }

    fn metadata_dir(&self) -> PathBuf {
        self.inner.root.join(POOL_DIR).join("volumes")
    }

    fn metadata_file(&self, name: &str) -> PathBuf {
        self.metadata_dir().join(name).join(METADATA_FILE)
    }

    fn read_metadata_of(&self, name: &str) -> Result<VolumeMetadata> {
        read_json(&self.metadata_file(name))
    }

    fn write_metadata_of(&self, name: &str, metadata: &VolumeMetadata) -> Result<()> {
        write_json(&self.metadata_file(name), metadata)
    }

    fn pool_guard(&self) -> MutexGuard<'_, ()> {
        self.inner.pool_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn volume(&self, name: &str) -> DeviceMapperVolume {
        let lock = {
            let mut locks = self.inner.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(name.to_string()).or_default())
        };
        DeviceMapperVolume {
            driver: self.clone(),
            name: name.to_string(),
            path: self.inner.root.join(name),
            tenant: tenant_of(name).to_string(),
            lock,
        }
    }

    fn dm_name(&self, device: &ThinDevice) -> String {
        format!("{}-{}", self.pool().device_name(), device.hash)
    }

    fn device_path(&self, device: &ThinDevice) -> String {
        mapper_path(&self.dm_name(device))
    }

    fn pool_message(&self, message: &[String]) -> Result<()> {
        let command = CommandLine::new("dmsetup")
            .args(["message".to_string(), self.pool().name.clone(), "0".to_string()])
            .args(message.iter().cloned());
        self.context().run(command)?;
        Ok(())
    }

    /// Reserve the next free device id and describe a device of `size`.
    fn allocate(&self, size: u64) -> Result<ThinDevice> {
        let path = self.inner.root.join(POOL_DIR).join(POOL_FILE);
        let mut pool: PoolMetadata = read_json(&path)?;
        let device = ThinDevice {
            hash: Uuid::new_v4().simple().to_string(),
            device_id: pool.next_device_id,
            size,
        };
        pool.next_device_id += 1;
        write_json(&path, &pool)?;
        Ok(device)
    }

    fn create_thin(&self) -> Result<ThinDevice> {
        let _pool = self.pool_guard();
        let device = self.allocate(self.inner.options.base_size)?;
        self.pool_message(&["create_thin".to_string(), device.device_id.to_string()])?;
        debug!(device = device.device_id, "created thin device");
        Ok(device)
    }

    /// Thin snapshot of `origin`, suspending the origin while it is taken.
    fn create_snap(&self, origin: &ThinDevice) -> Result<ThinDevice> {
        let _pool = self.pool_guard();
        let device = self.allocate(origin.size)?;
        let active = self.is_active(origin);
        let origin_name = self.dm_name(origin);
        if active {
            self.context()
                .run(CommandLine::new("dmsetup").args(["suspend", origin_name.as_str()]))?;
        }
        let created = self.pool_message(&[
            "create_snap".to_string(),
            device.device_id.to_string(),
            origin.device_id.to_string(),
        ]);
        if active {
            self.context()
                .run(CommandLine::new("dmsetup").args(["resume", origin_name.as_str()]))?;
        }
        created?;
        debug!(device = device.device_id, origin = origin.device_id, "created thin snapshot");
        Ok(device)
    }

    fn delete_device(&self, device: &ThinDevice) -> Result<()> {
        let _pool = self.pool_guard();
        self.pool_message(&["delete".to_string(), device.device_id.to_string()])
    }

    fn is_active(&self, device: &ThinDevice) -> bool {
        let command = CommandLine::new("dmsetup").args(["info".to_string(), self.dm_name(device)]);
        self.context()
            .run_unchecked(command)
            .is_ok_and(|output| output.success())
    }

    fn activate(&self, device: &ThinDevice) -> Result<()> {
        if self.is_active(device) {
            return Ok(());
        }
        let sectors = device.size / storage_sys::thinpool::SECTOR_SIZE;
        let table = format!("0 {sectors} thin {} {}", self.pool().name, device.device_id);
        self.context().run(CommandLine::new("dmsetup").args([
            "create".to_string(),
            self.dm_name(device),
            "--table".to_string(),
            table,
        ]))?;
        Ok(())
    }

    fn deactivate(&self, device: &ThinDevice) -> Result<()> {
        if !self.is_active(device) {
            return Ok(());
        }
        self.context()
            .run(CommandLine::new("dmsetup").args(["remove".to_string(), self.dm_name(device)]))?;
        Ok(())
    }

    fn is_mounted(&self, path: &Path) -> bool {
        let command = CommandLine::new("mountpoint").args(["-q".to_string(), path.display().to_string()]);
        self.context()
            .run_unchecked(command)
            .is_ok_and(|output| output.success())
    }

    fn mount(&self, device: &ThinDevice, path: &Path) -> Result<()> {
        fs::create_dir_all(path)?;
        if self.is_mounted(path) {
            return Ok(());
        }
        self.activate(device)?;
        self.context().run(
            CommandLine::new("mount").args([self.device_path(device), path.display().to_string()]),
        )?;
        Ok(())
    }

    fn unmount(&self, path: &Path) -> Result<()> {
        if self.is_mounted(path) {
            self.context()
                .run(CommandLine::new("umount").arg(path.display().to_string()))?;
        }
        Ok(())
    }

    /// Best-effort teardown of a device that never made it into metadata.
    fn discard(&self, device: &ThinDevice) {
        if let Err(err) = self.deactivate(device).and_then(|()| self.delete_device(device)) {
            warn!(device = device.device_id, "could not discard thin device: {err}");
        }
    }

    fn tenant_stats(
        &self,
        name: &str,
        pool_status: &PoolStatus,
        block_size: u64,
        devices: Option<&storage_sys::DeviceMap>,
    ) -> Result<Option<TenantStorageStats>> {
        let metadata = self.read_metadata_of(name)?;
        let Some(current) = metadata.current else {
            return Ok(None);
        };
        let path = self.inner.root.join(name);

        let mut stats = TenantStorageStats {
            tenant_id: tenant_of(name).to_string(),
            volume_path: path.display().to_string(),
            pool_available_blocks: pool_status.data_available(),
            device_name: self.dm_name(&current),
            device_total_blocks: current.size.checked_div(block_size).unwrap_or(0),
            number_snapshots: metadata.snapshots.len(),
            ..Default::default()
        };

        if let Some(devices) = devices {
            let allocated = devices
                .get(&current.device_id)
                .map(|device| device.allocated())
                .unwrap_or(0);
            stats.device_allocated_blocks = allocated;
            stats.device_unallocated_blocks = stats.device_total_blocks.saturating_sub(allocated);
            let snapshots: Vec<u32> = metadata.snapshots.values().map(|snap| snap.device_id).collect();
            stats.snapshot_allocated_blocks =
                snapshot_unique_blocks(devices, current.device_id, &snapshots);
        }

        match filesystem_stats(&path) {
            Ok(filesystem) => {
                stats.filesystem_total = filesystem.total;
                stats.filesystem_used = filesystem.used;
                stats.filesystem_available = filesystem.available;
            }
            Err(err) => stats
                .errors
                .push(format!("could not read filesystem usage of {}: {err}", path.display())),
        }
        Ok(Some(stats))
    }
}

impl Driver for DeviceMapperDriver {
    fn root(&self) -> &Path {
        &self.inner.root
    }

    fn driver_type(&self) -> DriverType {
        DriverType::DeviceMapper
    }

    fn create(&self, name: &str) -> Result<Box<dyn Volume>> {
        if self.exists(name) {
            return Err(VolumeError::VolumeExists(name.to_string()));
        }
        let volume = self.volume(name);
        let guard = volume.guard();

        let device = self.create_thin()?;
        let prepared = self
            .activate(&device)
            .and_then(|()| {
                self.context().run(
                    CommandLine::new("mkfs.ext4")
                        .args(["-q", "-E", "nodiscard"])
                        .arg(self.device_path(&device)),
                )?;
                Ok(())
            })
            .and_then(|()| {
                self.write_metadata_of(
                    name,
                    &VolumeMetadata {
                        current: Some(device.clone()),
                        snapshots: BTreeMap::new(),
                    },
                )
            });
        if let Err(err) = prepared {
            self.discard(&device);
            return Err(err);
        }

        self.mount(&device, &volume.path)?;
        info!(volume = name, device = device.device_id, "created devicemapper volume");
        drop(guard);
        Ok(Box::new(volume))
    }

    fn get(&self, name: &str) -> Result<Box<dyn Volume>> {
        if !self.exists(name) {
            return Err(VolumeError::VolumeNotExists(name.to_string()));
        }
        let volume = self.volume(name);
        {
            let _guard = volume.guard();
            if let Some(current) = self.read_metadata_of(name)?.current {
                self.mount(&current, &volume.path)?;
            }
        }
        Ok(Box::new(volume))
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
            .filter(|entry| entry.path().join(METADATA_FILE).is_file())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    fn exists(&self, name: &str) -> bool {
        self.metadata_file(name).is_file()
    }

    fn release(&self, name: &str) -> Result<()> {
        let volume = self.volume(name);
        let _guard = volume.guard();
        self.unmount(&volume.path)?;
        if let Some(current) = self.read_metadata_of(name)?.current {
            self.deactivate(&current)?;
        }
        debug!(volume = name, "released devicemapper volume");
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        if !self.exists(name) {
            return Ok(());
        }
        let volume = self.volume(name);
        for label in volume.snapshots()? {
            volume.remove_snapshot(&label)?;
        }
        if let Err(err) = self.release(name) {
            warn!(volume = name, "could not release volume before removal: {err}");
        }

        let _guard = volume.guard();
        if let Some(current) = self.read_metadata_of(name)?.current {
            self.delete_device(&current)
                .map_err(|err| VolumeError::RemovingVolume {
                    volume: name.to_string(),
                    reason: err.to_string(),
                })?;
        }
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
        info!(volume = name, "removed devicemapper volume");
        Ok(())
    }

    fn resize(&self, _name: &str, _size: u64) -> Result<()> {
        Err(VolumeError::not_supported(DriverType::DeviceMapper, Capability::Resize))
    }

    fn status(&self) -> Result<Status> {
        let context = self.context();
        let runner = context.runner.as_ref();
        let pool = self.pool();

        let pool_status = PoolStatus::query(runner, &pool.name)?;
        let block_size = PoolTable::query(runner, &pool.name)?.data_block_size();

        let mut status = DeviceMapperStatus {
            driver_path: self.inner.root.display().to_string(),
            pool_name: pool.name.clone(),
            block_size,
            pool_data_total: pool_status.data_total * block_size,
            pool_data_used: pool_status.data_used * block_size,
            pool_data_available: pool_status.data_available() * block_size,
            pool_metadata_total: pool_status.metadata_total * METADATA_BLOCK_SIZE,
            pool_metadata_used: pool_status.metadata_used * METADATA_BLOCK_SIZE,
            pool_metadata_available: pool_status.metadata_available() * METADATA_BLOCK_SIZE,
            driver_data: BTreeMap::from([
                ("PoolName".to_string(), pool.name.clone()),
                ("MetadataDevice".to_string(), pool.metadata_device.clone()),
                ("DataDevice".to_string(), pool.data_device.clone()),
                ("BaseSize".to_string(), self.inner.options.base_size.to_string()),
            ]),
            ..Default::default()
        };
        status.usage_data = vec![
            Usage::new("Data", "Available", status.pool_data_available),
            Usage::new("Data", "Used", status.pool_data_used),
            Usage::new("Data", "Total", status.pool_data_total),
            Usage::new("Metadata", "Available", status.pool_metadata_available),
            Usage::new("Metadata", "Used", status.pool_metadata_used),
            Usage::new("Metadata", "Total", status.pool_metadata_total),
        ];

        let devices = match context.usage.device_blocks(runner, pool) {
            Ok(devices) => Some(devices),
            Err(err) => {
                warn!(pool = %pool.name, "could not read thin pool metadata: {err}");
                status
                    .errors
                    .push(format!("could not read thin pool metadata: {err}"));
                None
            }
        };

        for name in self.list() {
            match self.tenant_stats(&name, &pool_status, block_size, devices.as_deref()) {
                Ok(Some(tenant)) => status.tenants.push(tenant),
                Ok(None) => {}
                Err(err) => status.errors.push(format!("volume {name}: {err}")),
            }
        }
        Ok(Status::DeviceMapper(status))
    }

    fn cleanup(&self) -> Result<()> {
        for name in self.list() {
            self.release(&name)?;
        }
        info!(root = %self.inner.root.display(), "devicemapper driver shut down");
        Ok(())
    }

    fn supports(&self, capability: Capability) -> bool {
        !matches!(
            capability,
            Capability::Resize | Capability::Export | Capability::Import
        )
    }
}

pub struct DeviceMapperVolume {
    driver: DeviceMapperDriver,
    name: String,
    path: PathBuf,
    tenant: String,
    lock: Arc<Mutex<()>>,
}

impl DeviceMapperVolume {
    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn metadata(&self) -> Result<VolumeMetadata> {
        self.driver.read_metadata_of(&self.name)
    }

    fn current(&self, metadata: &VolumeMetadata) -> Result<ThinDevice> {
        metadata
            .current
            .clone()
            .ok_or_else(|| VolumeError::VolumeNotExists(self.name.clone()))
    }

    fn metadata_path(&self, raw: &str) -> PathBuf {
        self.driver.metadata_dir().join(raw)
    }

    fn info(&self, label: &str) -> Result<SnapshotInfo> {
        let raw = raw_label(&self.tenant, label);
        let exists = self.metadata()?.snapshots.contains_key(&raw);
        read_info(
            &self.tenant,
            label,
            &self.metadata_path(&raw).join(SNAPSHOT_INFO_FILE),
            exists,
        )
    }

    fn list_snapshots(&self) -> Result<Vec<String>> {
        let found = self
            .metadata()?
            .snapshots
            .into_keys()
            .filter(|raw| is_snapshot(&self.tenant, raw))
            .map(|raw| {
                let dir = self.metadata_path(&raw);
                (raw, dir)
            })
            .collect();
        Ok(by_creation(found))
    }
}

impl Volume for DeviceMapperVolume {
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
        let mut metadata = self.metadata()?;
        if metadata.snapshots.contains_key(&raw) {
            return Err(VolumeError::SnapshotExists(raw));
        }
        ensure_tags_unused(&self.list_snapshots()?, tags, |label| self.info(label))?;
        let current = self.current(&metadata)?;

        let device = self.driver.create_snap(&current)?;
        let info = new_info(&self.tenant, &raw, message, tags);
        let recorded = write_info(&self.metadata_path(&raw).join(SNAPSHOT_INFO_FILE), &info)
            .and_then(|()| {
                metadata.snapshots.insert(raw.clone(), device.clone());
                self.driver.write_metadata_of(&self.name, &metadata)
            });
        if let Err(err) = recorded {
            self.driver.discard(&device);
            return Err(err);
        }
        info!(volume = %self.name, snapshot = %raw, device = device.device_id, "created thin snapshot");
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
        let mut metadata = self.metadata()?;
        let Some(device) = metadata.snapshots.remove(&raw) else {
            return Err(VolumeError::SnapshotDoesNotExist(raw));
        };
        self.driver.write_metadata_of(&self.name, &metadata)?;
        if let Err(err) = fs::remove_dir_all(self.metadata_path(&raw))
            && err.kind() != ErrorKind::NotFound
        {
            return Err(err.into());
        }

        if let Err(err) = self.driver.deactivate(&device) {
            debug!(device = device.device_id, "could not deactivate snapshot device: {err}");
        }
        self.driver
            .delete_device(&device)
            .map_err(|err| VolumeError::RemovingSnapshot {
                snapshot: raw.clone(),
                reason: err.to_string(),
            })?;
        info!(volume = %self.name, snapshot = %raw, "removed thin snapshot");
        Ok(())
    }

    fn rollback(&self, label: &str) -> Result<()> {
        let raw = raw_label(&self.tenant, label);
        let _guard = self.guard();
        let mut metadata = self.metadata()?;
        let Some(snapshot) = metadata.snapshots.get(&raw).cloned() else {
            return Err(VolumeError::SnapshotDoesNotExist(raw));
        };
        self.info(&raw)?;
        let old_head = self.current(&metadata)?;

        let new_head = self.driver.create_snap(&snapshot)?;
        self.driver.unmount(&self.path)?;
        self.driver.mount(&new_head, &self.path)?;
        metadata.current = Some(new_head.clone());
        self.driver.write_metadata_of(&self.name, &metadata)?;

        if let Err(err) = self
            .driver
            .deactivate(&old_head)
            .and_then(|()| self.driver.delete_device(&old_head))
        {
            warn!(device = old_head.device_id, "could not clean up previous head device: {err}");
        }
        info!(
            volume = %self.name,
            snapshot = %raw,
            device = new_head.device_id,
            "rolled back devicemapper volume"
        );
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

    fn export(&self, _label: &str, _parent: &str, _writer: &mut dyn Write) -> Result<()> {
        Err(VolumeError::not_supported(DriverType::DeviceMapper, Capability::Export))
    }

    fn import(&self, _label: &str, _reader: &mut dyn Read) -> Result<()> {
        Err(VolumeError::not_supported(DriverType::DeviceMapper, Capability::Import))
    }
}

#[cfg(test)]
mod tests {
    use storage_sys::{Reply, ScriptedRunner};

    use super::*;
    use crate::config::VolumeConfig;

    const FREE: &str = "0 2048 thin-pool 3 10/100 20/200 - rw\n";
    const HELD: &str = "0 2048 thin-pool 3 11/100 20/200 42 rw\n";
    const TABLE: &str = "0 2048 thin-pool 253:0 253:1 128 32768 1 skip_block_zeroing\n";
    // device 1 maps blocks 0-7, its snapshot (device 2) shares 0-3 and owns 9
    const DUMP: &str = r#"<superblock>
  <device dev_id="1"><range_mapping origin_begin="0" data_begin="0" length="8" time="0"/></device>
  <device dev_id="2">
    <range_mapping origin_begin="0" data_begin="0" length="4" time="0"/>
    <single_mapping origin_block="4" data_block="9" time="1"/>
  </device>
</superblock>"#;

    fn args(base_size: &str) -> Vec<String> {
        vec![
            "dm.thinpooldev=pool".to_string(),
            "dm.metadatadev=/dev/vg/meta".to_string(),
            "dm.datadev=/dev/vg/data".to_string(),
            format!("dm.basesize={base_size}"),
        ]
    }

    fn driver_with(runner: Arc<ScriptedRunner>) -> (tempfile::TempDir, DeviceMapperDriver) {
        let dir = tempfile::tempdir().expect("tempdir");
        let context = DriverContext::new(runner, VolumeConfig::default());
        let options = PoolOptions::parse(&args("1GiB")).expect("options");
        let driver = DeviceMapperDriver::new(&context, dir.path(), options).expect("driver");
        (dir, driver)
    }

    #[test]
    fn options_name_the_pool_and_base_size() {
        let options = PoolOptions::parse(&args("1073741824")).expect("options");
        assert_eq!(options.pool.name, "/dev/mapper/pool");
        assert_eq!(options.pool.metadata_device, "/dev/vg/meta");
        assert_eq!(options.base_size, 1024 * 1024 * 1024);
        assert_eq!(PoolOptions::parse(&args("1GiB")).expect("options").base_size, 1 << 30);

        assert!(matches!(
            PoolOptions::parse(&["dm.thinpooldev=pool".to_string()]),
            Err(VolumeError::InvalidOption { option, .. }) if option == "dm.metadatadev"
        ));
        assert!(matches!(
            PoolOptions::parse(&args("lots")),
            Err(VolumeError::InvalidOption { .. })
        ));
        assert!(matches!(
            PoolOptions::parse(&["thinpool".to_string()]),
            Err(VolumeError::InvalidOption { .. })
        ));
    }

    #[test]
    fn create_formats_and_mounts_a_new_thin_device() {
        let runner = Arc::new(ScriptedRunner::new());
        // inactive until `dmsetup create`, active from then on
        runner
            .on("dmsetup info", Reply::fail(1, "No such device"))
            .on("dmsetup info", Reply::ok(""));
        runner.on("mountpoint", Reply::fail(1, ""));
        let (dir, driver) = driver_with(Arc::clone(&runner));

        let volume = driver.create("app").expect("create");
        assert_eq!(volume.path(), dir.path().join("app"));
        assert_eq!(driver.list(), ["app"]);
        assert!(matches!(driver.create("app"), Err(VolumeError::VolumeExists(_))));

        assert_eq!(runner.call_count("dmsetup message /dev/mapper/pool 0 create_thin 1"), 1);
        assert_eq!(runner.call_count("dmsetup create pool-"), 1);
        assert_eq!(runner.call_count("dmsetup info pool-"), 2);
        assert_eq!(runner.call_count("mkfs.ext4"), 1);
        assert_eq!(runner.call_count("mount /dev/mapper/pool-"), 1);
    }

    #[test]
    fn snapshots_suspend_the_origin_and_roll_back_onto_a_new_head() {
        let runner = Arc::new(ScriptedRunner::new());
        let (_dir, driver) = driver_with(Arc::clone(&runner));

        let volume = driver.create("app").expect("create");
        volume.snapshot("v1", "first", &["live".to_string()]).expect("snapshot");
        assert_eq!(volume.snapshots().expect("snapshots"), ["app_v1"]);
        assert_eq!(runner.call_count("dmsetup suspend"), 1);
        assert_eq!(runner.call_count("dmsetup resume"), 1);
        assert_eq!(runner.call_count("dmsetup message /dev/mapper/pool 0 create_snap 2 1"), 1);
        assert_eq!(volume.get_snapshot_with_tag("live").expect("tagged").label, "v1");
        assert!(matches!(
            volume.snapshot("v1", "", &[]),
            Err(VolumeError::SnapshotExists(_))
        ));

        volume.rollback("v1").expect("rollback");
        assert_eq!(runner.call_count("dmsetup message /dev/mapper/pool 0 create_snap 3 2"), 1);
        assert_eq!(runner.call_count("dmsetup message /dev/mapper/pool 0 delete 1"), 1);
        let metadata = driver.read_metadata_of("app").expect("metadata");
        assert_eq!(metadata.current.map(|device| device.device_id), Some(3));

        assert!(matches!(
            volume.rollback("v2"),
            Err(VolumeError::SnapshotDoesNotExist(_))
        ));
        assert!(volume.export("v1", "", &mut Vec::new()).expect_err("export").is_not_supported());
    }

    #[test]
    fn remove_deletes_snapshots_and_the_live_device() {
        let runner = Arc::new(ScriptedRunner::new());
        let (dir, driver) = driver_with(Arc::clone(&runner));

        let volume = driver.create("app").expect("create");
        volume.snapshot("v1", "", &[]).expect("snapshot");
        driver.remove("app").expect("remove");

        assert_eq!(runner.call_count("dmsetup message /dev/mapper/pool 0 delete 2"), 1);
        assert_eq!(runner.call_count("dmsetup message /dev/mapper/pool 0 delete 1"), 1);
        assert!(driver.list().is_empty());
        assert!(!dir.path().join("app").exists());
        driver.remove("app").expect("removing again is a no-op");
    }

    #[test]
    fn status_accounts_blocks_per_tenant() {
        let runner = Arc::new(ScriptedRunner::new());
        runner
            .on("dmsetup status", Reply::ok(FREE))
            .on("dmsetup status", Reply::ok(FREE))
            .on("dmsetup status", Reply::ok(HELD))
            .on("dmsetup table", Reply::ok(TABLE))
            .on("thin_dump", Reply::ok(DUMP));
        let (dir, driver) = driver_with(Arc::clone(&runner));
        let volume = driver.create("app").expect("create");
        volume.snapshot("v1", "", &[]).expect("snapshot");

        let Status::DeviceMapper(status) = driver.status().expect("status") else {
            panic!("devicemapper reports a thin pool status");
        };
        assert_eq!(status.block_size, 65536);
        assert_eq!(status.pool_data_total, 200 * 65536);
        assert_eq!(status.pool_data_available, 180 * 65536);
        assert_eq!(status.pool_metadata_used, 10 * METADATA_BLOCK_SIZE);
        assert!(status.errors.is_empty(), "{:?}", status.errors);

        let [tenant] = status.tenants.as_slice() else {
            panic!("one tenant expected, got {:?}", status.tenants);
        };
        assert_eq!(tenant.tenant_id, "app");
        assert_eq!(tenant.volume_path, dir.path().join("app").display().to_string());
        assert_eq!(tenant.pool_available_blocks, 180);
        assert_eq!(tenant.device_total_blocks, 16384);
        assert_eq!(tenant.device_allocated_blocks, 8);
        assert_eq!(tenant.device_unallocated_blocks, 16376);
        assert_eq!(tenant.number_snapshots, 1);
        assert_eq!(tenant.snapshot_allocated_blocks, 1);
        assert!(tenant.filesystem_total > 0);
    }

    #[test]
    fn unreadable_pool_metadata_is_reported_not_fatal() {
        let runner = Arc::new(ScriptedRunner::new());
        runner
            .on("dmsetup status", Reply::ok(FREE))
            .on("dmsetup table", Reply::ok(TABLE))
            .on("dmsetup message /dev/mapper/pool 0 reserve_metadata_snap", Reply::fail(1, "busy"));
        let (_dir, driver) = driver_with(Arc::clone(&runner));
        driver.create("app").expect("create");

        let Status::DeviceMapper(status) = driver.status().expect("status") else {
            panic!("devicemapper reports a thin pool status");
        };
        assert_eq!(status.errors.len(), 1);
        assert_eq!(status.tenants.len(), 1);
        assert_eq!(status.tenants[0].device_allocated_blocks, 0);
    }
}
