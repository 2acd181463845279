// SPDX-License-Identifier: GPL-3.0-only

//! Subvolume backend
//!
//! Every volume is a btrfs subvolume directly under the driver root, and
//! every snapshot a read-only subvolume snapshot beside it. Snapshot info is
//! written into the live volume right before it is snapshotted, so each
//! snapshot carries its own `.SNAPSHOTINFO`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Instant;

use storage_sys::CommandLine;
use storage_sys::btrfs::{parse_object_id, parse_subvolume_list};
use storage_sys::df::btrfs_df;
use storage_types::{
    Capability, DriverType, SNAPSHOT_INFO_FILE, SimpleStatus, SnapshotInfo, Status, Usage,
};
use tracing::{debug, info, warn};

use crate::driver::{Driver, DriverContext, Volume};
use crate::error::{Result, VolumeError};
use crate::snapshot::{
    by_creation, ensure_tags_unused, find_tagged, is_snapshot, new_info, raw_label, read_info,
    tenant_of, write_info,
};

const POOL_DIR: &str = ".btrfs";

const BUSY: &str = "Device or resource busy";

fn btrfs<I, S>(args: I) -> CommandLine
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    CommandLine::new("btrfs").args(args)
}

fn display(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[derive(Clone)]
pub struct BtrfsDriver {
    inner: Arc<Shared>,
}

struct Shared {
    root: PathBuf,
    context: DriverContext,
    /// Object id of the subvolume holding the root
    object_id: u64,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl BtrfsDriver {
    pub fn new(context: &DriverContext, root: &Path) -> Result<Self> {
        let show = context.run(btrfs(["subvolume", "show", &display(root)]))?;
        let object_id = parse_object_id(&show.stdout);
        fs::create_dir_all(root.join(POOL_DIR).join("volumes"))?;
        debug!(root = %root.display(), object_id, "btrfs driver root");
        Ok(Self {
            inner: Arc::new(Shared {
                root: root.to_path_buf(),
                context: context.clone(),
                object_id,
                locks: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn init(context: &DriverContext, root: &Path, _args: &[String]) -> Result<Arc<dyn Driver>> {
        Ok(Arc::new(Self::new(context, root)?))
    }

    fn context(&self) -> &DriverContext {
        &self.inner.context
    }

    fn volume(&self, name: &str) -> BtrfsVolume {
        let lock = {
            let mut locks = self.inner.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(name.to_string()).or_default())
        };
        BtrfsVolume {
            driver: self.clone(),
            name: name.to_string(),
            path: self.inner.root.join(name),
            tenant: tenant_of(name).to_string(),
            lock,
        }
    }

    /// Names of subvolumes directly under the root, from `subvolume list`.
    fn subvolumes(&self, read_only: bool) -> Result<BTreeSet<String>> {
        let mut args = vec!["subvolume".to_string(), "list".to_string()];
        if read_only {
            args.push("-r".to_string());
        }
        args.push(display(&self.inner.root));
        let output = self.context().run(btrfs(args))?;
        Ok(parse_subvolume_list(&output.stdout)
            .into_iter()
            .filter(|row| row.top_level == self.inner.object_id)
            .map(|row| row.name().to_string())
            .filter(|name| !name.starts_with('.'))
            .collect())
    }
}

impl Driver for BtrfsDriver {
    fn root(&self) -> &Path {
        &self.inner.root
    }

    fn driver_type(&self) -> DriverType {
        DriverType::Btrfs
    }

    fn create(&self, name: &str) -> Result<Box<dyn Volume>> {
        if self.exists(name) {
            return Err(VolumeError::VolumeExists(name.to_string()));
        }
        let path = self.inner.root.join(name);
        self.context()
            .run(btrfs(["subvolume", "create", &display(&path)]))?;
        info!(volume = name, root = %self.inner.root.display(), "created btrfs subvolume");
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

    /// Writable subvolumes under the root; snapshots are left out.
    fn list(&self) -> Vec<String> {
        let listed = self
            .subvolumes(false)
            .and_then(|all| Ok((all, self.subvolumes(true)?)));
        match listed {
            Ok((all, read_only)) => all.difference(&read_only).cloned().collect(),
            Err(err) => {
                warn!(root = %self.inner.root.display(), "could not list subvolumes: {err}");
                Vec::new()
            }
        }
    }

    fn exists(&self, name: &str) -> bool {
        let path = self.inner.root.join(name);
        path.is_dir()
            && self
                .context()
                .run_unchecked(btrfs(["subvolume", "show", &display(&path)]))
                .is_ok_and(|output| output.success())
    }

    fn release(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        if !self.exists(name) {
            warn!(volume = name, "btrfs volume does not exist; nothing to remove");
            return Ok(());
        }
        let volume = self.volume(name);
        for label in volume.snapshots()? {
            volume.remove_snapshot(&label)?;
        }

        let _guard = volume.guard();
        self.context()
            .run(btrfs(["subvolume", "delete", &display(&volume.path)]))
            .map_err(|err| VolumeError::RemovingVolume {
                volume: name.to_string(),
                reason: err.to_string(),
            })?;
        info!(volume = name, "removed btrfs subvolume");
        Ok(())
    }

    fn resize(&self, name: &str, size: u64) -> Result<()> {
        debug!(volume = name, size, "btrfs subvolumes share the filesystem; nothing to resize");
        Ok(())
    }

    fn status(&self) -> Result<Status> {
        let rows = btrfs_df(self.context().runner.as_ref(), &self.inner.root)?;
        let mut usage_data = Vec::new();
        for row in rows {
            let label = format!("{} {}", row.data_type, row.level);
            usage_data.push(Usage::new(label.clone(), "Total", row.total));
            usage_data.push(Usage::new(label, "Used", row.used));
        }
        Ok(Status::Simple(SimpleStatus {
            driver: DriverType::Btrfs,
            driver_data: BTreeMap::from([(
                "DataFile".to_string(),
                self.inner.root.display().to_string(),
            )]),
            usage_data,
        }))
    }

    fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    fn supports(&self, capability: Capability) -> bool {
        capability != Capability::Tag
    }
}

pub struct BtrfsVolume {
    driver: BtrfsDriver,
    name: String,
    path: PathBuf,
    tenant: String,
    lock: Arc<Mutex<()>>,
}

impl BtrfsVolume {
    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn context(&self) -> &DriverContext {
        self.driver.context()
    }

    fn snapshot_path(&self, raw: &str) -> PathBuf {
        self.driver.inner.root.join(raw)
    }

    fn list_snapshots(&self) -> Result<Vec<String>> {
        let output = self.context().run(btrfs([
            "subvolume".to_string(),
            "list".to_string(),
            "-apucr".to_string(),
            display(&self.path),
        ]))?;

        let mut seen = BTreeSet::new();
        let found: Vec<(String, PathBuf)> = parse_subvolume_list(&output.stdout)
            .iter()
            .map(|row| row.name().to_string())
            .filter(|name| is_snapshot(&self.tenant, name))
            .filter(|name| self.snapshot_path(name).is_dir())
            .filter(|name| seen.insert(name.clone()))
            .map(|name| {
                let path = self.snapshot_path(&name);
                (name, path)
            })
            .collect();
        Ok(by_creation(found))
    }

    fn snapshot_exists(&self, raw: &str) -> Result<bool> {
        Ok(self.list_snapshots()?.iter().any(|label| label == raw))
    }

    fn info(&self, label: &str) -> Result<SnapshotInfo> {
        let raw = raw_label(&self.tenant, label);
        let path = self.snapshot_path(&raw);
        read_info(&self.tenant, label, &path.join(SNAPSHOT_INFO_FILE), path.is_dir())
    }

    /// Delete the live subvolume, waiting out transient `EBUSY` failures
    /// until the rollback deadline.
    fn delete_when_idle(&self) -> Result<()> {
        let config = &self.context().config;
        let deadline = Instant::now() + config.btrfs_rollback_timeout();
        loop {
            let output = self
                .context()
                .run_unchecked(btrfs(["subvolume", "delete", &display(&self.path)]))?;
            if output.success() {
                return Ok(());
            }
            if !output.combined().contains(BUSY) || Instant::now() >= deadline {
                return output.check().map(drop).map_err(VolumeError::from);
            }
            warn!(
                volume = %self.name,
                retry_in = ?config.btrfs_busy_retry(),
                "subvolume is busy; waiting to delete it"
            );
            thread::sleep(config.btrfs_busy_retry());
        }
    }

    /// Receive a send stream into `scratch`, then re-snapshot what arrived
    /// read-only as snapshot `raw`.
    fn receive(&self, raw: &str, scratch: &Path, reader: &mut dyn Read) -> Result<()> {
        let command = btrfs(["receive", &display(scratch)]);
        debug!(command = %command, "receiving snapshot");
        self.context().runner.run_with_input(&command, reader)?.check()?;

        let received = fs::read_dir(scratch)?
            .filter_map(|entry| entry.ok())
            .find(|entry| entry.file_type().is_ok_and(|kind| kind.is_dir()))
            .map(|entry| entry.path())
            .ok_or_else(|| VolumeError::IncompatibleSnapshot(raw.to_string()))?;

        let snapshot = self.context().run(btrfs([
            "subvolume".to_string(),
            "snapshot".to_string(),
            "-r".to_string(),
            display(&received),
            display(&self.snapshot_path(raw)),
        ]));
        self.delete_scratch(&received);
        snapshot.map(drop)
    }

    fn delete_scratch(&self, path: &Path) {
        if let Err(err) = self
            .context()
            .run(btrfs(["subvolume", "delete", &display(path)]))
        {
            warn!(path = %path.display(), "could not delete import scratch subvolume: {err}");
        }
    }
}

impl Volume for BtrfsVolume {
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

    /// Files are written into the live volume and captured by the next
    /// snapshot.
    fn write_metadata(&self, _label: &str, name: &str) -> Result<Box<dyn Write + Send>> {
        let path = self.path.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Box::new(File::create(path)?))
    }

    fn read_metadata(&self, label: &str, name: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.snapshot_path(&raw_label(&self.tenant, label)).join(name);
        Ok(Box::new(File::open(path)?))
    }

    fn snapshot(&self, label: &str, message: &str, tags: &[String]) -> Result<()> {
        let raw = raw_label(&self.tenant, label);
        let _guard = self.guard();
        let destination = self.snapshot_path(&raw);
        if destination.is_dir() {
            return Err(VolumeError::SnapshotExists(raw));
        }
        ensure_tags_unused(&self.list_snapshots()?, tags, |label| self.info(label))?;

        let info = new_info(&self.tenant, &raw, message, tags);
        write_info(&self.path.join(SNAPSHOT_INFO_FILE), &info)?;
        self.context().run(btrfs([
            "subvolume".to_string(),
            "snapshot".to_string(),
            "-r".to_string(),
            display(&self.path),
            display(&destination),
        ]))?;
        info!(volume = %self.name, snapshot = %raw, "created btrfs snapshot");
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
        if !self.snapshot_exists(&raw)? {
            return Err(VolumeError::SnapshotDoesNotExist(raw));
        }
        self.context()
            .run(btrfs(["subvolume", "delete", &display(&self.snapshot_path(&raw))]))
            .map_err(|err| VolumeError::RemovingSnapshot {
                snapshot: raw.clone(),
                reason: err.to_string(),
            })?;
        info!(volume = %self.name, snapshot = %raw, "removed btrfs snapshot");
        Ok(())
    }

    fn rollback(&self, label: &str) -> Result<()> {
        let raw = raw_label(&self.tenant, label);
        let _guard = self.guard();
        if !self.snapshot_exists(&raw)? {
            return Err(VolumeError::SnapshotDoesNotExist(raw));
        }
        self.info(&raw)?;

        if self.path.is_dir() {
            self.delete_when_idle()?;
        }
        self.context().run(btrfs([
            "subvolume".to_string(),
            "snapshot".to_string(),
            display(&self.snapshot_path(&raw)),
            display(&self.path),
        ]))?;
        info!(volume = %self.name, snapshot = %raw, "rolled back btrfs volume");
        Ok(())
    }

    fn tag_snapshot(&self, _label: &str, _tag: &str) -> Result<()> {
        Err(VolumeError::not_supported(DriverType::Btrfs, Capability::Tag))
    }

    fn untag_snapshot(&self, _tag: &str) -> Result<String> {
        Err(VolumeError::not_supported(DriverType::Btrfs, Capability::Tag))
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
        let raw = raw_label(&self.tenant, label);
        let _guard = self.guard();
        if !self.snapshot_exists(&raw)? {
            return Err(VolumeError::SnapshotDoesNotExist(raw));
        }

        let mut args = vec!["send".to_string()];
        let parent = parent.trim();
        if !parent.is_empty() {
            let parent = raw_label(&self.tenant, parent);
            if !self.snapshot_exists(&parent)? {
                return Err(VolumeError::SnapshotDoesNotExist(parent));
            }
            args.push("-p".to_string());
            args.push(display(&self.snapshot_path(&parent)));
        }
        args.push(display(&self.snapshot_path(&raw)));

        let command = btrfs(args);
        debug!(command = %command, "streaming snapshot");
        self.context().runner.run_to_writer(&command, writer)?.check()?;
        info!(volume = %self.name, snapshot = %raw, "exported btrfs snapshot");
        Ok(())
    }

    fn import(&self, label: &str, reader: &mut dyn Read) -> Result<()> {
        let raw = raw_label(&self.tenant, label);
        let _guard = self.guard();
        if self.snapshot_exists(&raw)? || self.snapshot_path(&raw).exists() {
            return Err(VolumeError::SnapshotExists(raw));
        }

        let scratch = self.driver.inner.root.join(POOL_DIR).join(format!("import-{raw}"));
        self.context()
            .run(btrfs(["subvolume", "create", &display(&scratch)]))?;

        let result = self.receive(&raw, &scratch, reader);
        self.delete_scratch(&scratch);
        result?;
        info!(volume = %self.name, snapshot = %raw, "imported btrfs snapshot");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use storage_sys::{Reply, ScriptedRunner};

    use super::*;
    use crate::config::VolumeConfig;

    const SHOW: &str = "/srv/volumes\n\tName: \t\t\tvolumes\n\tObject ID: \t\t257\n";

    fn driver(runner: Arc<ScriptedRunner>, root: &Path) -> BtrfsDriver {
        let context = DriverContext::new(runner, VolumeConfig::default());
        BtrfsDriver::new(&context, root).expect("driver")
    }

    #[test]
    fn lists_writable_subvolumes_of_the_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("btrfs subvolume show", Reply::ok(SHOW));
        runner.on(
            format!("btrfs subvolume list {}", root.display()),
            Reply::ok(
                "ID 258 gen 10 top level 257 path volumes/app\n\
                 ID 259 gen 11 top level 257 path volumes/app_v1\n\
                 ID 260 gen 12 top level 5 path other\n\
                 ID 261 gen 13 top level 257 path volumes/.btrfs\n",
            ),
        );
        runner.on(
            format!("btrfs subvolume list -r {}", root.display()),
            Reply::ok("ID 259 gen 11 top level 257 path volumes/app_v1\n"),
        );

        assert_eq!(driver(runner, root).list(), ["app"]);
    }

    #[test]
    fn status_reports_each_profile() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("btrfs subvolume show", Reply::ok(SHOW));
        runner.on(
            "btrfs filesystem df -b",
            Reply::ok(
                "Data, single: total=8388608, used=65536\n\
                 System, DUP: total=8388608, used=16384\n\
                 Metadata, DUP: total=107341824, used=131072\n",
            ),
        );

        let Status::Simple(status) = driver(runner, dir.path()).status().expect("status") else {
            panic!("btrfs reports a simple status");
        };
        assert_eq!(status.driver, DriverType::Btrfs);
        assert_eq!(status.usage_data.len(), 6);
        assert_eq!(status.usage_data[0], Usage::new("Data single", "Total", 8_388_608));
        assert_eq!(status.usage_data[5], Usage::new("Metadata DUP", "Used", 131_072));
    }

    #[test]
    fn rollback_waits_out_busy_subvolumes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        fs::create_dir_all(root.join("app")).expect("mkdir");
        let info = new_info("app", "app_v1", "", &[]);
        write_info(&root.join("app_v1").join(SNAPSHOT_INFO_FILE), &info).expect("info");

        let runner = Arc::new(ScriptedRunner::new());
        runner.on("btrfs subvolume show", Reply::ok(SHOW));
        runner.on(
            "btrfs subvolume list -apucr",
            Reply::ok("ID 259 gen 11 top level 257 path <FS_TREE>/volumes/app_v1\n"),
        );
        let delete = format!("btrfs subvolume delete {}", root.join("app").display());
        runner.on(delete.clone(), Reply::fail(1, "ERROR: Device or resource busy"));
        runner.on(delete.clone(), Reply::ok(""));

        let context = DriverContext::new(
            Arc::clone(&runner) as Arc<dyn storage_sys::CommandRunner>,
            VolumeConfig {
                btrfs_busy_retry_secs: 0,
                ..VolumeConfig::default()
            },
        );
        let driver = BtrfsDriver::new(&context, root).expect("driver");
        driver.get("app").expect("get").rollback("v1").expect("rollback");

        assert_eq!(runner.call_count(&delete), 2);
        assert_eq!(
            runner.call_count(&format!(
                "btrfs subvolume snapshot {} {}",
                root.join("app_v1").display(),
                root.join("app").display()
            )),
            1
        );
    }

    #[test]
    fn tags_cannot_change_on_read_only_snapshots() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("btrfs subvolume show", Reply::ok(SHOW));
        let driver = driver(runner, dir.path());
        let volume = driver.get("app").expect("get");

        assert!(!volume.supports(Capability::Tag));
        assert!(volume.supports(Capability::Export));
        assert!(volume.tag_snapshot("v1", "live").expect_err("tag").is_not_supported());
        assert!(volume.untag_snapshot("live").expect_err("untag").is_not_supported());
    }

    #[test]
    fn export_requires_a_label() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("btrfs subvolume show", Reply::ok(SHOW));
        let volume = driver(runner, dir.path()).get("app").expect("get");

        let mut sink = Vec::new();
        assert!(matches!(
            volume.export("  ", "", &mut sink),
            Err(VolumeError::InvalidLabel(_))
        ));
    }
}
