// SPDX-License-Identifier: GPL-3.0-only

//! btrfs backend against a fake `btrfs` tool that keeps subvolumes as plain
//! directories

mod common;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use storage_sys::{CommandLine, Reply, ScriptedRunner};
use storage_types::DriverType;
use storage_volume::{DriverContext, Registry, VolumeConfig, VolumeError};

#[derive(Default)]
struct FakeBtrfs {
    roots: Vec<PathBuf>,
    /// Subvolume path to (id, read-only)
    subvolumes: Mutex<BTreeMap<PathBuf, (u64, bool)>>,
}

fn copy_tree(source: &Path, destination: &Path) -> std::io::Result<()> {
    fs::create_dir_all(destination)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let target = destination.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

impl FakeBtrfs {
    fn new(roots: &[&Path]) -> Arc<Self> {
        Arc::new(Self {
            roots: roots.iter().map(|root| root.to_path_buf()).collect(),
            ..Default::default()
        })
    }

    fn add(&self, path: &Path, read_only: bool) {
        let mut subvolumes = self.subvolumes.lock().unwrap_or_else(PoisonError::into_inner);
        let id = 256 + subvolumes.len() as u64 + 1;
        subvolumes.insert(path.to_path_buf(), (id, read_only));
    }

    fn listing(&self, only_read_only: bool, under: Option<&Path>) -> String {
        let subvolumes = self.subvolumes.lock().unwrap_or_else(PoisonError::into_inner);
        subvolumes
            .iter()
            .filter(|(_, (_, read_only))| *read_only || !only_read_only)
            .filter(|(path, _)| under.is_none_or(|root| path.parent() == Some(root)))
            .filter_map(|(path, (id, _))| {
                let name = path.file_name()?.to_string_lossy();
                Some(format!("ID {id} gen 1 top level 5 path {name}\n"))
            })
            .collect()
    }

    fn handle(&self, command: &CommandLine, input: &[u8]) -> Option<Reply> {
        if command.program != "btrfs" {
            return None;
        }
        let args: Vec<&str> = command.args.iter().map(String::as_str).collect();
        let done = |result: std::io::Result<()>| match result {
            Ok(()) => Reply::ok(""),
            Err(err) => Reply::fail(1, err.to_string()),
        };

        let reply = match args.as_slice() {
            ["subvolume", "show", path] => {
                let path = Path::new(path);
                let known = self
                    .subvolumes
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .contains_key(path);
                if known || self.roots.iter().any(|root| root == path) {
                    Reply::ok("")
                } else {
                    Reply::fail(1, "Not a Btrfs subvolume")
                }
            }
            ["subvolume", "create", path] => {
                self.add(Path::new(path), false);
                done(fs::create_dir_all(path))
            }
            ["subvolume", "snapshot", "-r", source, destination] => {
                self.add(Path::new(destination), true);
                done(copy_tree(Path::new(source), Path::new(destination)))
            }
            ["subvolume", "snapshot", source, destination] => {
                self.add(Path::new(destination), false);
                done(copy_tree(Path::new(source), Path::new(destination)))
            }
            ["subvolume", "delete", path] => {
                self.subvolumes
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(Path::new(path));
                done(fs::remove_dir_all(path))
            }
            ["subvolume", "list", "-apucr", _] => Reply::ok(self.listing(true, None)),
            ["subvolume", "list", "-r", root] => Reply::ok(self.listing(true, Some(Path::new(root)))),
            ["subvolume", "list", root] => Reply::ok(self.listing(false, Some(Path::new(root)))),
            ["send", snapshot] => Reply::ok(snapshot.as_bytes().to_vec()),
            ["receive", scratch] => {
                let source = PathBuf::from(String::from_utf8_lossy(input).to_string());
                let name = source.file_name()?;
                let received = Path::new(scratch).join(name);
                self.add(&received, true);
                done(copy_tree(&source, &received))
            }
            _ => return None,
        };
        Some(reply)
    }
}

fn registry_over(fake: &Arc<FakeBtrfs>) -> Registry {
    let handler = Arc::clone(fake);
    let runner = ScriptedRunner::new().with_handler(move |command, input| handler.handle(command, input));
    let config = VolumeConfig {
        btrfs_busy_retry_secs: 0,
        ..VolumeConfig::default()
    };
    Registry::with_default_backends(DriverContext::new(Arc::new(runner), config))
}

#[test]
fn snapshots_are_read_only_subvolumes_that_roll_back() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fake = FakeBtrfs::new(&[dir.path()]);
    let registry = registry_over(&fake);

    let volume = registry.mount(DriverType::Btrfs, "app", dir.path()).expect("mount");
    fs::write(volume.path().join("state"), b"before").expect("write");
    volume.snapshot("v1", "before upgrade", &["good".to_string()]).expect("snapshot");
    fs::write(volume.path().join("state"), b"after").expect("write");

    let driver = registry.get_driver(dir.path()).expect("driver");
    assert_eq!(driver.list(), ["app"]);
    assert_eq!(volume.snapshots().expect("snapshots"), ["app_v1"]);
    assert_eq!(volume.get_snapshot_with_tag("good").expect("tagged").name, "app_v1");
    assert!(matches!(
        volume.snapshot("v1", "", &[]),
        Err(VolumeError::SnapshotExists(_))
    ));

    volume.rollback("v1").expect("rollback");
    assert_eq!(fs::read(volume.path().join("state")).expect("read"), b"before");
    assert_eq!(volume.snapshot_info("app_v1").expect("info").message, "before upgrade");

    driver.remove("app").expect("remove");
    assert!(!dir.path().join("app").exists());
    assert!(!dir.path().join("app_v1").exists());
    assert!(driver.list().is_empty());
}

#[test]
fn send_streams_import_through_a_scratch_subvolume() {
    let source_dir = tempfile::tempdir().expect("source");
    let target_dir = tempfile::tempdir().expect("target");
    let fake = FakeBtrfs::new(&[source_dir.path(), target_dir.path()]);
    let registry = registry_over(&fake);

    let source = registry
        .mount(DriverType::Btrfs, "app", source_dir.path())
        .expect("mount source");
    fs::write(source.path().join("data"), b"payload").expect("write");
    source.snapshot("v1", "shipped", &[]).expect("snapshot");

    let mut stream = Vec::new();
    source.export("v1", "", &mut stream).expect("export");
    assert!(matches!(
        source.export("v1", "v0", &mut Vec::new()),
        Err(VolumeError::SnapshotDoesNotExist(_))
    ));

    let target = registry
        .mount(DriverType::Btrfs, "app", target_dir.path())
        .expect("mount target");
    target.import("v1", &mut stream.as_slice()).expect("import");

    assert_eq!(target.snapshots().expect("snapshots"), ["app_v1"]);
    assert_eq!(target.snapshot_info("v1").expect("info").message, "shipped");
    assert_eq!(
        fs::read(target_dir.path().join("app_v1/data")).expect("read"),
        b"payload"
    );
    let scratch = target_dir.path().join(".btrfs/import-app_v1");
    assert!(!scratch.exists());

    assert!(matches!(
        target.import("v1", &mut stream.as_slice()),
        Err(VolumeError::SnapshotExists(_))
    ));
}
