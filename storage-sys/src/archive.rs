// SPDX-License-Identifier: GPL-3.0-only

//! Tar export and import of volume trees, preserving modes and ownership

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::{FileTypeExt, lchown};
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use nix::unistd::{getgid, getuid};
use tar::{Archive, Builder, EntryType, Header};
use tracing::{debug, warn};

use crate::Result;

/// Streams directory trees and small files into a tar archive
pub struct ArchiveWriter<W: Write> {
    builder: Builder<W>,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(writer: W) -> Self {
        let mut builder = Builder::new(writer);
        builder.follow_symlinks(false);
        Self { builder }
    }

    /// Add a regular file holding `data`, owned by the current user.
    pub fn append_bytes(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_uid(u64::from(getuid().as_raw()));
        header.set_gid(u64::from(getgid().as_raw()));
        header.set_mtime(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or_default(),
        );
        self.builder.append_data(&mut header, name, data)?;
        Ok(())
    }

    /// Add `path` and everything below it under the archive name `name`.
    ///
    /// Sockets, named pipes and device nodes cannot be carried and are skipped.
    pub fn append_directory(&mut self, path: &Path, name: &str) -> Result<()> {
        self.append_tree(path, Path::new(name))
    }

    fn append_tree(&mut self, path: &Path, name: &Path) -> Result<()> {
        let file_type = fs::symlink_metadata(path)?.file_type();
        if file_type.is_socket()
            || file_type.is_fifo()
            || file_type.is_block_device()
            || file_type.is_char_device()
        {
            warn!(path = %path.display(), "cannot export special file, skipping");
            return Ok(());
        }

        self.builder.append_path_with_name(path, name)?;
        if file_type.is_dir() {
            let mut children = fs::read_dir(path)?.collect::<std::io::Result<Vec<_>>>()?;
            children.sort_by_key(|child| child.file_name());
            for child in children {
                self.append_tree(&child.path(), &name.join(child.file_name()))?;
            }
        }
        Ok(())
    }

    pub fn finish(self) -> Result<W> {
        Ok(self.builder.into_inner()?)
    }
}

/// Where an archive entry should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Unpack to this path
    Extract(PathBuf),
    /// Keep the entry's contents in memory
    Capture,
    Skip,
}

/// Unpack an archive, routing each entry by its name.
///
/// Returns the contents of captured entries keyed by entry name. Ownership
/// is restored when permitted; failures to do so are logged.
pub fn import_archive(
    reader: &mut dyn Read,
    mut route: impl FnMut(&Path) -> Route,
) -> Result<BTreeMap<PathBuf, Vec<u8>>> {
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);

    let mut captured = BTreeMap::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.into_owned();

        if name.components().any(|part| matches!(part, Component::ParentDir)) {
            warn!(entry = %name.display(), "refusing archive entry outside its root");
            continue;
        }

        match route(&name) {
            Route::Skip => {}
            Route::Capture => {
                let mut contents = Vec::new();
                entry.read_to_end(&mut contents)?;
                captured.insert(name, contents);
            }
            Route::Extract(destination) => {
                if let Some(parent) = destination.parent() {
                    fs::create_dir_all(parent)?;
                }
                entry.unpack(&destination)?;

                match entry_owner(entry.header()) {
                    Ok((uid, gid)) => {
                        if let Err(err) = lchown(&destination, Some(uid), Some(gid)) {
                            warn!(path = %destination.display(), uid, gid, "could not restore ownership: {err}");
                        }
                    }
                    Err(reason) => {
                        warn!(entry = %name.display(), "keeping default ownership: {reason}");
                    }
                }
                debug!(entry = %name.display(), path = %destination.display(), "imported");
            }
        }
    }
    Ok(captured)
}

/// Numeric owner recorded in an entry header.
fn entry_owner(header: &Header) -> std::result::Result<(u32, u32), String> {
    let id = |field: &str, value: std::io::Result<u64>| {
        let value = value.map_err(|err| format!("unreadable {field}: {err}"))?;
        u32::try_from(value).map_err(|_| format!("{field} {value} out of range"))
    };
    Ok((id("uid", header.uid())?, id("gid", header.gid())?))
}

/// Path of `name` relative to `prefix`, when `name` lies under it.
pub fn strip_entry_prefix<'a>(name: &'a Path, prefix: &str) -> Option<&'a Path> {
    name.strip_prefix(prefix).ok()
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::{MetadataExt, PermissionsExt, symlink};

    use super::*;

    fn mode(path: &Path) -> u32 {
        fs::symlink_metadata(path).expect("metadata").permissions().mode() & 0o7777
    }

    #[test]
    fn round_trips_a_tree_with_modes_and_links() {
        let source = tempfile::tempdir().expect("source");
        let target = tempfile::tempdir().expect("target");

        let tree = source.path().join("tree");
        fs::create_dir_all(tree.join("nested")).expect("mkdir");
        fs::write(tree.join("nested/data.bin"), b"payload").expect("write");
        fs::set_permissions(tree.join("nested/data.bin"), fs::Permissions::from_mode(0o640))
            .expect("chmod");
        symlink("nested/data.bin", tree.join("link")).expect("symlink");

        let mut writer = ArchiveWriter::new(Vec::new());
        writer.append_bytes("label-driver", b"rsync").expect("driver entry");
        writer.append_directory(&tree, "label-volume").expect("tree");
        let bytes = writer.finish().expect("finish");

        let destination = target.path().to_path_buf();
        let captured = import_archive(&mut bytes.as_slice(), |name| {
            if name == Path::new("label-driver") {
                return Route::Capture;
            }
            match strip_entry_prefix(name, "label-volume") {
                Some(rest) => Route::Extract(destination.join("restored").join(rest)),
                None => Route::Skip,
            }
        })
        .expect("import");

        assert_eq!(captured[Path::new("label-driver")], b"rsync");

        let restored = target.path().join("restored");
        assert_eq!(fs::read(restored.join("nested/data.bin")).expect("read"), b"payload");
        assert_eq!(mode(&restored.join("nested/data.bin")), 0o640);
        assert_eq!(
            fs::read_link(restored.join("link")).expect("readlink"),
            Path::new("nested/data.bin")
        );

        let before = fs::metadata(tree.join("nested/data.bin")).expect("metadata");
        let after = fs::metadata(restored.join("nested/data.bin")).expect("metadata");
        assert_eq!((before.uid(), before.gid()), (after.uid(), after.gid()));
    }

    #[test]
    fn written_files_carry_the_current_owner() {
        let mut writer = ArchiveWriter::new(Vec::new());
        writer.append_bytes("label-driver", b"rsync").expect("entry");
        let bytes = writer.finish().expect("finish");

        let mut archive = Archive::new(bytes.as_slice());
        let entry = archive
            .entries()
            .expect("entries")
            .next()
            .expect("one entry")
            .expect("readable");
        let header = entry.header();
        assert_eq!(header.uid().expect("uid"), u64::from(getuid().as_raw()));
        assert_eq!(header.gid().expect("gid"), u64::from(getgid().as_raw()));
        assert!(header.mtime().expect("mtime") > 0);
    }

    #[test]
    fn entries_without_an_owner_still_unpack() {
        // a bare GNU header leaves the uid and gid fields blank
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(4);
        header.set_mode(0o600);
        header.set_mtime(1);
        let mut builder = Builder::new(Vec::new());
        builder
            .append_data(&mut header, "vol/file", &b"data"[..])
            .expect("append");
        let bytes = builder.into_inner().expect("finish");

        let target = tempfile::tempdir().expect("target");
        let destination = target.path().join("file");
        import_archive(&mut bytes.as_slice(), |_| Route::Extract(destination.clone()))
            .expect("import");
        assert_eq!(fs::read(&destination).expect("read"), b"data");
        assert_eq!(mode(&destination), 0o600);
    }

    #[test]
    fn skips_sockets() {
        let source = tempfile::tempdir().expect("source");
        let _listener = std::os::unix::net::UnixListener::bind(source.path().join("sock"))
            .expect("bind socket");
        fs::write(source.path().join("file"), b"x").expect("write");

        let mut writer = ArchiveWriter::new(Vec::new());
        writer.append_directory(source.path(), "vol").expect("tree");
        let bytes = writer.finish().expect("finish");

        let mut names = Vec::new();
        import_archive(&mut bytes.as_slice(), |name| {
            names.push(name.to_path_buf());
            Route::Skip
        })
        .expect("read back");

        assert!(names.contains(&PathBuf::from("vol/file")));
        assert!(!names.iter().any(|name| name.ends_with("sock")));
    }
}
