// SPDX-License-Identifier: GPL-3.0-only

//! Snapshot labels, `.SNAPSHOTINFO` documents and tag lookups shared by the
//! backends

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::Utc;
use storage_types::{SNAPSHOT_INFO_FILE, SnapshotInfo};
use tracing::{debug, warn};

use crate::error::{Result, VolumeError};

/// Tenant owning a volume: everything before the first `_`.
pub fn tenant_of(volume: &str) -> &str {
    volume.split('_').next().unwrap_or(volume)
}

/// `label` with the `<tenant>_` prefix, added if missing.
pub fn raw_label(tenant: &str, label: &str) -> String {
    let prefix = format!("{tenant}_");
    if label.starts_with(&prefix) {
        label.to_string()
    } else {
        format!("{prefix}{label}")
    }
}

/// `raw` without its `<tenant>_` prefix.
pub fn pretty_label<'a>(tenant: &str, raw: &'a str) -> &'a str {
    raw.strip_prefix(tenant)
        .and_then(|rest| rest.strip_prefix('_'))
        .unwrap_or(raw)
}

/// Whether `name` is a snapshot label of `tenant`.
pub fn is_snapshot(tenant: &str, name: &str) -> bool {
    name.len() > tenant.len() + 1 && name.starts_with(&format!("{tenant}_"))
}

pub(crate) fn new_info(tenant: &str, raw: &str, message: &str, tags: &[String]) -> SnapshotInfo {
    SnapshotInfo {
        name: raw.to_string(),
        tenant_id: tenant.to_string(),
        label: pretty_label(tenant, raw).to_string(),
        tags: tags.to_vec(),
        message: message.to_string(),
        created: Utc::now(),
    }
}

pub(crate) fn write_info(path: &Path, info: &SnapshotInfo) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_vec(info)?)?;
    debug!(snapshot = %info.name, path = %path.display(), "wrote snapshot info");
    Ok(())
}

/// Read the info document of `label` from `path`.
///
/// A missing document marks the snapshot invalid when the snapshot itself
/// is present (`exists`) or the caller named it by its raw label.
pub(crate) fn read_info(tenant: &str, label: &str, path: &Path, exists: bool) -> Result<SnapshotInfo> {
    match fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            if exists || is_snapshot(tenant, label) {
                Err(VolumeError::InvalidSnapshot(label.to_string()))
            } else {
                Err(VolumeError::SnapshotDoesNotExist(label.to_string()))
            }
        }
        Err(err) => Err(err.into()),
    }
}

/// Order labels oldest first.
///
/// Each entry names the directory holding the snapshot's info document; the
/// recorded creation time is used when readable, else the directory's mtime.
pub(crate) fn by_creation(entries: Vec<(String, PathBuf)>) -> Vec<String> {
    let mut dated: Vec<(SystemTime, String)> = entries
        .into_iter()
        .map(|(label, dir)| {
            let created = fs::read(dir.join(SNAPSHOT_INFO_FILE))
                .ok()
                .and_then(|bytes| serde_json::from_slice::<SnapshotInfo>(&bytes).ok())
                .map(|info| SystemTime::from(info.created))
                .or_else(|| fs::metadata(&dir).and_then(|meta| meta.modified()).ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (created, label)
        })
        .collect();
    dated.sort();
    dated.into_iter().map(|(_, label)| label).collect()
}

/// First snapshot in `labels` carrying `tag`. Invalid snapshots are skipped.
pub(crate) fn find_tagged(
    labels: &[String],
    tag: &str,
    info: impl Fn(&str) -> Result<SnapshotInfo>,
) -> Result<SnapshotInfo> {
    for label in labels {
        match info(label) {
            Ok(info) if info.has_tag(tag) => return Ok(info),
            Ok(_) => {}
            Err(VolumeError::InvalidSnapshot(_)) => {
                warn!(snapshot = %label, "skipping snapshot without info");
            }
            Err(err) => return Err(err),
        }
    }
    Err(VolumeError::SnapshotDoesNotExist(format!("tag {tag}")))
}

/// Fail with `TagAlreadyExists` if any of `tags` is used by a snapshot in
/// `labels`.
pub(crate) fn ensure_tags_unused(
    labels: &[String],
    tags: &[String],
    info: impl Fn(&str) -> Result<SnapshotInfo>,
) -> Result<()> {
    for tag in tags {
        match find_tagged(labels, tag, &info) {
            Ok(existing) => {
                return Err(VolumeError::TagAlreadyExists {
                    tag: tag.clone(),
                    snapshot: existing.name,
                });
            }
            Err(VolumeError::SnapshotDoesNotExist(_)) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

pub(crate) fn without_tag(mut info: SnapshotInfo, tag: &str) -> SnapshotInfo {
    info.tags.retain(|candidate| candidate != tag);
    info
}
