// SPDX-License-Identifier: GPL-3.0-only

//! Filesystem usage from `df`, `btrfs filesystem df` and `statvfs`

use std::path::Path;

use nix::sys::statvfs::statvfs;
use storage_types::pretty_to_bytes;
use tracing::{debug, warn};

use crate::runner::{CommandLine, CommandRunner};
use crate::{Result, SysError};

/// One row of `df --output=source,size,used,avail -B1`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfRow {
    pub source: String,
    pub size: u64,
    pub used: u64,
    pub available: u64,
}

/// Parse `df --output=source,size,used,avail -B1` output, header included.
pub fn parse_df(output: &str) -> Result<Vec<DfRow>> {
    output
        .lines()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 4 {
                return Err(SysError::parse(format!(
                    "expected 4 df fields, got {} in {line:?}",
                    fields.len()
                )));
            }
            let number = |field: &str| {
                field
                    .parse::<u64>()
                    .map_err(|_| SysError::parse(format!("invalid df size {field:?}")))
            };
            Ok(DfRow {
                source: fields[0].to_string(),
                size: number(fields[1])?,
                used: number(fields[2])?,
                available: number(fields[3])?,
            })
        })
        .collect()
}

/// Byte usage of the filesystem holding `path`.
pub fn df(runner: &dyn CommandRunner, path: &Path) -> Result<Vec<DfRow>> {
    let output = runner.capture(
        &CommandLine::new("df")
            .args(["--output=source,size,used,avail", "-B1"])
            .arg(path.to_string_lossy()),
    )?;
    debug!(path = %path.display(), "df output: {output}");
    parse_df(&output)
}

/// One allocation profile reported by `btrfs filesystem df`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtrfsDfRow {
    /// `Data`, `System`, `Metadata` or `GlobalReserve`
    pub data_type: String,
    /// Allocation profile such as `single` or `DUP`
    pub level: String,
    pub total: u64,
    pub used: u64,
}

fn btrfs_size(field: &str, key: &str, line: &str) -> Result<u64> {
    let value = field
        .strip_prefix(key)
        .ok_or_else(|| SysError::parse(format!("expected {key} field in {line:?}")))?;
    pretty_to_bytes(value).ok_or_else(|| SysError::parse(format!("invalid size {value:?} in {line:?}")))
}

/// Parse `btrfs filesystem df` output, with or without `-b`.
///
/// ```text
/// Data, single: total=8388608, used=65536
/// System, DUP: total=8.00MiB, used=16.00KiB
/// ```
pub fn parse_btrfs_df(output: &str) -> Result<Vec<BtrfsDfRow>> {
    let lines: Vec<&str> = output.lines().filter(|line| !line.trim().is_empty()).collect();
    if lines.len() < 3 {
        return Err(SysError::parse(format!("insufficient btrfs df output: {output:?}")));
    }

    lines
        .into_iter()
        .map(|line| {
            let fields: Vec<&str> = line
                .split(|c: char| c.is_whitespace() || c == ',' || c == ':')
                .filter(|field| !field.is_empty())
                .collect();
            if fields.len() != 4 {
                return Err(SysError::parse(format!(
                    "expected 4 fields, got {} in {line:?}",
                    fields.len()
                )));
            }
            match fields[0] {
                "Data" | "System" | "Metadata" | "GlobalReserve" => Ok(BtrfsDfRow {
                    data_type: fields[0].to_string(),
                    level: fields[1].to_string(),
                    total: btrfs_size(fields[2], "total=", line)?,
                    used: btrfs_size(fields[3], "used=", line)?,
                }),
                other => Err(SysError::parse(format!("unrecognized profile {other:?} in {line:?}"))),
            }
        })
        .collect()
}

/// `btrfs filesystem df` of `path`, retrying without `-b` for older btrfs-progs.
pub fn btrfs_df(runner: &dyn CommandRunner, path: &Path) -> Result<Vec<BtrfsDfRow>> {
    let path = path.to_string_lossy();
    let raw = CommandLine::new("btrfs").args(["filesystem", "df", "-b", &*path]);
    let output = match runner.capture(&raw) {
        Ok(output) => output,
        Err(err) => {
            warn!("{raw} failed, retrying without -b: {err}");
            runner.capture(&CommandLine::new("btrfs").args(["filesystem", "df", &*path]))?
        }
    };
    parse_btrfs_df(&output)
}

/// Capacity of the filesystem holding a path, from `statvfs`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilesystemStats {
    pub total: u64,
    pub used: u64,
    pub available: u64,
}

pub fn filesystem_stats(path: &Path) -> Result<FilesystemStats> {
    let stats = statvfs(path).map_err(|errno| SysError::Io(errno.into()))?;
    let fragment = stats.fragment_size() as u64;
    let total = stats.blocks() as u64 * fragment;
    let free = stats.blocks_free() as u64 * fragment;
    Ok(FilesystemStats {
        total,
        used: total.saturating_sub(free),
        available: stats.blocks_available() as u64 * fragment,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{Reply, ScriptedRunner};

    #[test]
    fn parses_df_rows() {
        let rows = parse_df(
            "Filesystem        1B-blocks        Used       Avail\n/dev/sda1      105088212992 43243298816 56461205504\n",
        )
        .expect("parse df");

        assert_eq!(
            rows,
            [DfRow {
                source: "/dev/sda1".to_string(),
                size: 105088212992,
                used: 43243298816,
                available: 56461205504,
            }]
        );
        assert!(parse_df("Filesystem 1B-blocks Used Avail\n/dev/sda1 1 2\n").is_err());
    }

    #[test]
    fn parses_btrfs_df_in_bytes_and_units() {
        let raw = "Data, single: total=8388608, used=65536\nSystem, DUP: total=8388608, used=16384\nMetadata, DUP: total=53673984, used=114688\nGlobalReserve, single: total=16777216, used=0\n";
        let rows = parse_btrfs_df(raw).expect("parse raw");
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[1].level, "DUP");
        assert_eq!(rows[2].total, 53673984);

        let pretty = "System, DUP: total=8.00MiB, used=16.00KiB\nSystem, single: total=4.00MiB, used=0.00B\nMetadata, DUP: total=51.19MiB, used=112.00KiB\n";
        let rows = parse_btrfs_df(pretty).expect("parse pretty");
        assert_eq!(rows[0].total, 8 * 1024 * 1024);
        assert_eq!(rows[0].used, 16 * 1024);
        assert_eq!(rows[1].used, 0);
    }

    #[test]
    fn rejects_unexpected_btrfs_df_lines() {
        assert!(parse_btrfs_df("Data, single: total=1, used=1\n").is_err());
        assert!(parse_btrfs_df("Data, single: total=1, used=1\nBogus, single: total=1, used=1\nSystem, DUP: total=1, used=1\n").is_err());
    }

    #[test]
    fn btrfs_df_falls_back_without_raw_flag() {
        let runner = ScriptedRunner::new();
        runner
            .on("btrfs filesystem df -b", Reply::fail(1, "unknown option -b"))
            .on(
                "btrfs filesystem df /srv",
                Reply::ok("Data, single: total=1.00GiB, used=0.50GiB\nSystem, single: total=4.00MiB, used=16.00KiB\nMetadata, single: total=8.00MiB, used=1.00MiB\n"),
            );

        let rows = btrfs_df(&runner, Path::new("/srv")).expect("btrfs df");
        assert_eq!(rows[0].used, 512 * 1024 * 1024);
        assert_eq!(runner.calls().len(), 2);
    }

    #[test]
    fn statvfs_reports_consistent_numbers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stats = filesystem_stats(dir.path()).expect("statvfs");
        assert!(stats.total >= stats.used);
        assert!(stats.total >= stats.available);
    }
}
