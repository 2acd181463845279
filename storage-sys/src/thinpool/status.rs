// SPDX-License-Identifier: GPL-3.0-only

use tracing::debug;

use crate::runner::{CommandLine, CommandRunner};
use crate::{Result, SysError};

/// Bytes per device-mapper sector
pub const SECTOR_SIZE: u64 = 512;

/// Thin-pool metadata is always allocated in 4 KiB blocks
pub const METADATA_BLOCK_SIZE: u64 = 4096;

/// Parsed `dmsetup status` line of a `thin-pool` target:
/// `<start> <length> thin-pool <transaction> <meta used>/<meta total>
/// <data used>/<data total> <held metadata root|-> ...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    pub transaction_id: u64,
    pub metadata_used: u64,
    pub metadata_total: u64,
    pub data_used: u64,
    pub data_total: u64,
    /// Block at which a reserved metadata snapshot is readable
    pub held_metadata_root: Option<u64>,
}

fn used_total(field: &str) -> Result<(u64, u64)> {
    let (used, total) = field
        .split_once('/')
        .ok_or_else(|| SysError::parse(format!("expected <used>/<total>, got {field:?}")))?;
    Ok((number(used)?, number(total)?))
}

fn number(field: &str) -> Result<u64> {
    field
        .parse()
        .map_err(|_| SysError::parse(format!("invalid number {field:?}")))
}

fn target_fields<'a>(output: &'a str, what: &str, min_fields: usize) -> Result<Vec<&'a str>> {
    let line = output
        .lines()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| SysError::parse(format!("empty {what} output")))?;
    let fields: Vec<&str> = line.split_whitespace().collect();

    if fields.get(2) != Some(&"thin-pool") {
        return Err(SysError::parse(format!("not a thin-pool target: {line:?}")));
    }
    if fields.len() < min_fields {
        return Err(SysError::parse(format!("truncated {what} line: {line:?}")));
    }
    Ok(fields)
}

impl PoolStatus {
    pub fn parse(output: &str) -> Result<Self> {
        let fields = target_fields(output, "dmsetup status", 7)?;
        let (metadata_used, metadata_total) = used_total(fields[4])?;
        let (data_used, data_total) = used_total(fields[5])?;
        let held_metadata_root = match fields[6] {
            "-" => None,
            block => Some(number(block)?),
        };

        Ok(Self {
            transaction_id: number(fields[3])?,
            metadata_used,
            metadata_total,
            data_used,
            data_total,
            held_metadata_root,
        })
    }

    pub fn query(runner: &dyn CommandRunner, pool: &str) -> Result<Self> {
        let output = runner.capture(&CommandLine::new("dmsetup").args(["status", pool]))?;
        let status = Self::parse(&output)?;
        debug!(pool, ?status, "pool status");
        Ok(status)
    }

    pub fn data_available(&self) -> u64 {
        self.data_total.saturating_sub(self.data_used)
    }

    pub fn metadata_available(&self) -> u64 {
        self.metadata_total.saturating_sub(self.metadata_used)
    }
}

/// Parsed `dmsetup table` line of a `thin-pool` target:
/// `<start> <length> thin-pool <metadata dev> <data dev> <block sectors> <low water mark> ...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolTable {
    pub length_sectors: u64,
    pub metadata_device: String,
    pub data_device: String,
    pub data_block_sectors: u64,
    pub low_water_mark: u64,
}

impl PoolTable {
    pub fn parse(output: &str) -> Result<Self> {
        let fields = target_fields(output, "dmsetup table", 7)?;
        Ok(Self {
            length_sectors: number(fields[1])?,
            metadata_device: fields[3].to_string(),
            data_device: fields[4].to_string(),
            data_block_sectors: number(fields[5])?,
            low_water_mark: number(fields[6])?,
        })
    }

    pub fn query(runner: &dyn CommandRunner, pool: &str) -> Result<Self> {
        let output = runner.capture(&CommandLine::new("dmsetup").args(["table", pool]))?;
        Self::parse(&output)
    }

    /// Size of one pool data block in bytes.
    pub fn data_block_size(&self) -> u64 {
        self.data_block_sectors * SECTOR_SIZE
    }
}
