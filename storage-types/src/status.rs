// SPDX-License-Identifier: GPL-3.0-only

//! Driver status models and their text report rendering

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::common::{bytes_to_pretty, grouped, percent};
use crate::driver::DriverType;

/// One usage figure reported by a driver, in bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(rename = "Label")]
    pub label: String,

    /// What the figure measures ("Total", "Used", "Available Bytes", ...)
    #[serde(rename = "Type")]
    pub usage_type: String,

    #[serde(rename = "Value")]
    pub value: u64,
}

impl Usage {
    pub fn new(label: impl Into<String>, usage_type: impl Into<String>, value: u64) -> Self {
        Self {
            label: label.into(),
            usage_type: usage_type.into(),
            value,
        }
    }
}

/// Status of a directory- or subvolume-backed driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleStatus {
    #[serde(rename = "Driver")]
    pub driver: DriverType,

    #[serde(rename = "DriverData", default)]
    pub driver_data: BTreeMap<String, String>,

    #[serde(rename = "UsageData", default)]
    pub usage_data: Vec<Usage>,
}

/// Storage accounting for one tenant volume in a thin pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TenantStorageStats {
    #[serde(rename = "TenantID")]
    pub tenant_id: String,
    pub volume_path: String,
    pub pool_available_blocks: u64,

    pub device_name: String,

    /// Virtual size of the thin device, in pool data blocks
    pub device_total_blocks: u64,
    /// Pool blocks mapped by the thin device
    pub device_allocated_blocks: u64,
    pub device_unallocated_blocks: u64,

    pub filesystem_total: u64,
    pub filesystem_used: u64,
    pub filesystem_available: u64,

    #[serde(default)]
    pub errors: Vec<String>,

    pub number_snapshots: usize,
    /// Blocks held only by snapshots, relative to the live device
    pub snapshot_allocated_blocks: u64,
}

/// Status of a device-mapper thin pool driver
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceMapperStatus {
    pub driver_path: String,
    pub pool_name: String,

    /// Size of one pool data block in bytes
    pub block_size: u64,

    pub pool_data_total: u64,
    pub pool_data_available: u64,
    pub pool_data_used: u64,

    pub pool_metadata_total: u64,
    pub pool_metadata_available: u64,
    pub pool_metadata_used: u64,

    #[serde(default)]
    pub driver_data: BTreeMap<String, String>,
    #[serde(default)]
    pub usage_data: Vec<Usage>,
    #[serde(default)]
    pub tenants: Vec<TenantStorageStats>,

    #[serde(default)]
    pub errors: Vec<String>,
}

impl DeviceMapperStatus {
    pub fn blocks_to_bytes(&self, blocks: u64) -> u64 {
        blocks.saturating_mul(self.block_size)
    }
}

/// Status returned by a single driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    DeviceMapper(DeviceMapperStatus),
    Simple(SimpleStatus),
}

impl Status {
    pub fn usage_data(&self) -> &[Usage] {
        match self {
            Status::DeviceMapper(status) => &status.usage_data,
            Status::Simple(status) => &status.usage_data,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::DeviceMapper(status) => status.fmt(f),
            Status::Simple(status) => status.fmt(f),
        }
    }
}

/// Aggregate status keyed by driver root path
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Statuses {
    pub device_mapper_status_map: BTreeMap<String, DeviceMapperStatus>,
    pub simple_status_map: BTreeMap<String, SimpleStatus>,
}

impl Statuses {
    pub fn insert(&mut self, path: impl Into<String>, status: Status) {
        match status {
            Status::DeviceMapper(status) => {
                self.device_mapper_status_map.insert(path.into(), status);
            }
            Status::Simple(status) => {
                self.simple_status_map.insert(path.into(), status);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.device_mapper_status_map.len() + self.simple_status_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

const LABEL_WIDTH: usize = 24;
const WIDE_LABEL_WIDTH: usize = 32;

impl fmt::Display for SimpleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<LABEL_WIDTH$}{}", "Driver:", self.driver)?;
        for (key, value) in &self.driver_data {
            writeln!(f, "{:<LABEL_WIDTH$}{}", format!("{key}:"), value)?;
        }
        writeln!(f, "Usage Data:")?;
        for usage in &self.usage_data {
            writeln!(
                f,
                "\t{} {}: {}",
                usage.label,
                usage.usage_type,
                bytes_to_pretty(usage.value, false)
            )?;
        }
        Ok(())
    }
}

fn write_triple(
    f: &mut fmt::Formatter<'_>,
    label: &str,
    total: u64,
    used: u64,
    available: u64,
) -> fmt::Result {
    writeln!(
        f,
        "{:<WIDE_LABEL_WIDTH$}{} / {} ({}) / {} ({})",
        label,
        bytes_to_pretty(total, false),
        bytes_to_pretty(used, false),
        percent(used, total),
        bytes_to_pretty(available, false),
        percent(available, total)
    )
}

impl fmt::Display for DeviceMapperStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<WIDE_LABEL_WIDTH$}{}", "Driver:", DriverType::DeviceMapper)?;
        writeln!(f, "{:<WIDE_LABEL_WIDTH$}{}", "Volume Path:", self.driver_path)?;
        writeln!(f)?;
        writeln!(f, "Thin Pool")?;
        writeln!(f, "---------")?;
        writeln!(f, "{:<WIDE_LABEL_WIDTH$}{}", "Logical Volume:", self.pool_name)?;
        write_triple(
            f,
            "Metadata (total/used/avail):",
            self.pool_metadata_total,
            self.pool_metadata_used,
            self.pool_metadata_available,
        )?;
        write_triple(
            f,
            "Data (total/used/avail):",
            self.pool_data_total,
            self.pool_data_used,
            self.pool_data_available,
        )?;

        for tenant in &self.tenants {
            writeln!(f)?;
            writeln!(f, "{} Application Data", tenant.tenant_id)?;
            writeln!(f, "-----------------------------------------")?;
            writeln!(
                f,
                "{:<WIDE_LABEL_WIDTH$}{}",
                "Volume Mount Point:", tenant.volume_path
            )?;
            write_triple(
                f,
                "Filesystem (total/used/avail):",
                tenant.filesystem_total,
                tenant.filesystem_used,
                tenant.filesystem_available,
            )?;
            writeln!(
                f,
                "{:<WIDE_LABEL_WIDTH$}{}",
                "Virtual device size:",
                bytes_to_pretty(self.blocks_to_bytes(tenant.device_total_blocks), false)
            )?;
            writeln!(
                f,
                "{:<WIDE_LABEL_WIDTH$}{} allocated / {} unallocated",
                "Virtual device blocks:",
                grouped(tenant.device_allocated_blocks),
                grouped(tenant.device_unallocated_blocks)
            )?;
            writeln!(
                f,
                "{:<WIDE_LABEL_WIDTH$}{} ({} exclusive to snapshots)",
                "Snapshots:",
                tenant.number_snapshots,
                bytes_to_pretty(self.blocks_to_bytes(tenant.snapshot_allocated_blocks), false)
            )?;
            for error in &tenant.errors {
                writeln!(f, "{error}")?;
            }
        }

        for error in &self.errors {
            writeln!(f)?;
            writeln!(f, "{error}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Statuses {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for status in self.device_mapper_status_map.values() {
            if !first {
                writeln!(f)?;
            }
            first = false;
            status.fmt(f)?;
        }
        for status in self.simple_status_map.values() {
            if !first {
                writeln!(f)?;
            }
            first = false;
            status.fmt(f)?;
        }
        Ok(())
    }
}
