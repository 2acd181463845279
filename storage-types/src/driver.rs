// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Storage backend a volume driver is built on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverType {
    Btrfs,
    Rsync,
    DeviceMapper,
    Nfs,
}

impl DriverType {
    pub const ALL: [DriverType; 4] = [
        DriverType::Btrfs,
        DriverType::Rsync,
        DriverType::DeviceMapper,
        DriverType::Nfs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DriverType::Btrfs => "btrfs",
            DriverType::Rsync => "rsync",
            DriverType::DeviceMapper => "devicemapper",
            DriverType::Nfs => "nfs",
        }
    }

    /// Name of the hidden directory a driver keeps under its root. Its
    /// presence marks the root as initialized by that driver.
    pub fn pool_dir_name(&self) -> Option<&'static str> {
        match self {
            DriverType::Btrfs => Some(".btrfs"),
            DriverType::Rsync => Some(".rsync"),
            DriverType::DeviceMapper => Some(".devicemapper"),
            DriverType::Nfs => None,
        }
    }
}

impl fmt::Display for DriverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownDriverType(pub String);

impl fmt::Display for UnknownDriverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "driver not supported: {}", self.0)
    }
}

impl std::error::Error for UnknownDriverType {}

impl FromStr for DriverType {
    type Err = UnknownDriverType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DriverType::ALL
            .into_iter()
            .find(|driver| driver.as_str() == s.trim())
            .ok_or_else(|| UnknownDriverType(s.to_string()))
    }
}

/// Optional operations a backend may or may not implement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Create,
    Remove,
    Resize,
    Status,
    Snapshot,
    Rollback,
    Tag,
    Metadata,
    Export,
    Import,
}

impl Capability {
    pub const ALL: [Capability; 10] = [
        Capability::Create,
        Capability::Remove,
        Capability::Resize,
        Capability::Status,
        Capability::Snapshot,
        Capability::Rollback,
        Capability::Tag,
        Capability::Metadata,
        Capability::Export,
        Capability::Import,
    ];
}
