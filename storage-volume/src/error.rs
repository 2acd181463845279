// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use storage_sys::SysError;
use storage_types::{Capability, DriverType};
use thiserror::Error;

/// Error types for volume and driver operations
#[derive(Error, Debug)]
pub enum VolumeError {
    #[error("{driver} driver does not support {capability:?}")]
    NotSupported {
        driver: DriverType,
        capability: Capability,
    },

    #[error("snapshot does not exist: {0}")]
    SnapshotDoesNotExist(String),

    #[error("snapshot already exists: {0}")]
    SnapshotExists(String),

    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("a {existing} driver is already initialized at {}", .root.display())]
    DriverAlreadyInit { root: PathBuf, existing: DriverType },

    #[error("no driver initialized at {}", .0.display())]
    DriverNotInit(PathBuf),

    #[error("driver not supported: {0}")]
    DriverNotSupported(DriverType),

    #[error("volume already exists: {0}")]
    VolumeExists(String),

    #[error("volume does not exist: {0}")]
    VolumeNotExists(String),

    #[error("tag {tag} is already in use by snapshot {snapshot}")]
    TagAlreadyExists { tag: String, snapshot: String },

    #[error("snapshot is missing its info file: {0}")]
    InvalidSnapshot(String),

    #[error("invalid snapshot label: {0:?}")]
    InvalidLabel(String),

    #[error("path is not absolute: {}", .0.display())]
    PathIsNotAbsolute(PathBuf),

    #[error("path is a driver root: {}", .0.display())]
    PathIsDriver(PathBuf),

    #[error("cannot mount {volume} at {}; driver root is {}", .requested.display(), .found.display())]
    BadMount {
        volume: String,
        requested: PathBuf,
        found: PathBuf,
    },

    #[error("incompatible snapshot archive: {0}")]
    IncompatibleSnapshot(String),

    #[error("could not remove volume {volume}: {reason}")]
    RemovingVolume { volume: String, reason: String },

    #[error("could not remove snapshot {snapshot}: {reason}")]
    RemovingSnapshot { snapshot: String, reason: String },

    #[error("{0} driver(s) failed to shut down")]
    BadDriverShutdown(usize),

    #[error("invalid driver option {option:?}: {reason}")]
    InvalidOption { option: String, reason: String },

    #[error("invalid configuration in {}: {reason}", .path.display())]
    InvalidConfig { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Sys(#[from] SysError),
}

impl VolumeError {
    pub fn not_supported(driver: DriverType, capability: Capability) -> Self {
        VolumeError::NotSupported { driver, capability }
    }

    pub fn is_not_supported(&self) -> bool {
        matches!(self, VolumeError::NotSupported { .. })
    }
}

/// Result type alias for volume operations
pub type Result<T> = std::result::Result<T, VolumeError>;
