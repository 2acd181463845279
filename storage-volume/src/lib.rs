// SPDX-License-Identifier: GPL-3.0-only

//! Snapshotting volumes over pluggable storage backends
//!
//! A [`Registry`] maps driver types to constructors and driver roots to
//! initialized [`Driver`]s. Drivers hand out [`Volume`]s, which snapshot,
//! roll back, export and import their contents:
//!
//! | backend | snapshot | export format |
//! |---|---|---|
//! | `btrfs` | read-only subvolume | `btrfs send` stream |
//! | `rsync` | directory copy | tar |
//! | `devicemapper` | thin device snapshot | not supported |
//! | `nfs` | not supported | not supported |
//!
//! Every external tool runs through the [`storage_sys::CommandRunner`] held
//! by the [`DriverContext`], so drivers can be driven by a
//! [`storage_sys::ScriptedRunner`] in tests.

pub mod backends;
pub mod config;
pub mod driver;
pub mod error;
pub mod registry;
pub mod snapshot;
pub mod status;

pub use config::VolumeConfig;
pub use driver::{Driver, DriverContext, DriverInit, Volume};
pub use error::{Result, VolumeError};
pub use registry::Registry;
pub use status::StatusReporter;
