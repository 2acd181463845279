// SPDX-License-Identifier: GPL-3.0-only

//! Low-level system operations for volume storage
//!
//! This crate wraps the external tools the volume drivers depend on:
//! - a mockable subprocess seam with deadlines ([`runner`])
//! - thin-pool metadata snapshots and per-device block accounting ([`thinpool`])
//! - `df`, `btrfs filesystem df` and `statvfs` usage ([`df`])
//! - `btrfs subvolume` listing parsers ([`btrfs`])
//! - tar export/import of directory trees ([`archive`])
//!
//! Most operations here require elevated privileges when run for real.

pub mod archive;
pub mod btrfs;
pub mod df;
pub mod error;
pub mod retry;
pub mod runner;
pub mod thinpool;

pub use error::{Result, SysError};
pub use retry::RetryPolicy;
pub use runner::{
    CommandLine, CommandOutput, CommandRunner, Reply, ScriptedRunner, SystemRunner, require_tool,
};
pub use thinpool::{DeviceBlocks, DeviceMap, ThinPool, UsageCache};
