// SPDX-License-Identifier: GPL-3.0-only

//! Shared data types for the volume storage stack
//!
//! These models are exchanged between the subprocess layer in `storage-sys`
//! and the volume drivers in `storage-volume`:
//!
//! - [`DriverType`] and [`Capability`] identify backends and what they can do
//! - [`SnapshotInfo`] is the record persisted alongside each snapshot
//! - [`Status`] and [`Statuses`] carry per-driver usage reports, and render
//!   the human-readable report through `Display`

pub mod common;
pub mod driver;
pub mod snapshot;
pub mod status;

pub use common::{bytes_to_pretty, grouped, percent, pretty_to_bytes};
pub use driver::{Capability, DriverType, UnknownDriverType};
pub use snapshot::{SNAPSHOT_INFO_FILE, SnapshotInfo};
pub use status::{
    DeviceMapperStatus, SimpleStatus, Status, Statuses, TenantStorageStats, Usage,
};
