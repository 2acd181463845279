// SPDX-License-Identifier: GPL-3.0-only

//! Storage backends, each behind a cargo feature of the same name

#[cfg(feature = "btrfs")]
pub mod btrfs;
#[cfg(feature = "devicemapper")]
pub mod devicemapper;
#[cfg(feature = "nfs")]
pub mod nfs;
#[cfg(feature = "rsync")]
pub mod rsync;

use crate::registry::Registry;

/// Register the constructor of every compiled-in backend.
pub fn register_all(registry: &Registry) {
    #[cfg(feature = "btrfs")]
    registry.register(
        storage_types::DriverType::Btrfs,
        Some(std::sync::Arc::new(btrfs::BtrfsDriver::init)),
    );
    #[cfg(feature = "devicemapper")]
    registry.register(
        storage_types::DriverType::DeviceMapper,
        Some(std::sync::Arc::new(devicemapper::DeviceMapperDriver::init)),
    );
    #[cfg(feature = "nfs")]
    registry.register(
        storage_types::DriverType::Nfs,
        Some(std::sync::Arc::new(nfs::NfsDriver::init)),
    );
    #[cfg(feature = "rsync")]
    registry.register(
        storage_types::DriverType::Rsync,
        Some(std::sync::Arc::new(rsync::RsyncDriver::init)),
    );
    let _ = registry;
}
