// SPDX-License-Identifier: GPL-3.0-only

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};

use storage_types::{DriverType, Statuses};
use tracing::{debug, error, info};

use crate::driver::{Driver, DriverContext, DriverInit, Volume};
use crate::error::{Result, VolumeError};
use crate::status::StatusReporter;

static GLOBAL: OnceLock<Registry> = OnceLock::new();

/// Driver constructors by type, and the drivers initialized from them by
/// root directory.
pub struct Registry {
    context: DriverContext,
    inits: RwLock<BTreeMap<DriverType, DriverInit>>,
    drivers: Mutex<BTreeMap<PathBuf, Arc<dyn Driver>>>,
}

impl Registry {
    /// Empty registry; nothing is registered.
    pub fn new(context: DriverContext) -> Self {
        Self {
            context,
            inits: RwLock::new(BTreeMap::new()),
            drivers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Registry with every backend compiled into this build.
    pub fn with_default_backends(context: DriverContext) -> Self {
        let registry = Self::new(context);
        crate::backends::register_all(&registry);
        registry
    }

    /// Process-wide registry over real processes and the default config.
    pub fn global() -> &'static Registry {
        GLOBAL.get_or_init(|| Registry::with_default_backends(DriverContext::default()))
    }

    pub fn context(&self) -> &DriverContext {
        &self.context
    }

    /// Register the constructor for `driver_type`.
    ///
    /// # Panics
    ///
    /// When `init` is `None` or the type already has a constructor.
    pub fn register(&self, driver_type: DriverType, init: Option<DriverInit>) {
        let Some(init) = init else {
            panic!("cannot register a nil {driver_type} driver");
        };
        let mut inits = self.inits.write().unwrap_or_else(PoisonError::into_inner);
        if inits.contains_key(&driver_type) {
            panic!("{driver_type} driver is already registered");
        }
        inits.insert(driver_type, init);
        debug!(%driver_type, "registered driver");
    }

    pub fn registered(&self, driver_type: DriverType) -> Option<DriverInit> {
        self.inits
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&driver_type)
            .cloned()
    }

    /// Whether a driver is registered under `name`; unknown names are not.
    pub fn is_registered(&self, name: &str) -> bool {
        name.parse::<DriverType>()
            .is_ok_and(|driver_type| self.registered(driver_type).is_some())
    }

    /// Forget the constructor for `driver_type` and every driver built from it.
    pub fn unregister(&self, driver_type: DriverType) {
        self.inits
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&driver_type);
        self.lock_drivers()
            .retain(|_, driver| driver.driver_type() != driver_type);
    }

    fn lock_drivers(&self) -> std::sync::MutexGuard<'_, BTreeMap<PathBuf, Arc<dyn Driver>>> {
        self.drivers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Initialize a `driver_type` driver at `root`, once.
    pub fn init_driver(&self, driver_type: DriverType, root: &Path, args: &[String]) -> Result<()> {
        let root = clean_path(root);
        if !root.is_absolute() {
            return Err(VolumeError::PathIsNotAbsolute(root));
        }

        let mut drivers = self.lock_drivers();
        if let Some(existing) = drivers.get(&root) {
            if existing.driver_type() == driver_type {
                return Ok(());
            }
            return Err(VolumeError::DriverAlreadyInit {
                root,
                existing: existing.driver_type(),
            });
        }

        if driver_type != DriverType::Nfs
            && let Some(existing) = detect_driver_type(&root)
            && existing != driver_type
        {
            error!(root = %root.display(), %existing, requested = %driver_type, "root belongs to another driver");
            return Err(VolumeError::DriverAlreadyInit { root, existing });
        }

        let init = self
            .registered(driver_type)
            .ok_or(VolumeError::DriverNotSupported(driver_type))?;

        fs::create_dir_all(&root)?;
        let driver = init(&self.context, &root, args)?;
        info!(%driver_type, root = %root.display(), "initialized driver");
        drivers.insert(root, driver);
        Ok(())
    }

    pub fn get_driver(&self, root: &Path) -> Result<Arc<dyn Driver>> {
        let root = clean_path(root);
        self.lock_drivers()
            .get(&root)
            .cloned()
            .ok_or(VolumeError::DriverNotInit(root))
    }

    /// Split `path` into the nearest enclosing driver root and the volume
    /// path below it, which is empty when `path` is the root itself.
    pub fn split_path(&self, path: &Path) -> Result<(PathBuf, String)> {
        let path = clean_path(path);
        if !path.is_absolute() {
            return Err(VolumeError::PathIsNotAbsolute(path));
        }

        let drivers = self.lock_drivers();
        let mut candidate = path.as_path();
        loop {
            if drivers.contains_key(candidate) {
                let volume = path
                    .strip_prefix(candidate)
                    .map(|rest| rest.to_string_lossy().to_string())
                    .unwrap_or_default();
                return Ok((candidate.to_path_buf(), volume));
            }
            match candidate.parent() {
                Some(parent) => candidate = parent,
                None => return Err(VolumeError::DriverNotInit(path)),
            }
        }
    }

    /// Mount the volume `path` names under its nearest driver root.
    pub fn find_mount(&self, path: &Path) -> Result<Box<dyn Volume>> {
        let (root, volume) = self.split_path(path)?;
        if volume.is_empty() {
            return Err(VolumeError::PathIsDriver(root));
        }
        self.mount_initialized(&volume, &root)
    }

    /// Get or create volume `name` under `root`, initializing a
    /// `driver_type` driver there first if needed.
    pub fn mount(&self, driver_type: DriverType, name: &str, root: &Path) -> Result<Box<dyn Volume>> {
        self.init_driver(driver_type, root, &[])?;
        self.mount_initialized(name, root)
    }

    fn mount_initialized(&self, name: &str, root: &Path) -> Result<Box<dyn Volume>> {
        let root = clean_path(root);
        let (found, volume) = self.split_path(&root.join(name))?;
        if found != root {
            error!(volume = name, requested = %root.display(), found = %found.display(), "volume is under another driver");
            return Err(VolumeError::BadMount {
                volume: name.to_string(),
                requested: root,
                found,
            });
        }
        if volume.is_empty() {
            return Err(VolumeError::PathIsDriver(root));
        }

        let driver = self.get_driver(&root)?;
        if driver.exists(name) {
            debug!(volume = name, root = %root.display(), "volume exists; remounting");
            driver.get(name)
        } else {
            debug!(volume = name, root = %root.display(), "volume does not exist; creating");
            driver.create(name)
        }
    }

    /// Clean up the driver at `root` and forget it.
    pub fn shutdown_driver(&self, root: &Path) -> Result<()> {
        let root = clean_path(root);
        let driver = self.get_driver(&root)?;
        info!(driver_type = %driver.driver_type(), root = %root.display(), "shutting down driver");
        driver.cleanup()?;
        self.lock_drivers().remove(&root);
        Ok(())
    }

    /// Shut down every driver, reporting how many failed.
    pub fn shutdown_all(&self) -> Result<()> {
        let roots: Vec<PathBuf> = self.lock_drivers().keys().cloned().collect();
        let failed = roots
            .iter()
            .filter(|root| match self.shutdown_driver(root) {
                Ok(()) => false,
                Err(err) => {
                    error!(root = %root.display(), "could not shut down driver: {err}");
                    true
                }
            })
            .count();
        if failed > 0 {
            return Err(VolumeError::BadDriverShutdown(failed));
        }
        Ok(())
    }

    /// Initialized drivers, ordered by root.
    pub fn drivers(&self) -> Vec<Arc<dyn Driver>> {
        self.lock_drivers().values().cloned().collect()
    }

    /// Status of every initialized driver; failing drivers are left out.
    pub fn status(&self) -> Statuses {
        StatusReporter::new(self.drivers()).collect()
    }
}

/// The driver type whose pool directory exists under `root`.
pub(crate) fn detect_driver_type(root: &Path) -> Option<DriverType> {
    DriverType::ALL.into_iter().find(|driver_type| {
        driver_type
            .pool_dir_name()
            .is_some_and(|dir| root.join(dir).is_dir())
    })
}

/// Lexically normalize `path`, resolving `.` and `..`.
pub(crate) fn clean_path(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !cleaned.pop() && !path.is_absolute() {
                    cleaned.push("..");
                }
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    if cleaned.as_os_str().is_empty() {
        cleaned.push(".");
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_cleaned_lexically() {
        assert_eq!(clean_path(Path::new("/srv/./volumes/../data/")), Path::new("/srv/data"));
        assert_eq!(clean_path(Path::new("/../srv")), Path::new("/srv"));
        assert_eq!(clean_path(Path::new("a/../..")), Path::new(".."));
        assert_eq!(clean_path(Path::new("")), Path::new("."));
    }

    #[test]
    fn pool_directories_identify_the_driver() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(detect_driver_type(dir.path()), None);

        fs::create_dir(dir.path().join(".rsync")).expect("mkdir");
        assert_eq!(detect_driver_type(dir.path()), Some(DriverType::Rsync));
    }
}
