// SPDX-License-Identifier: GPL-3.0-only

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::ThinPool;
use super::parser::DeviceMap;
use super::snapshot::MetadataSnapshot;
use crate::Result;
use crate::retry::RetryPolicy;
use crate::runner::CommandRunner;

/// Default lifetime of cached per-device block sets
pub const DEFAULT_STATS_TTL: Duration = Duration::from_secs(300);

struct CachedDevices {
    expiry: Instant,
    devices: Arc<DeviceMap>,
}

/// One mutex per key, created on first use
#[derive(Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    fn with_lock<T>(&self, key: &str, f: impl FnOnce() -> T) -> T {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        let _held = lock.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }
}

/// Per-pool cache of device block sets read from thin-pool metadata
pub struct UsageCache {
    ttl: Duration,
    policy: RetryPolicy,
    entries: Mutex<HashMap<String, CachedDevices>>,
    locks: KeyedLocks,
}

impl Default for UsageCache {
    fn default() -> Self {
        Self::new(DEFAULT_STATS_TTL)
    }
}

impl UsageCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            policy: RetryPolicy::default(),
            entries: Mutex::new(HashMap::new()),
            locks: KeyedLocks::default(),
        }
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn fresh(&self, pool: &str) -> Option<Arc<DeviceMap>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(pool)
            .filter(|cached| Instant::now() < cached.expiry)
            .map(|cached| Arc::clone(&cached.devices))
    }

    /// Block sets of every thin device in `pool`, from cache when fresh.
    ///
    /// Concurrent callers for the same pool wait for a single refresh;
    /// other pools are not blocked.
    pub fn device_blocks(
        &self,
        runner: &dyn CommandRunner,
        pool: &ThinPool,
    ) -> Result<Arc<DeviceMap>> {
        self.locks.with_lock(&pool.name, || {
            if let Some(devices) = self.fresh(&pool.name) {
                debug!(pool = %pool.name, "using cached storage stats");
                return Ok(devices);
            }

            info!(pool = %pool.name, "refreshing storage stats from thin pool metadata");
            let devices = Arc::new(MetadataSnapshot::new(runner, pool, self.policy).read_devices()?);

            // A pool holding only its base device is still being set up.
            if devices.len() > 1 {
                self.entries
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(
                        pool.name.clone(),
                        CachedDevices {
                            expiry: Instant::now() + self.ttl,
                            devices: Arc::clone(&devices),
                        },
                    );
            }
            Ok(devices)
        })
    }

    pub fn invalidate(&self, pool: &ThinPool) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pool.name);
    }
}
