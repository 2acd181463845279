// SPDX-License-Identifier: GPL-3.0-only

use std::sync::Arc;

use storage_types::Statuses;
use tracing::{debug, warn};

use crate::driver::Driver;

/// Aggregates the status of a set of drivers into one report
pub struct StatusReporter {
    drivers: Vec<Arc<dyn Driver>>,
}

impl StatusReporter {
    pub fn new(drivers: Vec<Arc<dyn Driver>>) -> Self {
        Self { drivers }
    }

    /// Query every driver; a driver that fails is logged and left out.
    pub fn collect(&self) -> Statuses {
        let mut statuses = Statuses::default();
        for driver in &self.drivers {
            let root = driver.root().display().to_string();
            match driver.status() {
                Ok(status) => {
                    debug!(root = %root, driver_type = %driver.driver_type(), "collected status");
                    statuses.insert(root, status);
                }
                Err(err) => {
                    warn!(root = %root, driver_type = %driver.driver_type(), "omitting driver from status: {err}");
                }
            }
        }
        statuses
    }
}
