// SPDX-License-Identifier: GPL-3.0-only

#![allow(dead_code)]

use std::sync::Arc;

use storage_sys::ScriptedRunner;
use storage_volume::{DriverContext, Registry, VolumeConfig};
use which::which;

/// Registry with every backend over a scripted runner.
pub fn scripted_registry() -> (Arc<ScriptedRunner>, Registry) {
    let runner = Arc::new(ScriptedRunner::new());
    let context = DriverContext::new(runner.clone(), VolumeConfig::default());
    (runner, Registry::with_default_backends(context))
}

/// Registry with every backend over real processes.
pub fn system_registry() -> Registry {
    Registry::with_default_backends(DriverContext::system(VolumeConfig::default()))
}

/// Whether `tool` is installed; tests needing it return early otherwise.
pub fn tool_available(tool: &str) -> bool {
    if which(tool).is_ok() {
        return true;
    }
    eprintln!("SKIP: {tool} not found on PATH");
    false
}
