// SPDX-License-Identifier: GPL-3.0-only

mod common;

use std::sync::Arc;

use storage_sys::Reply;
use storage_types::DriverType;
use storage_volume::StatusReporter;

use common::scripted_registry;

#[test]
fn failing_drivers_are_left_out_of_the_report() {
    let (runner, registry) = scripted_registry();
    runner.on(
        "df --output=source,size,used,avail -B1",
        Reply::ok("Filesystem 1B-blocks Used Avail\n/dev/sda1 1000 400 600\n"),
    );
    runner.on("btrfs filesystem df", Reply::fail(1, "not a btrfs filesystem"));

    let rsync_root = tempfile::tempdir().expect("tempdir");
    let btrfs_root = tempfile::tempdir().expect("tempdir");
    let nfs_root = tempfile::tempdir().expect("tempdir");
    registry
        .init_driver(DriverType::Rsync, rsync_root.path(), &[])
        .expect("rsync");
    registry
        .init_driver(DriverType::Btrfs, btrfs_root.path(), &[])
        .expect("btrfs");
    registry
        .init_driver(DriverType::Nfs, nfs_root.path(), &[])
        .expect("nfs");

    let statuses = registry.status();
    assert_eq!(statuses.len(), 1);
    let key = rsync_root.path().display().to_string();
    let status = &statuses.simple_status_map[&key];
    assert_eq!(status.driver, DriverType::Rsync);
    assert_eq!(status.usage_data.len(), 3);
    // with and without -b
    assert_eq!(runner.call_count("btrfs filesystem df"), 2);

    let report = statuses.to_string();
    assert!(report.starts_with("Driver:"));
    assert!(report.contains("rsync"));
    assert!(report.contains("Available Bytes"));

    let json = serde_json::to_value(&statuses).expect("json");
    assert!(json["SimpleStatusMap"][key.as_str()]["UsageData"].is_array());
    assert!(json["DeviceMapperStatusMap"].as_object().is_some_and(|map| map.is_empty()));
}

#[test]
fn an_empty_reporter_has_nothing_to_say() {
    let statuses = StatusReporter::new(Vec::new()).collect();
    assert!(statuses.is_empty());
    assert_eq!(statuses.to_string(), "");
}

#[test]
fn reporters_can_cover_a_subset_of_drivers() {
    let (runner, registry) = scripted_registry();
    runner.on(
        "df --output=source,size,used,avail -B1",
        Reply::ok("Filesystem 1B-blocks Used Avail\n/dev/sdb1 2048 1024 1024\n"),
    );
    let first = tempfile::tempdir().expect("tempdir");
    let second = tempfile::tempdir().expect("tempdir");
    registry.init_driver(DriverType::Rsync, first.path(), &[]).expect("first");
    registry.init_driver(DriverType::Rsync, second.path(), &[]).expect("second");

    let only = registry.get_driver(second.path()).expect("driver");
    let statuses = StatusReporter::new(vec![Arc::clone(&only)]).collect();
    assert_eq!(statuses.len(), 1);
    assert!(
        statuses
            .simple_status_map
            .contains_key(&second.path().display().to_string())
    );
    assert_eq!(registry.status().len(), 2);
}
