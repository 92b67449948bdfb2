use senscal_hardware::FileCalibrationStore;
use senscal_traits::{BiasMap, CalibrationStore};
use tempfile::tempdir;

fn bias(entries: &[(&str, i32)]) -> BiasMap {
    entries.iter().map(|(k, v)| ((*k).to_owned(), *v)).collect()
}

#[test]
fn staged_values_are_durable_only_after_flush() {
    let dir = tempdir().unwrap();
    let store = FileCalibrationStore::new(dir.path().join("vpd").join("calibration.json"));

    store
        .write_bias(&bias(&[("in_accel_x_base_calibbias", 4)]))
        .unwrap();
    assert_eq!(store.pending(), 1);
    assert!(store.load().unwrap().is_empty());

    store.flush().unwrap();
    assert_eq!(store.pending(), 0);
    assert_eq!(
        store.load().unwrap(),
        bias(&[("in_accel_x_base_calibbias", 4)])
    );
}

#[test]
fn flush_merges_with_committed_values() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("calibration.json");
    let store = FileCalibrationStore::new(&path);
    store
        .write_bias(&bias(&[("in_accel_x_base_calibbias", 4), ("in_accel_y_base_calibbias", -1)]))
        .unwrap();
    store.flush().unwrap();

    let again = FileCalibrationStore::new(&path);
    again
        .write_bias(&bias(&[("in_accel_y_base_calibbias", 2), ("in_anglvel_z_lid_calibbias", 9)]))
        .unwrap();
    again.flush().unwrap();

    assert_eq!(
        again.load().unwrap(),
        bias(&[
            ("in_accel_x_base_calibbias", 4),
            ("in_accel_y_base_calibbias", 2),
            ("in_anglvel_z_lid_calibbias", 9),
        ])
    );
}

#[test]
fn flush_with_nothing_staged_leaves_no_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("calibration.json");
    FileCalibrationStore::new(&path).flush().unwrap();
    assert!(!path.exists());
}

#[test]
fn flush_into_unwritable_location_fails() {
    let dir = tempdir().unwrap();
    let blocker = dir.path().join("file");
    std::fs::write(&blocker, "x").unwrap();
    // Parent of the target is a regular file.
    let store = FileCalibrationStore::new(blocker.join("calibration.json"));
    store.write_bias(&bias(&[("in_accel_x_lid_calibbias", 1)])).unwrap();
    assert!(store.flush().is_err());
    assert_eq!(store.pending(), 1);
}
