use std::time::Duration;

use nalgebra::{Isometry3, Matrix3, Point2, Translation3, UnitQuaternion, Vector3};
use tablemap_tracker::calibration::Homography;
use tablemap_tracker::camera::{
    CameraModel, DeviceLock, Distortion, Frame, FrameSource, Intrinsics,
};
use tablemap_tracker::detection::DetectorParams;
use tablemap_tracker::error::{PersistenceError, RuntimeError};
use tablemap_tracker::render::overlay_channel;
use tablemap_tracker::store::{CalibrationBundle, CalibrationStore, SharedCalibration};
use tablemap_tracker::table::TableFrame;
use tablemap_tracker::tracking::{TrackingConfig, TrackingLoop};

/// Counts how often the loop asked for a frame.
struct CountingSource {
    calls: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

impl FrameSource for CountingSource {
    fn next_frame(&mut self, _timeout: Duration) -> Result<Frame, RuntimeError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Err(RuntimeError::CaptureTimeout)
    }
}

fn bundle() -> CalibrationBundle {
    let rotation = UnitQuaternion::from_euler_angles(3.13, -0.021, 0.4);
    let center = Vector3::new(447.3, 301.9, 1187.6);
    let pose = Isometry3::from_parts(Translation3::from(-(rotation * center)), rotation);
    let camera = CameraModel::new(
        Intrinsics::new(1401.123456789, 1398.987654321, 959.5, 540.25),
        Distortion::from_array([-0.1123, 0.0317, -0.00042, 0.00019, -0.0071]),
        1920,
        1080,
    )
    .unwrap()
    .with_extrinsics(pose);
    let homography = Homography::new(Matrix3::new(
        2.1111, 0.0333, 10.123, -0.0123, 2.0987, 9.876, 2.5e-6, -1.25e-6, 1.0,
    ))
    .unwrap();
    let table = TableFrame::with_origin(900.0, 600.0, Point2::new(-3.5, 7.125)).unwrap();
    CalibrationBundle::new(camera, homography, table).unwrap()
}

#[test]
fn tracking_without_calibration_fails_before_capturing() {
    let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let (tx, _rx) = overlay_channel();
    let device = DeviceLock::new();
    let result = TrackingLoop::start(
        TrackingConfig::default(),
        CountingSource {
            calls: calls.clone(),
        },
        SharedCalibration::new(),
        DetectorParams::default(),
        tx,
        &device,
    );
    assert_eq!(result.unwrap_err(), RuntimeError::CalibrationMissing);
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert!(device.holder().is_none());
}

#[test]
fn store_round_trip_is_exact() {
    let dir = tempfile::tempdir().unwrap();
    let store = CalibrationStore::new(dir.path().join("calibration.json"));
    assert!(matches!(store.load(), Err(PersistenceError::NotFound(_))));

    let original = bundle();
    store.save(&original).unwrap();
    let loaded = store.load().unwrap();
    assert_eq!(loaded, original);
    assert_eq!(loaded.camera().intrinsics(), original.camera().intrinsics());
    assert_eq!(loaded.camera().distortion(), original.camera().distortion());
    assert_eq!(loaded.camera().extrinsics(), original.camera().extrinsics());
    assert_eq!(loaded.homography().to_row_major(), original.homography().to_row_major());
    assert_eq!(loaded.table(), original.table());
}

#[test]
fn truncated_bundle_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calibration.json");
    let store = CalibrationStore::new(&path);
    store.save(&bundle()).unwrap();

    let json = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, &json[..json.len() / 2]).unwrap();
    assert!(matches!(store.load(), Err(PersistenceError::CorruptBundle(_))));

    std::fs::write(&path, json).unwrap();
    assert_eq!(store.load().unwrap(), bundle());
}
