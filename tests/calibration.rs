mod common;

use common::{board_sample, board_views, truth_camera};
use nalgebra::Point2;
use tablemap_tracker::calibration::{
    CameraCalibrationConfig, CameraCalibrationState, CameraCalibrator, Correspondence,
    HomographyComputer, MarkerBoard, ProjectorCalibrationConfig, ProjectorCalibrator,
    RoundOutcome,
};
use tablemap_tracker::detection::DetectorParams;
use tablemap_tracker::error::CalibrationError;
use tablemap_tracker::table::TableFrame;

fn camera_calibrator() -> CameraCalibrator {
    CameraCalibrator::new(
        CameraCalibrationConfig::default(),
        DetectorParams::default(),
        640,
        480,
    )
    .unwrap()
}

#[test]
fn camera_calibration_recovers_synthetic_intrinsics() {
    let board = MarkerBoard::default();
    let truth = truth_camera();
    let mut cal = camera_calibrator();
    cal.start().unwrap();
    for pose in board_views(&board) {
        cal.submit_sample(board_sample(&board, &truth, &pose)).unwrap();
    }
    assert_eq!(cal.accepted_samples(), 8);

    let model = cal.solve().unwrap();
    let k = model.intrinsics();
    assert!((k.fx - 820.0).abs() < 0.5, "fx {}", k.fx);
    assert!((k.fy - 815.0).abs() < 0.5, "fy {}", k.fy);
    assert!((k.cx - 322.0).abs() < 0.5, "cx {}", k.cx);
    assert!((k.cy - 238.0).abs() < 0.5, "cy {}", k.cy);
    assert!((model.distortion().k1 + 0.08).abs() < 0.01);
    match cal.state() {
        CameraCalibrationState::Calibrated { rms, .. } => assert!(*rms < 1e-3, "rms {}", rms),
        other => panic!("unexpected state {}", other),
    }
}

#[test]
fn camera_calibration_with_three_samples_fails() {
    let board = MarkerBoard::default();
    let truth = truth_camera();
    let mut cal = camera_calibrator();
    cal.start().unwrap();
    for pose in board_views(&board).iter().take(3) {
        cal.submit_sample(board_sample(&board, &truth, pose)).unwrap();
    }
    assert_eq!(
        cal.solve().unwrap_err(),
        CalibrationError::InsufficientSamples {
            accepted: 3,
            required: 8
        }
    );
    assert!(matches!(cal.state(), CameraCalibrationState::Failed(_)));
    assert!(cal.model().is_none());
}

#[test]
fn projector_calibration_four_point_scenario() {
    let table = TableFrame::new(900.0, 600.0).unwrap();
    let camera = common::truth_camera().with_extrinsics(nalgebra::Isometry3::translation(-450.0, -300.0, 1200.0));
    let mut cal = ProjectorCalibrator::new(
        ProjectorCalibrationConfig::default(),
        camera,
        table,
        DetectorParams::default(),
    )
    .unwrap();
    cal.start().unwrap();

    let pairs = [
        ((0.0, 0.0), (10.0, 10.0)),
        ((900.0, 0.0), (1910.0, 10.0)),
        ((900.0, 600.0), (1910.0, 1270.0)),
        ((0.0, 600.0), (10.0, 1270.0)),
    ];
    let correspondences: Vec<Correspondence> = pairs
        .iter()
        .map(|&((x, y), (u, v))| Correspondence::new(Point2::new(x, y), Point2::new(u, v)))
        .collect();
    cal.submit_correspondences(&correspondences).unwrap();

    let homography = match cal.solve_round().unwrap() {
        RoundOutcome::Calibrated(h) => h,
        other => panic!("unexpected outcome {:?}", other),
    };
    for c in &correspondences {
        let mapped = homography.apply(&c.table).unwrap();
        assert!((mapped - c.projector).norm() < 1.0, "{} -> {}", c.table, mapped);
    }
}

#[test]
fn homography_round_trip_over_table() {
    let table = TableFrame::new(900.0, 600.0).unwrap();
    let pairs = [
        ((0.0, 0.0), (12.0, 31.0)),
        ((900.0, 0.0), (1890.0, 5.0)),
        ((900.0, 600.0), (1930.0, 1260.0)),
        ((0.0, 600.0), (40.0, 1200.0)),
        ((450.0, 300.0), (985.0, 640.0)),
    ];
    let correspondences: Vec<Correspondence> = pairs
        .iter()
        .map(|&((x, y), (u, v))| Correspondence::new(Point2::new(x, y), Point2::new(u, v)))
        .collect();
    let result = HomographyComputer::new()
        .with_threshold(1e6)
        .compute(&correspondences)
        .unwrap();
    let h = result.homography;

    for i in 0..=18 {
        for j in 0..=12 {
            let p = Point2::new(i as f64 * 50.0, j as f64 * 50.0);
            assert!(table.contains(&p));
            let back = h.apply_inverse(&h.apply(&p).unwrap()).unwrap();
            assert!((back - p).norm() < 1e-6, "{} -> {}", p, back);
        }
    }
}
