//! Synthetic scenes built only from the public API.

#![allow(dead_code)]

use image::{GrayImage, Luma};
use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};
use tablemap_tracker::calibration::{CalibrationSample, MarkerBoard};
use tablemap_tracker::camera::{CameraModel, Distortion, Intrinsics};
use tablemap_tracker::detection::{MarkerCodec, GRID_CELLS};

/// Axis-aligned markers `(id, left, top, size)` on a white page.
pub fn render_page(width: u32, height: u32, markers: &[(u16, u32, u32, u32)]) -> GrayImage {
    let codec = MarkerCodec::new();
    let mut img = GrayImage::from_pixel(width, height, Luma([235]));
    for &(id, left, top, size) in markers {
        let cells = codec.cells(id);
        let cell = size as f64 / GRID_CELLS as f64;
        for y in top..(top + size).min(height) {
            for x in left..(left + size).min(width) {
                let row = (((y - top) as f64 + 0.5) / cell) as usize;
                let col = (((x - left) as f64 + 0.5) / cell) as usize;
                let white = cells[row.min(GRID_CELLS - 1)][col.min(GRID_CELLS - 1)];
                img.put_pixel(x, y, Luma([if white { 235 } else { 20 }]));
            }
        }
    }
    img
}

/// 640x480 camera with mild barrel distortion.
pub fn truth_camera() -> CameraModel {
    CameraModel::new(
        Intrinsics::new(820.0, 815.0, 322.0, 238.0),
        Distortion::from_array([-0.08, 0.02, 0.0, 0.0, 0.0]),
        640,
        480,
    )
    .unwrap()
}

/// Eight varied board-to-camera poses.
pub fn board_views(board: &MarkerBoard) -> Vec<Isometry3<f64>> {
    let bw = board.width_mm();
    let bh = board.height_mm();
    let z = 2.6 * bw.max(bh);
    let tilts = [
        (0.0, 0.0, 0.0),
        (0.35, 0.0, 0.1),
        (-0.3, 0.1, -0.05),
        (0.0, 0.35, 0.2),
        (0.1, -0.35, 0.0),
        (0.25, 0.25, -0.2),
        (-0.25, -0.2, 0.3),
        (0.2, -0.2, 0.0),
    ];
    tilts
        .iter()
        .enumerate()
        .map(|(i, &(rx, ry, rz))| {
            let rotation = UnitQuaternion::from_euler_angles(rx, ry, rz);
            let center = rotation * Vector3::new(bw * 0.5, bh * 0.5, 0.0);
            let target = Vector3::new(
                (i as f64 - 3.5) * 0.04 * bw,
                ((i % 3) as f64 - 1.0) * 0.1 * bw,
                z + i as f64 * 0.02 * z,
            );
            Isometry3::from_parts(Translation3::from(target - center), rotation)
        })
        .collect()
}

/// Noise-free board corners as seen from `pose`.
pub fn board_sample(board: &MarkerBoard, camera: &CameraModel, pose: &Isometry3<f64>) -> CalibrationSample {
    let mut object = Vec::new();
    let mut image = Vec::new();
    for id in board.ids() {
        for p in board.marker_corners(id).unwrap() {
            image.push(camera.project(&pose.transform_point(&p)).unwrap());
            object.push(p);
        }
    }
    CalibrationSample::new(object, image).unwrap()
}
