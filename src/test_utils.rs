//! Synthetic frames for unit tests: flat marker renders and marker boards
//! seen through a camera model.

use crate::calibration::{CalibrationSample, Homography, MarkerBoard};
use crate::camera::{CameraModel, DepthPlane, Distortion, Intrinsics};
use crate::detection::{CellGrid, MarkerCodec, GRID_CELLS};
use crate::error::CalibrationError;
use crate::geometry::Pixel;
use crate::store::CalibrationBundle;
use crate::table::TableFrame;
use image::{GrayImage, Luma};
use nalgebra::{Isometry3, Matrix3, Point2, Translation3, UnitQuaternion, Vector2, Vector3};

const WHITE: f64 = 240.0;
const BLACK: f64 = 15.0;

/// One marker drawn directly in image coordinates.
#[derive(Debug, Clone)]
pub struct MarkerPlacement {
    pub id: u16,
    pub center: Point2<f64>,
    pub size: f64,
    /// Clockwise rotation in radians (y points down).
    pub angle: f64,
    pub mirrored: bool,
}

impl MarkerPlacement {
    pub fn axis_aligned(id: u16, left: f64, top: f64, size: f64) -> Self {
        Self {
            id,
            center: Point2::new(left + size * 0.5, top + size * 0.5),
            size,
            angle: 0.0,
            mirrored: false,
        }
    }

    pub fn rotated(id: u16, center_x: f64, center_y: f64, size: f64, angle: f64) -> Self {
        Self {
            id,
            center: Point2::new(center_x, center_y),
            size,
            angle,
            mirrored: false,
        }
    }

    pub fn mirrored(mut self) -> Self {
        self.mirrored = true;
        self
    }

    fn to_image(&self, u: f64, v: f64) -> Pixel {
        let (s, c) = self.angle.sin_cos();
        let du = u - self.size * 0.5;
        let dv = v - self.size * 0.5;
        Point2::new(self.center.x + c * du - s * dv, self.center.y + s * du + c * dv)
    }

    fn to_marker(&self, p: &Pixel) -> Vector2<f64> {
        let (s, c) = self.angle.sin_cos();
        let dx = p.x - self.center.x;
        let dy = p.y - self.center.y;
        Vector2::new(c * dx + s * dy + self.size * 0.5, -s * dx + c * dy + self.size * 0.5)
    }

    /// Marker corners: its own top-left, top-right, bottom-right, bottom-left.
    pub fn corners(&self) -> [Pixel; 4] {
        [
            self.to_image(0.0, 0.0),
            self.to_image(self.size, 0.0),
            self.to_image(self.size, self.size),
            self.to_image(0.0, self.size),
        ]
    }
}

fn cell_at(grid: &CellGrid, u: f64, v: f64, size: f64, mirrored: bool) -> Option<bool> {
    if u < 0.0 || v < 0.0 || u >= size || v >= size {
        return None;
    }
    let cell = size / GRID_CELLS as f64;
    let col = ((u / cell) as usize).min(GRID_CELLS - 1);
    let row = ((v / cell) as usize).min(GRID_CELLS - 1);
    Some(if mirrored { grid[col][row] } else { grid[row][col] })
}

/// Supersampled render of markers on a white background. Pixel centres sit
/// at integer coordinates.
pub fn render_markers(width: u32, height: u32, placements: &[MarkerPlacement]) -> GrayImage {
    const SS: usize = 4;
    let codec = MarkerCodec::new();
    let grids: Vec<CellGrid> = placements.iter().map(|p| codec.cells(p.id)).collect();
    GrayImage::from_fn(width, height, |x, y| {
        let mut acc = 0.0;
        for sy in 0..SS {
            for sx in 0..SS {
                let p = Point2::new(
                    x as f64 - 0.5 + (sx as f64 + 0.5) / SS as f64,
                    y as f64 - 0.5 + (sy as f64 + 0.5) / SS as f64,
                );
                let white = placements
                    .iter()
                    .zip(&grids)
                    .find_map(|(placement, grid)| {
                        let m = placement.to_marker(&p);
                        cell_at(grid, m.x, m.y, placement.size, placement.mirrored)
                    })
                    .unwrap_or(true);
                acc += if white { WHITE } else { BLACK };
            }
        }
        Luma([(acc / (SS * SS) as f64).round() as u8])
    })
}

/// Eight board-to-camera poses with varied tilt, all keeping `board` inside
/// a 640x480 view at focal length around 820 px.
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
            let board_center = rotation * Vector3::new(bw * 0.5, bh * 0.5, 0.0);
            let target = Vector3::new(
                (i as f64 - 3.5) * 0.04 * bw,
                ((i % 3) as f64 - 1.0) * 0.1 * bw,
                z + i as f64 * 0.02 * z,
            );
            Isometry3::from_parts(Translation3::from(target - board_center), rotation)
        })
        .collect()
}

/// Exact projections of every board corner for one view.
pub fn board_sample(
    board: &MarkerBoard,
    camera: &CameraModel,
    pose: &Isometry3<f64>,
) -> Result<CalibrationSample, CalibrationError> {
    let mut object = Vec::new();
    let mut image = Vec::new();
    for id in board.ids() {
        let Some(corners) = board.marker_corners(id) else {
            continue;
        };
        for p in corners {
            let px = camera
                .project(&pose.transform_point(&p))
                .ok_or(CalibrationError::DegenerateHomography)?;
            object.push(p);
            image.push(px);
        }
    }
    CalibrationSample::new(object, image)
}

/// Render the board as seen by `camera` from `pose`, lens distortion
/// included.
pub fn render_board_view(
    board: &MarkerBoard,
    camera: &CameraModel,
    pose: &Isometry3<f64>,
) -> GrayImage {
    const SS: usize = 2;
    let located = camera.with_extrinsics(*pose);
    let codec = MarkerCodec::new();
    let grids: Vec<CellGrid> = board.ids().map(|id| codec.cells(id)).collect();
    let pitch = board.pitch_mm();
    let (width, height) = camera.image_size();
    GrayImage::from_fn(width, height, |x, y| {
        let mut acc = 0.0;
        for sy in 0..SS {
            for sx in 0..SS {
                let p = Point2::new(
                    x as f64 - 0.5 + (sx as f64 + 0.5) / SS as f64,
                    y as f64 - 0.5 + (sy as f64 + 0.5) / SS as f64,
                );
                let white = located
                    .unproject(&p, DepthPlane::Table)
                    .and_then(|hit| {
                        if hit.x < 0.0 || hit.y < 0.0 {
                            return None;
                        }
                        let col = (hit.x / pitch) as usize;
                        let row = (hit.y / pitch) as usize;
                        if col >= board.columns as usize || row >= board.rows as usize {
                            return None;
                        }
                        let grid = &grids[row * board.columns as usize + col];
                        cell_at(
                            grid,
                            hit.x - col as f64 * pitch,
                            hit.y - row as f64 * pitch,
                            board.marker_size_mm,
                            false,
                        )
                    })
                    .unwrap_or(true);
                acc += if white { WHITE } else { BLACK };
            }
        }
        Luma([(acc / (SS * SS) as f64).round() as u8])
    })
}

/// A complete bundle with awkward (non-round) values everywhere.
pub fn sample_bundle() -> CalibrationBundle {
    let pose = Isometry3::from_parts(
        Translation3::new(-451.25, 298.0625, 1203.1),
        UnitQuaternion::from_euler_angles(3.1, 0.013, -0.2),
    );
    let camera = CameraModel::new(
        Intrinsics::new(1012.345678901, 1009.87654321, 641.3, 359.7),
        Distortion::from_array([-0.1234567, 0.0456, 1.2e-4, -3.4e-5, 0.0012]),
        1280,
        720,
    )
    .unwrap()
    .with_extrinsics(pose);
    let homography = Homography::new(Matrix3::new(
        2.0011, 0.0123, 10.5, -0.004, 1.9987, 9.75, 1.1e-6, -2.3e-6, 1.0,
    ))
    .unwrap();
    let table = TableFrame::with_origin(900.0, 600.0, Point2::new(12.5, -3.25)).unwrap();
    CalibrationBundle::new(camera, homography, table).unwrap()
}

/// Camera 1200 mm above the centre of a 900 x 600 mm table, looking down,
/// with a projector homography of 2 px/mm plus a 10 px offset.
pub fn overhead_bundle() -> CalibrationBundle {
    let rotation = UnitQuaternion::from_euler_angles(std::f64::consts::PI, 0.0, 0.0);
    let center = Vector3::new(450.0, 300.0, 1200.0);
    let pose = Isometry3::from_parts(Translation3::from(-(rotation * center)), rotation);
    let camera = CameraModel::new(
        Intrinsics::new(900.0, 900.0, 320.0, 240.0),
        Distortion::none(),
        640,
        480,
    )
    .unwrap()
    .with_extrinsics(pose);
    let homography = Homography::new(Matrix3::new(2.0, 0.0, 10.0, 0.0, 2.0, 10.0, 0.0, 0.0, 1.0)).unwrap();
    let table = TableFrame::new(900.0, 600.0).unwrap();
    CalibrationBundle::new(camera, homography, table).unwrap()
}
