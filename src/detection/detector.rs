//! Marker detection: threshold, segment, fit quads, refine corners, decode.

use super::codec::{CellGrid, MarkerCodec, GRID_CELLS};
use super::components::find_components;
use super::quad::{fit_quad, FitQuadConfig, Quad};
use super::subpix::{refine_corner, SubPixConfig};
use super::threshold::adaptive_threshold;
use crate::calibration::estimate_dlt;
use crate::camera::{sample_bilinear, CameraModel, DepthPlane, Frame};
use crate::error::DetectionError;
use crate::geometry::{diagonal_intersection, signed_area, transform_point, Pixel};
use crate::table::TableFrame;
use image::GrayImage;
use nalgebra::{Matrix3, Point2};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Marker corners in image coordinates, starting at the marker's own
/// top-left corner and following its top edge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Corners {
    pub points: [Pixel; 4],
    /// Whether sub-pixel refinement converged for every corner.
    pub converged: bool,
}

impl Corners {
    /// Projective centre (intersection of the diagonals).
    pub fn center(&self) -> Pixel {
        diagonal_intersection(&self.points).unwrap_or_else(|| {
            Point2::from(self.points.iter().map(|p| p.coords).sum::<nalgebra::Vector2<f64>>() / 4.0)
        })
    }

    pub fn area(&self) -> f64 {
        signed_area(&self.points).abs()
    }

    /// Mean side length in pixels.
    pub fn mean_side(&self) -> f64 {
        (0..4)
            .map(|i| (self.points[(i + 1) % 4] - self.points[i]).norm())
            .sum::<f64>()
            / 4.0
    }
}

/// Marker pose on the table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarkerPose {
    /// Centre in table coordinates (mm).
    pub position: Point2<f64>,
    /// Direction of the marker's top edge, radians from the table +x axis
    /// towards +y.
    pub rotation: f64,
    /// Mean side length (mm).
    pub size_mm: f64,
}

/// One decoded marker.
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    /// Camera pose relative to the table is known.
    Resolved {
        identity: u16,
        corners: Corners,
        pose: MarkerPose,
    },
    /// Image-space result only.
    CornersOnly { identity: u16, corners: Corners },
}

impl Detection {
    pub fn identity(&self) -> u16 {
        match self {
            Detection::Resolved { identity, .. } | Detection::CornersOnly { identity, .. } => {
                *identity
            }
        }
    }

    pub fn corners(&self) -> &Corners {
        match self {
            Detection::Resolved { corners, .. } | Detection::CornersOnly { corners, .. } => corners,
        }
    }

    pub fn pose(&self) -> Option<&MarkerPose> {
        match self {
            Detection::Resolved { pose, .. } => Some(pose),
            Detection::CornersOnly { .. } => None,
        }
    }
}

/// Rectangular search region in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Detector tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorParams {
    /// Half-size of the adaptive threshold window.
    pub threshold_radius: u32,
    /// How much darker than the local mean a pixel must be.
    pub threshold_offset: u8,
    /// Smallest component (pixels) considered.
    pub min_component_area: usize,
    pub quad: FitQuadConfig,
    pub subpix: SubPixConfig,
    /// Minimum gray-level difference between border and quiet zone.
    pub min_contrast: f64,
    /// Also accept mirror-image markers (seen through a flipping projector).
    pub allow_mirrored: bool,
    pub roi: Option<Roi>,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            threshold_radius: 15,
            threshold_offset: 7,
            min_component_area: 40,
            quad: FitQuadConfig::default(),
            subpix: SubPixConfig::default(),
            min_contrast: 30.0,
            allow_mirrored: false,
            roi: None,
        }
    }
}

/// Stateless per-frame marker detector.
#[derive(Debug, Clone, Default)]
pub struct MarkerDetector {
    params: DetectorParams,
    codec: MarkerCodec,
}

impl MarkerDetector {
    pub fn new(params: DetectorParams) -> Self {
        Self {
            params,
            codec: MarkerCodec::new(),
        }
    }

    pub fn params(&self) -> &DetectorParams {
        &self.params
    }

    /// Detect markers in a frame, image-space only.
    pub fn detect_frame(&self, frame: &Frame) -> Result<Vec<Detection>, DetectionError> {
        Ok(self.detect(&frame.to_luma()?))
    }

    /// Detect markers, image-space only.
    pub fn detect(&self, image: &GrayImage) -> Vec<Detection> {
        self.detect_corners(image)
            .into_iter()
            .map(|(identity, corners)| Detection::CornersOnly { identity, corners })
            .collect()
    }

    /// Detect markers in an undistorted frame and resolve their table pose
    /// when the camera has been located relative to the table.
    pub fn detect_with_pose(
        &self,
        image: &GrayImage,
        camera: &CameraModel,
        table: &TableFrame,
    ) -> Vec<Detection> {
        self.detect_corners(image)
            .into_iter()
            .map(|(identity, corners)| match marker_pose(&corners, camera, table) {
                Some(pose) => Detection::Resolved {
                    identity,
                    corners,
                    pose,
                },
                None => Detection::CornersOnly { identity, corners },
            })
            .collect()
    }

    fn detect_corners(&self, image: &GrayImage) -> Vec<(u16, Corners)> {
        let roi = self.params.roi.and_then(|r| clamp_roi(r, image));
        let cropped = roi.map(|r| {
            image::imageops::crop_imm(image, r.x, r.y, r.width, r.height).to_image()
        });
        let (search, offset) = match (&cropped, roi) {
            (Some(crop), Some(r)) => (crop, (r.x as f64, r.y as f64)),
            _ => (image, (0.0, 0.0)),
        };

        let mask = adaptive_threshold(
            search,
            self.params.threshold_radius,
            self.params.threshold_offset,
        );
        let components = find_components(&mask, self.params.min_component_area);

        let mut best: HashMap<u16, Corners> = HashMap::new();
        let mut order: Vec<u16> = Vec::new();
        for component in &components {
            let Some(quad) = fit_quad(component, &self.params.quad) else {
                continue;
            };
            match self.decode_quad(search, &quad) {
                Ok((id, mut corners)) => {
                    for p in corners.points.iter_mut() {
                        p.x += offset.0;
                        p.y += offset.1;
                    }
                    match best.get(&id) {
                        Some(existing) if existing.area() >= corners.area() => {}
                        Some(_) => {
                            best.insert(id, corners);
                        }
                        None => {
                            order.push(id);
                            best.insert(id, corners);
                        }
                    }
                }
                Err(e) => log::debug!("Rejected marker candidate: {}", e),
            }
        }

        order
            .into_iter()
            .filter_map(|id| best.remove(&id).map(|c| (id, c)))
            .collect()
    }

    /// Refine the quad's corners and try every orientation.
    fn decode_quad(
        &self,
        image: &GrayImage,
        quad: &Quad,
    ) -> Result<(u16, Corners), DetectionError> {
        let cell = quad.min_side() / GRID_CELLS as f64;
        let half_window = (cell * 0.5).round().clamp(2.0, 6.0) as u32;
        let mut refined = quad.corners;
        let mut converged = true;
        for p in refined.iter_mut() {
            let r = refine_corner(image, *p, half_window, &self.params.subpix);
            converged &= r.converged;
            *p = r.position;
        }

        let grid = self.sample_grid(image, &refined)?;

        let mut orderings: Vec<(CellGrid, [Pixel; 4])> = Vec::with_capacity(8);
        let mut g = grid;
        let mut c = refined;
        for _ in 0..4 {
            orderings.push((g, c));
            g = rotate(&g);
            c = [c[1], c[2], c[3], c[0]];
        }
        if self.params.allow_mirrored {
            let mut g = transpose(&grid);
            let mut c = [refined[0], refined[3], refined[2], refined[1]];
            for _ in 0..4 {
                orderings.push((g, c));
                g = rotate(&g);
                c = [c[1], c[2], c[3], c[0]];
            }
        }

        let mut last_err = DetectionError::MalformedPayload("orientation cells do not match");
        for (grid, points) in &orderings {
            if !self.codec.orientation_matches(grid) {
                continue;
            }
            match self.codec.decode(grid) {
                Ok(id) => {
                    return Ok((
                        id,
                        Corners {
                            points: *points,
                            converged,
                        },
                    ))
                }
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    /// Sample the 8x8 cell grid and binarize it between the border (black)
    /// and quiet-zone (white) levels.
    fn sample_grid(
        &self,
        image: &GrayImage,
        corners: &[Pixel; 4],
    ) -> Result<CellGrid, DetectionError> {
        let n = GRID_CELLS as f64;
        let square = [
            Point2::new(0.0, 0.0),
            Point2::new(n, 0.0),
            Point2::new(n, n),
            Point2::new(0.0, n),
        ];
        let h = estimate_dlt(&square, corners)
            .ok_or(DetectionError::MalformedPayload("degenerate quad"))?;

        // Cells -1..=8 so the quiet-zone ring is included.
        let size = GRID_CELLS + 2;
        let mut values = vec![0.0f64; size * size];
        for r in 0..size {
            for c in 0..size {
                values[r * size + c] = cell_value(image, &h, r as f64 - 1.0, c as f64 - 1.0)
                    .ok_or(DetectionError::MalformedPayload("cell outside image"))?;
            }
        }

        let mut black = 0.0;
        let mut white = 0.0;
        let (mut nb, mut nw) = (0, 0);
        for r in 0..size {
            for c in 0..size {
                let ring = r == 0 || c == 0 || r == size - 1 || c == size - 1;
                let border = !ring && (r == 1 || c == 1 || r == size - 2 || c == size - 2);
                if ring {
                    white += values[r * size + c];
                    nw += 1;
                } else if border {
                    black += values[r * size + c];
                    nb += 1;
                }
            }
        }
        black /= nb as f64;
        white /= nw as f64;
        if white - black < self.params.min_contrast {
            return Err(DetectionError::MalformedPayload("insufficient contrast"));
        }
        let threshold = 0.5 * (black + white);

        let mut grid = [[false; GRID_CELLS]; GRID_CELLS];
        for (r, row) in grid.iter_mut().enumerate() {
            for (c, cell) in row.iter_mut().enumerate() {
                *cell = values[(r + 1) * size + c + 1] > threshold;
            }
        }
        Ok(grid)
    }
}

/// Mean of a 3x3 sub-sample grid in the inner part of a cell.
fn cell_value(image: &GrayImage, h: &Matrix3<f64>, row: f64, col: f64) -> Option<f64> {
    const OFFSETS: [f64; 3] = [0.3, 0.5, 0.7];
    let (w, ht) = image.dimensions();
    let mut sum = 0.0;
    for dy in OFFSETS {
        for dx in OFFSETS {
            let p = transform_point(h, &Point2::new(col + dx, row + dy))?;
            if p.x < -0.5 || p.y < -0.5 || p.x > w as f64 - 0.5 || p.y > ht as f64 - 0.5 {
                return None;
            }
            sum += sample_bilinear(image, p.x, p.y);
        }
    }
    Some(sum / 9.0)
}

/// Grid as seen when starting from the next corner clockwise.
fn rotate(g: &CellGrid) -> CellGrid {
    let mut out = [[false; GRID_CELLS]; GRID_CELLS];
    for (r, row) in out.iter_mut().enumerate() {
        for (c, cell) in row.iter_mut().enumerate() {
            *cell = g[c][GRID_CELLS - 1 - r];
        }
    }
    out
}

fn transpose(g: &CellGrid) -> CellGrid {
    let mut out = [[false; GRID_CELLS]; GRID_CELLS];
    for (r, row) in out.iter_mut().enumerate() {
        for (c, cell) in row.iter_mut().enumerate() {
            *cell = g[c][r];
        }
    }
    out
}

fn clamp_roi(roi: Roi, image: &GrayImage) -> Option<Roi> {
    let (w, h) = image.dimensions();
    if roi.x >= w || roi.y >= h {
        return None;
    }
    let width = roi.width.min(w - roi.x);
    let height = roi.height.min(h - roi.y);
    if width == 0 || height == 0 {
        return None;
    }
    Some(Roi {
        x: roi.x,
        y: roi.y,
        width,
        height,
    })
}

/// Unproject the (undistorted) corners onto the table.
fn marker_pose(corners: &Corners, camera: &CameraModel, table: &TableFrame) -> Option<MarkerPose> {
    let mut on_table = [Point2::origin(); 4];
    for (dst, p) in on_table.iter_mut().zip(&corners.points) {
        let hit = camera.unproject_rectified(p, DepthPlane::Table)?;
        *dst = table.to_table(&Point2::new(hit.x, hit.y));
    }
    let position = Point2::from(on_table.iter().map(|p| p.coords).sum::<nalgebra::Vector2<f64>>() / 4.0);
    let top = (on_table[1] - on_table[0]) + (on_table[2] - on_table[3]);
    let rotation = top.y.atan2(top.x);
    let size_mm = (0..4)
        .map(|i| (on_table[(i + 1) % 4] - on_table[i]).norm())
        .sum::<f64>()
        / 4.0;
    Some(MarkerPose {
        position,
        rotation,
        size_mm,
    })
}
