//! Planar calibration pattern: a grid of markers with known geometry.

use crate::detection::Detection;
use crate::error::{CalibrationError, ConfigurationError};
use crate::geometry::{has_non_collinear_triple, Pixel};
use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One captured view: pattern points (board frame, z = 0, mm) and the
/// pixels where they were observed.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationSample {
    object_points: Vec<Point3<f64>>,
    image_points: Vec<Pixel>,
}

impl CalibrationSample {
    pub fn new(
        object_points: Vec<Point3<f64>>,
        image_points: Vec<Pixel>,
    ) -> Result<Self, CalibrationError> {
        if object_points.len() != image_points.len() || object_points.len() < 4 {
            return Err(CalibrationError::InsufficientCorrespondences {
                inliers: object_points.len().min(image_points.len()),
                required: 4,
            });
        }
        if object_points.iter().any(|p| p.z.abs() > 1e-9) {
            return Err(CalibrationError::SolverFailed(
                "calibration pattern points must lie on the z = 0 plane".to_string(),
            ));
        }
        let plane: Vec<Point2<f64>> = object_points.iter().map(|p| p.xy()).collect();
        if !has_non_collinear_triple(&plane) || !has_non_collinear_triple(&image_points) {
            return Err(CalibrationError::DegenerateHomography);
        }
        Ok(Self {
            object_points,
            image_points,
        })
    }

    pub fn object_points(&self) -> &[Point3<f64>] {
        &self.object_points
    }

    pub fn image_points(&self) -> &[Pixel] {
        &self.image_points
    }

    /// Pattern points as 2D plane coordinates.
    pub fn plane_points(&self) -> Vec<Point2<f64>> {
        self.object_points.iter().map(|p| p.xy()).collect()
    }

    pub fn len(&self) -> usize {
        self.object_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.object_points.is_empty()
    }

    /// Bounding box of the observed pixels.
    pub fn image_bounds(&self) -> (Pixel, Pixel) {
        let mut min = Point2::new(f64::INFINITY, f64::INFINITY);
        let mut max = Point2::new(f64::NEG_INFINITY, f64::NEG_INFINITY);
        for p in &self.image_points {
            min.x = min.x.min(p.x);
            min.y = min.y.min(p.y);
            max.x = max.x.max(p.x);
            max.y = max.y.max(p.y);
        }
        (min, max)
    }
}

/// Why a frame did not yield a calibration sample.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    /// Not every marker of the board was decoded.
    MissingMarkers { found: usize, expected: usize },
    /// Sub-pixel refinement did not converge for some corner.
    NotConverged,
    /// Too similar to a sample already accepted.
    DuplicatePose,
    /// Observed points are degenerate.
    InvalidGeometry,
    /// Frame could not be read.
    InvalidFrame(String),
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::MissingMarkers { found, expected } => {
                write!(f, "found {} of {} board markers", found, expected)
            }
            RejectReason::NotConverged => write!(f, "corner refinement did not converge"),
            RejectReason::DuplicatePose => write!(f, "pose too similar to an earlier sample"),
            RejectReason::InvalidGeometry => write!(f, "degenerate point geometry"),
            RejectReason::InvalidFrame(msg) => write!(f, "invalid frame: {}", msg),
        }
    }
}

/// Result of submitting one frame to a calibration session.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleVerdict {
    Accepted { accepted: usize },
    Rejected(RejectReason),
}

/// A `columns x rows` grid of markers on a flat board.
///
/// Marker `(col, row)` has identity `first_id + row * columns + col` and its
/// top-left corner at `(col, row) * (marker_size_mm + spacing_mm)` in the
/// board frame (x right, y down, z = 0).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerBoard {
    pub columns: u32,
    pub rows: u32,
    pub marker_size_mm: f64,
    pub spacing_mm: f64,
    pub first_id: u16,
}

impl Default for MarkerBoard {
    fn default() -> Self {
        Self {
            columns: 5,
            rows: 4,
            marker_size_mm: 40.0,
            spacing_mm: 10.0,
            first_id: 0,
        }
    }
}

impl MarkerBoard {
    pub fn new(
        columns: u32,
        rows: u32,
        marker_size_mm: f64,
        spacing_mm: f64,
        first_id: u16,
    ) -> Result<Self, ConfigurationError> {
        let board = Self {
            columns,
            rows,
            marker_size_mm,
            spacing_mm,
            first_id,
        };
        board.validate()?;
        Ok(board)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.columns == 0 || self.rows == 0 {
            return Err(ConfigurationError::InvalidConfig(
                "marker board needs at least one row and column".to_string(),
            ));
        }
        if !(self.marker_size_mm > 0.0) {
            return Err(ConfigurationError::InvalidConfig(format!(
                "marker size {} mm must be positive",
                self.marker_size_mm
            )));
        }
        // Adjacent markers share a quiet zone of at least one cell.
        if !(self.spacing_mm >= self.marker_size_mm / 8.0) {
            return Err(ConfigurationError::InvalidConfig(format!(
                "marker spacing {} mm is below one cell ({} mm)",
                self.spacing_mm,
                self.marker_size_mm / 8.0
            )));
        }
        let last = self.first_id as u64 + self.marker_count() as u64 - 1;
        if last > u16::MAX as u64 {
            return Err(ConfigurationError::InvalidConfig(format!(
                "marker ids up to {} exceed the 16-bit range",
                last
            )));
        }
        Ok(())
    }

    pub fn marker_count(&self) -> usize {
        (self.columns * self.rows) as usize
    }

    pub fn pitch_mm(&self) -> f64 {
        self.marker_size_mm + self.spacing_mm
    }

    pub fn width_mm(&self) -> f64 {
        self.columns as f64 * self.pitch_mm() - self.spacing_mm
    }

    pub fn height_mm(&self) -> f64 {
        self.rows as f64 * self.pitch_mm() - self.spacing_mm
    }

    /// Identities in row-major order.
    pub fn ids(&self) -> impl Iterator<Item = u16> + '_ {
        (0..self.marker_count()).map(move |i| self.first_id + i as u16)
    }

    /// Corners of marker `id` (top-left first, clockwise) in the board frame.
    pub fn marker_corners(&self, id: u16) -> Option<[Point3<f64>; 4]> {
        let index = id.checked_sub(self.first_id)? as usize;
        if index >= self.marker_count() {
            return None;
        }
        let col = (index % self.columns as usize) as f64;
        let row = (index / self.columns as usize) as f64;
        let x = col * self.pitch_mm();
        let y = row * self.pitch_mm();
        let s = self.marker_size_mm;
        Some([
            Point3::new(x, y, 0.0),
            Point3::new(x + s, y, 0.0),
            Point3::new(x + s, y + s, 0.0),
            Point3::new(x, y + s, 0.0),
        ])
    }

    /// Build a sample from one frame's detections. Every board marker must
    /// be present with converged corners.
    pub fn sample_from_detections(
        &self,
        detections: &[Detection],
    ) -> Result<CalibrationSample, RejectReason> {
        let by_id: HashMap<u16, &Detection> = detections
            .iter()
            .filter(|d| self.marker_corners(d.identity()).is_some())
            .map(|d| (d.identity(), d))
            .collect();
        if by_id.len() != self.marker_count() {
            return Err(RejectReason::MissingMarkers {
                found: by_id.len(),
                expected: self.marker_count(),
            });
        }
        if by_id.values().any(|d| !d.corners().converged) {
            return Err(RejectReason::NotConverged);
        }

        let mut object = Vec::with_capacity(self.marker_count() * 4);
        let mut image = Vec::with_capacity(self.marker_count() * 4);
        for id in self.ids() {
            let (Some(board), Some(detection)) = (self.marker_corners(id), by_id.get(&id)) else {
                continue;
            };
            object.extend_from_slice(&board);
            image.extend_from_slice(&detection.corners().points);
        }
        CalibrationSample::new(object, image).map_err(|_| RejectReason::InvalidGeometry)
    }
}
