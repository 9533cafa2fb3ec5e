//! Physical table coordinate system.
//!
//! The table plane is `z = 0` of the camera's table pose. Table coordinates
//! are plane coordinates shifted by the origin offset, in millimetres.

use crate::camera::{CameraModel, DepthPlane};
use crate::error::{CalibrationError, ConfigurationError, TrackerError};
use crate::geometry::Pixel;
use nalgebra::Point2;

/// Width, height and origin offset of the playing surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TableFrame {
    width: f64,
    height: f64,
    origin: Point2<f64>,
}

impl TableFrame {
    pub fn new(width: f64, height: f64) -> Result<Self, ConfigurationError> {
        Self::with_origin(width, height, Point2::origin())
    }

    pub fn with_origin(
        width: f64,
        height: f64,
        origin: Point2<f64>,
    ) -> Result<Self, ConfigurationError> {
        if !(width.is_finite() && height.is_finite()) || width <= 0.0 || height <= 0.0 {
            return Err(ConfigurationError::InvalidDimensions { width, height });
        }
        if !(origin.x.is_finite() && origin.y.is_finite()) {
            return Err(ConfigurationError::InvalidConfig(format!(
                "table origin ({}, {}) is not finite",
                origin.x, origin.y
            )));
        }
        Ok(Self {
            width,
            height,
            origin,
        })
    }

    pub fn width(&self) -> f64 {
        self.width
    }

    pub fn height(&self) -> f64 {
        self.height
    }

    pub fn origin(&self) -> Point2<f64> {
        self.origin
    }

    /// Table corners in table coordinates, clockwise from (0, 0).
    pub fn corners(&self) -> [Point2<f64>; 4] {
        [
            Point2::new(0.0, 0.0),
            Point2::new(self.width, 0.0),
            Point2::new(self.width, self.height),
            Point2::new(0.0, self.height),
        ]
    }

    /// Plane coordinates to table coordinates.
    pub fn to_table(&self, plane: &Point2<f64>) -> Point2<f64> {
        Point2::from(plane - self.origin)
    }

    /// Table coordinates to plane coordinates.
    pub fn to_plane(&self, table: &Point2<f64>) -> Point2<f64> {
        table + self.origin.coords
    }

    pub fn contains(&self, p: &Point2<f64>) -> bool {
        p.x >= 0.0 && p.y >= 0.0 && p.x <= self.width && p.y <= self.height
    }

    /// Measure a table from the camera: unproject four observed corners
    /// (clockwise from the table origin) onto the current table plane.
    ///
    /// Width and height are the mean lengths of opposite sides; the origin
    /// is placed at the first corner.
    pub fn from_observed_corners(
        camera: &CameraModel,
        corners: &[Pixel; 4],
    ) -> Result<Self, TrackerError> {
        camera.require_extrinsics()?;
        let mut plane = [Point2::origin(); 4];
        for (dst, px) in plane.iter_mut().zip(corners) {
            let hit = camera
                .unproject(px, DepthPlane::Table)
                .ok_or(CalibrationError::SolverFailed(
                    "table corner ray does not hit the table plane".to_string(),
                ))?;
            *dst = Point2::new(hit.x, hit.y);
        }
        let width = 0.5 * ((plane[1] - plane[0]).norm() + (plane[2] - plane[3]).norm());
        let height = 0.5 * ((plane[3] - plane[0]).norm() + (plane[2] - plane[1]).norm());
        let frame = Self::with_origin(width, height, plane[0])?;
        log::info!(
            "Measured table {:.1} x {:.1} mm (origin {:.1}, {:.1})",
            width,
            height,
            plane[0].x,
            plane[0].y
        );
        Ok(frame)
    }
}
