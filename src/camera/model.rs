//! Pinhole camera with Brown-Conrady lens distortion.

use crate::calibration::{estimate_dlt, pose_from_homography, refine_pose};
use crate::error::{CalibrationError, ConfigurationError};
use crate::geometry::Pixel;
use crate::table::TableFrame;
use nalgebra::{Isometry3, Matrix2, Matrix3, Point2, Point3, Vector2, Vector3};

/// Focal lengths and principal point, in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Intrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// The 3x3 camera matrix K.
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    pub fn to_array(&self) -> [f64; 4] {
        [self.fx, self.fy, self.cx, self.cy]
    }

    pub fn from_array(v: [f64; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }

    /// Normalized image coordinates to pixels.
    pub fn to_pixel(&self, n: &Vector2<f64>) -> Pixel {
        Point2::new(self.fx * n.x + self.cx, self.fy * n.y + self.cy)
    }

    /// Pixels to normalized image coordinates.
    pub fn to_normalized(&self, p: &Pixel) -> Vector2<f64> {
        Vector2::new((p.x - self.cx) / self.fx, (p.y - self.cy) / self.fy)
    }
}

/// Radial (k1, k2, k3) and tangential (p1, p2) distortion coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Distortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

impl Distortion {
    pub fn none() -> Self {
        Self::default()
    }

    /// Coefficients in the conventional order `[k1, k2, p1, p2, k3]`.
    pub fn to_array(&self) -> [f64; 5] {
        [self.k1, self.k2, self.p1, self.p2, self.k3]
    }

    pub fn from_array(v: [f64; 5]) -> Self {
        Self {
            k1: v[0],
            k2: v[1],
            p1: v[2],
            p2: v[3],
            k3: v[4],
        }
    }

    pub fn is_zero(&self) -> bool {
        self.to_array().iter().all(|c| *c == 0.0)
    }

    /// Apply distortion to an undistorted normalized point.
    pub fn distort(&self, n: &Vector2<f64>) -> Vector2<f64> {
        let (x, y) = (n.x, n.y);
        let r2 = x * x + y * y;
        let radial = 1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3));
        let xy = x * y;
        Vector2::new(
            x * radial + 2.0 * self.p1 * xy + self.p2 * (r2 + 2.0 * x * x),
            y * radial + self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * xy,
        )
    }

    fn jacobian(&self, n: &Vector2<f64>) -> Matrix2<f64> {
        let (x, y) = (n.x, n.y);
        let r2 = x * x + y * y;
        let radial = 1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3));
        // d(radial)/d(r2)
        let d_radial = self.k1 + 2.0 * self.k2 * r2 + 3.0 * self.k3 * r2 * r2;

        let dxx = radial + 2.0 * x * x * d_radial + 2.0 * self.p1 * y + 6.0 * self.p2 * x;
        let dxy = 2.0 * x * y * d_radial + 2.0 * self.p1 * x + 2.0 * self.p2 * y;
        let dyx = 2.0 * x * y * d_radial + 2.0 * self.p1 * x + 2.0 * self.p2 * y;
        let dyy = radial + 2.0 * y * y * d_radial + 6.0 * self.p1 * y + 2.0 * self.p2 * x;
        Matrix2::new(dxx, dxy, dyx, dyy)
    }

    /// Invert the distortion with bounded Newton iterations.
    pub fn undistort(&self, distorted: &Vector2<f64>) -> Vector2<f64> {
        if self.is_zero() {
            return *distorted;
        }
        let mut n = *distorted;
        for _ in 0..20 {
            let err = self.distort(&n) - distorted;
            if err.norm_squared() < 1e-24 {
                break;
            }
            let step = match self.jacobian(&n).try_inverse() {
                Some(inv) => inv * err,
                None => err,
            };
            n -= step;
            if !n.x.is_finite() || !n.y.is_finite() {
                return *distorted;
            }
        }
        n
    }
}

/// Target plane for unprojection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DepthPlane {
    /// The table surface (z = 0 in table coordinates); needs extrinsics.
    Table,
    /// The plane `z = depth` in camera coordinates.
    CameraZ(f64),
}

/// Calibrated camera: intrinsics, distortion, raster size and the optional
/// table-to-camera pose.
///
/// Instances never change after construction; `with_extrinsics` returns a
/// new model.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraModel {
    intrinsics: Intrinsics,
    distortion: Distortion,
    width: u32,
    height: u32,
    extrinsics: Option<Isometry3<f64>>,
}

impl CameraModel {
    pub fn new(
        intrinsics: Intrinsics,
        distortion: Distortion,
        width: u32,
        height: u32,
    ) -> Result<Self, ConfigurationError> {
        let Intrinsics { fx, fy, cx, cy } = intrinsics;
        if !(fx.is_finite() && fy.is_finite() && cx.is_finite() && cy.is_finite()) {
            return Err(ConfigurationError::InvalidModel(
                "non-finite intrinsics".to_string(),
            ));
        }
        if fx <= 0.0 || fy <= 0.0 {
            return Err(ConfigurationError::InvalidModel(format!(
                "focal lengths must be positive (fx={}, fy={})",
                fx, fy
            )));
        }
        if width == 0 || height == 0 {
            return Err(ConfigurationError::InvalidModel(format!(
                "image size {}x{} is empty",
                width, height
            )));
        }
        if distortion.to_array().iter().any(|c| !c.is_finite()) {
            return Err(ConfigurationError::InvalidModel(
                "non-finite distortion coefficients".to_string(),
            ));
        }
        Ok(Self {
            intrinsics,
            distortion,
            width,
            height,
            extrinsics: None,
        })
    }

    /// Same intrinsics with a table-to-camera pose attached.
    pub fn with_extrinsics(&self, table_to_camera: Isometry3<f64>) -> Self {
        Self {
            extrinsics: Some(table_to_camera),
            ..self.clone()
        }
    }

    /// Same intrinsics without a table pose.
    pub fn without_extrinsics(&self) -> Self {
        Self {
            extrinsics: None,
            ..self.clone()
        }
    }

    pub fn intrinsics(&self) -> &Intrinsics {
        &self.intrinsics
    }

    pub fn distortion(&self) -> &Distortion {
        &self.distortion
    }

    pub fn image_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Table-to-camera transform, if the camera has been located.
    pub fn extrinsics(&self) -> Option<&Isometry3<f64>> {
        self.extrinsics.as_ref()
    }

    pub fn require_extrinsics(&self) -> Result<&Isometry3<f64>, ConfigurationError> {
        self.extrinsics
            .as_ref()
            .ok_or(ConfigurationError::MissingTablePose)
    }

    /// Remove lens distortion from an observed pixel.
    pub fn undistort(&self, pixel: &Pixel) -> Pixel {
        let n = self.undistort_normalized(pixel);
        self.intrinsics.to_pixel(&n)
    }

    /// Observed pixel to undistorted normalized coordinates.
    pub fn undistort_normalized(&self, pixel: &Pixel) -> Vector2<f64> {
        let distorted = self.intrinsics.to_normalized(pixel);
        self.distortion.undistort(&distorted)
    }

    /// Undistorted pixel to the pixel the lens would actually produce.
    pub fn distort(&self, pixel: &Pixel) -> Pixel {
        let n = self.intrinsics.to_normalized(pixel);
        self.intrinsics.to_pixel(&self.distortion.distort(&n))
    }

    /// Project a camera-frame point. `None` when behind the camera.
    pub fn project(&self, point: &Point3<f64>) -> Option<Pixel> {
        if point.z <= 1e-9 {
            return None;
        }
        let n = Vector2::new(point.x / point.z, point.y / point.z);
        Some(self.intrinsics.to_pixel(&self.distortion.distort(&n)))
    }

    /// Project a table-frame point (mm). `None` without extrinsics or when
    /// the point is behind the camera.
    pub fn project_table(&self, point: &Point3<f64>) -> Option<Pixel> {
        let pose = self.extrinsics.as_ref()?;
        self.project(&pose.transform_point(point))
    }

    /// Intersect the viewing ray through an observed (distorted) pixel with
    /// a plane.
    ///
    /// Returns table coordinates for `DepthPlane::Table` and camera
    /// coordinates for `DepthPlane::CameraZ`. `None` when the ray is
    /// parallel to the plane, the hit lies behind the camera, or the table
    /// pose is unknown.
    pub fn unproject(&self, pixel: &Pixel, plane: DepthPlane) -> Option<Point3<f64>> {
        let n = self.undistort_normalized(pixel);
        self.unproject_normalized(&n, plane)
    }

    /// As [`unproject`](Self::unproject) for a pixel that is already
    /// undistorted (e.g. taken from a remapped frame).
    pub fn unproject_rectified(&self, pixel: &Pixel, plane: DepthPlane) -> Option<Point3<f64>> {
        let n = self.intrinsics.to_normalized(pixel);
        self.unproject_normalized(&n, plane)
    }

    fn unproject_normalized(&self, n: &Vector2<f64>, plane: DepthPlane) -> Option<Point3<f64>> {
        let ray = Vector3::new(n.x, n.y, 1.0);
        match plane {
            DepthPlane::CameraZ(depth) => {
                if depth <= 0.0 || !depth.is_finite() {
                    return None;
                }
                Some(Point3::from(ray * depth))
            }
            DepthPlane::Table => {
                let pose = self.extrinsics.as_ref()?;
                let inv = pose.inverse();
                // Ray in table coordinates: origin o, direction d.
                let o = inv.translation.vector;
                let d = inv.rotation * ray;
                if d.z.abs() < 1e-12 {
                    return None;
                }
                let s = -o.z / d.z;
                if s <= 0.0 {
                    return None;
                }
                let hit = o + d * s;
                Some(Point3::new(hit.x, hit.y, 0.0))
            }
        }
    }

    /// Locate the table from its four corners observed in a raw frame,
    /// listed clockwise from the table origin. Returns a new model carrying
    /// the estimated table-to-camera pose.
    pub fn locate_table(
        &self,
        table: &TableFrame,
        observed: &[Pixel; 4],
    ) -> Result<CameraModel, CalibrationError> {
        let plane: Vec<Point2<f64>> = table.corners().iter().map(|c| table.to_plane(c)).collect();
        let normalized: Vec<Point2<f64>> = observed
            .iter()
            .map(|p| Point2::from(self.undistort_normalized(p)))
            .collect();
        let h = estimate_dlt(&plane, &normalized).ok_or(CalibrationError::DegenerateHomography)?;
        let initial = pose_from_homography(&Matrix3::identity(), &h).ok_or_else(|| {
            CalibrationError::SolverFailed("table homography has no valid pose".to_string())
        })?;
        let object: Vec<Point3<f64>> = plane.iter().map(|p| Point3::new(p.x, p.y, 0.0)).collect();
        let (pose, rms) = refine_pose(self, &object, observed, &initial);
        log::info!(
            "Located table: camera {:.1} mm above the surface, corner RMS {:.3}px",
            pose.inverse().translation.vector.z.abs(),
            rms
        );
        Ok(self.with_extrinsics(pose))
    }

    /// Camera centre in table coordinates.
    pub fn center_in_table(&self) -> Option<Point3<f64>> {
        self.extrinsics
            .as_ref()
            .map(|pose| Point3::from(pose.inverse().translation.vector))
    }

    /// Whether a pixel lies inside the raster.
    pub fn contains(&self, pixel: &Pixel) -> bool {
        pixel.x >= 0.0
            && pixel.y >= 0.0
            && pixel.x <= (self.width - 1) as f64
            && pixel.y <= (self.height - 1) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Translation3, UnitQuaternion};

    fn model() -> CameraModel {
        CameraModel::new(
            Intrinsics::new(1000.0, 1000.0, 640.0, 360.0),
            Distortion::from_array([-0.12, 0.05, 0.001, -0.0005, 0.0]),
            1280,
            720,
        )
        .unwrap()
    }

    fn overhead_pose() -> Isometry3<f64> {
        // Camera 1200 mm above the table centre looking straight down.
        let rotation = UnitQuaternion::from_euler_angles(std::f64::consts::PI, 0.0, 0.0);
        let camera_center = Vector3::new(450.0, 300.0, 1200.0);
        let translation = -(rotation * camera_center);
        Isometry3::from_parts(Translation3::from(translation), rotation)
    }

    #[test]
    fn test_invalid_intrinsics_rejected() {
        let err = CameraModel::new(Intrinsics::new(0.0, 1000.0, 1.0, 1.0), Distortion::none(), 10, 10);
        assert!(matches!(err, Err(ConfigurationError::InvalidModel(_))));
        let err = CameraModel::new(Intrinsics::new(100.0, 100.0, 1.0, 1.0), Distortion::none(), 0, 10);
        assert!(matches!(err, Err(ConfigurationError::InvalidModel(_))));
    }

    #[test]
    fn test_undistort_inverts_distort() {
        let cam = model();
        for &(x, y) in &[(10.0, 10.0), (640.0, 360.0), (1200.0, 700.0), (300.0, 650.0)] {
            let p = Point2::new(x, y);
            let back = cam.undistort(&cam.distort(&p));
            assert!((back - p).norm() < 1e-6, "{:?} -> {:?}", p, back);
        }
    }

    #[test]
    fn test_project_unproject_camera_plane() {
        let cam = model();
        let p = Point3::new(120.0, -80.0, 1500.0);
        let px = cam.project(&p).unwrap();
        let back = cam.unproject(&px, DepthPlane::CameraZ(1500.0)).unwrap();
        assert!((back - p).norm() < 1e-6);
        assert!(cam.project(&Point3::new(0.0, 0.0, -1.0)).is_none());
    }

    #[test]
    fn test_unproject_table_needs_pose() {
        let cam = model();
        assert!(cam.unproject(&Point2::new(640.0, 360.0), DepthPlane::Table).is_none());
        assert_eq!(cam.require_extrinsics().unwrap_err(), ConfigurationError::MissingTablePose);

        let located = cam.with_extrinsics(overhead_pose());
        let table_pt = Point3::new(200.0, 450.0, 0.0);
        let px = located.project_table(&table_pt).unwrap();
        let back = located.unproject(&px, DepthPlane::Table).unwrap();
        assert!((back - table_pt).norm() < 1e-6);
        // Original model is unchanged.
        assert!(cam.extrinsics().is_none());
    }

    #[test]
    fn test_locate_table_recovers_pose() {
        let cam = model();
        let table = TableFrame::new(900.0, 600.0).unwrap();
        let truth = cam.with_extrinsics(overhead_pose());
        let observed = table
            .corners()
            .map(|c| truth.project_table(&Point3::new(c.x, c.y, 0.0)).unwrap());
        let located = cam.locate_table(&table, &observed).unwrap();
        let table_point = Point3::new(333.0, 222.0, 0.0);
        let a = located.project_table(&table_point).unwrap();
        let b = truth.project_table(&table_point).unwrap();
        assert!((a - b).norm() < 1e-3, "{:?} vs {:?}", a, b);
    }

    #[test]
    fn test_center_in_table() {
        let located = model().with_extrinsics(overhead_pose());
        let c = located.center_in_table().unwrap();
        assert!((c - Point3::new(450.0, 300.0, 1200.0)).norm() < 1e-9);
    }
}
