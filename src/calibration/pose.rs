//! Planar pose: linear initialisation from a homography and nonlinear
//! refinement against observed pixels.

use super::jacobian::numeric_jacobian;
use crate::camera::CameraModel;
use crate::geometry::Pixel;
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::storage::Owned;
use nalgebra::{
    DMatrix, DVector, Dyn, Isometry3, Matrix3, Point3, Rotation3, Translation3, UnitQuaternion,
    Vector3,
};

/// Decompose a plane-to-image homography into the pose of the plane
/// (z = 0) in camera coordinates, given the camera matrix `k`.
///
/// The homography sign is chosen so that the plane lies in front of the
/// camera.
pub fn pose_from_homography(k: &Matrix3<f64>, h: &Matrix3<f64>) -> Option<Isometry3<f64>> {
    let k_inv = k.try_inverse()?;
    let mut m = k_inv * h;
    if m[(2, 2)] < 0.0 {
        m = -m;
    }
    let h1 = m.column(0).into_owned();
    let h2 = m.column(1).into_owned();
    let h3 = m.column(2).into_owned();

    let norm1 = h1.norm();
    let norm2 = h2.norm();
    if norm1 < 1e-12 || norm2 < 1e-12 {
        return None;
    }
    let lambda = 2.0 / (norm1 + norm2);

    let r1 = h1 * lambda;
    let r2 = h2 * lambda;
    let r3 = r1.cross(&r2);
    let r = Matrix3::from_columns(&[r1, r2, r3]);

    // Nearest rotation (polar decomposition).
    let svd = r.svd(true, true);
    let (u, v_t) = (svd.u?, svd.v_t?);
    let mut r_orth = u * v_t;
    if r_orth.determinant() < 0.0 {
        let mut u_flipped = u;
        u_flipped.column_mut(2).neg_mut();
        r_orth = u_flipped * v_t;
    }

    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r_orth));
    let translation = Translation3::from(h3 * lambda);
    Some(Isometry3::from_parts(translation, rotation))
}

/// Axis-angle rotation followed by translation.
pub fn pose_to_params(pose: &Isometry3<f64>) -> [f64; 6] {
    let w = pose.rotation.scaled_axis();
    let t = pose.translation.vector;
    [w.x, w.y, w.z, t.x, t.y, t.z]
}

pub fn params_to_pose(p: &[f64]) -> Isometry3<f64> {
    let rotation = UnitQuaternion::from_scaled_axis(Vector3::new(p[0], p[1], p[2]));
    Isometry3::from_parts(Translation3::new(p[3], p[4], p[5]), rotation)
}

/// Single-view pose refinement with fixed intrinsics.
struct PoseProblem<'a> {
    camera: &'a CameraModel,
    object: &'a [Point3<f64>],
    observed: &'a [Pixel],
    params: DVector<f64>,
}

impl PoseProblem<'_> {
    fn residuals_at(&self, params: &[f64]) -> DVector<f64> {
        let pose = params_to_pose(params);
        let mut r = DVector::zeros(self.object.len() * 2);
        for (i, (p, obs)) in self.object.iter().zip(self.observed).enumerate() {
            match self.camera.project(&pose.transform_point(p)) {
                Some(px) => {
                    r[2 * i] = px.x - obs.x;
                    r[2 * i + 1] = px.y - obs.y;
                }
                None => {
                    r[2 * i] = 1e6;
                    r[2 * i + 1] = 1e6;
                }
            }
        }
        r
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for PoseProblem<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.params.clone_from(x);
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        Some(self.residuals_at(self.params.as_slice()))
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        Some(numeric_jacobian(|x| self.residuals_at(x), &self.params))
    }
}

/// Refine a plane pose by minimizing reprojection error. Returns the pose
/// and its RMS error in pixels.
pub fn refine_pose(
    camera: &CameraModel,
    object: &[Point3<f64>],
    observed: &[Pixel],
    initial: &Isometry3<f64>,
) -> (Isometry3<f64>, f64) {
    let problem = PoseProblem {
        camera,
        object,
        observed,
        params: DVector::from_row_slice(&pose_to_params(initial)),
    };
    let (problem, report) = LevenbergMarquardt::new().minimize(problem);
    if !report.termination.was_successful() {
        log::debug!("Pose refinement stopped early: {:?}", report.termination);
    }
    let n = object.len().max(1) as f64;
    let r = problem.residuals_at(problem.params.as_slice());
    let rms = (r.norm_squared() / n).sqrt();
    (params_to_pose(problem.params.as_slice()), rms)
}
