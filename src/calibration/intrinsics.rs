//! Planar camera calibration: Zhang's closed-form initialisation followed
//! by a Levenberg-Marquardt bundle over intrinsics, distortion and per-view
//! poses.

use super::homography::estimate_dlt;
use super::jacobian::{half_squared_norm, step_size};
use super::pattern::CalibrationSample;
use super::pose::{params_to_pose, pose_from_homography, pose_to_params};
use crate::camera::{CameraModel, Distortion, Intrinsics};
use crate::error::CalibrationError;
use crate::geometry::Pixel;
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::storage::Owned;
use nalgebra::{DMatrix, DVector, Dyn, Isometry3, Matrix3, Point3, Vector2, Vector3, Vector6};

const INTRINSIC_PARAMS: usize = 9;
const POSE_PARAMS: usize = 6;

/// Output of [`calibrate_planar`].
#[derive(Debug, Clone)]
pub struct IntrinsicsSolution {
    /// Calibrated model without extrinsics.
    pub camera: CameraModel,
    /// RMS reprojection error over all points, in pixels.
    pub rms: f64,
    pub per_view_rms: Vec<f64>,
    /// Pattern-to-camera pose of every view.
    pub poses: Vec<Isometry3<f64>>,
    /// Residual evaluations spent by the solver.
    pub evaluations: usize,
    pub converged: bool,
}

fn v_ij(h: &Matrix3<f64>, i: usize, j: usize) -> Vector6<f64> {
    let hi = h.column(i);
    let hj = h.column(j);
    Vector6::new(
        hi[0] * hj[0],
        hi[0] * hj[1] + hi[1] * hj[0],
        hi[1] * hj[1],
        hi[2] * hj[0] + hi[0] * hj[2],
        hi[2] * hj[1] + hi[1] * hj[2],
        hi[2] * hj[2],
    )
}

/// Zhang's closed-form intrinsics from plane-to-image homographies, with
/// zero skew imposed. Needs at least two views.
///
/// Homographies are conditioned with a similarity on the image side sized
/// to `width x height` before solving.
pub fn zhang_intrinsics(homographies: &[Matrix3<f64>], width: u32, height: u32) -> Option<Intrinsics> {
    if homographies.len() < 2 {
        return None;
    }
    let s = 2.0 / (width as f64 + height as f64);
    let (ox, oy) = (width as f64 * 0.5, height as f64 * 0.5);
    let n = Matrix3::new(s, 0.0, -s * ox, 0.0, s, -s * oy, 0.0, 0.0, 1.0);

    let rows = (2 * homographies.len() + 1).max(6);
    let mut v = DMatrix::<f64>::zeros(rows, 6);
    for (k, h) in homographies.iter().enumerate() {
        let hn = n * h;
        let norm = hn.norm();
        if norm < 1e-15 {
            return None;
        }
        let hn = hn / norm;
        v.row_mut(2 * k).copy_from(&v_ij(&hn, 0, 1).transpose());
        v.row_mut(2 * k + 1)
            .copy_from(&(v_ij(&hn, 0, 0) - v_ij(&hn, 1, 1)).transpose());
    }
    v[(2 * homographies.len(), 1)] = 1.0;

    let svd = v.svd(false, true);
    let v_t = svd.v_t?;
    let (min_idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let b = v_t.row(min_idx);
    let (b11, b12, b22, b13, b23, b33) = (b[0], b[1], b[2], b[3], b[4], b[5]);

    let denom = b11 * b22 - b12 * b12;
    if denom.abs() < 1e-18 || b11.abs() < 1e-18 {
        return None;
    }
    let v0 = (b12 * b13 - b11 * b23) / denom;
    let lambda = b33 - (b13 * b13 + v0 * (b12 * b13 - b11 * b23)) / b11;
    let alpha_sq = lambda / b11;
    let beta_sq = lambda * b11 / denom;
    if !(alpha_sq > 0.0 && beta_sq > 0.0) {
        return None;
    }
    let alpha = alpha_sq.sqrt();
    let beta = beta_sq.sqrt();
    let u0 = -b13 * alpha * alpha / lambda;

    let k = Intrinsics::new(alpha / s, beta / s, u0 / s + ox, v0 / s + oy);
    [k.fx, k.fy, k.cx, k.cy]
        .iter()
        .all(|x| x.is_finite())
        .then_some(k)
}

/// Bundle over `[fx, fy, cx, cy, k1, k2, p1, p2, k3]` followed by six pose
/// parameters per view.
struct BundleProblem<'a> {
    samples: &'a [CalibrationSample],
    offsets: Vec<usize>,
    residual_count: usize,
    params: DVector<f64>,
}

impl<'a> BundleProblem<'a> {
    fn new(samples: &'a [CalibrationSample], x0: Vec<f64>) -> Self {
        let mut offsets = Vec::with_capacity(samples.len());
        let mut total = 0;
        for s in samples {
            offsets.push(total);
            total += 2 * s.len();
        }
        Self {
            samples,
            offsets,
            residual_count: total,
            params: DVector::from_vec(x0),
        }
    }

    fn project(params: &[f64], view: usize, p: &Point3<f64>) -> Option<Pixel> {
        let intrinsics = Intrinsics::new(params[0], params[1], params[2], params[3]);
        let distortion = Distortion::from_array([params[4], params[5], params[6], params[7], params[8]]);
        let base = INTRINSIC_PARAMS + POSE_PARAMS * view;
        let pose = params_to_pose(&params[base..base + POSE_PARAMS]);
        let pc = pose.transform_point(p);
        if pc.z <= 1e-9 {
            return None;
        }
        let n = Vector2::new(pc.x / pc.z, pc.y / pc.z);
        Some(intrinsics.to_pixel(&distortion.distort(&n)))
    }

    fn view_residuals(&self, params: &[f64], view: usize, out: &mut [f64]) {
        let sample = &self.samples[view];
        for (i, (p, obs)) in sample
            .object_points()
            .iter()
            .zip(sample.image_points())
            .enumerate()
        {
            match Self::project(params, view, p) {
                Some(px) => {
                    out[2 * i] = px.x - obs.x;
                    out[2 * i + 1] = px.y - obs.y;
                }
                None => {
                    out[2 * i] = 1e6;
                    out[2 * i + 1] = 1e6;
                }
            }
        }
    }
}

impl BundleProblem<'_> {
    fn residuals_at(&self, params: &[f64]) -> DVector<f64> {
        let mut r = DVector::zeros(self.residual_count);
        for view in 0..self.samples.len() {
            let start = self.offsets[view];
            let len = 2 * self.samples[view].len();
            self.view_residuals(params, view, &mut r.as_mut_slice()[start..start + len]);
        }
        r
    }

    /// Central differences; pose columns only touch their own view's rows.
    fn jacobian_at(&self, params: &DVector<f64>) -> DMatrix<f64> {
        let mut jac = DMatrix::zeros(self.residual_count, params.len());
        let mut shifted = params.clone();

        for j in 0..INTRINSIC_PARAMS {
            let h = step_size(params[j]);
            shifted[j] = params[j] + h;
            let plus = self.residuals_at(shifted.as_slice());
            shifted[j] = params[j] - h;
            let minus = self.residuals_at(shifted.as_slice());
            shifted[j] = params[j];
            jac.column_mut(j).copy_from(&((plus - minus) / (2.0 * h)));
        }

        for view in 0..self.samples.len() {
            let start = self.offsets[view];
            let len = 2 * self.samples[view].len();
            let mut plus = vec![0.0; len];
            let mut minus = vec![0.0; len];
            for k in 0..POSE_PARAMS {
                let j = INTRINSIC_PARAMS + POSE_PARAMS * view + k;
                let h = step_size(params[j]);
                shifted[j] = params[j] + h;
                self.view_residuals(shifted.as_slice(), view, &mut plus);
                shifted[j] = params[j] - h;
                self.view_residuals(shifted.as_slice(), view, &mut minus);
                shifted[j] = params[j];
                for row in 0..len {
                    jac[(start + row, j)] = (plus[row] - minus[row]) / (2.0 * h);
                }
            }
        }
        jac
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for BundleProblem<'_> {
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
        Some(self.jacobian_at(&self.params))
    }
}

/// Calibrate intrinsics and distortion from planar views of a pattern.
pub fn calibrate_planar(
    samples: &[CalibrationSample],
    width: u32,
    height: u32,
) -> Result<IntrinsicsSolution, CalibrationError> {
    if samples.len() < 2 {
        return Err(CalibrationError::InsufficientSamples {
            accepted: samples.len(),
            required: 2,
        });
    }

    let mut homographies = Vec::with_capacity(samples.len());
    for sample in samples {
        let h = estimate_dlt(&sample.plane_points(), sample.image_points())
            .ok_or(CalibrationError::DegenerateHomography)?;
        homographies.push(h);
    }

    let initial = zhang_intrinsics(&homographies, width, height).unwrap_or_else(|| {
        let f = width.max(height) as f64;
        log::warn!("Closed-form intrinsics failed, starting from f = {}", f);
        Intrinsics::new(f, f, width as f64 * 0.5, height as f64 * 0.5)
    });
    log::debug!(
        "Initial intrinsics fx={:.2} fy={:.2} cx={:.2} cy={:.2}",
        initial.fx,
        initial.fy,
        initial.cx,
        initial.cy
    );

    let k = initial.matrix();
    let mut x0 = Vec::with_capacity(INTRINSIC_PARAMS + POSE_PARAMS * samples.len());
    x0.extend_from_slice(&initial.to_array());
    x0.extend_from_slice(&Distortion::none().to_array());
    for h in &homographies {
        let pose = pose_from_homography(&k, h).ok_or_else(|| {
            CalibrationError::SolverFailed("view homography has no valid pose".to_string())
        })?;
        x0.extend_from_slice(&pose_to_params(&pose));
    }

    let problem = BundleProblem::new(samples, x0);
    let initial_cost = half_squared_norm(&problem.residuals_at(problem.params.as_slice()));
    let (problem, report) = LevenbergMarquardt::new()
        .with_patience(200)
        .minimize(problem);
    let converged = report.termination.was_successful();
    log::debug!(
        "Bundle finished after {} evaluations ({:?}), cost {:.3e} -> {:.3e}",
        report.number_of_evaluations,
        report.termination,
        initial_cost,
        report.objective_function
    );

    let p = problem.params.as_slice();
    let intrinsics = Intrinsics::new(p[0], p[1], p[2], p[3]);
    let distortion = Distortion::from_array([p[4], p[5], p[6], p[7], p[8]]);
    let camera = CameraModel::new(intrinsics, distortion, width, height)
        .map_err(|e| CalibrationError::SolverFailed(e.to_string()))?;

    let mut poses = Vec::with_capacity(samples.len());
    let mut per_view_rms = Vec::with_capacity(samples.len());
    let mut total_sq = 0.0;
    let mut total_points = 0usize;
    for (view, sample) in samples.iter().enumerate() {
        let mut r = vec![0.0; 2 * sample.len()];
        problem.view_residuals(p, view, &mut r);
        let sq: f64 = r.iter().map(|e| e * e).sum();
        per_view_rms.push((sq / sample.len() as f64).sqrt());
        total_sq += sq;
        total_points += sample.len();
        let base = INTRINSIC_PARAMS + POSE_PARAMS * view;
        poses.push(params_to_pose(&p[base..base + POSE_PARAMS]));
    }
    let rms = (total_sq / total_points.max(1) as f64).sqrt();
    if !rms.is_finite() {
        return Err(CalibrationError::SolverFailed(
            "reprojection error is not finite".to_string(),
        ));
    }

    Ok(IntrinsicsSolution {
        camera,
        rms,
        per_view_rms,
        poses,
        evaluations: report.number_of_evaluations,
        converged,
    })
}

/// Normal of the pattern plane in camera coordinates.
pub(crate) fn plane_normal(pose: &Isometry3<f64>) -> Vector3<f64> {
    pose.rotation * Vector3::z()
}

/// Quick pose estimate for one sample given approximate intrinsics.
pub(crate) fn approximate_pose(
    sample: &CalibrationSample,
    intrinsics: &Intrinsics,
) -> Option<Isometry3<f64>> {
    let h = estimate_dlt(&sample.plane_points(), sample.image_points())?;
    pose_from_homography(&intrinsics.matrix(), &h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Translation3, UnitQuaternion};

    fn grid() -> Vec<Point3<f64>> {
        (0..8)
            .flat_map(|i| (0..6).map(move |j| Point3::new(i as f64 * 30.0, j as f64 * 30.0, 0.0)))
            .collect()
    }

    fn views() -> Vec<Isometry3<f64>> {
        let angles = [
            (0.0, 0.0, 0.0),
            (0.35, 0.0, 0.1),
            (-0.3, 0.1, -0.05),
            (0.0, 0.35, 0.2),
            (0.1, -0.35, 0.0),
            (0.25, 0.25, -0.2),
            (-0.25, -0.2, 0.3),
            (0.2, -0.2, 0.0),
        ];
        angles
            .iter()
            .enumerate()
            .map(|(i, &(rx, ry, rz))| {
                let rotation = UnitQuaternion::from_euler_angles(rx, ry, rz);
                let center = rotation * Vector3::new(105.0, 75.0, 0.0);
                let offset = Vector3::new(
                    (i as f64 - 3.5) * 40.0,
                    ((i % 3) as f64 - 1.0) * 60.0,
                    420.0 + i as f64 * 15.0,
                );
                Isometry3::from_parts(Translation3::from(offset - center), rotation)
            })
            .collect()
    }

    fn synthetic_samples(camera: &CameraModel) -> Vec<CalibrationSample> {
        let object = grid();
        views()
            .iter()
            .map(|pose| {
                let image: Vec<Pixel> = object
                    .iter()
                    .map(|p| camera.project(&pose.transform_point(p)).unwrap())
                    .collect();
                CalibrationSample::new(object.clone(), image).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_zhang_recovers_pinhole() {
        let truth = CameraModel::new(
            Intrinsics::new(900.0, 880.0, 650.0, 350.0),
            Distortion::none(),
            1280,
            720,
        )
        .unwrap();
        let hs: Vec<_> = synthetic_samples(&truth)
            .iter()
            .map(|s| estimate_dlt(&s.plane_points(), s.image_points()).unwrap())
            .collect();
        let k = zhang_intrinsics(&hs, 1280, 720).unwrap();
        assert_relative_eq!(k.fx, 900.0, max_relative = 1e-6);
        assert_relative_eq!(k.fy, 880.0, max_relative = 1e-6);
        assert_relative_eq!(k.cx, 650.0, epsilon = 1e-3);
        assert_relative_eq!(k.cy, 350.0, epsilon = 1e-3);
    }

    #[test]
    fn test_bundle_recovers_distortion() {
        let truth = CameraModel::new(
            Intrinsics::new(900.0, 880.0, 650.0, 350.0),
            Distortion::from_array([-0.12, 0.05, 0.001, -0.0005, 0.0]),
            1280,
            720,
        )
        .unwrap();
        let samples = synthetic_samples(&truth);
        let solution = calibrate_planar(&samples, 1280, 720).unwrap();
        assert!(solution.rms < 1e-3, "rms {}", solution.rms);
        let k = solution.camera.intrinsics();
        assert_relative_eq!(k.fx, 900.0, max_relative = 1e-3);
        assert_relative_eq!(k.fy, 880.0, max_relative = 1e-3);
        assert_relative_eq!(k.cx, 650.0, epsilon = 0.5);
        assert_relative_eq!(k.cy, 350.0, epsilon = 0.5);
        assert_eq!(solution.poses.len(), samples.len());
        assert!(solution.camera.extrinsics().is_none());
    }

    #[test]
    fn test_bundle_recovers_strong_barrel_lens() {
        let truth = CameraModel::new(
            Intrinsics::new(1100.0, 1092.0, 636.0, 355.0),
            Distortion::from_array([-0.2, 0.04, 0.0, 0.0, 0.0]),
            1280,
            720,
        )
        .unwrap();
        let solution = calibrate_planar(&synthetic_samples(&truth), 1280, 720).unwrap();
        assert!(solution.evaluations > 0);
        assert!(solution.rms < 1e-3, "rms {}", solution.rms);
        let k = solution.camera.intrinsics();
        assert_relative_eq!(k.fx, 1100.0, max_relative = 1e-3);
        assert_relative_eq!(k.fy, 1092.0, max_relative = 1e-3);
        assert_relative_eq!(k.cx, 636.0, epsilon = 0.5);
        assert_relative_eq!(k.cy, 355.0, epsilon = 0.5);
        assert_relative_eq!(solution.camera.distortion().k1, -0.2, epsilon = 0.01);
    }

    #[test]
    fn test_too_few_views() {
        let truth = CameraModel::new(Intrinsics::new(900.0, 900.0, 640.0, 360.0), Distortion::none(), 1280, 720).unwrap();
        let samples = synthetic_samples(&truth);
        assert!(matches!(
            calibrate_planar(&samples[..1], 1280, 720),
            Err(CalibrationError::InsufficientSamples { accepted: 1, .. })
        ));
    }
}
