//! Homography estimation.
//!
//! Computes the table-to-projector homography from measured correspondences
//! using normalized DLT inside RANSAC for robust outlier rejection, followed by
//! Levenberg-Marquardt refinement on the inliers.

use super::jacobian::{half_squared_norm, numeric_jacobian};
use crate::error::CalibrationError;
use crate::geometry::{has_non_collinear_triple, normalization_transform, transform_point, Pixel};
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::storage::Owned;
use nalgebra::{DMatrix, DVector, Dyn, Matrix3, Point2};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Smallest acceptable ratio of singular values of the normalized matrix.
const MIN_CONDITION: f64 = 1e-6;

/// An invertible 3x3 projective transform between two planes.
#[derive(Debug, Clone, Copy)]
pub struct Homography {
    matrix: Matrix3<f64>,
    inverse: Matrix3<f64>,
}

impl PartialEq for Homography {
    fn eq(&self, other: &Self) -> bool {
        self.matrix == other.matrix
    }
}

impl Homography {
    /// Wrap a matrix, rejecting singular or non-finite ones.
    pub fn new(matrix: Matrix3<f64>) -> Result<Self, CalibrationError> {
        if matrix.iter().any(|v| !v.is_finite()) {
            return Err(CalibrationError::DegenerateHomography);
        }
        let norm = matrix.norm();
        if norm < 1e-300 {
            return Err(CalibrationError::DegenerateHomography);
        }
        // det scales with the cube of the matrix scale.
        if (matrix.determinant() / norm.powi(3)).abs() < 1e-12 {
            return Err(CalibrationError::DegenerateHomography);
        }
        let inverse = matrix
            .try_inverse()
            .ok_or(CalibrationError::DegenerateHomography)?;
        if inverse.iter().any(|v| !v.is_finite()) {
            return Err(CalibrationError::DegenerateHomography);
        }
        Ok(Self { matrix, inverse })
    }

    pub fn identity() -> Self {
        Self {
            matrix: Matrix3::identity(),
            inverse: Matrix3::identity(),
        }
    }

    /// Build from 9 row-major coefficients.
    pub fn from_row_major(values: [f64; 9]) -> Result<Self, CalibrationError> {
        Self::new(Matrix3::from_row_slice(&values))
    }

    /// The 9 coefficients, row-major.
    pub fn to_row_major(&self) -> [f64; 9] {
        let m = &self.matrix;
        [
            m[(0, 0)],
            m[(0, 1)],
            m[(0, 2)],
            m[(1, 0)],
            m[(1, 1)],
            m[(1, 2)],
            m[(2, 0)],
            m[(2, 1)],
            m[(2, 2)],
        ]
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.matrix
    }

    pub fn inverse_matrix(&self) -> &Matrix3<f64> {
        &self.inverse
    }

    /// The inverse mapping as a homography of its own.
    pub fn inverse(&self) -> Homography {
        Homography {
            matrix: self.inverse,
            inverse: self.matrix,
        }
    }

    /// Map a source-plane point. `None` if it maps to infinity.
    pub fn apply(&self, p: &Point2<f64>) -> Option<Point2<f64>> {
        transform_point(&self.matrix, p)
    }

    /// Map a target-plane point back to the source plane.
    pub fn apply_inverse(&self, p: &Point2<f64>) -> Option<Point2<f64>> {
        transform_point(&self.inverse, p)
    }

    /// Ratio of smallest to largest singular value after Hartley
    /// normalization of both planes by the given point sets.
    pub fn condition(&self, source: &[Point2<f64>], target: &[Point2<f64>]) -> f64 {
        let t_src = normalization_transform(source);
        let t_dst = normalization_transform(target);
        let Some(t_src_inv) = t_src.try_inverse() else {
            return 0.0;
        };
        singular_ratio(&(t_dst * self.matrix * t_src_inv))
    }
}

fn singular_ratio(m: &Matrix3<f64>) -> f64 {
    let sv = m.singular_values();
    let max = sv.max();
    if max <= 0.0 || !max.is_finite() {
        return 0.0;
    }
    sv.min() / max
}

/// A table-space point and the projector pixel it maps to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    /// Table-plane position (mm).
    pub table: Point2<f64>,
    /// Projector raster position (px).
    pub projector: Pixel,
}

impl Correspondence {
    pub fn new(table: Point2<f64>, projector: Pixel) -> Self {
        Self { table, projector }
    }
}

/// Normalized direct linear transform from `source` to `target`.
///
/// Returns `None` for fewer than 4 pairs or a numerically singular system.
pub fn estimate_dlt(source: &[Point2<f64>], target: &[Point2<f64>]) -> Option<Matrix3<f64>> {
    let n = source.len();
    if n < 4 || target.len() != n {
        return None;
    }
    let t_src = normalization_transform(source);
    let t_dst = normalization_transform(target);

    // At least 9 rows so the SVD yields a full 9x9 V^T.
    let rows = (2 * n).max(9);
    let mut a = DMatrix::<f64>::zeros(rows, 9);
    for (i, (s, d)) in source.iter().zip(target).enumerate() {
        let s = transform_point(&t_src, s)?;
        let d = transform_point(&t_dst, d)?;
        let (x, y, u, v) = (s.x, s.y, d.x, d.y);
        let r = 2 * i;
        a.row_mut(r)
            .copy_from_slice(&[-x, -y, -1.0, 0.0, 0.0, 0.0, u * x, u * y, u]);
        a.row_mut(r + 1)
            .copy_from_slice(&[0.0, 0.0, 0.0, -x, -y, -1.0, v * x, v * y, v]);
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let (min_idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let h = v_t.row(min_idx);
    let hn = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    let t_dst_inv = t_dst.try_inverse()?;
    let mut m = t_dst_inv * hn * t_src;
    let scale = if m[(2, 2)].abs() > 1e-12 { m[(2, 2)] } else { m.norm() };
    if scale.abs() < 1e-300 {
        return None;
    }
    m /= scale;
    if m.iter().all(|v| v.is_finite()) {
        Some(m)
    } else {
        None
    }
}

/// Forward reprojection error of one pair under `m`.
fn transfer_error(m: &Matrix3<f64>, source: &Point2<f64>, target: &Point2<f64>) -> f64 {
    match transform_point(m, source) {
        Some(p) => (p - target).norm(),
        None => f64::INFINITY,
    }
}

/// Refinement of a homography in normalized coordinates with `h33 = 1`.
struct TransferProblem<'a> {
    source: &'a [Point2<f64>],
    target: &'a [Point2<f64>],
    t_src: Matrix3<f64>,
    t_dst_inv: Matrix3<f64>,
    params: DVector<f64>,
}

impl TransferProblem<'_> {
    fn denormalize(&self, params: &[f64]) -> Matrix3<f64> {
        let hn = Matrix3::new(
            params[0], params[1], params[2], params[3], params[4], params[5], params[6],
            params[7], 1.0,
        );
        self.t_dst_inv * hn * self.t_src
    }

    fn residuals_at(&self, params: &[f64]) -> DVector<f64> {
        let m = self.denormalize(params);
        let mut r = DVector::zeros(self.source.len() * 2);
        for (i, (s, t)) in self.source.iter().zip(self.target).enumerate() {
            match transform_point(&m, s) {
                Some(p) => {
                    r[2 * i] = p.x - t.x;
                    r[2 * i + 1] = p.y - t.y;
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

impl LeastSquaresProblem<f64, Dyn, Dyn> for TransferProblem<'_> {
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

/// Minimize the forward transfer error of `initial` over the given pairs.
pub fn refine_homography(
    initial: &Matrix3<f64>,
    source: &[Point2<f64>],
    target: &[Point2<f64>],
) -> Matrix3<f64> {
    let t_src = normalization_transform(source);
    let t_dst = normalization_transform(target);
    let (Some(t_src_inv), Some(t_dst_inv)) = (t_src.try_inverse(), t_dst.try_inverse()) else {
        return *initial;
    };
    let mut hn = t_dst * initial * t_src_inv;
    if hn[(2, 2)].abs() < 1e-3 * hn.norm() {
        return *initial;
    }
    hn /= hn[(2, 2)];

    let x0 = DVector::from_vec(vec![
        hn[(0, 0)],
        hn[(0, 1)],
        hn[(0, 2)],
        hn[(1, 0)],
        hn[(1, 1)],
        hn[(1, 2)],
        hn[(2, 0)],
        hn[(2, 1)],
    ]);
    let problem = TransferProblem {
        source,
        target,
        t_src,
        t_dst_inv,
        params: x0,
    };
    let initial_cost = half_squared_norm(&problem.residuals_at(problem.params.as_slice()));
    let (problem, _) = LevenbergMarquardt::new()
        .with_patience(50)
        .minimize(problem);
    let final_cost = half_squared_norm(&problem.residuals_at(problem.params.as_slice()));
    if final_cost.is_finite() && final_cost <= initial_cost {
        let mut m = problem.denormalize(problem.params.as_slice());
        if m[(2, 2)].abs() > 1e-12 {
            m /= m[(2, 2)];
        }
        m
    } else {
        *initial
    }
}

/// Result of homography computation.
#[derive(Debug, Clone)]
pub struct HomographyResult {
    pub homography: Homography,
    /// Per-correspondence inlier flags, in input order.
    pub inliers: Vec<bool>,
    /// Number of inlier points.
    pub inlier_count: usize,
    /// Ratio of inliers to total points.
    pub inlier_ratio: f32,
    /// Mean reprojection error over inliers in pixels.
    pub reprojection_error: f64,
    /// Singular value ratio of the normalized matrix.
    pub condition: f64,
}

/// Robust homography estimator.
#[derive(Debug, Clone)]
pub struct HomographyComputer {
    /// RANSAC reprojection threshold in pixels.
    pub ransac_threshold: f64,
    /// Maximum RANSAC iterations.
    pub max_iters: usize,
    /// Confidence level for RANSAC.
    pub confidence: f64,
    /// Minimum points required for homography.
    pub min_points: usize,
    /// Seed for the RANSAC sampler.
    pub seed: u64,
}

impl Default for HomographyComputer {
    fn default() -> Self {
        Self {
            ransac_threshold: 3.0,
            max_iters: 2000,
            confidence: 0.995,
            min_points: 4,
            seed: 0x7ab1e,
        }
    }
}

impl HomographyComputer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_threshold(mut self, ransac_threshold: f64) -> Self {
        self.ransac_threshold = ransac_threshold;
        self
    }

    /// Compute the table-to-projector homography.
    pub fn compute(
        &self,
        correspondences: &[Correspondence],
    ) -> Result<HomographyResult, CalibrationError> {
        let source: Vec<_> = correspondences.iter().map(|c| c.table).collect();
        let target: Vec<_> = correspondences.iter().map(|c| c.projector).collect();
        self.compute_points(&source, &target)
    }

    /// Compute a homography mapping `source` onto `target`.
    pub fn compute_points(
        &self,
        source: &[Point2<f64>],
        target: &[Point2<f64>],
    ) -> Result<HomographyResult, CalibrationError> {
        let n = source.len().min(target.len());
        let required = self.min_points.max(4);
        if n < required {
            return Err(CalibrationError::InsufficientCorrespondences {
                inliers: n,
                required,
            });
        }
        if !has_non_collinear_triple(&source[..n]) || !has_non_collinear_triple(&target[..n]) {
            return Err(CalibrationError::DegenerateHomography);
        }

        log::info!("Computing homography from {} point pairs", n);

        let initial = if n == 4 {
            estimate_dlt(&source[..n], &target[..n]).ok_or(CalibrationError::DegenerateHomography)?
        } else {
            self.ransac(&source[..n], &target[..n])?
        };

        let mut inliers = self.classify(&initial, &source[..n], &target[..n]);
        let mut matrix = initial;

        if n > 4 {
            let (src_in, dst_in) = select(&source[..n], &target[..n], &inliers);
            if src_in.len() >= 4 {
                if let Some(refit) = estimate_dlt(&src_in, &dst_in) {
                    matrix = refine_homography(&refit, &src_in, &dst_in);
                    inliers = self.classify(&matrix, &source[..n], &target[..n]);
                }
            }
        }

        let inlier_count = inliers.iter().filter(|&&b| b).count();
        if inlier_count < required {
            return Err(CalibrationError::InsufficientCorrespondences {
                inliers: inlier_count,
                required,
            });
        }

        let (src_in, dst_in) = select(&source[..n], &target[..n], &inliers);
        if !has_non_collinear_triple(&src_in) {
            return Err(CalibrationError::DegenerateHomography);
        }

        let homography = Homography::new(matrix)?;
        let condition = homography.condition(&src_in, &dst_in);
        if condition < MIN_CONDITION {
            log::warn!("Rejecting badly conditioned homography ({:.3e})", condition);
            return Err(CalibrationError::DegenerateHomography);
        }

        let reprojection_error = src_in
            .iter()
            .zip(&dst_in)
            .map(|(s, d)| transfer_error(&matrix, s, d))
            .sum::<f64>()
            / inlier_count as f64;
        let inlier_ratio = inlier_count as f32 / n as f32;

        log::info!(
            "Homography computed: {} inliers ({:.1}%), error: {:.3}px",
            inlier_count,
            inlier_ratio * 100.0,
            reprojection_error
        );

        Ok(HomographyResult {
            homography,
            inliers,
            inlier_count,
            inlier_ratio,
            reprojection_error,
            condition,
        })
    }

    fn classify(
        &self,
        m: &Matrix3<f64>,
        source: &[Point2<f64>],
        target: &[Point2<f64>],
    ) -> Vec<bool> {
        source
            .iter()
            .zip(target)
            .map(|(s, d)| transfer_error(m, s, d) <= self.ransac_threshold)
            .collect()
    }

    fn ransac(
        &self,
        source: &[Point2<f64>],
        target: &[Point2<f64>],
    ) -> Result<Matrix3<f64>, CalibrationError> {
        let n = source.len();
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut best: Option<(usize, f64, Matrix3<f64>)> = None;
        let mut needed = self.max_iters;
        let mut iter = 0;

        while iter < needed.min(self.max_iters) {
            iter += 1;
            let sample = rand::seq::index::sample(&mut rng, n, 4).into_vec();
            let s: Vec<_> = sample.iter().map(|&i| source[i]).collect();
            let d: Vec<_> = sample.iter().map(|&i| target[i]).collect();
            if !minimal_sample_ok(&s) || !minimal_sample_ok(&d) {
                continue;
            }
            let Some(m) = estimate_dlt(&s, &d) else {
                continue;
            };

            let mut count = 0;
            let mut err_sum = 0.0;
            for (p, q) in source.iter().zip(target) {
                let e = transfer_error(&m, p, q);
                if e <= self.ransac_threshold {
                    count += 1;
                    err_sum += e;
                }
            }

            let better = match &best {
                None => count >= 4,
                Some((c, e, _)) => count > *c || (count == *c && err_sum < *e),
            };
            if better {
                best = Some((count, err_sum, m));
                let w = count as f64 / n as f64;
                let p_fail = 1.0 - w.powi(4);
                if p_fail <= f64::EPSILON {
                    needed = iter;
                } else {
                    let k = (1.0 - self.confidence).ln() / p_fail.ln();
                    if k.is_finite() && k >= 0.0 {
                        needed = (k.ceil() as usize).max(iter);
                    }
                }
            }
        }

        match best {
            Some((count, _, m)) => {
                log::debug!("RANSAC: {} iterations, best consensus {} / {}", iter, count, n);
                Ok(m)
            }
            None => Err(CalibrationError::InsufficientCorrespondences {
                inliers: 0,
                required: self.min_points.max(4),
            }),
        }
    }
}

/// No three of the four sample points collinear.
fn minimal_sample_ok(points: &[Point2<f64>]) -> bool {
    let spread = points
        .iter()
        .flat_map(|a| points.iter().map(move |b| (a - b).norm()))
        .fold(0.0f64, f64::max);
    if spread <= 1e-9 {
        return false;
    }
    let tol = 1e-3 * spread * spread;
    for i in 0..points.len() {
        for j in i + 1..points.len() {
            for k in j + 1..points.len() {
                if crate::geometry::cross2(&points[i], &points[j], &points[k]).abs() <= tol {
                    return false;
                }
            }
        }
    }
    true
}

fn select(
    source: &[Point2<f64>],
    target: &[Point2<f64>],
    mask: &[bool],
) -> (Vec<Point2<f64>>, Vec<Point2<f64>>) {
    source
        .iter()
        .zip(target)
        .zip(mask)
        .filter(|(_, &keep)| keep)
        .map(|((s, t), _)| (*s, *t))
        .unzip()
}
