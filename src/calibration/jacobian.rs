//! Finite-difference Jacobians for the calibration least-squares problems.

use nalgebra::{DMatrix, DVector};

/// Step for a parameter of magnitude `value`.
pub(crate) fn step_size(value: f64) -> f64 {
    1e-6 * value.abs().max(1.0)
}

/// Central-difference Jacobian of `f` at `x`.
pub(crate) fn numeric_jacobian<F>(f: F, x: &DVector<f64>) -> DMatrix<f64>
where
    F: Fn(&[f64]) -> DVector<f64>,
{
    let r0 = f(x.as_slice());
    let mut jac = DMatrix::<f64>::zeros(r0.len(), x.len());
    let mut shifted = x.clone();
    for j in 0..x.len() {
        let h = step_size(x[j]);
        shifted[j] = x[j] + h;
        let plus = f(shifted.as_slice());
        shifted[j] = x[j] - h;
        let minus = f(shifted.as_slice());
        shifted[j] = x[j];
        jac.column_mut(j).copy_from(&((plus - minus) / (2.0 * h)));
    }
    jac
}

/// `0.5 * |r|^2`, the objective the solver reports.
pub(crate) fn half_squared_norm(r: &DVector<f64>) -> f64 {
    0.5 * r.norm_squared()
}
