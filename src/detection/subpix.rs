//! Iterative sub-pixel corner refinement.
//!
//! For a true corner `q`, the image gradient at every nearby point `p` is
//! orthogonal to `p - q`. Each iteration solves the weighted least-squares
//! system `sum(g g^T) q = sum(g g^T p)` over a window around the current
//! estimate.

use crate::camera::sample_bilinear;
use image::GrayImage;
use nalgebra::{Matrix2, Point2, Vector2};
use serde::{Deserialize, Serialize};

/// Termination criteria for corner refinement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubPixConfig {
    pub max_iterations: usize,
    /// Stop when the corner moves less than this many pixels.
    pub epsilon: f64,
}

impl Default for SubPixConfig {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            epsilon: 0.001,
        }
    }
}

/// Outcome of refining one corner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefinedCorner {
    pub position: Point2<f64>,
    pub converged: bool,
    pub iterations: usize,
}

/// Refine `initial` within a square window of half-size `half_window`.
///
/// If the estimate leaves the window or the system is singular, the initial
/// position is returned unconverged.
pub fn refine_corner(
    image: &GrayImage,
    initial: Point2<f64>,
    half_window: u32,
    config: &SubPixConfig,
) -> RefinedCorner {
    let hw = half_window.max(1) as i32;
    let sigma = hw as f64 * 0.5 + 0.5;
    let mut q = initial;

    for iteration in 1..=config.max_iterations {
        let mut a = Matrix2::<f64>::zeros();
        let mut b = Vector2::<f64>::zeros();

        for dy in -hw..=hw {
            for dx in -hw..=hw {
                let p = Point2::new(q.x + dx as f64, q.y + dy as f64);
                let gx = 0.5 * (sample_bilinear(image, p.x + 1.0, p.y) - sample_bilinear(image, p.x - 1.0, p.y));
                let gy = 0.5 * (sample_bilinear(image, p.x, p.y + 1.0) - sample_bilinear(image, p.x, p.y - 1.0));
                let w = (-((dx * dx + dy * dy) as f64) / (2.0 * sigma * sigma)).exp();
                let gxx = w * gx * gx;
                let gxy = w * gx * gy;
                let gyy = w * gy * gy;
                a[(0, 0)] += gxx;
                a[(0, 1)] += gxy;
                a[(1, 0)] += gxy;
                a[(1, 1)] += gyy;
                b.x += gxx * p.x + gxy * p.y;
                b.y += gxy * p.x + gyy * p.y;
            }
        }

        // A corner needs gradients in two independent directions.
        let det = a.determinant();
        let trace = a.trace();
        if trace <= 0.0 || det <= 1e-6 * trace * trace {
            break;
        }
        let Some(inv) = a.try_inverse() else {
            break;
        };
        let next = Point2::from(inv * b);
        let shift = (next - q).norm();
        q = next;

        if (q - initial).norm() > hw as f64 {
            break;
        }
        if shift < config.epsilon {
            return RefinedCorner {
                position: q,
                converged: true,
                iterations: iteration,
            };
        }
    }

    RefinedCorner {
        position: initial,
        converged: false,
        iterations: config.max_iterations,
    }
}
