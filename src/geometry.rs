//! Shared geometric types and small helpers.

use nalgebra::{Matrix3, Point2, Vector3};

/// A pixel position (sub-pixel precision) in a camera or projector raster.
pub type Pixel = Point2<f64>;

/// Apply a 3x3 projective transform to a 2D point.
///
/// Returns `None` when the point maps to infinity.
pub fn transform_point(matrix: &Matrix3<f64>, p: &Point2<f64>) -> Option<Point2<f64>> {
    let v = matrix * Vector3::new(p.x, p.y, 1.0);
    if v.z.abs() < 1e-12 {
        return None;
    }
    Some(Point2::new(v.x / v.z, v.y / v.z))
}

/// Hartley normalization: translate the centroid to the origin and scale so
/// the mean distance to the origin is sqrt(2).
pub fn normalization_transform(points: &[Point2<f64>]) -> Matrix3<f64> {
    if points.is_empty() {
        return Matrix3::identity();
    }
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.y).sum::<f64>() / n;
    let mean_dist = points
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let scale = if mean_dist > 1e-12 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    Matrix3::new(scale, 0.0, -scale * cx, 0.0, scale, -scale * cy, 0.0, 0.0, 1.0)
}

/// Twice the signed area of the triangle (a, b, c).
pub fn cross2(a: &Point2<f64>, b: &Point2<f64>, c: &Point2<f64>) -> f64 {
    (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)
}

/// Signed area of a polygon (positive when clockwise in a y-down raster).
pub fn signed_area(points: &[Point2<f64>]) -> f64 {
    let n = points.len();
    if n < 3 {
        return 0.0;
    }
    let mut acc = 0.0;
    for i in 0..n {
        let a = &points[i];
        let b = &points[(i + 1) % n];
        acc += a.x * b.y - b.x * a.y;
    }
    acc * 0.5
}

/// Whether a quadrilateral is strictly convex.
pub fn is_convex_quad(q: &[Point2<f64>; 4]) -> bool {
    let mut sign = 0.0f64;
    for i in 0..4 {
        let c = cross2(&q[i], &q[(i + 1) % 4], &q[(i + 2) % 4]);
        if c.abs() < 1e-9 {
            return false;
        }
        if sign == 0.0 {
            sign = c.signum();
        } else if c.signum() != sign {
            return false;
        }
    }
    true
}

/// Intersection of the diagonals of a quadrilateral (the projective centre).
pub fn diagonal_intersection(q: &[Point2<f64>; 4]) -> Option<Point2<f64>> {
    let p = q[0];
    let r = q[2] - q[0];
    let s = q[3] - q[1];
    let denom = r.x * s.y - r.y * s.x;
    if denom.abs() < 1e-12 {
        return None;
    }
    let qp = q[1] - p;
    let t = (qp.x * s.y - qp.y * s.x) / denom;
    Some(p + r * t)
}

/// Whether any triple of points spans a triangle with non-trivial area
/// relative to the spread of the set.
pub fn has_non_collinear_triple(points: &[Point2<f64>]) -> bool {
    if points.len() < 3 {
        return false;
    }
    let spread = points
        .iter()
        .flat_map(|a| points.iter().map(move |b| (a - b).norm()))
        .fold(0.0f64, f64::max);
    if spread <= 1e-9 {
        return false;
    }
    let a = points[0];
    let far = points
        .iter()
        .copied()
        .max_by(|p, q| (p - a).norm().total_cmp(&(q - a).norm()))
        .unwrap_or(a);
    points
        .iter()
        .any(|c| cross2(&a, &far, c).abs() > 1e-3 * spread * spread)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_point_identity() {
        let p = transform_point(&Matrix3::identity(), &Point2::new(100.0, 200.0)).unwrap();
        assert!((p.x - 100.0).abs() < 1e-12);
        assert!((p.y - 200.0).abs() < 1e-12);
    }

    #[test]
    fn test_normalization_centers_points() {
        let pts = vec![
            Point2::new(0.0, 0.0),
            Point2::new(900.0, 0.0),
            Point2::new(900.0, 600.0),
            Point2::new(0.0, 600.0),
        ];
        let t = normalization_transform(&pts);
        let mapped: Vec<_> = pts.iter().filter_map(|p| transform_point(&t, p)).collect();
        let cx: f64 = mapped.iter().map(|p| p.x).sum::<f64>() / 4.0;
        let mean: f64 = mapped.iter().map(|p| p.coords.norm()).sum::<f64>() / 4.0;
        assert!(cx.abs() < 1e-9);
        assert!((mean - std::f64::consts::SQRT_2).abs() < 1e-9);
    }

    #[test]
    fn test_collinear_detection() {
        let line: Vec<_> = (0..5).map(|i| Point2::new(i as f64, 2.0 * i as f64)).collect();
        assert!(!has_non_collinear_triple(&line));
        let mut bent = line.clone();
        bent.push(Point2::new(0.0, 10.0));
        assert!(has_non_collinear_triple(&bent));
    }

    #[test]
    fn test_quad_helpers() {
        let q = [
            Point2::new(0.0, 0.0),
            Point2::new(10.0, 0.0),
            Point2::new(10.0, 10.0),
            Point2::new(0.0, 10.0),
        ];
        assert!(is_convex_quad(&q));
        assert!(signed_area(&q) > 0.0);
        let c = diagonal_intersection(&q).unwrap();
        assert!((c.x - 5.0).abs() < 1e-12 && (c.y - 5.0).abs() < 1e-12);
    }
}
