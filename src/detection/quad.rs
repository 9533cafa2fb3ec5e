//! Quadrilateral extraction from dark components.

use super::components::Component;
use crate::geometry::{cross2, is_convex_quad, signed_area};
use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Options for fitting quads to components.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitQuadConfig {
    /// Shortest acceptable side in pixels.
    pub min_side: f64,
    /// Fraction of points along each side that must lie on the component
    /// boundary.
    pub min_edge_support: f64,
    /// Smallest interior-angle cosine magnitude allowed (rejects slivers).
    pub max_corner_cos: f64,
}

impl Default for FitQuadConfig {
    fn default() -> Self {
        Self {
            min_side: 12.0,
            min_edge_support: 0.8,
            max_corner_cos: 0.85,
        }
    }
}

/// A marker candidate: four corners, clockwise in image coordinates
/// (y down).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quad {
    pub corners: [Point2<f64>; 4],
}

impl Quad {
    pub fn area(&self) -> f64 {
        signed_area(&self.corners).abs()
    }

    pub fn min_side(&self) -> f64 {
        (0..4)
            .map(|i| (self.corners[(i + 1) % 4] - self.corners[i]).norm())
            .fold(f64::INFINITY, f64::min)
    }
}

fn farthest_from(points: &[Point2<f64>], from: &Point2<f64>) -> Option<Point2<f64>> {
    points
        .iter()
        .copied()
        .max_by(|a, b| (a - from).norm_squared().total_cmp(&(b - from).norm_squared()))
}

/// Fit a quad to a component's outline using extreme points: the point
/// farthest from the centroid, the point farthest from that, and the points
/// farthest from the resulting diagonal on either side.
pub fn fit_quad(component: &Component, config: &FitQuadConfig) -> Option<Quad> {
    let points = &component.boundary;
    if points.len() < 8 {
        return None;
    }
    let n = points.len() as f64;
    let centroid = Point2::new(
        points.iter().map(|p| p.x).sum::<f64>() / n,
        points.iter().map(|p| p.y).sum::<f64>() / n,
    );

    let a = farthest_from(points, &centroid)?;
    let b = farthest_from(points, &a)?;
    let (mut left, mut right) = (None::<(f64, Point2<f64>)>, None::<(f64, Point2<f64>)>);
    for p in points {
        let d = cross2(&a, &b, p);
        if d > 0.0 && left.map_or(true, |(best, _)| d > best) {
            left = Some((d, *p));
        } else if d < 0.0 && right.map_or(true, |(best, _)| -d > best) {
            right = Some((-d, *p));
        }
    }
    let (_, c) = left?;
    let (_, d) = right?;

    // a and b are opposite corners; c and d lie on either side of ab.
    let mut corners = [a, c, b, d];
    if signed_area(&corners) < 0.0 {
        corners = [a, d, b, c];
    }
    let quad = Quad { corners };

    if !is_convex_quad(&quad.corners) || quad.min_side() < config.min_side {
        return None;
    }
    if !corner_angles_ok(&quad, config.max_corner_cos) {
        return None;
    }
    if !edges_supported(&quad, points, config.min_edge_support) {
        return None;
    }
    Some(quad)
}

fn corner_angles_ok(quad: &Quad, max_cos: f64) -> bool {
    (0..4).all(|i| {
        let prev = quad.corners[(i + 3) % 4] - quad.corners[i];
        let next = quad.corners[(i + 1) % 4] - quad.corners[i];
        let cos = prev.dot(&next) / (prev.norm() * next.norm());
        cos.abs() <= max_cos
    })
}

/// Check that the straight sides of the quad follow the component outline.
fn edges_supported(quad: &Quad, boundary: &[Point2<f64>], min_support: f64) -> bool {
    let pixels: HashSet<(i64, i64)> = boundary
        .iter()
        .map(|p| (p.x.round() as i64, p.y.round() as i64))
        .collect();
    let near = |p: Point2<f64>| {
        let (x, y) = (p.x.round() as i64, p.y.round() as i64);
        (-1..=1).any(|dy| (-1..=1).any(|dx| pixels.contains(&(x + dx, y + dy))))
    };

    (0..4).all(|i| {
        let start = quad.corners[i];
        let end = quad.corners[(i + 1) % 4];
        let samples = 16;
        let hits = (1..samples)
            .filter(|&k| {
                let t = k as f64 / samples as f64;
                near(start + (end - start) * t)
            })
            .count();
        hits as f64 / (samples - 1) as f64 >= min_support
    })
}
