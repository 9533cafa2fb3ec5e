//! Cross-frame marker bookkeeping for the tracking loop.

use crate::detection::MarkerPose;
use crate::geometry::Pixel;
use nalgebra::Point2;
use std::collections::BTreeMap;

/// Last published state of one marker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackedMarker {
    pub id: u16,
    pub pose: MarkerPose,
    /// Marker centre in projector pixels.
    pub projector_px: Pixel,
    /// Overlay radius in projector pixels.
    pub radius_px: f64,
    pub last_seen_cycle: u64,
}

/// One marker as observed in the current cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub id: u16,
    pub pose: MarkerPose,
    pub projector_px: Pixel,
    pub radius_px: f64,
}

/// What changed in one cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackerUpdate {
    /// Markers present this cycle, in id order.
    pub present: Vec<TrackedMarker>,
    /// Markers that disappeared this cycle.
    pub removed: Vec<u16>,
}

/// Holds each marker's pose steady until it moves by more than the
/// hysteresis distance (Manhattan, in mm), so overlays do not jitter.
#[derive(Debug, Clone)]
pub struct MarkerTracker {
    hysteresis_mm: f64,
    markers: BTreeMap<u16, TrackedMarker>,
}

fn manhattan(a: &Point2<f64>, b: &Point2<f64>) -> f64 {
    (a.x - b.x).abs() + (a.y - b.y).abs()
}

impl MarkerTracker {
    pub fn new(hysteresis_mm: f64) -> Self {
        Self {
            hysteresis_mm: hysteresis_mm.max(0.0),
            markers: BTreeMap::new(),
        }
    }

    pub fn hysteresis_mm(&self) -> f64 {
        self.hysteresis_mm
    }

    /// Apply one cycle's observations. Markers not observed are dropped.
    pub fn update(&mut self, cycle: u64, observations: &[Observation]) -> TrackerUpdate {
        let mut next = BTreeMap::new();
        for obs in observations {
            let tracked = match self.markers.get(&obs.id) {
                Some(prev) if manhattan(&prev.pose.position, &obs.pose.position) <= self.hysteresis_mm => {
                    TrackedMarker {
                        last_seen_cycle: cycle,
                        ..*prev
                    }
                }
                _ => TrackedMarker {
                    id: obs.id,
                    pose: obs.pose,
                    projector_px: obs.projector_px,
                    radius_px: obs.radius_px,
                    last_seen_cycle: cycle,
                },
            };
            next.insert(obs.id, tracked);
        }

        let removed: Vec<u16> = self
            .markers
            .keys()
            .filter(|id| !next.contains_key(id))
            .copied()
            .collect();
        for id in &removed {
            log::debug!("Marker {} lost", id);
        }
        self.markers = next;

        TrackerUpdate {
            present: self.markers.values().copied().collect(),
            removed,
        }
    }

    pub fn get(&self, id: u16) -> Option<&TrackedMarker> {
        self.markers.get(&id)
    }

    pub fn markers(&self) -> impl Iterator<Item = &TrackedMarker> {
        self.markers.values()
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    /// The tracked marker nearest `position` (table mm) within
    /// `max_distance` Manhattan distance.
    pub fn query(&self, position: &Point2<f64>, max_distance: f64) -> Option<&TrackedMarker> {
        nearest(self.markers.values(), position, max_distance)
    }

    pub fn clear(&mut self) -> Vec<u16> {
        let ids = self.markers.keys().copied().collect();
        self.markers.clear();
        ids
    }
}

/// Nearest marker within a Manhattan radius; ties go to the lower id.
pub fn nearest<'a>(
    markers: impl Iterator<Item = &'a TrackedMarker>,
    position: &Point2<f64>,
    max_distance: f64,
) -> Option<&'a TrackedMarker> {
    markers
        .map(|m| (manhattan(&m.pose.position, position), m))
        .filter(|(d, _)| *d <= max_distance)
        .min_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, m)| m)
}
