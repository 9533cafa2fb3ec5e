//! Real-time marker tracking.
//!
//! [`TrackingLoop`] owns the camera while it runs and turns every frame into
//! a batch of projector overlay commands. [`MarkerTracker`] supplies the
//! cross-frame identity continuity the detector deliberately does not.

mod tracker;
mod tracking_loop;

pub use tracker::{nearest, MarkerTracker, Observation, TrackedMarker, TrackerUpdate};
pub use tracking_loop::{TrackingConfig, TrackingLoop, TrackingStats};
