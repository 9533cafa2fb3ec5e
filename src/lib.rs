//! Tabletop Camera/Projector Tracker
//!
//! Calibration and piece tracking for projected tabletop overlays:
//! - Camera intrinsics from a planar marker board
//! - Table-to-projector homography measured through the camera
//! - Fiducial marker detection with sub-pixel corners
//! - A real-time loop turning marker poses into projector overlay commands

pub mod app;
pub mod calibration;
pub mod camera;
pub mod config;
pub mod detection;
pub mod error;
pub mod export;
pub mod geometry;
pub mod render;
pub mod store;
pub mod table;
pub mod tracking;

#[cfg(test)]
pub(crate) mod test_utils;

pub use app::{CalibrationStatus, FrameFeedback, SessionKind, SessionOutcome, SessionStatus, TrackerApp};
pub use error::{Result, TrackerError};
