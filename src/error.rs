//! Error taxonomy for calibration, detection, tracking and persistence.

use std::path::PathBuf;
use thiserror::Error;

/// Invalid setup: bad table dimensions, uninitialized models, missing devices.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("invalid table dimensions: {width} x {height} mm (both must be positive)")]
    InvalidDimensions { width: f64, height: f64 },
    #[error("invalid camera model: {0}")]
    InvalidModel(String),
    #[error("camera pose relative to the table is unknown")]
    MissingTablePose,
    #[error("no camera device available")]
    MissingDevice,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Failures of the camera and projector calibration procedures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("insufficient calibration samples: {accepted} accepted, {required} required (or pose diversity not met)")]
    InsufficientSamples { accepted: usize, required: usize },
    #[error("RMS reprojection error {rms:.3}px exceeds threshold {threshold:.3}px")]
    HighReprojectionError { rms: f64, threshold: f64 },
    #[error("homography is degenerate or badly conditioned")]
    DegenerateHomography,
    #[error("insufficient correspondences: {inliers} inliers, {required} required")]
    InsufficientCorrespondences { inliers: usize, required: usize },
    #[error("mean residual {mean:.3}px did not reach tolerance {tolerance:.3}px")]
    ResidualTooHigh { mean: f64, tolerance: f64 },
    #[error("solver failed: {0}")]
    SolverFailed(String),
    #[error("operation not allowed in calibration state {0}")]
    InvalidState(String),
}

/// Per-candidate marker decoding failures. Never fatal for a frame.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DetectionError {
    #[error("malformed marker payload: {0}")]
    MalformedPayload(&'static str),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

/// Device and tracking-loop failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("frame capture timed out")]
    CaptureTimeout,
    #[error("frame capture failed: {0}")]
    CaptureFailed(String),
    #[error("camera device is held by another session")]
    DeviceBusy,
    #[error("camera device lost after {consecutive_failures} consecutive capture failures")]
    DeviceLost { consecutive_failures: u32 },
    #[error("tracking requires a complete calibration (camera model, homography, table frame)")]
    CalibrationMissing,
    #[error("tracking loop is already running")]
    AlreadyRunning,
    #[error("tracking loop is not running")]
    NotRunning,
}

/// Persistence failures for calibration bundles.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("calibration bundle not found at {0}")]
    NotFound(PathBuf),
    #[error("corrupt calibration bundle: {0}")]
    CorruptBundle(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Crate-level error.
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    Detection(#[from] DetectionError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

pub type Result<T> = std::result::Result<T, TrackerError>;
