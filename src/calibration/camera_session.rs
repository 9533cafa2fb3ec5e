//! Interactive camera calibration session.
//!
//! The operator presents the marker board at varied poses; each submitted
//! frame is either accepted as a sample or rejected with a reason. Once
//! enough diverse samples exist, `solve` runs the bundle adjustment.

use super::intrinsics::{approximate_pose, calibrate_planar, plane_normal};
use super::pattern::{CalibrationSample, MarkerBoard, RejectReason, SampleVerdict};
use crate::camera::{CameraModel, Frame, Intrinsics};
use crate::detection::{DetectorParams, MarkerDetector};
use crate::error::{CalibrationError, ConfigurationError};
use serde::{Deserialize, Serialize};

/// Camera calibration thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraCalibrationConfig {
    pub board: MarkerBoard,
    /// Minimum number of accepted samples before solving.
    pub min_samples: usize,
    /// Maximum acceptable RMS reprojection error in pixels.
    pub max_rms_px: f64,
    /// Minimum angle between the most different board normals, in degrees.
    pub min_normal_spread_deg: f64,
    /// Minimum fraction of the image width and height the samples must span.
    pub min_coverage: f64,
    /// Mean corner displacement below which a sample repeats an earlier one.
    pub duplicate_distance_px: f64,
}

impl Default for CameraCalibrationConfig {
    fn default() -> Self {
        Self {
            board: MarkerBoard::default(),
            min_samples: 8,
            max_rms_px: 0.5,
            min_normal_spread_deg: 10.0,
            min_coverage: 0.25,
            duplicate_distance_px: 4.0,
        }
    }
}

/// State of a camera calibration session.
#[derive(Debug, Clone, PartialEq)]
pub enum CameraCalibrationState {
    /// Waiting to start.
    Idle,
    /// Collecting samples.
    Capturing { accepted: usize },
    /// Running the optimisation.
    Solving,
    /// Terminal: calibrated model and its RMS error.
    Calibrated { model: CameraModel, rms: f64 },
    /// Terminal: why the session failed.
    Failed(CalibrationError),
}

impl CameraCalibrationState {
    pub fn is_idle(&self) -> bool {
        matches!(self, CameraCalibrationState::Idle)
    }

    pub fn is_capturing(&self) -> bool {
        matches!(self, CameraCalibrationState::Capturing { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CameraCalibrationState::Calibrated { .. } | CameraCalibrationState::Failed(_)
        )
    }
}

impl std::fmt::Display for CameraCalibrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CameraCalibrationState::Idle => write!(f, "Idle"),
            CameraCalibrationState::Capturing { accepted } => {
                write!(f, "Capturing ({} samples)", accepted)
            }
            CameraCalibrationState::Solving => write!(f, "Solving"),
            CameraCalibrationState::Calibrated { rms, .. } => {
                write!(f, "Calibrated (RMS {:.3}px)", rms)
            }
            CameraCalibrationState::Failed(err) => write!(f, "Failed: {}", err),
        }
    }
}

/// How varied the accepted samples are.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Diversity {
    pub samples: usize,
    /// Largest angle between two board normals, degrees.
    pub normal_spread_deg: f64,
    /// Fraction of the image width spanned by all observed points.
    pub coverage_x: f64,
    /// Fraction of the image height spanned by all observed points.
    pub coverage_y: f64,
}

/// Drives camera calibration against a [`MarkerBoard`].
pub struct CameraCalibrator {
    config: CameraCalibrationConfig,
    detector: MarkerDetector,
    width: u32,
    height: u32,
    state: CameraCalibrationState,
    samples: Vec<CalibrationSample>,
}

impl CameraCalibrator {
    pub fn new(
        config: CameraCalibrationConfig,
        detector: DetectorParams,
        width: u32,
        height: u32,
    ) -> Result<Self, ConfigurationError> {
        config.board.validate()?;
        if width == 0 || height == 0 {
            return Err(ConfigurationError::InvalidModel(format!(
                "image size {}x{} is empty",
                width, height
            )));
        }
        if config.min_samples < 2 {
            return Err(ConfigurationError::InvalidConfig(
                "camera calibration needs at least two samples".to_string(),
            ));
        }
        Ok(Self {
            config,
            detector: MarkerDetector::new(detector),
            width,
            height,
            state: CameraCalibrationState::Idle,
            samples: Vec::new(),
        })
    }

    pub fn state(&self) -> &CameraCalibrationState {
        &self.state
    }

    pub fn config(&self) -> &CameraCalibrationConfig {
        &self.config
    }

    pub fn accepted_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn required_samples(&self) -> usize {
        self.config.min_samples
    }

    /// The calibrated model, once the session has succeeded.
    pub fn model(&self) -> Option<&CameraModel> {
        match &self.state {
            CameraCalibrationState::Calibrated { model, .. } => Some(model),
            _ => None,
        }
    }

    /// Begin capturing samples.
    pub fn start(&mut self) -> Result<(), CalibrationError> {
        if !self.state.is_idle() {
            return Err(CalibrationError::InvalidState(self.state.to_string()));
        }
        log::info!(
            "Camera calibration started: {}x{} board, {} samples required",
            self.config.board.columns,
            self.config.board.rows,
            self.config.min_samples
        );
        self.state = CameraCalibrationState::Capturing { accepted: 0 };
        Ok(())
    }

    /// Abandon the session. Samples are discarded.
    pub fn cancel(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.fail(CalibrationError::InvalidState("session cancelled".to_string()));
    }

    /// Detect the board in a raw camera frame and try to add it as a sample.
    pub fn submit_frame(&mut self, frame: &Frame) -> Result<SampleVerdict, CalibrationError> {
        self.ensure_capturing()?;
        if frame.width != self.width || frame.height != self.height {
            return Ok(self.reject(RejectReason::InvalidFrame(format!(
                "frame is {}x{}, session expects {}x{}",
                frame.width, frame.height, self.width, self.height
            ))));
        }
        let detections = match self.detector.detect_frame(frame) {
            Ok(d) => d,
            Err(e) => return Ok(self.reject(RejectReason::InvalidFrame(e.to_string()))),
        };
        match self.config.board.sample_from_detections(&detections) {
            Ok(sample) => self.add_sample(sample),
            Err(reason) => Ok(self.reject(reason)),
        }
    }

    /// Add a sample whose correspondences were measured elsewhere.
    pub fn submit_sample(
        &mut self,
        sample: CalibrationSample,
    ) -> Result<SampleVerdict, CalibrationError> {
        self.ensure_capturing()?;
        self.add_sample(sample)
    }

    fn ensure_capturing(&self) -> Result<(), CalibrationError> {
        if self.state.is_capturing() {
            Ok(())
        } else {
            Err(CalibrationError::InvalidState(self.state.to_string()))
        }
    }

    fn reject(&self, reason: RejectReason) -> SampleVerdict {
        log::debug!("Calibration frame rejected: {}", reason);
        SampleVerdict::Rejected(reason)
    }

    fn add_sample(&mut self, sample: CalibrationSample) -> Result<SampleVerdict, CalibrationError> {
        if self.is_duplicate(&sample) {
            return Ok(self.reject(RejectReason::DuplicatePose));
        }
        self.samples.push(sample);
        let accepted = self.samples.len();
        self.state = CameraCalibrationState::Capturing { accepted };
        log::info!(
            "Calibration sample {} accepted ({} required)",
            accepted,
            self.config.min_samples
        );
        Ok(SampleVerdict::Accepted { accepted })
    }

    fn is_duplicate(&self, sample: &CalibrationSample) -> bool {
        self.samples.iter().any(|existing| {
            existing.object_points() == sample.object_points()
                && mean_displacement(existing, sample) < self.config.duplicate_distance_px
        })
    }

    /// Spread of board orientations and image coverage so far.
    pub fn diversity(&self) -> Diversity {
        let f = self.width.max(self.height) as f64;
        let guess = Intrinsics::new(f, f, self.width as f64 * 0.5, self.height as f64 * 0.5);
        let normals: Vec<_> = self
            .samples
            .iter()
            .filter_map(|s| approximate_pose(s, &guess))
            .map(|pose| plane_normal(&pose))
            .collect();
        let mut spread: f64 = 0.0;
        for (i, a) in normals.iter().enumerate() {
            for b in &normals[i + 1..] {
                spread = spread.max(a.angle(b));
            }
        }

        let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
        let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        for sample in &self.samples {
            let (lo, hi) = sample.image_bounds();
            min_x = min_x.min(lo.x);
            min_y = min_y.min(lo.y);
            max_x = max_x.max(hi.x);
            max_y = max_y.max(hi.y);
        }
        let (coverage_x, coverage_y) = if self.samples.is_empty() {
            (0.0, 0.0)
        } else {
            (
                ((max_x - min_x) / self.width as f64).clamp(0.0, 1.0),
                ((max_y - min_y) / self.height as f64).clamp(0.0, 1.0),
            )
        };

        Diversity {
            samples: self.samples.len(),
            normal_spread_deg: spread.to_degrees(),
            coverage_x,
            coverage_y,
        }
    }

    /// Whether `solve` would get past the sample and diversity checks.
    pub fn ready(&self) -> bool {
        let d = self.diversity();
        d.samples >= self.config.min_samples
            && d.normal_spread_deg >= self.config.min_normal_spread_deg
            && d.coverage_x >= self.config.min_coverage
            && d.coverage_y >= self.config.min_coverage
    }

    /// Solve for the camera model. The session ends in `Calibrated` or
    /// `Failed` either way.
    pub fn solve(&mut self) -> Result<CameraModel, CalibrationError> {
        self.ensure_capturing()?;
        let accepted = self.samples.len();
        let required = self.config.min_samples;

        if accepted < required {
            return Err(self.fail(CalibrationError::InsufficientSamples { accepted, required }));
        }
        let diversity = self.diversity();
        if !self.ready() {
            log::warn!(
                "Pose diversity not met: normal spread {:.1} deg, coverage {:.2} x {:.2}",
                diversity.normal_spread_deg,
                diversity.coverage_x,
                diversity.coverage_y
            );
            return Err(self.fail(CalibrationError::InsufficientSamples { accepted, required }));
        }

        self.state = CameraCalibrationState::Solving;
        log::info!("Solving camera model from {} samples", accepted);
        let samples = std::mem::take(&mut self.samples);
        let solution = match calibrate_planar(&samples, self.width, self.height) {
            Ok(s) => s,
            Err(e) => return Err(self.fail(e)),
        };

        if solution.rms > self.config.max_rms_px {
            return Err(self.fail(CalibrationError::HighReprojectionError {
                rms: solution.rms,
                threshold: self.config.max_rms_px,
            }));
        }

        let k = solution.camera.intrinsics();
        log::info!(
            "Camera calibrated: fx={:.2} fy={:.2} cx={:.2} cy={:.2}, RMS {:.4}px",
            k.fx,
            k.fy,
            k.cx,
            k.cy,
            solution.rms
        );
        self.state = CameraCalibrationState::Calibrated {
            model: solution.camera.clone(),
            rms: solution.rms,
        };
        Ok(solution.camera)
    }

    fn fail(&mut self, err: CalibrationError) -> CalibrationError {
        log::warn!("Camera calibration failed: {}", err);
        self.samples.clear();
        self.state = CameraCalibrationState::Failed(err.clone());
        err
    }
}

fn mean_displacement(a: &CalibrationSample, b: &CalibrationSample) -> f64 {
    let n = a.len().min(b.len()).max(1) as f64;
    a.image_points()
        .iter()
        .zip(b.image_points())
        .map(|(p, q)| (p - q).norm())
        .sum::<f64>()
        / n
}
