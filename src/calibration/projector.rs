//! Projector calibration: project markers, observe them with the located
//! camera, and solve the table-to-projector homography in rounds.

use super::homography::{Correspondence, Homography, HomographyComputer};
use crate::camera::{CameraModel, DepthPlane, Frame};
use crate::detection::{DetectorParams, MarkerDetector};
use crate::error::{CalibrationError, ConfigurationError};
use crate::geometry::{has_non_collinear_triple, Pixel};
use crate::render::DrawCommand;
use crate::table::TableFrame;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

/// Projector calibration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectorCalibrationConfig {
    pub projector_width: u32,
    pub projector_height: u32,
    /// RANSAC inlier threshold in projector pixels.
    pub ransac_threshold_px: f64,
    /// Correspondences with a larger residual are discarded after solving.
    pub outlier_threshold_px: f64,
    /// Mean inlier residual that counts as converged.
    pub tolerance_px: f64,
    /// Capture rounds before giving up.
    pub max_rounds: usize,
    /// Marker grid projected in the first round.
    pub grid_columns: u32,
    pub grid_rows: u32,
    pub marker_size_px: f64,
    pub first_marker_id: u16,
}

impl Default for ProjectorCalibrationConfig {
    fn default() -> Self {
        Self {
            projector_width: 1920,
            projector_height: 1080,
            ransac_threshold_px: 3.0,
            outlier_threshold_px: 3.0,
            tolerance_px: 1.0,
            max_rounds: 3,
            grid_columns: 4,
            grid_rows: 3,
            marker_size_px: 120.0,
            first_marker_id: 1000,
        }
    }
}

/// One marker to project.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectorTarget {
    pub id: u16,
    pub projector_px: Pixel,
    pub size_px: f64,
}

/// The markers to show for one capture round.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionRound {
    pub index: usize,
    pub targets: Vec<ProjectorTarget>,
}

impl ProjectionRound {
    pub fn draw_commands(&self) -> Vec<DrawCommand> {
        self.targets
            .iter()
            .map(|t| DrawCommand::Marker {
                id: t.id,
                center: t.projector_px,
                size: t.size_px,
            })
            .collect()
    }

    pub fn target(&self, id: u16) -> Option<&ProjectorTarget> {
        self.targets.iter().find(|t| t.id == id)
    }
}

/// Result of a successful `solve_round`.
#[derive(Debug, Clone, PartialEq)]
pub enum RoundOutcome {
    Calibrated(Homography),
    /// Residual still above tolerance; project this round next.
    NeedsAnotherRound(ProjectionRound),
}

/// State of a projector calibration session.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectorCalibrationState {
    Idle,
    /// Waiting for observations of the given round.
    Projecting { round: usize },
    Calibrated {
        homography: Homography,
        mean_residual: f64,
    },
    Failed(CalibrationError),
}

impl ProjectorCalibrationState {
    pub fn is_projecting(&self) -> bool {
        matches!(self, ProjectorCalibrationState::Projecting { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProjectorCalibrationState::Calibrated { .. } | ProjectorCalibrationState::Failed(_)
        )
    }
}

impl std::fmt::Display for ProjectorCalibrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProjectorCalibrationState::Idle => write!(f, "Idle"),
            ProjectorCalibrationState::Projecting { round } => write!(f, "Round {}", round + 1),
            ProjectorCalibrationState::Calibrated { mean_residual, .. } => {
                write!(f, "Calibrated (mean residual {:.3}px)", mean_residual)
            }
            ProjectorCalibrationState::Failed(err) => write!(f, "Failed: {}", err),
        }
    }
}

/// Solves the table-to-projector homography using the camera as the
/// measuring instrument.
pub struct ProjectorCalibrator {
    config: ProjectorCalibrationConfig,
    camera: CameraModel,
    table: TableFrame,
    detector: MarkerDetector,
    state: ProjectorCalibrationState,
    round: Option<ProjectionRound>,
    correspondences: Vec<Correspondence>,
    estimate: Option<Homography>,
}

impl ProjectorCalibrator {
    /// `camera` must already be located relative to the table.
    pub fn new(
        config: ProjectorCalibrationConfig,
        camera: CameraModel,
        table: TableFrame,
        detector: DetectorParams,
    ) -> Result<Self, ConfigurationError> {
        camera.require_extrinsics()?;
        if config.projector_width == 0 || config.projector_height == 0 {
            return Err(ConfigurationError::InvalidConfig(
                "projector raster is empty".to_string(),
            ));
        }
        if config.grid_columns < 2 || config.grid_rows < 2 {
            return Err(ConfigurationError::InvalidConfig(
                "projector marker grid needs at least 2x2 markers".to_string(),
            ));
        }
        if config.max_rounds == 0 {
            return Err(ConfigurationError::InvalidConfig(
                "projector calibration needs at least one round".to_string(),
            ));
        }
        let max_id = config.first_marker_id as u64
            + (config.grid_columns as u64 * config.grid_rows as u64).max(25);
        if max_id > u16::MAX as u64 {
            return Err(ConfigurationError::InvalidConfig(
                "projector marker ids exceed the 16-bit range".to_string(),
            ));
        }
        // Projectors may flip the image.
        let detector = MarkerDetector::new(DetectorParams {
            allow_mirrored: true,
            ..detector
        });
        Ok(Self {
            config,
            camera,
            table,
            detector,
            state: ProjectorCalibrationState::Idle,
            round: None,
            correspondences: Vec::new(),
            estimate: None,
        })
    }

    pub fn state(&self) -> &ProjectorCalibrationState {
        &self.state
    }

    pub fn current_round(&self) -> Option<&ProjectionRound> {
        self.round.as_ref()
    }

    pub fn correspondences(&self) -> &[Correspondence] {
        &self.correspondences
    }

    pub fn homography(&self) -> Option<&Homography> {
        match &self.state {
            ProjectorCalibrationState::Calibrated { homography, .. } => Some(homography),
            _ => None,
        }
    }

    /// Start the session and return the first round to project.
    pub fn start(&mut self) -> Result<ProjectionRound, CalibrationError> {
        if !matches!(self.state, ProjectorCalibrationState::Idle) {
            return Err(CalibrationError::InvalidState(self.state.to_string()));
        }
        let round = self.grid_round();
        log::info!(
            "Projector calibration started: {} markers on a {}x{} raster",
            round.targets.len(),
            self.config.projector_width,
            self.config.projector_height
        );
        self.state = ProjectorCalibrationState::Projecting { round: 0 };
        self.round = Some(round.clone());
        Ok(round)
    }

    pub fn cancel(&mut self) {
        if !self.state.is_terminal() {
            self.fail(CalibrationError::InvalidState("session cancelled".to_string()));
        }
    }

    fn grid_round(&self) -> ProjectionRound {
        let c = &self.config;
        let margin = c.marker_size_px;
        let span_x = (c.projector_width as f64 - 2.0 * margin).max(0.0);
        let span_y = (c.projector_height as f64 - 2.0 * margin).max(0.0);
        let mut targets = Vec::new();
        for row in 0..c.grid_rows {
            for col in 0..c.grid_columns {
                let x = margin + span_x * col as f64 / (c.grid_columns - 1) as f64;
                let y = margin + span_y * row as f64 / (c.grid_rows - 1) as f64;
                targets.push(ProjectorTarget {
                    id: c.first_marker_id + (row * c.grid_columns + col) as u16,
                    projector_px: Point2::new(x, y),
                    size_px: c.marker_size_px,
                });
            }
        }
        ProjectionRound { index: 0, targets }
    }

    /// Table-space test points mapped through the current estimate.
    fn refinement_round(&self, index: usize, estimate: &Homography) -> ProjectionRound {
        const STEPS: usize = 5;
        let c = &self.config;
        let half = c.marker_size_px * 0.5;
        let (w, h) = (self.table.width(), self.table.height());
        let mut targets = Vec::new();
        let mut next_id = c.first_marker_id;
        for j in 0..STEPS {
            for i in 0..STEPS {
                let table = Point2::new(
                    w * (0.1 + 0.8 * i as f64 / (STEPS - 1) as f64),
                    h * (0.1 + 0.8 * j as f64 / (STEPS - 1) as f64),
                );
                let Some(p) = estimate.apply(&table) else {
                    continue;
                };
                let inside = p.x >= half
                    && p.y >= half
                    && p.x <= c.projector_width as f64 - half
                    && p.y <= c.projector_height as f64 - half;
                if inside {
                    targets.push(ProjectorTarget {
                        id: next_id,
                        projector_px: p,
                        size_px: c.marker_size_px,
                    });
                    next_id += 1;
                }
            }
        }
        if targets.len() < 4 {
            // Estimate maps the table mostly off the raster; fall back to the grid.
            let mut grid = self.grid_round();
            grid.index = index;
            return grid;
        }
        ProjectionRound { index, targets }
    }

    /// Detect the projected markers in a raw camera frame and record their
    /// table positions. Returns how many correspondences were added.
    pub fn submit_observation(&mut self, frame: &Frame) -> Result<usize, CalibrationError> {
        self.ensure_projecting()?;
        let round = match &self.round {
            Some(r) => r,
            None => return Err(CalibrationError::InvalidState(self.state.to_string())),
        };
        let detections = match self.detector.detect_frame(frame) {
            Ok(d) => d,
            Err(e) => {
                log::warn!("Projector calibration frame unusable: {}", e);
                return Ok(0);
            }
        };

        let mut added = Vec::new();
        for detection in &detections {
            let Some(target) = round.target(detection.identity()) else {
                continue;
            };
            let center = detection.corners().center();
            let Some(hit) = self.camera.unproject(&center, DepthPlane::Table) else {
                log::debug!("Marker {} does not map onto the table", target.id);
                continue;
            };
            let table = self.table.to_table(&Point2::new(hit.x, hit.y));
            added.push(Correspondence::new(table, target.projector_px));
        }
        log::info!(
            "Round {}: {} of {} projected markers observed",
            round.index + 1,
            added.len(),
            round.targets.len()
        );
        let count = added.len();
        self.correspondences.extend(added);
        Ok(count)
    }

    /// Add correspondences measured by other means.
    pub fn submit_correspondences(
        &mut self,
        correspondences: &[Correspondence],
    ) -> Result<(), CalibrationError> {
        self.ensure_projecting()?;
        self.correspondences.extend_from_slice(correspondences);
        Ok(())
    }

    fn ensure_projecting(&self) -> Result<(), CalibrationError> {
        if self.state.is_projecting() {
            Ok(())
        } else {
            Err(CalibrationError::InvalidState(self.state.to_string()))
        }
    }

    /// Solve with everything gathered so far.
    pub fn solve_round(&mut self) -> Result<RoundOutcome, CalibrationError> {
        let round_index = match self.state {
            ProjectorCalibrationState::Projecting { round } => round,
            _ => return Err(CalibrationError::InvalidState(self.state.to_string())),
        };

        let table_points: Vec<Point2<f64>> = self.correspondences.iter().map(|c| c.table).collect();
        if self.correspondences.len() < 4 {
            return Err(self.fail(CalibrationError::InsufficientCorrespondences {
                inliers: self.correspondences.len(),
                required: 4,
            }));
        }
        if !has_non_collinear_triple(&table_points) {
            return Err(self.fail(CalibrationError::DegenerateHomography));
        }

        let computer = HomographyComputer::new().with_threshold(self.config.ransac_threshold_px);
        let result = match computer.compute(&self.correspondences) {
            Ok(r) => r,
            Err(e) => return Err(self.fail(e)),
        };

        let before = self.correspondences.len();
        let homography = result.homography.clone();
        let threshold = self.config.outlier_threshold_px;
        self.correspondences
            .retain(|c| residual(&homography, c).is_some_and(|r| r <= threshold));
        let inliers = self.correspondences.len();
        if inliers < before {
            log::info!("Discarded {} outlier correspondences", before - inliers);
        }
        if inliers < 4 {
            return Err(self.fail(CalibrationError::InsufficientCorrespondences {
                inliers,
                required: 4,
            }));
        }

        let mean = self
            .correspondences
            .iter()
            .filter_map(|c| residual(&homography, c))
            .sum::<f64>()
            / inliers as f64;
        log::info!(
            "Round {}: {} inliers, mean residual {:.3}px (tolerance {:.3}px)",
            round_index + 1,
            inliers,
            mean,
            self.config.tolerance_px
        );

        if mean <= self.config.tolerance_px {
            log::info!("Projector calibrated");
            self.round = None;
            self.state = ProjectorCalibrationState::Calibrated {
                homography: homography.clone(),
                mean_residual: mean,
            };
            return Ok(RoundOutcome::Calibrated(homography));
        }

        let next = round_index + 1;
        if next >= self.config.max_rounds {
            return Err(self.fail(CalibrationError::ResidualTooHigh {
                mean,
                tolerance: self.config.tolerance_px,
            }));
        }
        let round = self.refinement_round(next, &homography);
        self.estimate = Some(homography);
        self.round = Some(round.clone());
        self.state = ProjectorCalibrationState::Projecting { round: next };
        Ok(RoundOutcome::NeedsAnotherRound(round))
    }

    /// The most recent intermediate estimate, if a round needed repeating.
    pub fn estimate(&self) -> Option<&Homography> {
        self.estimate.as_ref()
    }

    fn fail(&mut self, err: CalibrationError) -> CalibrationError {
        log::warn!("Projector calibration failed: {}", err);
        self.round = None;
        self.correspondences.clear();
        self.state = ProjectorCalibrationState::Failed(err.clone());
        err
    }
}

fn residual(h: &Homography, c: &Correspondence) -> Option<f64> {
    h.apply(&c.table).map(|p| (p - c.projector).norm())
}
