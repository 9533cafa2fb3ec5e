//! Application state and the inbound control surface.
//!
//! [`TrackerApp`] is what an interactive shell drives: it runs one
//! calibration session at a time, assembles the calibration bundle from
//! their results, and starts or stops the tracking loop.

use crate::calibration::{
    CameraCalibrationState, CameraCalibrator, Homography, ProjectionRound,
    ProjectorCalibrationState, ProjectorCalibrator, RoundOutcome, SampleVerdict,
};
use crate::camera::{CameraModel, DeviceGuard, DeviceLock, Frame, FrameSource};
use crate::config::TrackerConfig;
use crate::error::{CalibrationError, ConfigurationError, Result, RuntimeError};
use crate::geometry::Pixel;
use crate::render::{overlay_channel, OverlayReceiver, OverlaySender, RenderBatch, RenderCommand};
use crate::store::{CalibrationBundle, CalibrationStore, SharedCalibration};
use crate::table::TableFrame;
use crate::tracking::{TrackedMarker, TrackingLoop, TrackingStats};

/// Which calibration procedure to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Camera,
    Projector,
}

/// Result of handing one frame to the active session.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameFeedback {
    /// Camera session: whether the frame became a sample.
    Sample(SampleVerdict),
    /// Projector session: correspondences gained from the frame.
    Observed(usize),
}

/// Result of finishing the active session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    CameraCalibrated(CameraModel),
    ProjectorCalibrated(Homography),
    /// The projector session continues with this round.
    NeedsAnotherRound(ProjectionRound),
}

/// State of the active session, if any.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStatus {
    None,
    Camera {
        state: CameraCalibrationState,
        accepted: usize,
        required: usize,
    },
    Projector {
        state: ProjectorCalibrationState,
        round: Option<ProjectionRound>,
    },
}

/// Everything an operator needs to see about calibration progress.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationStatus {
    pub session: SessionStatus,
    pub camera_calibrated: bool,
    pub table_located: bool,
    pub table_set: bool,
    pub projector_calibrated: bool,
    /// A complete bundle is installed for tracking.
    pub complete: bool,
    pub bundle_version: u64,
    pub tracking: bool,
}

enum ActiveSession {
    Camera(CameraCalibrator),
    Projector(ProjectorCalibrator),
}

struct Session {
    calibrator: ActiveSession,
    _device: DeviceGuard,
}

/// Main application state.
pub struct TrackerApp {
    config: TrackerConfig,
    store: CalibrationStore,
    device: DeviceLock,
    shared: SharedCalibration,
    overlay_tx: OverlaySender,
    overlay_rx: OverlayReceiver,
    /// Latest camera model, located on the table or not.
    camera: Option<CameraModel>,
    homography: Option<Homography>,
    table: Option<TableFrame>,
    session: Option<Session>,
    tracking: Option<TrackingLoop>,
}

impl TrackerApp {
    /// Create an uncalibrated app using the configured store location.
    pub fn new(config: TrackerConfig) -> Result<Self> {
        let store = config.store()?;
        Self::with_store(config, store)
    }

    pub fn with_store(config: TrackerConfig, store: CalibrationStore) -> Result<Self> {
        config.validate()?;
        let (overlay_tx, overlay_rx) = overlay_channel();
        log::info!("Calibration store: {}", store.path().display());
        Ok(Self {
            config,
            store,
            device: DeviceLock::new(),
            shared: SharedCalibration::new(),
            overlay_tx,
            overlay_rx,
            camera: None,
            homography: None,
            table: None,
            session: None,
            tracking: None,
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Receiver for overlay and projection commands, for the presentation
    /// layer.
    pub fn overlay_receiver(&self) -> OverlayReceiver {
        self.overlay_rx.clone()
    }

    /// The bundle the tracking loop reads.
    pub fn shared_calibration(&self) -> &SharedCalibration {
        &self.shared
    }

    pub fn device(&self) -> &DeviceLock {
        &self.device
    }

    // ---- Calibration sessions ----

    /// Start a calibration session. The session holds the camera until it
    /// ends. A projector session returns the first round to project (also
    /// published on the overlay channel).
    pub fn start_calibration_session(&mut self, kind: SessionKind) -> Result<Option<ProjectionRound>> {
        if let Some(session) = &self.session {
            let state = match &session.calibrator {
                ActiveSession::Camera(c) => c.state().to_string(),
                ActiveSession::Projector(p) => p.state().to_string(),
            };
            return Err(CalibrationError::InvalidState(format!("session already active ({})", state)).into());
        }

        match kind {
            SessionKind::Camera => {
                let mut calibrator = CameraCalibrator::new(
                    self.config.camera_calibration.clone(),
                    self.config.detector.clone(),
                    self.config.camera_width,
                    self.config.camera_height,
                )?;
                let device = self.device.acquire("camera-calibration")?;
                calibrator.start()?;
                self.session = Some(Session {
                    calibrator: ActiveSession::Camera(calibrator),
                    _device: device,
                });
                Ok(None)
            }
            SessionKind::Projector => {
                let camera = self.camera.clone().ok_or_else(|| {
                    ConfigurationError::InvalidModel("camera has not been calibrated".to_string())
                })?;
                let table = self.table.ok_or_else(|| {
                    ConfigurationError::InvalidConfig("table frame has not been set".to_string())
                })?;
                let mut calibrator = ProjectorCalibrator::new(
                    self.config.projector_calibration.clone(),
                    camera,
                    table,
                    self.config.detector.clone(),
                )?;
                let device = self.device.acquire("projector-calibration")?;
                let round = calibrator.start()?;
                self.publish_round(&round, None);
                self.session = Some(Session {
                    calibrator: ActiveSession::Projector(calibrator),
                    _device: device,
                });
                Ok(Some(round))
            }
        }
    }

    /// Hand one camera frame to the active session.
    pub fn submit_calibration_frame(&mut self, frame: &Frame) -> Result<FrameFeedback> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| CalibrationError::InvalidState("no calibration session".to_string()))?;
        let feedback = match &mut session.calibrator {
            ActiveSession::Camera(c) => FrameFeedback::Sample(c.submit_frame(frame)?),
            ActiveSession::Projector(p) => FrameFeedback::Observed(p.submit_observation(frame)?),
        };
        Ok(feedback)
    }

    /// Solve the active session. A success installs its result; a failure
    /// ends the session and is returned for the operator to retry.
    pub fn finish_calibration_session(&mut self) -> Result<SessionOutcome> {
        let mut session = self
            .session
            .take()
            .ok_or_else(|| CalibrationError::InvalidState("no calibration session".to_string()))?;

        let (previous, outcome) = match &mut session.calibrator {
            ActiveSession::Camera(calibrator) => {
                let model = calibrator.solve()?;
                // A new lens model invalidates the old table pose.
                self.camera = Some(model.without_extrinsics());
                self.publish_bundle();
                return Ok(SessionOutcome::CameraCalibrated(model));
            }
            ActiveSession::Projector(calibrator) => {
                let previous: Vec<u16> = calibrator
                    .current_round()
                    .map(|r| r.targets.iter().map(|t| t.id).collect())
                    .unwrap_or_default();
                (previous, calibrator.solve_round())
            }
        };

        match outcome {
            Ok(RoundOutcome::Calibrated(homography)) => {
                self.clear_projection(&previous);
                self.homography = Some(homography);
                self.publish_bundle();
                Ok(SessionOutcome::ProjectorCalibrated(homography))
            }
            Ok(RoundOutcome::NeedsAnotherRound(round)) => {
                self.publish_round(&round, Some(&previous));
                self.session = Some(session);
                Ok(SessionOutcome::NeedsAnotherRound(round))
            }
            Err(e) => {
                self.clear_projection(&previous);
                Err(e.into())
            }
        }
    }

    /// Abandon the active session, releasing the camera.
    pub fn cancel_calibration_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            match &mut session.calibrator {
                ActiveSession::Camera(c) => c.cancel(),
                ActiveSession::Projector(p) => {
                    let ids: Vec<u16> = p
                        .current_round()
                        .map(|r| r.targets.iter().map(|t| t.id).collect())
                        .unwrap_or_default();
                    p.cancel();
                    self.clear_projection(&ids);
                }
            }
            log::info!("Calibration session cancelled");
        }
    }

    pub fn calibration_status(&self) -> CalibrationStatus {
        let session = match &self.session {
            None => SessionStatus::None,
            Some(s) => match &s.calibrator {
                ActiveSession::Camera(c) => SessionStatus::Camera {
                    state: c.state().clone(),
                    accepted: c.accepted_samples(),
                    required: c.required_samples(),
                },
                ActiveSession::Projector(p) => SessionStatus::Projector {
                    state: p.state().clone(),
                    round: p.current_round().cloned(),
                },
            },
        };
        let (bundle_version, bundle) = self.shared.versioned_snapshot();
        CalibrationStatus {
            session,
            camera_calibrated: self.camera.is_some(),
            table_located: self
                .camera
                .as_ref()
                .is_some_and(|c| c.extrinsics().is_some()),
            table_set: self.table.is_some(),
            projector_calibrated: self.homography.is_some(),
            complete: bundle.is_some(),
            bundle_version,
            tracking: self.is_tracking(),
        }
    }

    // ---- Table setup ----

    /// Set the table from physical measurements. A different table
    /// invalidates the projector homography, which is expressed in table
    /// coordinates.
    pub fn set_table_frame(&mut self, table: TableFrame) -> Result<()> {
        self.ensure_not_tracking()?;
        if self.table.is_some_and(|t| t != table) && self.homography.take().is_some() {
            log::info!("Table frame changed, projector calibration discarded");
        }
        self.table = Some(table);
        self.publish_bundle();
        Ok(())
    }

    /// Locate the camera relative to the table from the table's four corners
    /// observed in a raw frame, clockwise from the origin.
    pub fn locate_table(&mut self, corners: &[Pixel; 4]) -> Result<()> {
        self.ensure_not_tracking()?;
        let camera = self.camera.as_ref().ok_or_else(|| {
            ConfigurationError::InvalidModel("camera has not been calibrated".to_string())
        })?;
        let table = self.table.ok_or_else(|| {
            ConfigurationError::InvalidConfig("table frame has not been set".to_string())
        })?;
        self.camera = Some(camera.locate_table(&table, corners)?);
        self.publish_bundle();
        Ok(())
    }

    // ---- Persistence ----

    /// Replace the calibration with the stored bundle. On failure the app is
    /// left uncalibrated.
    pub fn load_calibration(&mut self) -> Result<()> {
        match self.store.load() {
            Ok(bundle) => {
                self.install(bundle);
                Ok(())
            }
            Err(e) => {
                log::warn!("Could not load calibration: {}", e);
                self.camera = None;
                self.homography = None;
                self.table = None;
                self.shared.clear();
                Err(e.into())
            }
        }
    }

    /// Install a bundle obtained elsewhere (for example an import).
    pub fn install(&mut self, bundle: CalibrationBundle) {
        self.camera = Some(bundle.camera().clone());
        self.homography = Some(*bundle.homography());
        self.table = Some(*bundle.table());
        self.shared.replace(bundle);
    }

    pub fn save_calibration(&self) -> Result<()> {
        let bundle = self.shared.snapshot().ok_or(RuntimeError::CalibrationMissing)?;
        self.store.save(&bundle)?;
        Ok(())
    }

    // ---- Tracking ----

    pub fn start_tracking<S>(&mut self, source: S) -> Result<()>
    where
        S: FrameSource + 'static,
    {
        if self.is_tracking() {
            return Err(RuntimeError::AlreadyRunning.into());
        }
        if let Some(ended) = self.tracking.take() {
            if let Err(e) = ended.stop() {
                log::warn!("Previous tracking run ended with: {}", e);
            }
        }
        let tracking = TrackingLoop::start(
            self.config.tracking.clone(),
            source,
            self.shared.clone(),
            self.config.detector.clone(),
            self.overlay_tx.clone(),
            &self.device,
        )?;
        self.tracking = Some(tracking);
        Ok(())
    }

    /// Stop tracking and report the run's counters, or the fatal error that
    /// ended it.
    pub fn stop_tracking(&mut self) -> Result<TrackingStats> {
        let tracking = self.tracking.take().ok_or(RuntimeError::NotRunning)?;
        Ok(tracking.stop()?)
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking.as_ref().is_some_and(|t| t.is_running())
    }

    pub fn tracking_stats(&self) -> Option<TrackingStats> {
        self.tracking.as_ref().map(|t| t.stats())
    }

    /// Poses from the last completed tracking cycle; empty when idle.
    pub fn current_marker_poses(&self) -> Vec<TrackedMarker> {
        self.tracking
            .as_ref()
            .map(|t| t.current_poses())
            .unwrap_or_default()
    }

    // ---- Internals ----

    fn ensure_not_tracking(&self) -> Result<()> {
        if self.is_tracking() {
            Err(RuntimeError::AlreadyRunning.into())
        } else {
            Ok(())
        }
    }

    /// Install the assembled bundle, or clear the shared one when a part is
    /// missing.
    fn publish_bundle(&self) {
        let (Some(camera), Some(homography), Some(table)) = (&self.camera, self.homography, self.table)
        else {
            if self.shared.is_calibrated() {
                self.shared.clear();
                log::info!("Calibration incomplete, tracking bundle withdrawn");
            }
            return;
        };
        match CalibrationBundle::new(camera.clone(), homography, table) {
            Ok(bundle) => {
                self.shared.replace(bundle);
            }
            Err(e) => {
                log::debug!("Calibration not yet complete: {}", e);
                if self.shared.is_calibrated() {
                    self.shared.clear();
                }
            }
        }
    }

    fn publish_round(&self, round: &ProjectionRound, previous: Option<&[u16]>) {
        let mut batch = RenderBatch::new(0);
        for (id, shape) in round.targets.iter().map(|t| t.id).zip(round.draw_commands()) {
            batch.commands.push(RenderCommand::DrawOverlay { marker_id: id, shape });
        }
        for &id in previous.unwrap_or_default() {
            if round.target(id).is_none() {
                batch.commands.push(RenderCommand::ClearOverlay { marker_id: id });
            }
        }
        self.overlay_tx.publish(batch);
    }

    fn clear_projection(&self, ids: &[u16]) {
        if ids.is_empty() {
            return;
        }
        let mut batch = RenderBatch::new(0);
        batch.commands = ids
            .iter()
            .map(|&marker_id| RenderCommand::ClearOverlay { marker_id })
            .collect();
        self.overlay_tx.publish(batch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::RejectReason;
    use crate::render::DrawCommand;
    use crate::error::{PersistenceError, TrackerError};
    use crate::test_utils::{overhead_bundle, render_markers, MarkerPlacement};
    use image::{GrayImage, Luma};
    use std::time::{Duration, Instant};

    struct RepeatSource(Frame);

    impl FrameSource for RepeatSource {
        fn next_frame(&mut self, _timeout: Duration) -> std::result::Result<Frame, RuntimeError> {
            std::thread::sleep(Duration::from_millis(2));
            Ok(self.0.clone())
        }
    }

    fn app_in(dir: &tempfile::TempDir) -> TrackerApp {
        let mut config = TrackerConfig::default();
        config.camera_width = 640;
        config.camera_height = 480;
        config.tracking.cycle_deadline_ms = 10_000;
        TrackerApp::with_store(config, CalibrationStore::new(dir.path().join("calibration.json"))).unwrap()
    }

    fn blank_frame() -> Frame {
        Frame::from_gray(GrayImage::from_pixel(640, 480, Luma([240])))
    }

    #[test]
    fn test_tracking_requires_calibration() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = app_in(&dir);
        let err = app.start_tracking(RepeatSource(blank_frame())).unwrap_err();
        assert!(matches!(err, TrackerError::Runtime(RuntimeError::CalibrationMissing)));
        assert!(!app.is_tracking());
        assert!(matches!(
            app.stop_tracking(),
            Err(TrackerError::Runtime(RuntimeError::NotRunning))
        ));
    }

    #[test]
    fn test_load_failure_leaves_app_uncalibrated() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = app_in(&dir);
        app.install(overhead_bundle());
        assert!(app.calibration_status().complete);

        let err = app.load_calibration().unwrap_err();
        assert!(matches!(err, TrackerError::Persistence(PersistenceError::NotFound(_))));
        let status = app.calibration_status();
        assert!(!status.complete);
        assert!(!status.camera_calibrated && !status.table_set && !status.projector_calibrated);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = app_in(&dir);
        assert!(matches!(
            app.save_calibration(),
            Err(TrackerError::Runtime(RuntimeError::CalibrationMissing))
        ));
        app.install(overhead_bundle());
        app.save_calibration().unwrap();

        let mut fresh = app_in(&dir);
        fresh.load_calibration().unwrap();
        assert_eq!(*fresh.shared_calibration().snapshot().unwrap(), overhead_bundle());
        let status = fresh.calibration_status();
        assert!(status.complete && status.table_located);
    }

    #[test]
    fn test_camera_session_with_too_few_samples_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = app_in(&dir);
        assert_eq!(app.start_calibration_session(SessionKind::Camera).unwrap(), None);
        assert_eq!(app.device().holder().as_deref(), Some("camera-calibration"));

        let feedback = app.submit_calibration_frame(&blank_frame()).unwrap();
        assert!(matches!(
            feedback,
            FrameFeedback::Sample(SampleVerdict::Rejected(RejectReason::MissingMarkers { found: 0, .. }))
        ));
        match app.calibration_status().session {
            SessionStatus::Camera { accepted, required, .. } => {
                assert_eq!((accepted, required), (0, 8));
            }
            other => panic!("unexpected session {:?}", other),
        }

        let err = app.finish_calibration_session().unwrap_err();
        assert!(matches!(
            err,
            TrackerError::Calibration(CalibrationError::InsufficientSamples { accepted: 0, required: 8 })
        ));
        assert_eq!(app.calibration_status().session, SessionStatus::None);
        assert!(app.device().holder().is_none());
        assert!(!app.calibration_status().camera_calibrated);
    }

    #[test]
    fn test_session_blocks_tracking() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = app_in(&dir);
        app.install(overhead_bundle());
        app.start_calibration_session(SessionKind::Camera).unwrap();
        assert!(matches!(
            app.start_calibration_session(SessionKind::Projector),
            Err(TrackerError::Calibration(CalibrationError::InvalidState(_)))
        ));
        let err = app.start_tracking(RepeatSource(blank_frame())).unwrap_err();
        assert!(matches!(err, TrackerError::Runtime(RuntimeError::DeviceBusy)));
        app.cancel_calibration_session();
        assert!(app.device().holder().is_none());
    }

    #[test]
    fn test_projector_session_publishes_round() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = app_in(&dir);
        assert!(matches!(
            app.start_calibration_session(SessionKind::Projector),
            Err(TrackerError::Configuration(ConfigurationError::InvalidModel(_)))
        ));

        app.install(overhead_bundle());
        let rx = app.overlay_receiver();
        let round = app
            .start_calibration_session(SessionKind::Projector)
            .unwrap()
            .unwrap();
        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.draws().count(), round.targets.len());
        assert!(batch.commands.iter().all(|c| match c {
            RenderCommand::DrawOverlay { shape, .. } => matches!(shape, DrawCommand::Marker { .. }),
            RenderCommand::ClearOverlay { .. } => false,
        }));

        // Nothing observed: the round cannot be solved.
        assert_eq!(app.submit_calibration_frame(&blank_frame()).unwrap(), FrameFeedback::Observed(0));
        let err = app.finish_calibration_session().unwrap_err();
        assert!(matches!(
            err,
            TrackerError::Calibration(CalibrationError::InsufficientCorrespondences { inliers: 0, .. })
        ));
        let cleared = rx.try_recv().unwrap();
        assert_eq!(cleared.clears().count(), round.targets.len());
        // The previous homography is still installed.
        assert!(app.calibration_status().complete);
    }

    #[test]
    fn test_changing_table_withdraws_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = app_in(&dir);
        app.install(overhead_bundle());
        let same = *overhead_bundle().table();
        app.set_table_frame(same).unwrap();
        assert!(app.calibration_status().complete);

        app.set_table_frame(TableFrame::new(1200.0, 800.0).unwrap()).unwrap();
        let status = app.calibration_status();
        assert!(!status.complete);
        assert!(!status.projector_calibrated);
        assert!(status.table_located);
    }

    #[test]
    fn test_tracking_reports_marker_poses() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = app_in(&dir);
        app.install(overhead_bundle());
        let img = render_markers(640, 480, &[MarkerPlacement::rotated(21, 320.0, 240.0, 60.0, 0.0)]);
        app.start_tracking(RepeatSource(Frame::from_gray(img))).unwrap();
        assert!(matches!(
            app.start_tracking(RepeatSource(blank_frame())),
            Err(TrackerError::Runtime(RuntimeError::AlreadyRunning))
        ));
        assert!(matches!(
            app.set_table_frame(TableFrame::new(100.0, 100.0).unwrap()),
            Err(TrackerError::Runtime(RuntimeError::AlreadyRunning))
        ));

        let start = Instant::now();
        while app.current_marker_poses().is_empty() && start.elapsed() < Duration::from_secs(30) {
            std::thread::sleep(Duration::from_millis(10));
        }
        let poses = app.current_marker_poses();
        assert_eq!(poses.len(), 1);
        assert_eq!(poses[0].id, 21);
        // Image centre lies over the table centre.
        assert!((poses[0].pose.position - nalgebra::Point2::new(450.0, 300.0)).norm() < 1.0);

        let stats = app.stop_tracking().unwrap();
        assert!(stats.completed >= 1);
        assert!(app.current_marker_poses().is_empty());
    }
}
