//! The steady-state capture, detect and render loop.
//!
//! Runs on its own thread. Each cycle pulls one frame, undistorts it, detects
//! markers, maps their table poses through the projector homography and
//! publishes one [`RenderBatch`]. Stopping takes effect at the next cycle
//! boundary.

use super::tracker::{nearest, MarkerTracker, Observation, TrackedMarker};
use crate::camera::{DeviceGuard, DeviceLock, Frame, FrameSource, UndistortMap};
use crate::detection::{Detection, DetectorParams, MarkerDetector, MarkerPose};
use crate::error::RuntimeError;
use crate::render::{DrawCommand, OverlaySender, RenderBatch, RenderCommand};
use crate::store::{CalibrationBundle, SharedCalibration};
use nalgebra::{Point2, Vector2};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Tracking loop tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// How long one capture may block.
    pub capture_timeout_ms: u64,
    /// Budget from frame arrival to overlay publication.
    pub cycle_deadline_ms: u64,
    /// Consecutive capture failures tolerated before the device is declared lost.
    pub max_consecutive_failures: u32,
    /// Markers moving less than this (Manhattan, mm) keep their overlay.
    pub hysteresis_mm: f64,
    /// Overlay ring radius relative to the marker side.
    pub overlay_radius_scale: f64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            capture_timeout_ms: 100,
            cycle_deadline_ms: 50,
            max_consecutive_failures: 30,
            hysteresis_mm: 4.0,
            overlay_radius_scale: 0.75,
        }
    }
}

/// Counters readable while the loop runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackingStats {
    /// Capture attempts.
    pub cycles: u64,
    /// Cycles that published a batch.
    pub completed: u64,
    /// Cycles dropped for exceeding the deadline.
    pub abandoned: u64,
    pub capture_failures: u64,
    pub consecutive_failures: u32,
    /// Markers tracked after the last completed cycle.
    pub markers: usize,
}

/// State shared between the loop thread and its handle.
struct LoopShared {
    running: AtomicBool,
    stats: Mutex<TrackingStats>,
    poses: RwLock<Vec<TrackedMarker>>,
    fatal: Mutex<Option<RuntimeError>>,
}

/// Handle to a running tracking loop.
pub struct TrackingLoop {
    shared: Arc<LoopShared>,
    thread_handle: Option<JoinHandle<()>>,
}

impl TrackingLoop {
    /// Start tracking. Fails with `CalibrationMissing` before touching the
    /// device when no complete bundle is installed, and with `DeviceBusy`
    /// when a calibration session holds the camera.
    pub fn start<S>(
        config: TrackingConfig,
        source: S,
        calibration: SharedCalibration,
        detector: DetectorParams,
        overlay: OverlaySender,
        device: &DeviceLock,
    ) -> Result<Self, RuntimeError>
    where
        S: FrameSource + 'static,
    {
        if !calibration.is_calibrated() {
            log::warn!("Tracking requested without a calibration bundle");
            return Err(RuntimeError::CalibrationMissing);
        }
        let guard = device.acquire("tracking")?;

        let shared = Arc::new(LoopShared {
            running: AtomicBool::new(true),
            stats: Mutex::new(TrackingStats::default()),
            poses: RwLock::new(Vec::new()),
            fatal: Mutex::new(None),
        });

        let worker = Worker {
            tracker: MarkerTracker::new(config.hysteresis_mm),
            config,
            source,
            calibration,
            detector: MarkerDetector::new(detector),
            overlay,
            shared: Arc::clone(&shared),
            undistort: None,
            pending_clears: Vec::new(),
            _device: guard,
        };

        let thread_handle = std::thread::Builder::new()
            .name("tracking-loop".into())
            .spawn(move || worker.run())
            .map_err(|e| RuntimeError::CaptureFailed(format!("failed to spawn tracking thread: {}", e)))?;

        log::info!("Tracking loop started");
        Ok(Self {
            shared,
            thread_handle: Some(thread_handle),
        })
    }

    /// False once stopped or after a fatal error.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> TrackingStats {
        *self.shared.stats.lock()
    }

    /// Markers tracked after the last completed cycle, in id order.
    pub fn current_poses(&self) -> Vec<TrackedMarker> {
        self.shared.poses.read().clone()
    }

    /// Nearest tracked marker to a table position (mm) within a Manhattan
    /// distance.
    pub fn query(&self, position: &Point2<f64>, max_distance: f64) -> Option<TrackedMarker> {
        let poses = self.shared.poses.read();
        nearest(poses.iter(), position, max_distance).copied()
    }

    /// The error that ended the loop, if any.
    pub fn fatal_error(&self) -> Option<RuntimeError> {
        self.shared.fatal.lock().clone()
    }

    /// Stop at the next cycle boundary and wait for the thread. Returns the
    /// final counters, or the fatal error that ended the loop early.
    pub fn stop(mut self) -> Result<TrackingStats, RuntimeError> {
        self.shutdown();
        match self.fatal_error() {
            Some(e) => Err(e),
            None => Ok(self.stats()),
        }
    }

    fn shutdown(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                log::error!("Tracking thread panicked");
            }
            log::info!("Tracking loop stopped");
        }
    }
}

impl Drop for TrackingLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TrackingLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingLoop")
            .field("running", &self.is_running())
            .field("stats", &self.stats())
            .finish()
    }
}

enum CycleOutcome {
    Completed,
    Abandoned,
}

struct Worker<S> {
    config: TrackingConfig,
    source: S,
    calibration: SharedCalibration,
    detector: MarkerDetector,
    overlay: OverlaySender,
    shared: Arc<LoopShared>,
    tracker: MarkerTracker,
    /// Undistortion map and the bundle version it was built for.
    undistort: Option<(u64, UndistortMap)>,
    /// Clears owed to the presentation layer after a calibration change.
    pending_clears: Vec<u16>,
    _device: DeviceGuard,
}

impl<S: FrameSource> Worker<S> {
    fn run(mut self) {
        let timeout = Duration::from_millis(self.config.capture_timeout_ms);
        let mut cycle: u64 = 0;

        while self.shared.running.load(Ordering::Acquire) {
            cycle += 1;
            self.shared.stats.lock().cycles = cycle;

            let frame = match self.source.next_frame(timeout) {
                Ok(frame) => frame,
                Err(e) => {
                    if self.capture_failed(e) {
                        break;
                    }
                    continue;
                }
            };
            let received = Instant::now();

            let (version, bundle) = self.calibration.versioned_snapshot();
            let Some(bundle) = bundle else {
                log::error!("Calibration removed while tracking");
                self.fail(RuntimeError::CalibrationMissing);
                break;
            };

            match self.process(cycle, &frame, version, &bundle, received) {
                Ok(CycleOutcome::Completed) => {
                    let mut stats = self.shared.stats.lock();
                    stats.completed += 1;
                    stats.consecutive_failures = 0;
                    stats.markers = self.tracker.len();
                }
                Ok(CycleOutcome::Abandoned) => {
                    let mut stats = self.shared.stats.lock();
                    stats.abandoned += 1;
                    stats.consecutive_failures = 0;
                }
                Err(e) => {
                    if self.capture_failed(e) {
                        break;
                    }
                }
            }
        }

        self.shared.running.store(false, Ordering::Release);
    }

    /// Count a failed capture. Returns true when the device is lost.
    fn capture_failed(&mut self, error: RuntimeError) -> bool {
        let consecutive = {
            let mut stats = self.shared.stats.lock();
            stats.capture_failures += 1;
            stats.consecutive_failures += 1;
            stats.consecutive_failures
        };
        if consecutive >= self.config.max_consecutive_failures {
            log::error!(
                "Camera {} lost after {} consecutive failures: {}",
                self.source.name(),
                consecutive,
                error
            );
            self.fail(RuntimeError::DeviceLost {
                consecutive_failures: consecutive,
            });
            return true;
        }
        log::warn!("Capture failed on {}: {}", self.source.name(), error);
        false
    }

    fn fail(&self, error: RuntimeError) {
        *self.shared.fatal.lock() = Some(error);
        self.shared.running.store(false, Ordering::Release);
    }

    fn process(
        &mut self,
        cycle: u64,
        frame: &Frame,
        version: u64,
        bundle: &CalibrationBundle,
        received: Instant,
    ) -> Result<CycleOutcome, RuntimeError> {
        let camera = bundle.camera();
        if (frame.width, frame.height) != camera.image_size() {
            let (w, h) = camera.image_size();
            return Err(RuntimeError::CaptureFailed(format!(
                "frame is {}x{}, calibration expects {}x{}",
                frame.width, frame.height, w, h
            )));
        }

        if self.undistort.as_ref().map(|(v, _)| *v) != Some(version) {
            if self.undistort.is_some() {
                log::info!("Calibration changed (version {}), resetting tracked markers", version);
                self.pending_clears.extend(self.tracker.clear());
            }
            self.undistort = Some((version, UndistortMap::new(camera)));
        }

        let raw = frame
            .to_luma()
            .map_err(|e| RuntimeError::CaptureFailed(e.to_string()))?;
        let rectified = match &self.undistort {
            Some((_, map)) => map
                .remap(&raw)
                .map_err(|e| RuntimeError::CaptureFailed(e.to_string()))?,
            None => raw,
        };
        let detections = self
            .detector
            .detect_with_pose(&rectified, camera, bundle.table());

        let deadline = Duration::from_millis(self.config.cycle_deadline_ms);
        let elapsed = received.elapsed();
        if elapsed > deadline {
            log::debug!(
                "Cycle {} abandoned after {:.1} ms (frame {})",
                cycle,
                elapsed.as_secs_f64() * 1000.0,
                frame.sequence
            );
            return Ok(CycleOutcome::Abandoned);
        }

        let observations: Vec<Observation> = detections
            .iter()
            .filter_map(|d| self.observe(d, bundle))
            .collect();
        let update = self.tracker.update(cycle, &observations);

        let mut batch = RenderBatch::new(cycle);
        for marker in &update.present {
            batch.commands.push(RenderCommand::DrawOverlay {
                marker_id: marker.id,
                shape: DrawCommand::Ring {
                    center: marker.projector_px,
                    radius: marker.radius_px,
                    rotation: marker.pose.rotation,
                },
            });
        }
        let owed = std::mem::take(&mut self.pending_clears);
        for marker_id in update.removed.into_iter().chain(owed) {
            if !batch.commands.iter().any(|c| c.marker_id() == marker_id) {
                batch.commands.push(RenderCommand::ClearOverlay { marker_id });
            }
        }

        *self.shared.poses.write() = update.present;
        self.overlay.publish(batch);
        Ok(CycleOutcome::Completed)
    }

    /// Map a detection with a table pose into projector space.
    fn observe(&self, detection: &Detection, bundle: &CalibrationBundle) -> Option<Observation> {
        let pose: MarkerPose = *detection.pose()?;
        let projector_px = bundle.table_to_projector(&pose.position)?;
        let heading = Vector2::new(pose.rotation.cos(), pose.rotation.sin());
        let edge = bundle.table_to_projector(&(pose.position + heading * pose.size_mm))?;
        let radius_px = (edge - projector_px).norm() * self.config.overlay_radius_scale;
        Some(Observation {
            id: detection.identity(),
            pose,
            projector_px,
            radius_px,
        })
    }
}
