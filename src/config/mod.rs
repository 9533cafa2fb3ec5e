//! Configuration and serialization module.

use crate::calibration::{CameraCalibrationConfig, ProjectorCalibrationConfig};
use crate::detection::DetectorParams;
use crate::error::ConfigurationError;
use crate::store::CalibrationStore;
use crate::tracking::TrackingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Tracker configuration. Every field has a default, so a partial file (or
/// `{}`) is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub camera_calibration: CameraCalibrationConfig,
    pub projector_calibration: ProjectorCalibrationConfig,
    pub detector: DetectorParams,
    pub tracking: TrackingConfig,
    /// Bundle location. Defaults to the platform configuration directory.
    pub store_path: Option<PathBuf>,
    /// Camera raster width.
    pub camera_width: u32,
    /// Camera raster height.
    pub camera_height: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            camera_calibration: CameraCalibrationConfig::default(),
            projector_calibration: ProjectorCalibrationConfig::default(),
            detector: DetectorParams::default(),
            tracking: TrackingConfig::default(),
            store_path: None,
            camera_width: 1280,
            camera_height: 720,
        }
    }
}

impl TrackerConfig {
    /// Reject values no session or loop could run with.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |msg: &str| Err(ConfigurationError::InvalidConfig(msg.to_string()));
        if self.camera_width == 0 || self.camera_height == 0 {
            return invalid("camera resolution must be non-zero");
        }
        let cam = &self.camera_calibration;
        if cam.min_samples < 2 {
            return invalid("camera_calibration.min_samples must be at least 2");
        }
        if !(cam.max_rms_px > 0.0) {
            return invalid("camera_calibration.max_rms_px must be positive");
        }
        cam.board
            .validate()
            .map_err(|e| ConfigurationError::InvalidConfig(format!("camera_calibration.board: {}", e)))?;

        let proj = &self.projector_calibration;
        if proj.projector_width == 0 || proj.projector_height == 0 {
            return invalid("projector resolution must be non-zero");
        }
        if proj.max_rounds == 0 {
            return invalid("projector_calibration.max_rounds must be at least 1");
        }
        if !(proj.tolerance_px > 0.0) || !(proj.outlier_threshold_px > 0.0) {
            return invalid("projector thresholds must be positive");
        }

        let tracking = &self.tracking;
        if tracking.max_consecutive_failures == 0 {
            return invalid("tracking.max_consecutive_failures must be at least 1");
        }
        if !(tracking.hysteresis_mm >= 0.0) {
            return invalid("tracking.hysteresis_mm must not be negative");
        }
        Ok(())
    }

    /// The calibration store this configuration points at.
    pub fn store(&self) -> Result<CalibrationStore, ConfigurationError> {
        self.store_path
            .clone()
            .or_else(CalibrationStore::default_path)
            .map(CalibrationStore::new)
            .ok_or_else(|| {
                ConfigurationError::InvalidConfig(
                    "no store_path configured and no platform config directory".to_string(),
                )
            })
    }
}

/// Load and validate a JSON configuration file.
pub fn load_config(path: &Path) -> Result<TrackerConfig, ConfigurationError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| ConfigurationError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
    let config: TrackerConfig = serde_json::from_str(&contents)
        .map_err(|e| ConfigurationError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
    config.validate()?;
    Ok(config)
}

/// Write a configuration as pretty-printed JSON.
pub fn save_config(config: &TrackerConfig, path: &Path) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(config)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    std::fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config: TrackerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, TrackerConfig::default());
        assert_eq!(config.camera_calibration.min_samples, 8);
        assert_eq!(config.camera_calibration.max_rms_px, 0.5);
        assert_eq!(config.tracking.cycle_deadline_ms, 50);
        assert_eq!(config.projector_calibration.max_rounds, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_sections_merge_with_defaults() {
        let json = r#"{
            "tracking": { "hysteresis_mm": 2.5 },
            "detector": { "allow_mirrored": true },
            "store_path": "/tmp/bundle.json"
        }"#;
        let config: TrackerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.tracking.hysteresis_mm, 2.5);
        assert_eq!(config.tracking.capture_timeout_ms, 100);
        assert!(config.detector.allow_mirrored);
        assert_eq!(config.store().unwrap().path(), Path::new("/tmp/bundle.json"));
    }

    #[test]
    fn test_validation_rejects_nonsense() {
        let mut config = TrackerConfig::default();
        config.tracking.max_consecutive_failures = 0;
        assert!(matches!(config.validate(), Err(ConfigurationError::InvalidConfig(_))));

        let mut config = TrackerConfig::default();
        config.projector_calibration.tolerance_px = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.json");
        let mut config = TrackerConfig::default();
        config.camera_width = 1920;
        config.camera_height = 1080;
        save_config(&config, &path).unwrap();
        assert_eq!(load_config(&path).unwrap(), config);

        std::fs::write(&path, "{ \"tracking\": 7 }").unwrap();
        assert!(matches!(load_config(&path), Err(ConfigurationError::InvalidConfig(_))));
    }
}
