//! Persistent calibration storage.

mod bundle;
mod shared;

pub use bundle::{CalibrationBundle, FORMAT_VERSION};
pub use shared::SharedCalibration;

use crate::error::PersistenceError;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// File name of the bundle inside the configuration directory.
pub const BUNDLE_FILE: &str = "calibration.json";

/// Saves and loads the calibration bundle at a fixed path.
#[derive(Debug, Clone)]
pub struct CalibrationStore {
    path: PathBuf,
}

impl CalibrationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config dir>/tablemap-tracker/calibration.json`, if the platform has
    /// a configuration directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("tablemap-tracker").join(BUNDLE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Write the bundle atomically: a crash leaves either the old or the new
    /// bundle on disk, never a mix.
    pub fn save(&self, bundle: &CalibrationBundle) -> Result<(), PersistenceError> {
        let json = bundle.to_json()?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.temp_path();
        let written = (|| -> std::io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        log::info!("Saved calibration bundle to {:?}", self.path);
        Ok(())
    }

    /// Load and validate the bundle.
    pub fn load(&self) -> Result<CalibrationBundle, PersistenceError> {
        let json = match fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PersistenceError::NotFound(self.path.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        let bundle = CalibrationBundle::from_json(&json)?;
        log::info!("Loaded calibration bundle from {:?}", self.path);
        Ok(bundle)
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| BUNDLE_FILE.into());
        name.push(format!(".{}.tmp", std::process::id()));
        self.path.with_file_name(name)
    }
}
