//! Frame source that replays still images from a directory.

use super::frame::{Frame, FrameSource};
use crate::error::{ConfigurationError, RuntimeError};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// Replays image files in lexicographic order as camera frames.
pub struct ImageSequenceSource {
    name: String,
    paths: Vec<PathBuf>,
    next_index: usize,
    looping: bool,
    sequence: u64,
    start_time: Instant,
}

impl ImageSequenceSource {
    /// Collect every PNG/JPEG file in `dir`.
    ///
    /// A directory that cannot be read or holds no images is a missing
    /// device.
    pub fn from_dir(dir: &Path) -> crate::error::Result<Self> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            log::warn!("Cannot read frame directory {}: {}", dir.display(), e);
            ConfigurationError::MissingDevice
        })?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();
        if paths.is_empty() {
            log::warn!("No PNG/JPEG frames in {}", dir.display());
            return Err(ConfigurationError::MissingDevice.into());
        }
        log::info!("Replay source: {} frames from {}", paths.len(), dir.display());
        Ok(Self::from_paths(dir.display().to_string(), paths))
    }

    pub fn from_paths(name: impl Into<String>, paths: Vec<PathBuf>) -> Self {
        Self {
            name: name.into(),
            paths,
            next_index: 0,
            looping: false,
            sequence: 0,
            start_time: Instant::now(),
        }
    }

    /// Restart from the first image after the last one.
    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Frames left before the sequence ends (ignores looping).
    pub fn remaining(&self) -> usize {
        self.paths.len().saturating_sub(self.next_index)
    }
}

impl FrameSource for ImageSequenceSource {
    fn next_frame(&mut self, _timeout: Duration) -> Result<Frame, RuntimeError> {
        if self.next_index >= self.paths.len() {
            if self.looping && !self.paths.is_empty() {
                self.next_index = 0;
            } else {
                return Err(RuntimeError::CaptureFailed(format!(
                    "end of image sequence '{}'",
                    self.name
                )));
            }
        }
        let path = &self.paths[self.next_index];
        self.next_index += 1;

        let image = image::open(path)
            .map_err(|e| RuntimeError::CaptureFailed(format!("{}: {}", path.display(), e)))?
            .to_luma8();
        self.sequence += 1;
        Ok(Frame::from_gray(image)
            .with_sequence(self.sequence)
            .with_timestamp(self.start_time.elapsed()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
