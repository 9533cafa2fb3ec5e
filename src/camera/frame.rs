//! Camera frames, the pull-based frame source interface and device ownership.

use crate::error::{DetectionError, RuntimeError};
use bytes::Bytes;
use image::GrayImage;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Raster layout of frame data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Gray8,
    Rgb8,
    Rgba8,
    Bgra8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb8 => 3,
            PixelFormat::Rgba8 | PixelFormat::Bgra8 => 4,
        }
    }
}

/// Video frame captured from the camera.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    pub format: PixelFormat,
    /// Tightly packed pixel data.
    pub data: Bytes,
    /// Monotonic frame number assigned by the source.
    pub sequence: u64,
    /// Capture time from stream start.
    pub timestamp: Duration,
}

impl Frame {
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Bytes,
    ) -> Result<Self, DetectionError> {
        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if width == 0 || height == 0 || data.len() != expected {
            return Err(DetectionError::InvalidFrame(format!(
                "{}x{} {:?} needs {} bytes, got {}",
                width,
                height,
                format,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            format,
            data,
            sequence: 0,
            timestamp: Duration::ZERO,
        })
    }

    /// Wrap a grayscale image.
    pub fn from_gray(image: GrayImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            format: PixelFormat::Gray8,
            data: Bytes::from(image.into_raw()),
            sequence: 0,
            timestamp: Duration::ZERO,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_timestamp(mut self, timestamp: Duration) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Luminance view of the frame (BT.601 weights for color formats).
    pub fn to_luma(&self) -> Result<GrayImage, DetectionError> {
        let bpp = self.format.bytes_per_pixel();
        let pixels = self.width as usize * self.height as usize;
        if self.data.len() < pixels * bpp {
            return Err(DetectionError::InvalidFrame(format!(
                "truncated frame data ({} bytes)",
                self.data.len()
            )));
        }
        let luma: Vec<u8> = match self.format {
            PixelFormat::Gray8 => self.data[..pixels].to_vec(),
            PixelFormat::Rgb8 | PixelFormat::Rgba8 => self
                .data
                .chunks_exact(bpp)
                .take(pixels)
                .map(|c| luma_of(c[0], c[1], c[2]))
                .collect(),
            PixelFormat::Bgra8 => self
                .data
                .chunks_exact(bpp)
                .take(pixels)
                .map(|c| luma_of(c[2], c[1], c[0]))
                .collect(),
        };
        GrayImage::from_raw(self.width, self.height, luma)
            .ok_or_else(|| DetectionError::InvalidFrame("frame size overflow".to_string()))
    }
}

fn luma_of(r: u8, g: u8, b: u8) -> u8 {
    (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32).round() as u8
}

/// A camera device with a pull-based "next frame" capability.
pub trait FrameSource: Send {
    /// Block until the next frame arrives or `timeout` elapses.
    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, RuntimeError>;

    /// Human-readable device name for logs.
    fn name(&self) -> &str {
        "camera"
    }
}

impl FrameSource for Box<dyn FrameSource> {
    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, RuntimeError> {
        (**self).next_frame(timeout)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Shared state between the capture producer and the consumer.
struct SlotState {
    current_frame: Mutex<Option<Frame>>,
    frame_ready: Condvar,
    closed: AtomicBool,
    frame_count: AtomicU64,
    dropped_count: AtomicU64,
}

/// Single-frame mailbox between a capture thread and the tracking loop.
///
/// Publishing replaces any frame the consumer has not taken yet, so at most
/// one frame is ever pending.
#[derive(Clone)]
pub struct LatestFrameSlot {
    state: Arc<SlotState>,
    name: String,
}

impl LatestFrameSlot {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            state: Arc::new(SlotState {
                current_frame: Mutex::new(None),
                frame_ready: Condvar::new(),
                closed: AtomicBool::new(false),
                frame_count: AtomicU64::new(0),
                dropped_count: AtomicU64::new(0),
            }),
            name: name.into(),
        }
    }

    /// Hand a freshly captured frame to the consumer.
    pub fn publish(&self, mut frame: Frame) {
        let seq = self.state.frame_count.fetch_add(1, Ordering::AcqRel);
        if frame.sequence == 0 {
            frame.sequence = seq + 1;
        }
        let mut current = self.state.current_frame.lock();
        if current.replace(frame).is_some() {
            self.state.dropped_count.fetch_add(1, Ordering::Relaxed);
        }
        drop(current);
        self.state.frame_ready.notify_one();
    }

    /// Mark the device as gone; waiting consumers fail immediately.
    pub fn close(&self) {
        self.state.closed.store(true, Ordering::Release);
        self.state.frame_ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Number of frames published so far.
    pub fn frame_count(&self) -> u64 {
        self.state.frame_count.load(Ordering::Acquire)
    }

    /// Frames overwritten before being consumed.
    pub fn dropped_count(&self) -> u64 {
        self.state.dropped_count.load(Ordering::Acquire)
    }
}

impl FrameSource for LatestFrameSlot {
    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, RuntimeError> {
        let deadline = Instant::now() + timeout;
        let mut current = self.state.current_frame.lock();
        loop {
            if let Some(frame) = current.take() {
                return Ok(frame);
            }
            if self.state.closed.load(Ordering::Acquire) {
                return Err(RuntimeError::CaptureFailed(format!(
                    "'{}' was closed",
                    self.name
                )));
            }
            if self
                .state
                .frame_ready
                .wait_until(&mut current, deadline)
                .timed_out()
            {
                return current.take().ok_or(RuntimeError::CaptureTimeout);
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Exclusive ownership of the camera device.
///
/// Calibration sessions and the tracking loop each hold a [`DeviceGuard`]
/// while they use the camera.
#[derive(Clone, Default)]
pub struct DeviceLock {
    holder: Arc<Mutex<Option<String>>>,
}

impl DeviceLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the device for `owner`, failing with `DeviceBusy` if held.
    pub fn acquire(&self, owner: &str) -> Result<DeviceGuard, RuntimeError> {
        let mut holder = self.holder.lock();
        if let Some(current) = holder.as_deref() {
            log::debug!("Camera device requested by {} but held by {}", owner, current);
            return Err(RuntimeError::DeviceBusy);
        }
        *holder = Some(owner.to_string());
        Ok(DeviceGuard {
            holder: Arc::clone(&self.holder),
        })
    }

    /// Who currently holds the device.
    pub fn holder(&self) -> Option<String> {
        self.holder.lock().clone()
    }
}

/// Releases the device when dropped.
pub struct DeviceGuard {
    holder: Arc<Mutex<Option<String>>>,
}

impl std::fmt::Debug for DeviceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceGuard")
            .field("holder", &*self.holder.lock())
            .finish()
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        self.holder.lock().take();
    }
}
