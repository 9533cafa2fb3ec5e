//! Camera model and frame input.
//!
//! Provides the calibrated lens model, whole-frame undistortion and the
//! pull-based frame sources the tracking loop reads from.

mod frame;
mod model;
mod replay;
mod undistort;

pub use frame::{DeviceGuard, DeviceLock, Frame, FrameSource, LatestFrameSlot, PixelFormat};
pub use model::{CameraModel, DepthPlane, Distortion, Intrinsics};
pub use replay::ImageSequenceSource;
pub use undistort::{sample_bilinear, UndistortMap};
