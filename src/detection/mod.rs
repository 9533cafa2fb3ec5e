//! Fiducial marker detection.
//!
//! Each frame is processed independently; identity continuity across frames
//! is left to the tracking layer.

mod codec;
mod components;
mod detector;
mod quad;
mod subpix;
mod threshold;

pub use codec::{crc16_ccitt, CellGrid, MarkerCodec, GRID_CELLS};
pub use components::{find_components, Component, UnionFind};
pub use detector::{Corners, Detection, DetectorParams, MarkerDetector, MarkerPose, Roi};
pub use quad::{fit_quad, FitQuadConfig, Quad};
pub use subpix::{refine_corner, RefinedCorner, SubPixConfig};
pub use threshold::{adaptive_threshold, DarkMask};
