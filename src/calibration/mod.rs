//! Camera and projector calibration.

mod camera_session;
mod homography;
mod intrinsics;
mod jacobian;
mod pattern;
mod pose;
mod projector;

pub use camera_session::{
    CameraCalibrationConfig, CameraCalibrationState, CameraCalibrator, Diversity,
};
pub use homography::{
    estimate_dlt, refine_homography, Correspondence, Homography, HomographyComputer,
    HomographyResult,
};
pub use intrinsics::{calibrate_planar, zhang_intrinsics, IntrinsicsSolution};
pub use pattern::{CalibrationSample, MarkerBoard, RejectReason, SampleVerdict};
pub use pose::{params_to_pose, pose_from_homography, pose_to_params, refine_pose};
pub use projector::{
    ProjectionRound, ProjectorCalibrationConfig, ProjectorCalibrationState, ProjectorCalibrator,
    ProjectorTarget, RoundOutcome,
};
