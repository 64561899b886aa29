//! RGB-D Calibration Library
//!
//! Geometric calibration of a depth + color camera rig, and of a projector by
//! the same method, from 3D↔2D point correspondences. The library provides:
//! - A pinhole camera model with two-term radial distortion and its iterative inverse
//! - A per-pixel undistorted ray table for the depth camera
//! - Linear pose initialisation with the Direct Linear Transform
//! - A stepwise Levenberg-Marquardt solver over generic residual functions
//! - The calibration pipeline producing intrinsics, the depth→color pose and
//!   reprojection errors
//!
//! An optional polish hands the final reprojection costs to the tiny-solver
//! optimization framework.

pub mod calibration;
pub mod camera;
pub mod error;
pub mod geometry;
pub mod optimization;

// Re-export commonly used types
pub use calibration::{
    CalibrationConfig, CalibrationProcedure, CalibrationResult, CalibrationStage,
};
pub use camera::{
    CameraIntrinsics, CameraModel, CameraModelError, DepthSpaceTable, RadialModel, Resolution,
};
pub use error::CalibrationError;
pub use geometry::{Correspondence, Pose, PoseEstimator, ProjectionError};
pub use optimization::{
    LevenbergMarquardtSolver, ResidualFunction, SolverConfig, SolverReport, SolverState,
};
