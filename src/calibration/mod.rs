//! The rig calibration pipeline.
//!
//! [`CalibrationProcedure`] runs the stages in order: depth intrinsics with the
//! identity pose, then color intrinsics and the depth→color pose seeded by the
//! DLT, then reprojection statistics for both cameras. Settings come from a
//! [`CalibrationConfig`], usually loaded from YAML.

use crate::camera::{CameraIntrinsics, CameraModelError, Resolution};
use crate::error::CalibrationError;
use crate::geometry::{DltConfig, Pose, ProjectionError};
use crate::optimization::{SolverConfig, SolverReport};

use nalgebra::Matrix4;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;

pub mod procedure;

pub use procedure::{
    compose_depth_to_color, CalibrationProcedure, CameraCalibration, DepthCalibration,
};

/// Settings of a calibration run. Every field has a default, so a YAML file
/// only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub depth_resolution: Resolution,
    /// Starting point of the depth intrinsics solve.
    pub depth_seed: CameraIntrinsics,
    /// Intrinsics used to undistort color pixels for the DLT and to start the
    /// color solve.
    pub color_seed: CameraIntrinsics,
    pub solver: SolverConfig,
    pub dlt: DltConfig,
    /// Re-run each stage with `tiny_solver` and keep the result if it fits better.
    pub polish_with_batch_solver: bool,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        CalibrationConfig {
            depth_resolution: Resolution {
                width: 512,
                height: 424,
            },
            depth_seed: CameraIntrinsics::new(365.0, 365.0, 256.0, 212.0),
            color_seed: CameraIntrinsics::new(1080.0, 1080.0, 960.0, 540.0),
            solver: SolverConfig::default(),
            dlt: DltConfig::default(),
            polish_with_batch_solver: false,
        }
    }
}

impl CalibrationConfig {
    /// Loads the settings from a YAML file.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::Camera`] wrapping an IO or YAML error.
    pub fn load_from_yaml(path: &str) -> Result<Self, CalibrationError> {
        let contents = fs::read_to_string(path).map_err(CameraModelError::from)?;
        Self::from_yaml_str(&contents)
    }

    /// # Errors
    ///
    /// [`CalibrationError::Camera`] wrapping the YAML error.
    pub fn from_yaml_str(contents: &str) -> Result<Self, CalibrationError> {
        let config: CalibrationConfig =
            serde_yaml::from_str(contents).map_err(CameraModelError::from)?;
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> Result<String, CalibrationError> {
        Ok(serde_yaml::to_string(self).map_err(CameraModelError::from)?)
    }
}

/// The stage a progress callback is reporting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationStage {
    DepthIntrinsics,
    ColorIntrinsicsAndPose,
    ProjectorIntrinsicsAndPose,
}

impl fmt::Display for CalibrationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CalibrationStage::DepthIntrinsics => "depth intrinsics",
            CalibrationStage::ColorIntrinsicsAndPose => "color intrinsics and pose",
            CalibrationStage::ProjectorIntrinsicsAndPose => "projector intrinsics and pose",
        };
        f.write_str(name)
    }
}

/// Everything a depth+color calibration produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub depth_intrinsics: CameraIntrinsics,
    pub color_intrinsics: CameraIntrinsics,
    /// Maps depth-camera points into the color camera frame.
    pub depth_to_color: Pose,
    /// `[R | t; 0 0 0 1]` of `depth_to_color`.
    pub depth_to_color_matrix: Matrix4<f64>,
    /// Pixel RMS of the depth camera over all correspondences.
    pub depth_rms: f64,
    /// Pixel RMS of the color camera over the correspondences it observed.
    pub color_rms: f64,
    pub depth_error: ProjectionError,
    pub color_error: ProjectionError,
    pub depth_report: SolverReport,
    pub color_report: SolverReport,
}
