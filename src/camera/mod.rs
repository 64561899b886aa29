//! Camera intrinsics, the radial distortion model and the depth ray table.
//!
//! The engine works with a single camera model: a pinhole camera with a
//! two-term radial distortion polynomial `1 + k1·r² + k2·r⁴` applied to
//! normalised image coordinates. [`CameraIntrinsics`] carries the six
//! parameters, [`RadialModel`] pairs them with an image [`Resolution`] and
//! implements the [`CameraModel`] trait, and [`DepthSpaceTable`] caches the
//! per-pixel undistorted rays of a calibrated depth camera.

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

pub mod depth_table;
pub mod radial;

pub use depth_table::DepthSpaceTable;
pub use radial::RadialModel;

/// Pinhole intrinsics with two radial distortion coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub k1: f64,
    pub k2: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(thiserror::Error, Debug)]
pub enum CameraModelError {
    #[error("Cannot project point ({x}, {y}, {z}): z is zero or a coordinate is not finite")]
    DegenerateProjection { x: f64, y: f64, z: f64 },
    #[error("Focal length must be positive")]
    FocalLengthMustBePositive,
    #[error("Principal point must be finite")]
    PrincipalPointMustBeFinite,
    #[error("Invalid camera parameters: {0}")]
    InvalidParams(String),
    #[error("Failed to load YAML: {0}")]
    YamlError(String),
    #[error("IO Error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for CameraModelError {
    fn from(err: std::io::Error) -> Self {
        CameraModelError::IOError(err.to_string())
    }
}

impl From<yaml_rust::ScanError> for CameraModelError {
    fn from(err: yaml_rust::ScanError) -> Self {
        CameraModelError::YamlError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CameraModelError {
    fn from(err: serde_yaml::Error) -> Self {
        CameraModelError::YamlError(err.to_string())
    }
}

/// Trait defining the core functionality for camera models
pub trait CameraModel {
    /// Project a 3D point in camera coordinates to distorted pixel coordinates
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError>;

    /// Unproject a distorted pixel to a unit-length ray in camera coordinates
    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError>;

    /// Load camera parameters from a YAML file
    fn load_from_yaml(path: &str) -> Result<Self, CameraModelError>
    where
        Self: Sized;

    /// Save camera parameters to a YAML file
    fn save_to_yaml(&self, path: &str) -> Result<(), CameraModelError>;

    /// Validate camera parameters
    fn validate_params(&self) -> Result<(), CameraModelError>;

    fn get_resolution(&self) -> Resolution;

    fn get_intrinsics(&self) -> CameraIntrinsics;
}

/// Common validation functions for camera parameters
pub mod validation {
    use super::*;

    pub fn validate_intrinsics(intrinsics: &CameraIntrinsics) -> Result<(), CameraModelError> {
        if !(intrinsics.fx > 0.0 && intrinsics.fy > 0.0) {
            return Err(CameraModelError::FocalLengthMustBePositive);
        }
        if !intrinsics.cx.is_finite() || !intrinsics.cy.is_finite() {
            return Err(CameraModelError::PrincipalPointMustBeFinite);
        }
        if !intrinsics.k1.is_finite() || !intrinsics.k2.is_finite() {
            return Err(CameraModelError::InvalidParams(format!(
                "Distortion coefficients must be finite (k1 = {}, k2 = {})",
                intrinsics.k1, intrinsics.k2
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_intrinsics() {
        let mut intrinsics = CameraIntrinsics::new(360.0, 360.0, 256.0, 212.0);
        assert!(validation::validate_intrinsics(&intrinsics).is_ok());

        intrinsics.fy = 0.0;
        assert!(matches!(
            validation::validate_intrinsics(&intrinsics),
            Err(CameraModelError::FocalLengthMustBePositive)
        ));

        intrinsics.fy = f64::NAN;
        assert!(matches!(
            validation::validate_intrinsics(&intrinsics),
            Err(CameraModelError::FocalLengthMustBePositive)
        ));

        intrinsics.fy = 360.0;
        intrinsics.cx = f64::INFINITY;
        assert!(matches!(
            validation::validate_intrinsics(&intrinsics),
            Err(CameraModelError::PrincipalPointMustBeFinite)
        ));

        intrinsics.cx = 256.0;
        intrinsics.k2 = f64::NAN;
        assert!(matches!(
            validation::validate_intrinsics(&intrinsics),
            Err(CameraModelError::InvalidParams(_))
        ));
    }
}
