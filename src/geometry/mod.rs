//! Correspondences, rigid poses, linear pose estimation and reprojection statistics.

use crate::camera::CameraIntrinsics;
use crate::error::CalibrationError;
use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod dlt;
pub mod pose;
pub mod synthetic;

pub use dlt::{DltConfig, PoseEstimator};
pub use pose::Pose;

/// One calibration sample: a point in depth-camera space and the pixels that observed it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Correspondence {
    /// 3D point in the depth camera's frame.
    pub world: Vector3<f64>,
    /// Distorted pixel in the depth image.
    pub depth_pixel: Vector2<f64>,
    /// Distorted pixel in the color image, if the point was seen there.
    pub color_pixel: Option<Vector2<f64>>,
}

impl Correspondence {
    pub fn new(world: Vector3<f64>, depth_pixel: Vector2<f64>) -> Self {
        Correspondence {
            world,
            depth_pixel,
            color_pixel: None,
        }
    }

    pub fn with_color(mut self, color_pixel: Vector2<f64>) -> Self {
        self.color_pixel = Some(color_pixel);
        self
    }
}

#[derive(Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProjectionError {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
}

impl fmt::Debug for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Projection Error [ rmse: {}, min: {}, max: {}, mean: {}, stddev: {}, median: {} ]",
            self.rmse, self.min, self.max, self.mean, self.stddev, self.median
        )
    }
}

/// Checks that world points and pixels pair up and are non-empty.
pub(crate) fn check_pairs(
    world_points: &[Vector3<f64>],
    pixels: &[Vector2<f64>],
) -> Result<(), CalibrationError> {
    if world_points.len() != pixels.len() {
        return Err(CalibrationError::InvalidInput(format!(
            "Number of 3D points ({}) and 2D points ({}) must match",
            world_points.len(),
            pixels.len()
        )));
    }
    if world_points.is_empty() {
        return Err(CalibrationError::InvalidInput(
            "Points arrays cannot be empty".to_string(),
        ));
    }
    Ok(())
}

/// Pixel reprojection statistics of `world_points` seen through `pose` and `intrinsics`.
///
/// Use [`Pose::identity`] for the depth camera, whose points already live in
/// its own frame. Only used for validation; nothing is fed back into the
/// optimisation.
///
/// # Errors
///
/// * [`CalibrationError::InvalidInput`] for empty or mismatched inputs.
/// * [`CalibrationError::Camera`] if a transformed point has `z == 0`.
pub fn compute_reprojection_error(
    world_points: &[Vector3<f64>],
    pixels: &[Vector2<f64>],
    intrinsics: &CameraIntrinsics,
    pose: &Pose,
) -> Result<ProjectionError, CalibrationError> {
    check_pairs(world_points, pixels)?;

    let mut errors = world_points
        .iter()
        .zip(pixels)
        .map(|(world, observed)| -> Result<f64, CalibrationError> {
            let predicted = intrinsics.project(&pose.transform_point(world))?;
            Ok((predicted - observed).norm())
        })
        .collect::<Result<Vec<f64>, _>>()?;

    let n = errors.len() as f64;
    let sum_squared: f64 = errors.iter().map(|e| e * e).sum();
    let mean = errors.iter().sum::<f64>() / n;
    let variance = errors.iter().map(|e| (e - mean) * (e - mean)).sum::<f64>() / n;

    errors.sort_by(|a, b| a.total_cmp(b));
    let median = if errors.len() % 2 == 0 {
        (errors[errors.len() / 2 - 1] + errors[errors.len() / 2]) / 2.0
    } else {
        errors[errors.len() / 2]
    };

    Ok(ProjectionError {
        rmse: (sum_squared / n).sqrt(),
        min: errors[0],
        max: errors[errors.len() - 1],
        mean,
        stddev: variance.sqrt(),
        median,
    })
}
