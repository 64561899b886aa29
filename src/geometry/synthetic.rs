//! Synthetic depth+color rigs with known ground truth.
//!
//! Points are spread over the depth camera's field of view with a Halton
//! sequence, so they are deterministic, well distributed and never coplanar.

use crate::camera::CameraIntrinsics;
use crate::error::CalibrationError;
use crate::geometry::{Correspondence, Pose};
use nalgebra::Vector3;

/// Ground-truth calibration of a simulated rig.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyntheticRig {
    pub depth: CameraIntrinsics,
    pub color: CameraIntrinsics,
    /// Maps depth-camera points into the color camera frame.
    pub depth_to_color: Pose,
}

impl SyntheticRig {
    /// A 512×424 depth camera next to a 1920×1080 color camera.
    pub fn kinect_like() -> Self {
        SyntheticRig {
            depth: CameraIntrinsics::new(360.0, 360.0, 256.0, 212.0),
            color: CameraIntrinsics::new(1081.37, 1081.37, 959.5, 539.5).with_distortion(0.02, -0.01),
            depth_to_color: Pose::from_rotation_vector(
                &Vector3::new(0.012, -0.021, 0.004),
                Vector3::new(-0.052, 0.0015, 0.0021),
            ),
        }
    }

    /// Noise-free correspondences for `count` points between 0.8 m and 4 m.
    ///
    /// # Errors
    ///
    /// Propagates projection failures, which cannot happen for points in front
    /// of both cameras.
    pub fn correspondences(&self, count: usize) -> Result<Vec<Correspondence>, CalibrationError> {
        scattered_points(count, 0.8, 4.0, 0.65, 0.45)
            .into_iter()
            .map(|world| {
                let depth_pixel = self.depth.project(&world)?;
                let color_pixel = self
                    .color
                    .project(&self.depth_to_color.transform_point(&world))?;
                Ok(Correspondence::new(world, depth_pixel).with_color(color_pixel))
            })
            .collect()
    }
}

/// `count` points in the frustum `|x/z| <= tan_x`, `|y/z| <= tan_y`, `near <= z <= far`.
pub fn scattered_points(
    count: usize,
    near: f64,
    far: f64,
    tan_x: f64,
    tan_y: f64,
) -> Vec<Vector3<f64>> {
    (1..=count)
        .map(|i| {
            let z = near + (far - near) * radical_inverse(i, 5);
            let x = tan_x * (2.0 * radical_inverse(i, 2) - 1.0) * z;
            let y = tan_y * (2.0 * radical_inverse(i, 3) - 1.0) * z;
            Vector3::new(x, y, z)
        })
        .collect()
}

/// Van der Corput radical inverse of `index` in `base`, in `[0, 1)`.
fn radical_inverse(mut index: usize, base: usize) -> f64 {
    let inv_base = 1.0 / base as f64;
    let mut scale = inv_base;
    let mut value = 0.0;
    while index > 0 {
        value += (index % base) as f64 * scale;
        index /= base;
        scale *= inv_base;
    }
    value
}
