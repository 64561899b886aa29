//! Per-pixel undistorted ray table for a calibrated depth camera.
//!
//! Inverting the radial distortion needs an iterative solve, which is too
//! slow to run for every pixel of every depth frame. The table is computed
//! once per depth-camera calibration; a depth sample `d` at pixel `(px, py)`
//! then maps to the camera-space point `(x·d, y·d, d)` with a single lookup.

use crate::camera::{validation, CameraIntrinsics, CameraModelError};
use log::{debug, warn};
use nalgebra::{Vector2, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Dense `width × height` table of undistorted normalised rays, row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthSpaceTable {
    width: u32,
    height: u32,
    rays: Vec<Vector2<f64>>,
}

impl DepthSpaceTable {
    /// Undistorts every depth pixel.
    ///
    /// Rows are measured from the bottom of the image: the entry for
    /// `(px, py)` is the undistortion of pixel `(px, height - py)`, matching
    /// the sensor's Y-up camera space. Rows are computed in parallel.
    ///
    /// # Errors
    ///
    /// The [`validation::validate_intrinsics`] error for unusable intrinsics.
    pub fn compute(
        intrinsics: &CameraIntrinsics,
        width: u32,
        height: u32,
    ) -> Result<Self, CameraModelError> {
        validation::validate_intrinsics(intrinsics)?;
        let row_len = width as usize;
        let mut rays = vec![Vector2::zeros(); row_len * height as usize];

        let unconverged: usize = rays
            .par_chunks_mut(row_len.max(1))
            .enumerate()
            .map(|(py, row)| {
                let frame_y = height as f64 - py as f64;
                let mut misses = 0usize;
                for (px, ray) in row.iter_mut().enumerate() {
                    let undistorted =
                        intrinsics.undistort_detailed(&Vector2::new(px as f64, frame_y));
                    if !undistorted.converged {
                        misses += 1;
                    }
                    *ray = undistorted.point;
                }
                misses
            })
            .sum();

        if unconverged > 0 {
            warn!(
                "Undistortion did not converge for {} of {} depth pixels; using best iterates",
                unconverged,
                rays.len()
            );
        }
        debug!("Computed {}x{} depth space table", width, height);

        Ok(DepthSpaceTable {
            width,
            height,
            rays,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// All rays, row-major.
    pub fn rays(&self) -> &[Vector2<f64>] {
        &self.rays
    }

    /// Ray for a pixel, `None` outside the table.
    pub fn ray(&self, px: u32, py: u32) -> Option<Vector2<f64>> {
        if px >= self.width || py >= self.height {
            return None;
        }
        Some(self.rays[py as usize * self.width as usize + px as usize])
    }

    /// Camera-space point for a depth sample at a pixel.
    pub fn point_at(&self, px: u32, py: u32, depth: f64) -> Option<Vector3<f64>> {
        self.ray(px, py)
            .map(|ray| Vector3::new(ray.x * depth, ray.y * depth, depth))
    }

    /// Converts a row-major depth frame in millimetres to camera-space points in metres.
    ///
    /// Pixels with no depth reading (zero) are skipped.
    ///
    /// # Errors
    ///
    /// [`CameraModelError::InvalidParams`] if the frame size does not match the table.
    pub fn point_cloud(&self, depth_mm: &[u16]) -> Result<Vec<Vector3<f64>>, CameraModelError> {
        if depth_mm.len() != self.rays.len() {
            return Err(CameraModelError::InvalidParams(format!(
                "Depth frame has {} samples, table expects {}x{}",
                depth_mm.len(),
                self.width,
                self.height
            )));
        }

        Ok(self
            .rays
            .par_iter()
            .zip(depth_mm.par_iter())
            .filter(|(_, depth)| **depth > 0)
            .map(|(ray, &depth)| {
                let d = depth as f64 / 1000.0;
                Vector3::new(ray.x * d, ray.y * d, d)
            })
            .collect())
    }
}
