//! Implements the pinhole camera model with two-term radial distortion.
//!
//! Projection normalises a camera-space point by its depth, scales the
//! normalised coordinates by the radial factor `1 + k1·r² + k2·r⁴` and maps
//! them to pixels with the focal lengths and principal point. The inverse
//! direction has no closed form and is solved with a Newton-Raphson iteration
//! on the radius (see [`CameraIntrinsics::undistort`]).

use crate::camera::{validation, CameraIntrinsics, CameraModel, CameraModelError, Resolution};
use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use yaml_rust::YamlLoader;

/// Convergence threshold on the Newton update of the undistorted radius.
pub const UNDISTORT_TOLERANCE: f64 = 1e-4;
/// Upper bound on Newton iterations per undistorted pixel.
pub const UNDISTORT_MAX_ITERATIONS: usize = 100;

/// Outcome of inverting the radial distortion for one pixel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Undistortion {
    /// Undistorted normalised ray `(x, y)` at unit depth.
    pub point: Vector2<f64>,
    /// Undistorted radius the ray was scaled with. `None` when the radial
    /// factor was not positive even at the starting radius, in which case the
    /// distorted normalised ray is returned unchanged.
    pub radius: Option<f64>,
    /// Number of Newton updates that were applied.
    pub iterations: usize,
    /// `true` only when the Newton update fell below the tolerance at a valid
    /// iterate.
    pub converged: bool,
}

impl CameraIntrinsics {
    /// Intrinsics without lens distortion.
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        CameraIntrinsics {
            fx,
            fy,
            cx,
            cy,
            k1: 0.0,
            k2: 0.0,
        }
    }

    pub fn with_distortion(mut self, k1: f64, k2: f64) -> Self {
        self.k1 = k1;
        self.k2 = k2;
        self
    }

    /// Radial scale `1 + k1·r² + k2·r⁴` for a squared normalised radius.
    #[inline]
    pub fn radial_factor(&self, r2: f64) -> f64 {
        1.0 + self.k1 * r2 + self.k2 * r2 * r2
    }

    /// Maps an undistorted normalised ray `(x, y)` at unit depth to pixels.
    pub fn distort_normalized(&self, ray: &Vector2<f64>) -> Vector2<f64> {
        let factor = self.radial_factor(ray.norm_squared());
        Vector2::new(
            self.fx * ray.x * factor + self.cx,
            self.fy * ray.y * factor + self.cy,
        )
    }

    /// Projects a camera-space point to distorted pixel coordinates.
    ///
    /// # Errors
    ///
    /// [`CameraModelError::DegenerateProjection`] when `z` is zero or any
    /// coordinate is not finite.
    pub fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        if !(point_3d.x.is_finite() && point_3d.y.is_finite() && point_3d.z.is_finite())
            || point_3d.z.abs() < f64::EPSILON
        {
            return Err(CameraModelError::DegenerateProjection {
                x: point_3d.x,
                y: point_3d.y,
                z: point_3d.z,
            });
        }
        let ray = Vector2::new(point_3d.x / point_3d.z, point_3d.y / point_3d.z);
        Ok(self.distort_normalized(&ray))
    }

    /// Recovers the undistorted normalised ray for a distorted pixel.
    ///
    /// Non-convergence is not an error: the best iterate is returned. Use
    /// [`CameraIntrinsics::undistort_detailed`] to find out whether the
    /// iteration converged.
    pub fn undistort(&self, pixel: &Vector2<f64>) -> Vector2<f64> {
        self.undistort_detailed(pixel).point
    }

    /// Newton-Raphson inversion of the radial distortion.
    ///
    /// Solves `r·(1 + k1·r² + k2·r⁴) = r_d` for the undistorted radius `r`,
    /// where `r_d` is the radius of the normalised distorted pixel, starting
    /// from `r = r_d`. The ray is then `(x_d, y_d) / (1 + k1·r² + k2·r⁴)`.
    ///
    /// Only iterates with `r >= 0` and a positive radial factor are valid: any
    /// other root would flip the ray to the opposite side of the optical axis.
    /// Reaching an invalid iterate stops the iteration without convergence and
    /// the valid iterate with the smallest residual is used instead.
    pub fn undistort_detailed(&self, pixel: &Vector2<f64>) -> Undistortion {
        let x = (pixel.x - self.cx) / self.fx;
        let y = (pixel.y - self.cy) / self.fy;

        let r_target = (x * x + y * y).sqrt();
        let mut r = r_target;
        let mut best: Option<(f64, f64)> = None;
        let mut iterations = 0;
        let mut converged = false;

        while iterations < UNDISTORT_MAX_ITERATIONS {
            let r2 = r * r;
            let factor = self.radial_factor(r2);
            if !(r >= 0.0 && factor > 0.0) {
                break;
            }

            let num = r * factor - r_target;
            if best.map_or(true, |(residual, _)| num.abs() < residual) {
                best = Some((num.abs(), r));
            }

            let denom = 1.0 + 3.0 * self.k1 * r2 + 5.0 * self.k2 * r2 * r2;
            let delta = num / denom;
            if !delta.is_finite() {
                break;
            }
            r -= delta;
            iterations += 1;

            if delta.abs() < UNDISTORT_TOLERANCE {
                converged = r >= 0.0 && self.radial_factor(r * r) > 0.0;
                break;
            }
        }

        let radius = if converged {
            Some(r)
        } else {
            best.map(|(_, best_r)| best_r)
        };
        let point = match radius {
            Some(radius) => {
                let factor = self.radial_factor(radius * radius);
                Vector2::new(x / factor, y / factor)
            }
            None => Vector2::new(x, y),
        };
        Undistortion {
            point,
            radius,
            iterations,
            converged,
        }
    }
}

/// A radial-distortion camera with a known image size.
///
/// # Examples
///
/// ```rust
/// use nalgebra::Vector3;
/// use rgbd_calibration::camera::{CameraIntrinsics, CameraModel, RadialModel, Resolution};
///
/// let intrinsics = CameraIntrinsics::new(360.0, 360.0, 256.0, 212.0);
/// let model = RadialModel::new(intrinsics, Resolution { width: 512, height: 424 }).unwrap();
///
/// let pixel = model.project(&Vector3::new(0.1, 0.2, 1.0)).unwrap();
/// assert!((pixel.x - 292.0).abs() < 1e-9);
/// assert!((pixel.y - 284.0).abs() < 1e-9);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadialModel {
    pub intrinsics: CameraIntrinsics,
    pub resolution: Resolution,
}

impl RadialModel {
    pub fn new(
        intrinsics: CameraIntrinsics,
        resolution: Resolution,
    ) -> Result<Self, CameraModelError> {
        let model = RadialModel {
            intrinsics,
            resolution,
        };
        model.validate_params()?;
        Ok(model)
    }

    fn contains(&self, pixel: &Vector2<f64>) -> bool {
        pixel.x >= 0.0
            && pixel.x < self.resolution.width as f64
            && pixel.y >= 0.0
            && pixel.y < self.resolution.height as f64
    }
}

impl CameraModel for RadialModel {
    /// Projects a camera-space point and rejects pixels outside the image.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::DegenerateProjection`] for `z == 0` or non-finite input.
    /// * [`CameraModelError::InvalidParams`] when the pixel falls outside the resolution.
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        let pixel = self.intrinsics.project(point_3d)?;
        if !self.contains(&pixel) {
            return Err(CameraModelError::InvalidParams(format!(
                "Projection ({:.2}, {:.2}) is outside the {}x{} image",
                pixel.x, pixel.y, self.resolution.width, self.resolution.height
            )));
        }
        Ok(pixel)
    }

    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        if !self.contains(point_2d) {
            return Err(CameraModelError::InvalidParams(format!(
                "Pixel ({:.2}, {:.2}) is outside the {}x{} image",
                point_2d.x, point_2d.y, self.resolution.width, self.resolution.height
            )));
        }
        let ray = self.intrinsics.undistort(point_2d);
        Ok(Vector3::new(ray.x, ray.y, 1.0).normalize())
    }

    /// Loads a camera from YAML.
    ///
    /// Expected layout:
    ///
    /// ```yaml
    /// cam0:
    ///   camera_model: radial
    ///   intrinsics: [fx, fy, cx, cy]
    ///   distortion: [k1, k2]
    ///   resolution: [width, height]
    /// ```
    fn load_from_yaml(path: &str) -> Result<Self, CameraModelError> {
        let contents = fs::read_to_string(path)?;
        let docs = YamlLoader::load_from_str(&contents)?;

        if docs.is_empty() {
            return Err(CameraModelError::InvalidParams(
                "Empty YAML document".to_string(),
            ));
        }

        let doc = &docs[0];

        let intrinsics_yaml = doc["cam0"]["intrinsics"]
            .as_vec()
            .ok_or_else(|| CameraModelError::InvalidParams("Invalid intrinsics".to_string()))?;
        let resolution_yaml = doc["cam0"]["resolution"]
            .as_vec()
            .ok_or_else(|| CameraModelError::InvalidParams("Invalid resolution".to_string()))?;
        let distortion_yaml = doc["cam0"]["distortion"].as_vec().ok_or_else(|| {
            CameraModelError::InvalidParams("Missing distortion parameters".to_string())
        })?;

        if intrinsics_yaml.len() != 4 {
            return Err(CameraModelError::InvalidParams(format!(
                "Expected 4 intrinsic parameters in YAML, found {}",
                intrinsics_yaml.len()
            )));
        }
        if distortion_yaml.len() != 2 {
            return Err(CameraModelError::InvalidParams(format!(
                "Expected 2 distortion parameters in YAML, found {}",
                distortion_yaml.len()
            )));
        }
        if resolution_yaml.len() != 2 {
            return Err(CameraModelError::InvalidParams(format!(
                "Expected [width, height] resolution in YAML, found {} values",
                resolution_yaml.len()
            )));
        }

        let float_at = |node: &yaml_rust::Yaml, name: &str| {
            // yaml-rust reads `360` as an integer
            node.as_f64()
                .or_else(|| node.as_i64().map(|v| v as f64))
                .ok_or_else(|| CameraModelError::InvalidParams(format!("Invalid {name}")))
        };

        let intrinsics = CameraIntrinsics {
            fx: float_at(&intrinsics_yaml[0], "fx")?,
            fy: float_at(&intrinsics_yaml[1], "fy")?,
            cx: float_at(&intrinsics_yaml[2], "cx")?,
            cy: float_at(&intrinsics_yaml[3], "cy")?,
            k1: float_at(&distortion_yaml[0], "k1")?,
            k2: float_at(&distortion_yaml[1], "k2")?,
        };

        let dimension = |value: &yaml_rust::Yaml, name: &str| {
            value
                .as_i64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| CameraModelError::InvalidParams(format!("Invalid {name}")))
        };
        let resolution = Resolution {
            width: dimension(&resolution_yaml[0], "width")?,
            height: dimension(&resolution_yaml[1], "height")?,
        };

        RadialModel::new(intrinsics, resolution)
    }

    fn save_to_yaml(&self, path: &str) -> Result<(), CameraModelError> {
        let yaml = serde_yaml::to_value(serde_yaml::Mapping::from_iter([(
            serde_yaml::Value::String("cam0".to_string()),
            serde_yaml::to_value(serde_yaml::Mapping::from_iter([
                (
                    serde_yaml::Value::String("camera_model".to_string()),
                    serde_yaml::Value::String("radial".to_string()),
                ),
                (
                    serde_yaml::Value::String("intrinsics".to_string()),
                    serde_yaml::to_value(vec![
                        self.intrinsics.fx,
                        self.intrinsics.fy,
                        self.intrinsics.cx,
                        self.intrinsics.cy,
                    ])?,
                ),
                (
                    serde_yaml::Value::String("distortion".to_string()),
                    serde_yaml::to_value(vec![self.intrinsics.k1, self.intrinsics.k2])?,
                ),
                (
                    serde_yaml::Value::String("resolution".to_string()),
                    serde_yaml::to_value(vec![self.resolution.width, self.resolution.height])?,
                ),
            ]))?,
        )]))?;

        let yaml_string = serde_yaml::to_string(&yaml)?;

        let mut file = fs::File::create(path)?;
        file.write_all(yaml_string.as_bytes())?;

        Ok(())
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        if self.resolution.width == 0 || self.resolution.height == 0 {
            return Err(CameraModelError::InvalidParams(
                "Resolution must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    fn get_resolution(&self) -> Resolution {
        self.resolution
    }

    fn get_intrinsics(&self) -> CameraIntrinsics {
        self.intrinsics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_intrinsics() -> Vec<CameraIntrinsics> {
        vec![
            CameraIntrinsics::new(360.0, 360.0, 256.0, 212.0),
            CameraIntrinsics::new(365.2, 364.8, 258.1, 205.4).with_distortion(0.09, -0.05),
            CameraIntrinsics::new(1081.4, 1079.9, 959.5, 539.5).with_distortion(0.02, -0.01),
            CameraIntrinsics::new(500.0, 480.0, 320.0, 240.0).with_distortion(-0.2, 0.05),
        ]
    }

    #[test]
    fn test_project_known_point() {
        let intrinsics = CameraIntrinsics::new(500.0, 400.0, 320.0, 240.0).with_distortion(0.1, 0.01);
        let pixel = intrinsics.project(&Vector3::new(0.2, -0.1, 2.0)).unwrap();

        // r² = 0.1² + 0.05² = 0.0125
        let factor = 1.0 + 0.1 * 0.0125 + 0.01 * 0.0125 * 0.0125;
        assert_relative_eq!(pixel.x, 500.0 * 0.1 * factor + 320.0, epsilon = 1e-12);
        assert_relative_eq!(pixel.y, 400.0 * -0.05 * factor + 240.0, epsilon = 1e-12);
    }

    #[test]
    fn test_project_rejects_degenerate_points() {
        let intrinsics = CameraIntrinsics::new(360.0, 360.0, 256.0, 212.0);
        assert!(matches!(
            intrinsics.project(&Vector3::new(1.0, 1.0, 0.0)),
            Err(CameraModelError::DegenerateProjection { .. })
        ));
        assert!(matches!(
            intrinsics.project(&Vector3::new(f64::NAN, 1.0, 1.0)),
            Err(CameraModelError::DegenerateProjection { .. })
        ));
        // Points behind the camera are still projectable.
        assert!(intrinsics.project(&Vector3::new(0.1, 0.1, -1.0)).is_ok());
    }

    #[test]
    fn test_undistort_without_distortion_is_exact() {
        let intrinsics = CameraIntrinsics::new(361.5, 358.25, 255.75, 211.5);
        for &(u, v) in &[(0.0, 0.0), (17.5, 400.25), (511.0, 423.0), (255.75, 211.5)] {
            let ray = intrinsics.undistort(&Vector2::new(u, v));
            assert_eq!(ray.x, (u - intrinsics.cx) / intrinsics.fx);
            assert_eq!(ray.y, (v - intrinsics.cy) / intrinsics.fy);
        }
    }

    #[test]
    fn test_undistort_then_project_round_trip() {
        for intrinsics in sample_intrinsics() {
            let width = 2.0 * intrinsics.cx;
            let height = 2.0 * intrinsics.cy;
            for i in 0..=10 {
                for j in 0..=10 {
                    let pixel = Vector2::new(width * i as f64 / 10.0, height * j as f64 / 10.0);
                    let undistorted = intrinsics.undistort_detailed(&pixel);
                    assert!(undistorted.converged, "no convergence at {:?}", pixel);

                    let ray = Vector3::new(undistorted.point.x, undistorted.point.y, 1.0);
                    let reprojected = intrinsics.project(&ray).unwrap();
                    assert!(
                        (reprojected - pixel).norm() < 1e-3,
                        "round trip error {} at {:?} for {:?}",
                        (reprojected - pixel).norm(),
                        pixel,
                        intrinsics
                    );
                }
            }
        }
    }

    #[test]
    fn test_undistort_stops_at_non_positive_factor() {
        // 1 - r² vanishes at the starting radius r = 1.
        let intrinsics = CameraIntrinsics::new(100.0, 100.0, 0.0, 0.0).with_distortion(-1.0, 0.0);
        let result = intrinsics.undistort_detailed(&Vector2::new(100.0, 0.0));
        assert!(!result.converged);
        assert_eq!(result.iterations, 0);
        assert_eq!(result.radius, None);
        assert_eq!(result.point, Vector2::new(1.0, 0.0));
    }

    #[test]
    fn test_undistort_soft_failure_returns_best_iterate() {
        // Newton on r - 0.8r³ + 0.15r⁵ = 1.1 keeps bouncing around the local
        // maximum near r = 0.7 and never reaches the root beyond r = 1.6.
        let intrinsics = CameraIntrinsics::new(100.0, 100.0, 0.0, 0.0).with_distortion(-0.8, 0.15);
        for pixel in [
            Vector2::new(110.0, 0.0),
            Vector2::new(-110.0, 0.0),
            Vector2::new(0.0, -110.0),
        ] {
            let result = intrinsics.undistort_detailed(&pixel);
            assert!(!result.converged);
            assert_eq!(result.iterations, UNDISTORT_MAX_ITERATIONS);
            assert!(result.point.x.is_finite() && result.point.y.is_finite());

            // Same side of the optical axis as the pixel.
            assert!(result.point.x * pixel.x >= 0.0 && result.point.y * pixel.y >= 0.0);
            assert!(result.point.norm() > 0.0);

            let radius = result.radius.unwrap();
            assert!(radius >= 0.0);
            let factor = intrinsics.radial_factor(radius * radius);
            assert!(factor > 0.0);
            assert_relative_eq!(result.point, pixel / 100.0 / factor, epsilon = 1e-15);

            // No worse than the starting iterate r = r_d.
            let r_target = 1.1;
            let start_residual =
                (r_target * intrinsics.radial_factor(r_target * r_target) - r_target).abs();
            let best_residual = (radius * factor - r_target).abs();
            assert!(best_residual <= start_residual);
        }
    }

    #[test]
    fn test_undistort_keeps_sign_on_kinect_corners() {
        let intrinsics = RadialModel::load_from_yaml("samples/kinect_depth.yaml")
            .unwrap()
            .intrinsics;
        for &(u, v) in &[(0.0, 0.0), (511.0, 0.0), (0.0, 424.0), (511.0, 424.0), (46.0, 424.0)] {
            let result = intrinsics.undistort_detailed(&Vector2::new(u, v));
            assert!(result.point.x * (u - intrinsics.cx) > 0.0, "x flipped at ({u}, {v})");
            assert!(result.point.y * (v - intrinsics.cy) > 0.0, "y flipped at ({u}, {v})");
        }
    }

    #[test]
    fn test_radial_model_project_unproject() {
        let intrinsics = CameraIntrinsics::new(365.2, 364.8, 258.1, 205.4).with_distortion(0.09, -0.27);
        let model = RadialModel::new(
            intrinsics,
            Resolution {
                width: 512,
                height: 424,
            },
        )
        .unwrap();

        let point_3d = Vector3::new(0.4, -0.3, 2.5);
        let point_2d = model.project(&point_3d).unwrap();
        let ray = model.unproject(&point_2d).unwrap();
        let expected = point_3d.normalize();

        assert_relative_eq!(ray.norm(), 1.0, epsilon = 1e-12);
        assert!((ray - expected).norm() < 1e-5);

        assert!(model.project(&Vector3::new(5.0, 0.0, 1.0)).is_err());
        assert!(model.unproject(&Vector2::new(-1.0, 10.0)).is_err());
    }

    #[test]
    fn test_radial_model_rejects_invalid_params() {
        let bad = CameraIntrinsics::new(-1.0, 360.0, 256.0, 212.0);
        assert!(RadialModel::new(
            bad,
            Resolution {
                width: 512,
                height: 424
            }
        )
        .is_err());
    }

    #[test]
    fn test_radial_load_from_yaml() {
        let model = RadialModel::load_from_yaml("samples/kinect_depth.yaml").unwrap();

        assert_eq!(model.intrinsics.fx, 365.456);
        assert_eq!(model.intrinsics.fy, 365.456);
        assert_eq!(model.intrinsics.cx, 254.878);
        assert_eq!(model.intrinsics.cy, 205.395);
        assert_eq!(model.intrinsics.k1, 0.0905474);
        assert_eq!(model.intrinsics.k2, -0.26819);
        assert_eq!(model.resolution.width, 512);
        assert_eq!(model.resolution.height, 424);
    }

    #[test]
    fn test_radial_save_to_yaml() {
        let model = RadialModel::load_from_yaml("samples/kinect_color.yaml").unwrap();

        let output_path = std::env::temp_dir().join("rgbd_calibration_radial_saved.yaml");
        let output_path = output_path.to_str().unwrap();
        model.save_to_yaml(output_path).unwrap();

        let saved_model = RadialModel::load_from_yaml(output_path).unwrap();
        assert_eq!(model, saved_model);

        std::fs::remove_file(output_path).unwrap();
    }

    #[test]
    fn test_radial_load_rejects_out_of_range_resolution() {
        for (name, resolution) in [("negative", "[-512, 424]"), ("oversized", "[512, 4294967296]")] {
            let path = std::env::temp_dir().join(format!("rgbd_calibration_{name}_resolution.yaml"));
            let path = path.to_str().unwrap();
            std::fs::write(
                path,
                format!(
                    "cam0:\n  camera_model: radial\n  intrinsics: [360.0, 360.0, 256.0, 212.0]\n  \
                     distortion: [0.0, 0.0]\n  resolution: {resolution}\n"
                ),
            )
            .unwrap();

            let result = RadialModel::load_from_yaml(path);
            std::fs::remove_file(path).unwrap();
            assert!(
                matches!(result, Err(CameraModelError::InvalidParams(_))),
                "{name} resolution accepted: {result:?}"
            );
        }
    }

    #[test]
    fn test_radial_load_missing_file() {
        assert!(matches!(
            RadialModel::load_from_yaml("samples/does_not_exist.yaml"),
            Err(CameraModelError::IOError(_))
        ));
    }
}
