//! Linear pose initialisation with the Direct Linear Transform.
//!
//! Every 3D↔2D correspondence gives two linear constraints on the entries of
//! the 3×4 projection `P = [R | t]` once the pixel has been undistorted into a
//! normalised ray, so the focal lengths and principal point drop out. The
//! homogeneous system is solved with an SVD and the result is projected onto
//! SO(3).

use crate::camera::CameraIntrinsics;
use crate::error::CalibrationError;
use crate::geometry::{check_pairs, Pose};
use log::debug;
use nalgebra::{DMatrix, Matrix3, Matrix3x4, Matrix4, Rotation3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// Fewest correspondences that determine the 11 degrees of freedom of `P`.
pub const MIN_CORRESPONDENCES: usize = 6;

/// Thresholds used to reject ill-conditioned systems.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DltConfig {
    /// Minimum `σ_second_smallest / σ_max`. Below this the null space is at
    /// least two dimensional (coplanar or collinear points).
    pub min_conditioning: f64,
    /// Maximum `σ_smallest / σ_second_smallest`. Above this the solution
    /// vector is not well separated from its neighbour.
    pub max_singular_value_tie: f64,
}

impl Default for DltConfig {
    fn default() -> Self {
        DltConfig {
            min_conditioning: 1e-7,
            max_singular_value_tie: 0.5,
        }
    }
}

/// A DLT pose together with the conditioning diagnostics of its system.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseEstimate {
    pub pose: Pose,
    /// `σ_smallest / σ_second_smallest` of the design matrix.
    pub singular_value_ratio: f64,
    /// `σ_second_smallest / σ_max` of the design matrix.
    pub conditioning: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PoseEstimator {
    config: DltConfig,
}

impl PoseEstimator {
    pub fn new(config: DltConfig) -> Self {
        PoseEstimator { config }
    }

    /// Estimates the pose mapping `world_points` into the camera frame.
    ///
    /// Pixels are undistorted with `intrinsics` first, so only the `[R | t]`
    /// part of the projection is estimated.
    ///
    /// # Errors
    ///
    /// * [`CalibrationError::InvalidInput`] for empty or mismatched inputs.
    /// * [`CalibrationError::DegenerateGeometry`] for fewer than six points or
    ///   an ill-conditioned system.
    pub fn estimate_pose(
        &self,
        world_points: &[Vector3<f64>],
        image_points: &[Vector2<f64>],
        intrinsics: &CameraIntrinsics,
    ) -> Result<PoseEstimate, CalibrationError> {
        check_pairs(world_points, image_points)?;
        let n = world_points.len();
        if n < MIN_CORRESPONDENCES {
            return Err(CalibrationError::DegenerateGeometry {
                reason: format!(
                    "DLT needs at least {MIN_CORRESPONDENCES} correspondences, got {n}"
                ),
                singular_value_ratio: f64::NAN,
                conditioning: f64::NAN,
            });
        }

        let normalization = normalize_world(world_points)?;
        let rays: Vec<Vector2<f64>> = image_points
            .iter()
            .map(|pixel| intrinsics.undistort(pixel))
            .collect();

        let mut a = DMatrix::<f64>::zeros(2 * n, 12);
        for (i, (world, ray)) in world_points.iter().zip(&rays).enumerate() {
            let p = normalization * world.push(1.0);
            for j in 0..4 {
                a[(2 * i, j)] = p[j];
                a[(2 * i, 8 + j)] = -ray.x * p[j];
                a[(2 * i + 1, 4 + j)] = p[j];
                a[(2 * i + 1, 8 + j)] = -ray.y * p[j];
            }
        }

        let svd = a.svd(false, true);
        let v_t = svd.v_t.ok_or_else(|| CalibrationError::DegenerateGeometry {
            reason: "SVD of the DLT system did not produce right singular vectors".to_string(),
            singular_value_ratio: f64::NAN,
            conditioning: f64::NAN,
        })?;

        let singular_values = &svd.singular_values;
        let (smallest, second) = two_smallest(singular_values.as_slice());
        let sigma_max = singular_values.max();
        let singular_value_ratio = singular_values[smallest] / singular_values[second];
        let conditioning = singular_values[second] / sigma_max;

        debug!(
            "DLT with {} points: singular value ratio {:.3e}, conditioning {:.3e}",
            n, singular_value_ratio, conditioning
        );

        if !(conditioning >= self.config.min_conditioning) {
            return Err(CalibrationError::DegenerateGeometry {
                reason: "points are coplanar or collinear".to_string(),
                singular_value_ratio,
                conditioning,
            });
        }
        if !(singular_value_ratio <= self.config.max_singular_value_tie) {
            return Err(CalibrationError::DegenerateGeometry {
                reason: "smallest singular value is not isolated".to_string(),
                singular_value_ratio,
                conditioning,
            });
        }

        let solution: Vec<f64> = v_t.row(smallest).iter().copied().collect();
        let projection = Matrix3x4::from_row_slice(&solution) * normalization;

        let mut m: Matrix3<f64> = projection.fixed_view::<3, 3>(0, 0).into_owned();
        let mut t: Vector3<f64> = projection.column(3).into_owned();
        if m.determinant() < 0.0 {
            m = -m;
            t = -t;
        }

        let svd_m = m.svd(true, true);
        let (u, v_t) = match (svd_m.u, svd_m.v_t) {
            (Some(u), Some(v_t)) => (u, v_t),
            _ => {
                return Err(CalibrationError::DegenerateGeometry {
                    reason: "SVD of the rotation block failed".to_string(),
                    singular_value_ratio,
                    conditioning,
                })
            }
        };
        let mut r = u * v_t;
        if r.determinant() < 0.0 {
            let mut u_flipped = u;
            u_flipped.column_mut(2).neg_mut();
            r = u_flipped * v_t;
        }

        let scale = svd_m.singular_values.mean();
        if !(scale > f64::EPSILON) {
            return Err(CalibrationError::DegenerateGeometry {
                reason: "rotation block of the DLT solution vanishes".to_string(),
                singular_value_ratio,
                conditioning,
            });
        }

        Ok(PoseEstimate {
            pose: Pose::new(Rotation3::from_matrix_unchecked(r), t / scale),
            singular_value_ratio,
            conditioning,
        })
    }
}

/// Similarity that centres the points and scales their mean distance to √3.
fn normalize_world(points: &[Vector3<f64>]) -> Result<Matrix4<f64>, CalibrationError> {
    let n = points.len() as f64;
    let centroid = points.iter().fold(Vector3::zeros(), |acc, p| acc + p) / n;
    let mean_distance = points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n;

    if !(mean_distance > f64::EPSILON) {
        return Err(CalibrationError::DegenerateGeometry {
            reason: "all world points coincide".to_string(),
            singular_value_ratio: f64::NAN,
            conditioning: 0.0,
        });
    }

    let s = 3.0_f64.sqrt() / mean_distance;
    #[rustfmt::skip]
    let transform = Matrix4::new(
        s,   0.0, 0.0, -s * centroid.x,
        0.0, s,   0.0, -s * centroid.y,
        0.0, 0.0, s,   -s * centroid.z,
        0.0, 0.0, 0.0, 1.0,
    );
    Ok(transform)
}

/// Indices of the smallest and second smallest entries.
fn two_smallest(values: &[f64]) -> (usize, usize) {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    (order[0], order[1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ground_truth_pose() -> Pose {
        Pose::from_rotation_vector(
            &Vector3::new(0.02, -0.15, 0.04),
            Vector3::new(-0.052, 0.004, 0.012),
        )
    }

    fn scattered_points() -> Vec<Vector3<f64>> {
        vec![
            Vector3::new(-0.5, -0.4, 1.2),
            Vector3::new(0.6, -0.3, 1.8),
            Vector3::new(-0.2, 0.5, 2.4),
            Vector3::new(0.4, 0.4, 1.5),
            Vector3::new(0.0, 0.0, 3.0),
            Vector3::new(-0.7, 0.1, 2.1),
            Vector3::new(0.3, -0.6, 2.7),
            Vector3::new(0.8, 0.7, 3.3),
            Vector3::new(-0.4, -0.8, 1.9),
            Vector3::new(0.1, 0.9, 2.2),
        ]
    }

    fn project_all(
        points: &[Vector3<f64>],
        intrinsics: &CameraIntrinsics,
        pose: &Pose,
    ) -> Vec<Vector2<f64>> {
        points
            .iter()
            .map(|p| intrinsics.project(&pose.transform_point(p)).unwrap())
            .collect()
    }

    #[test]
    fn test_dlt_recovers_synthetic_pose() {
        let pose = ground_truth_pose();
        for intrinsics in [
            CameraIntrinsics::new(1081.4, 1079.9, 959.5, 539.5),
            CameraIntrinsics::new(1081.4, 1079.9, 959.5, 539.5).with_distortion(0.02, -0.01),
        ] {
            let points = scattered_points();
            let pixels = project_all(&points, &intrinsics, &pose);

            let estimate = PoseEstimator::default()
                .estimate_pose(&points, &pixels, &intrinsics)
                .unwrap();

            assert_relative_eq!(
                estimate.pose.rotation.matrix(),
                pose.rotation.matrix(),
                epsilon = 1e-6
            );
            assert_relative_eq!(estimate.pose.translation, pose.translation, epsilon = 1e-6);
            assert!(estimate.singular_value_ratio < 1e-3);

            let r = estimate.pose.rotation.matrix();
            assert_relative_eq!(r.determinant(), 1.0, epsilon = 1e-12);
            assert_relative_eq!(r.transpose() * r, Matrix3::identity(), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_dlt_rejects_coplanar_points() {
        let intrinsics = CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0);
        let pose = ground_truth_pose();
        let points = vec![
            Vector3::new(-0.5, -0.5, 2.0),
            Vector3::new(0.5, -0.5, 2.0),
            Vector3::new(0.5, 0.5, 2.0),
            Vector3::new(-0.5, 0.5, 2.0),
            Vector3::new(0.1, 0.2, 2.0),
            Vector3::new(-0.3, 0.05, 2.0),
        ];
        let pixels = project_all(&points, &intrinsics, &pose);

        match PoseEstimator::default().estimate_pose(&points, &pixels, &intrinsics) {
            Err(CalibrationError::DegenerateGeometry { conditioning, .. }) => {
                assert!(conditioning < DltConfig::default().min_conditioning)
            }
            other => panic!("expected degenerate geometry, got {other:?}"),
        }
    }

    #[test]
    fn test_dlt_rejects_collinear_points() {
        let intrinsics = CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0);
        let pose = ground_truth_pose();
        let points: Vec<Vector3<f64>> = (0..8)
            .map(|i| Vector3::new(0.1 * i as f64, -0.05 * i as f64, 1.5 + 0.2 * i as f64))
            .collect();
        let pixels = project_all(&points, &intrinsics, &pose);

        assert!(matches!(
            PoseEstimator::default().estimate_pose(&points, &pixels, &intrinsics),
            Err(CalibrationError::DegenerateGeometry { .. })
        ));
    }

    #[test]
    fn test_dlt_requires_six_points() {
        let intrinsics = CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0);
        let points = scattered_points()[..5].to_vec();
        let pixels = project_all(&points, &intrinsics, &ground_truth_pose());

        assert!(matches!(
            PoseEstimator::default().estimate_pose(&points, &pixels, &intrinsics),
            Err(CalibrationError::DegenerateGeometry { .. })
        ));
        assert!(matches!(
            PoseEstimator::default().estimate_pose(&points, &pixels[..4], &intrinsics),
            Err(CalibrationError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_dlt_does_not_mutate_inputs() {
        let intrinsics = CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0);
        let points = scattered_points();
        let pixels = project_all(&points, &intrinsics, &ground_truth_pose());
        let (points_before, pixels_before) = (points.clone(), pixels.clone());

        PoseEstimator::default()
            .estimate_pose(&points, &pixels, &intrinsics)
            .unwrap();
        assert_eq!(points, points_before);
        assert_eq!(pixels, pixels_before);
    }
}
