//! Rigid transforms between sensor frames.

use crate::error::CalibrationError;
use nalgebra::{Matrix3, Matrix4, Rotation3, Vector3};
use serde::{Deserialize, Serialize};

/// Rotation and translation mapping points of one frame into another:
/// `p' = R·p + t`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub rotation: Rotation3<f64>,
    pub translation: Vector3<f64>,
}

impl Default for Pose {
    fn default() -> Self {
        Pose::identity()
    }
}

impl Pose {
    pub fn identity() -> Self {
        Pose {
            rotation: Rotation3::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: Rotation3<f64>, translation: Vector3<f64>) -> Self {
        Pose {
            rotation,
            translation,
        }
    }

    /// Builds a pose from an axis-angle vector (Rodrigues) and a translation.
    pub fn from_rotation_vector(rotation_vector: &Vector3<f64>, translation: Vector3<f64>) -> Self {
        Pose {
            rotation: Rotation3::new(*rotation_vector),
            translation,
        }
    }

    /// Axis-angle vector whose norm is the rotation angle in radians.
    pub fn rotation_vector(&self) -> Vector3<f64> {
        self.rotation.scaled_axis()
    }

    pub fn transform_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * point + self.translation
    }

    pub fn inverse(&self) -> Pose {
        let rotation = self.rotation.inverse();
        Pose {
            rotation,
            translation: -(rotation * self.translation),
        }
    }

    /// `self ∘ other`: applies `other` first, then `self`.
    pub fn compose(&self, other: &Pose) -> Pose {
        Pose {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Homogeneous `[R | t; 0 0 0 1]`.
    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut matrix = Matrix4::identity();
        matrix
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(self.rotation.matrix());
        matrix
            .fixed_view_mut::<3, 1>(0, 3)
            .copy_from(&self.translation);
        matrix
    }

    /// Reads a homogeneous rigid transform.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::InvalidInput`] if the bottom row is not `0 0 0 1` or
    /// the upper-left block is not a proper rotation within `1e-6`.
    pub fn from_matrix(matrix: &Matrix4<f64>) -> Result<Self, CalibrationError> {
        let bottom = matrix.fixed_view::<1, 4>(3, 0);
        if (bottom[(0, 0)].abs() + bottom[(0, 1)].abs() + bottom[(0, 2)].abs()) > 1e-9
            || (bottom[(0, 3)] - 1.0).abs() > 1e-9
        {
            return Err(CalibrationError::InvalidInput(
                "Bottom row of a rigid transform must be [0, 0, 0, 1]".to_string(),
            ));
        }

        let r: Matrix3<f64> = matrix.fixed_view::<3, 3>(0, 0).into_owned();
        let orthogonality = (r.transpose() * r - Matrix3::identity()).norm();
        if orthogonality > 1e-6 || r.determinant() <= 0.0 {
            return Err(CalibrationError::InvalidInput(format!(
                "Upper-left block is not a rotation (|RᵀR - I| = {:.3e}, det = {:.6})",
                orthogonality,
                r.determinant()
            )));
        }

        Ok(Pose {
            rotation: Rotation3::from_matrix(&r),
            translation: matrix.fixed_view::<3, 1>(0, 3).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_pose() -> Pose {
        Pose::from_rotation_vector(
            &Vector3::new(0.05, -0.12, 0.3),
            Vector3::new(-0.052, 0.01, 0.003),
        )
    }

    #[test]
    fn test_rotation_vector_round_trip() {
        let rv = Vector3::new(0.05, -0.12, 0.3);
        let pose = Pose::from_rotation_vector(&rv, Vector3::zeros());
        assert_relative_eq!(pose.rotation_vector(), rv, epsilon = 1e-12);
        assert_relative_eq!(pose.rotation.matrix().determinant(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_matrix_conversion() {
        let pose = sample_pose();
        let matrix = pose.to_matrix();

        assert_eq!(matrix[(3, 3)], 1.0);
        assert_eq!(matrix[(3, 0)], 0.0);
        assert_eq!(matrix[(0, 3)], -0.052);

        let point = Vector3::new(0.3, -0.2, 1.7);
        let homogeneous = matrix * point.push(1.0);
        assert_relative_eq!(
            homogeneous.xyz(),
            pose.transform_point(&point),
            epsilon = 1e-12
        );

        let restored = Pose::from_matrix(&matrix).unwrap();
        assert_relative_eq!(
            restored.rotation.matrix(),
            pose.rotation.matrix(),
            epsilon = 1e-12
        );
        assert_relative_eq!(restored.translation, pose.translation, epsilon = 1e-15);
    }

    #[test]
    fn test_from_matrix_rejects_non_rigid() {
        let mut matrix = sample_pose().to_matrix();
        matrix[(0, 0)] *= 2.0;
        assert!(Pose::from_matrix(&matrix).is_err());

        let mut matrix = sample_pose().to_matrix();
        matrix[(3, 1)] = 0.5;
        assert!(Pose::from_matrix(&matrix).is_err());
    }

    #[test]
    fn test_inverse_and_compose() {
        let pose = sample_pose();
        let identity = pose.compose(&pose.inverse());
        assert_relative_eq!(
            identity.rotation.matrix(),
            &Matrix3::identity(),
            epsilon = 1e-12
        );
        assert_relative_eq!(identity.translation, Vector3::zeros(), epsilon = 1e-12);

        let other = Pose::from_rotation_vector(&Vector3::new(0.0, 0.2, 0.0), Vector3::new(1.0, 0.0, 0.0));
        let point = Vector3::new(0.1, 0.2, 0.3);
        assert_relative_eq!(
            pose.compose(&other).transform_point(&point),
            pose.transform_point(&other.transform_point(&point)),
            epsilon = 1e-12
        );
    }
}
