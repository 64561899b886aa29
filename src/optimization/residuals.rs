//! Reprojection costs of the calibration stages.
//!
//! Parameter layout:
//! * depth intrinsics: `[fx, fy, cx, cy, k1, k2]`
//! * camera with pose: `[fx, fy, cx, cy, k1, k2, rx, ry, rz, tx, ty, tz]`, where
//!   `r` is the Rodrigues vector of the rotation from depth space into the camera.
//!
//! Residuals are `observed - predicted` pixel coordinates, two per point.

use crate::camera::CameraIntrinsics;
use crate::error::CalibrationError;
use crate::geometry::{check_pairs, Pose};
use crate::optimization::ResidualFunction;

use nalgebra::{DVector, RealField, Vector2, Vector3};
use tiny_solver::factors::Factor;

pub const INTRINSICS_PARAMETERS: usize = 6;
pub const CAMERA_POSE_PARAMETERS: usize = 12;

/// Residual assigned to points that land on the camera plane inside `Factor`.
const INVALID_RESIDUAL: f64 = 1e6;

pub fn pack_intrinsics(intrinsics: &CameraIntrinsics) -> DVector<f64> {
    DVector::from_vec(vec![
        intrinsics.fx,
        intrinsics.fy,
        intrinsics.cx,
        intrinsics.cy,
        intrinsics.k1,
        intrinsics.k2,
    ])
}

fn check_length(parameters: &DVector<f64>, expected: usize) -> Result<(), CalibrationError> {
    if parameters.len() < expected {
        return Err(CalibrationError::InvalidInput(format!(
            "Expected at least {} parameters, found {}",
            expected,
            parameters.len()
        )));
    }
    Ok(())
}

/// Reads the first six entries of `parameters`.
///
/// # Errors
///
/// [`CalibrationError::InvalidInput`] if `parameters` is shorter than that.
pub fn unpack_intrinsics(parameters: &DVector<f64>) -> Result<CameraIntrinsics, CalibrationError> {
    check_length(parameters, INTRINSICS_PARAMETERS)?;
    Ok(CameraIntrinsics {
        fx: parameters[0],
        fy: parameters[1],
        cx: parameters[2],
        cy: parameters[3],
        k1: parameters[4],
        k2: parameters[5],
    })
}

pub fn pack_camera_pose(intrinsics: &CameraIntrinsics, pose: &Pose) -> DVector<f64> {
    let rotation = pose.rotation_vector();
    let mut parameters = DVector::zeros(CAMERA_POSE_PARAMETERS);
    parameters
        .rows_mut(0, INTRINSICS_PARAMETERS)
        .copy_from(&pack_intrinsics(intrinsics));
    parameters.fixed_rows_mut::<3>(6).copy_from(&rotation);
    parameters.fixed_rows_mut::<3>(9).copy_from(&pose.translation);
    parameters
}

/// # Errors
///
/// [`CalibrationError::InvalidInput`] for fewer than twelve parameters.
pub fn unpack_camera_pose(
    parameters: &DVector<f64>,
) -> Result<(CameraIntrinsics, Pose), CalibrationError> {
    check_length(parameters, CAMERA_POSE_PARAMETERS)?;
    let rotation: Vector3<f64> = parameters.fixed_rows::<3>(6).into_owned();
    let translation: Vector3<f64> = parameters.fixed_rows::<3>(9).into_owned();
    Ok((
        unpack_intrinsics(parameters)?,
        Pose::from_rotation_vector(&rotation, translation),
    ))
}

/// Rodrigues rotation of `point` by `rotation_vector`, for any scalar the
/// solvers differentiate with.
fn rotate<T: RealField>(rotation_vector: &Vector3<T>, point: &Vector3<T>) -> Vector3<T> {
    let theta2 = rotation_vector.norm_squared();
    if theta2 > T::from_subset(&1e-20_f64) {
        let theta = theta2.sqrt();
        let axis = rotation_vector / theta.clone();
        let (sin, cos) = (theta.clone().sin(), theta.cos());
        let along = axis.dot(point) * (T::one() - cos.clone());
        point * cos + axis.cross(point) * sin + axis * along
    } else {
        point + rotation_vector.cross(point)
    }
}

/// Generic pinhole + radial projection; `None` on the camera plane.
fn project_generic<T: RealField>(camera: &[T], point: &Vector3<T>) -> Option<Vector2<T>> {
    let z = point.z.clone();
    let epsilon = T::from_subset(&f64::EPSILON);
    if z < epsilon && z > -epsilon.clone() {
        return None;
    }
    let x = point.x.clone() / z.clone();
    let y = point.y.clone() / z;
    let r2 = x.clone() * x.clone() + y.clone() * y.clone();
    let factor =
        T::one() + camera[4].clone() * r2.clone() + camera[5].clone() * r2.clone() * r2;
    Some(Vector2::new(
        camera[0].clone() * x * factor.clone() + camera[2].clone(),
        camera[1].clone() * y * factor + camera[3].clone(),
    ))
}

fn write_residual<T: RealField>(
    residuals: &mut DVector<T>,
    index: usize,
    predicted: Option<Vector2<T>>,
    observed: &Vector2<f64>,
) {
    match predicted {
        Some(p) => {
            residuals[2 * index] = T::from_subset(&observed.x) - p.x.clone();
            residuals[2 * index + 1] = T::from_subset(&observed.y) - p.y.clone();
        }
        None => {
            residuals[2 * index] = T::from_subset(&INVALID_RESIDUAL);
            residuals[2 * index + 1] = T::from_subset(&INVALID_RESIDUAL);
        }
    }
}

/// Depth camera intrinsics with the identity pose: depth-space points are
/// already in the depth camera's frame.
#[derive(Debug, Clone)]
pub struct DepthIntrinsicsCost {
    world: Vec<Vector3<f64>>,
    pixels: Vec<Vector2<f64>>,
}

impl DepthIntrinsicsCost {
    /// # Errors
    ///
    /// [`CalibrationError::InvalidInput`] for empty or mismatched inputs.
    pub fn new(world: &[Vector3<f64>], pixels: &[Vector2<f64>]) -> Result<Self, CalibrationError> {
        check_pairs(world, pixels)?;
        Ok(DepthIntrinsicsCost {
            world: world.to_vec(),
            pixels: pixels.to_vec(),
        })
    }
}

impl ResidualFunction for DepthIntrinsicsCost {
    fn num_parameters(&self) -> usize {
        INTRINSICS_PARAMETERS
    }

    fn num_residuals(&self) -> usize {
        2 * self.world.len()
    }

    fn residuals(&self, parameters: &DVector<f64>) -> Result<DVector<f64>, CalibrationError> {
        let intrinsics = unpack_intrinsics(parameters)?;
        let mut residuals = DVector::zeros(self.num_residuals());
        for (i, (world, observed)) in self.world.iter().zip(&self.pixels).enumerate() {
            let predicted = intrinsics.project(world)?;
            residuals[2 * i] = observed.x - predicted.x;
            residuals[2 * i + 1] = observed.y - predicted.y;
        }
        Ok(residuals)
    }
}

impl<T: RealField> Factor<T> for DepthIntrinsicsCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let camera = params[0].as_slice();
        let mut residuals = DVector::zeros(self.pixels.len() * 2);
        for (i, (world, observed)) in self.world.iter().zip(&self.pixels).enumerate() {
            let point = world.map(|v| T::from_subset(&v));
            write_residual(&mut residuals, i, project_generic(camera, &point), observed);
        }
        residuals
    }
}

/// Intrinsics and depth→camera pose of the color camera (or a projector).
#[derive(Debug, Clone)]
pub struct CameraPoseCost {
    world: Vec<Vector3<f64>>,
    pixels: Vec<Vector2<f64>>,
}

impl CameraPoseCost {
    /// # Errors
    ///
    /// [`CalibrationError::InvalidInput`] for empty or mismatched inputs.
    pub fn new(world: &[Vector3<f64>], pixels: &[Vector2<f64>]) -> Result<Self, CalibrationError> {
        check_pairs(world, pixels)?;
        Ok(CameraPoseCost {
            world: world.to_vec(),
            pixels: pixels.to_vec(),
        })
    }
}

impl ResidualFunction for CameraPoseCost {
    fn num_parameters(&self) -> usize {
        CAMERA_POSE_PARAMETERS
    }

    fn num_residuals(&self) -> usize {
        2 * self.world.len()
    }

    fn residuals(&self, parameters: &DVector<f64>) -> Result<DVector<f64>, CalibrationError> {
        let (intrinsics, pose) = unpack_camera_pose(parameters)?;
        let mut residuals = DVector::zeros(self.num_residuals());
        for (i, (world, observed)) in self.world.iter().zip(&self.pixels).enumerate() {
            let predicted = intrinsics.project(&pose.transform_point(world))?;
            residuals[2 * i] = observed.x - predicted.x;
            residuals[2 * i + 1] = observed.y - predicted.y;
        }
        Ok(residuals)
    }
}

impl<T: RealField> Factor<T> for CameraPoseCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let camera = params[0].as_slice();
        let rotation = Vector3::new(camera[6].clone(), camera[7].clone(), camera[8].clone());
        let translation = Vector3::new(camera[9].clone(), camera[10].clone(), camera[11].clone());

        let mut residuals = DVector::zeros(self.pixels.len() * 2);
        for (i, (world, observed)) in self.world.iter().zip(&self.pixels).enumerate() {
            let point = world.map(|v| T::from_subset(&v));
            let in_camera = rotate(&rotation, &point) + translation.clone();
            write_residual(&mut residuals, i, project_generic(camera, &in_camera), observed);
        }
        residuals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::synthetic::SyntheticRig;
    use approx::assert_relative_eq;

    #[test]
    fn test_pack_unpack_camera_pose() {
        let rig = SyntheticRig::kinect_like();
        let parameters = pack_camera_pose(&rig.color, &rig.depth_to_color);
        assert_eq!(parameters.len(), CAMERA_POSE_PARAMETERS);
        assert_eq!(parameters[0], rig.color.fx);
        assert_eq!(parameters[5], rig.color.k2);
        assert_eq!(parameters[9], rig.depth_to_color.translation.x);

        let (intrinsics, pose) = unpack_camera_pose(&parameters).unwrap();
        assert_eq!(intrinsics, rig.color);
        assert_relative_eq!(
            pose.rotation.matrix(),
            rig.depth_to_color.rotation.matrix(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_unpack_rejects_short_vectors() {
        assert!(matches!(
            unpack_intrinsics(&DVector::zeros(5)),
            Err(CalibrationError::InvalidInput(_))
        ));
        assert!(matches!(
            unpack_camera_pose(&DVector::zeros(INTRINSICS_PARAMETERS)),
            Err(CalibrationError::InvalidInput(_))
        ));

        let cost =
            DepthIntrinsicsCost::new(&[Vector3::new(0.1, 0.1, 1.0)], &[Vector2::zeros()]).unwrap();
        assert!(cost.residuals(&DVector::zeros(3)).is_err());
    }

    #[test]
    fn test_residual_is_observed_minus_predicted() {
        // Projects to (60, 40).
        let world = [Vector3::new(0.1, -0.1, 1.0)];
        let parameters = pack_intrinsics(&CameraIntrinsics::new(100.0, 100.0, 50.0, 50.0));
        let cost = DepthIntrinsicsCost::new(&world, &[Vector2::new(62.0, 39.0)]).unwrap();

        let r = cost.residuals(&parameters).unwrap();
        assert_relative_eq!(r[0], 2.0, epsilon = 1e-12);
        assert_relative_eq!(r[1], -1.0, epsilon = 1e-12);

        let generic: DVector<f64> = cost.residual_func(&[parameters]);
        assert_relative_eq!(generic, r, epsilon = 1e-12);
    }

    #[test]
    fn test_rotate_matches_rotation3() {
        let rv = Vector3::new(0.3, -0.2, 0.5);
        let p = Vector3::new(1.0, 2.0, 3.0);
        let expected = Pose::from_rotation_vector(&rv, Vector3::zeros()).transform_point(&p);
        assert_relative_eq!(rotate(&rv, &p), expected, epsilon = 1e-12);
        assert_relative_eq!(rotate(&Vector3::zeros(), &p), p, epsilon = 1e-15);
    }

    #[test]
    fn test_zero_residuals_at_ground_truth() {
        let rig = SyntheticRig::kinect_like();
        let samples = rig.correspondences(30).unwrap();
        let world: Vec<_> = samples.iter().map(|s| s.world).collect();
        let depth: Vec<_> = samples.iter().map(|s| s.depth_pixel).collect();
        let color: Vec<_> = samples.iter().filter_map(|s| s.color_pixel).collect();

        let depth_cost = DepthIntrinsicsCost::new(&world, &depth).unwrap();
        let r = depth_cost.residuals(&pack_intrinsics(&rig.depth)).unwrap();
        assert_eq!(r.len(), depth_cost.num_residuals());
        assert!(r.amax() < 1e-9);

        let color_cost = CameraPoseCost::new(&world, &color).unwrap();
        let r = color_cost
            .residuals(&pack_camera_pose(&rig.color, &rig.depth_to_color))
            .unwrap();
        assert!(r.amax() < 1e-9);
    }

    #[test]
    fn test_factor_agrees_with_residual_function() {
        let rig = SyntheticRig::kinect_like();
        let samples = rig.correspondences(20).unwrap();
        let world: Vec<_> = samples.iter().map(|s| s.world).collect();
        let color: Vec<_> = samples.iter().filter_map(|s| s.color_pixel).collect();
        let cost = CameraPoseCost::new(&world, &color).unwrap();

        let mut parameters = pack_camera_pose(&rig.color, &rig.depth_to_color);
        parameters[0] += 3.0;
        parameters[7] += 0.01;
        parameters[9] += 0.02;

        let expected = cost.residuals(&parameters).unwrap();
        let generic: DVector<f64> = cost.residual_func(&[parameters.clone()]);
        assert_relative_eq!(generic, expected, epsilon = 1e-8);

        let depth: Vec<_> = samples.iter().map(|s| s.depth_pixel).collect();
        let depth_cost = DepthIntrinsicsCost::new(&world, &depth).unwrap();
        let depth_parameters = pack_intrinsics(&rig.depth.with_distortion(0.01, -0.002));
        let generic: DVector<f64> = depth_cost.residual_func(&[depth_parameters.clone()]);
        assert_relative_eq!(
            generic,
            depth_cost.residuals(&depth_parameters).unwrap(),
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_degenerate_point_is_an_error() {
        let cost = DepthIntrinsicsCost::new(
            &[Vector3::new(0.1, 0.1, 1.0), Vector3::new(0.2, 0.0, 0.0)],
            &[Vector2::new(0.0, 0.0), Vector2::new(0.0, 0.0)],
        )
        .unwrap();
        let parameters = pack_intrinsics(&CameraIntrinsics::new(100.0, 100.0, 50.0, 50.0));
        assert!(matches!(
            cost.residuals(&parameters),
            Err(CalibrationError::Camera(_))
        ));

        let generic: DVector<f64> = cost.residual_func(&[parameters]);
        assert_eq!(generic[2], INVALID_RESIDUAL);
    }

    #[test]
    fn test_mismatched_inputs() {
        assert!(DepthIntrinsicsCost::new(&[Vector3::new(0.0, 0.0, 1.0)], &[]).is_err());
        assert!(CameraPoseCost::new(&[], &[]).is_err());
    }
}
