//! Stage functions of the calibration pipeline.

use crate::calibration::{CalibrationConfig, CalibrationResult, CalibrationStage};
use crate::camera::validation::validate_intrinsics;
use crate::camera::CameraIntrinsics;
use crate::error::CalibrationError;
use crate::geometry::{compute_reprojection_error, Correspondence, Pose, PoseEstimator};
use crate::optimization::batch::{polish_camera_pose, polish_depth_intrinsics};
use crate::optimization::residuals::{
    pack_camera_pose, pack_intrinsics, unpack_camera_pose, unpack_intrinsics,
};
use crate::optimization::{
    rms_of, CameraPoseCost, DepthIntrinsicsCost, IterationRecord, LevenbergMarquardtSolver,
    ResidualFunction, SolverReport,
};

use log::{debug, info, warn};
use nalgebra::{DVector, Matrix4, Vector2, Vector3};

type ProgressCallback<'a> = Box<dyn FnMut(CalibrationStage, &IterationRecord) + 'a>;

/// Result of the depth intrinsics stage.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthCalibration {
    pub intrinsics: CameraIntrinsics,
    /// Solver RMS over the pixel coordinates.
    pub rms: f64,
    pub report: SolverReport,
}

/// Result of an intrinsics + pose stage (color camera or projector).
#[derive(Debug, Clone, PartialEq)]
pub struct CameraCalibration {
    pub intrinsics: CameraIntrinsics,
    /// Maps depth-camera points into this device's frame.
    pub pose: Pose,
    /// Solver RMS over the pixel coordinates.
    pub rms: f64,
    pub report: SolverReport,
}

/// Runs calibration stages with one configuration.
///
/// ```no_run
/// use rgbd_calibration::calibration::{CalibrationConfig, CalibrationProcedure};
/// use rgbd_calibration::geometry::synthetic::SyntheticRig;
///
/// let samples = SyntheticRig::kinect_like().correspondences(100)?;
/// let config = CalibrationConfig::load_from_yaml("samples/calibration.yaml")?;
/// let result = CalibrationProcedure::new(config)
///     .with_progress(|stage, record| println!("{stage}: rms {:.4}", record.rms))
///     .run(&samples)?;
/// println!("{:?}", result.depth_to_color_matrix);
/// # Ok::<(), rgbd_calibration::error::CalibrationError>(())
/// ```
pub struct CalibrationProcedure<'a> {
    config: CalibrationConfig,
    progress: Option<ProgressCallback<'a>>,
}

impl<'a> CalibrationProcedure<'a> {
    pub fn new(config: CalibrationConfig) -> Self {
        CalibrationProcedure {
            config,
            progress: None,
        }
    }

    /// Calls `progress` after every solver step of every stage.
    pub fn with_progress<P>(mut self, progress: P) -> Self
    where
        P: FnMut(CalibrationStage, &IterationRecord) + 'a,
    {
        self.progress = Some(Box::new(progress));
        self
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// Calibrates the depth camera: all six intrinsics with the identity pose.
    ///
    /// # Errors
    ///
    /// * [`CalibrationError::InvalidInput`] for empty or mismatched inputs.
    /// * [`CalibrationError::Camera`] if `seed` is invalid or a point lies on the
    ///   camera plane.
    /// * [`CalibrationError::SolverDivergence`] if the solver does not converge.
    pub fn calibrate_depth_camera(
        &mut self,
        world_points: &[Vector3<f64>],
        depth_pixels: &[Vector2<f64>],
        seed: &CameraIntrinsics,
    ) -> Result<DepthCalibration, CalibrationError> {
        validate_intrinsics(seed)?;
        let cost = DepthIntrinsicsCost::new(world_points, depth_pixels)?;

        let mut parameters = pack_intrinsics(seed);
        let report = self.solve_stage(
            CalibrationStage::DepthIntrinsics,
            &cost,
            &mut parameters,
            polish_depth_intrinsics,
        )?;

        let intrinsics = unpack_intrinsics(&parameters)?;
        validate_intrinsics(&intrinsics)?;
        info!(
            "Depth intrinsics: fx {:.4}, fy {:.4}, cx {:.4}, cy {:.4}, k1 {:.6}, k2 {:.6} (rms {:.6})",
            intrinsics.fx,
            intrinsics.fy,
            intrinsics.cx,
            intrinsics.cy,
            intrinsics.k1,
            intrinsics.k2,
            report.final_rms
        );

        Ok(DepthCalibration {
            intrinsics,
            rms: report.final_rms,
            report,
        })
    }

    /// Calibrates the color camera intrinsics and the depth→color pose.
    ///
    /// `seed` undistorts the pixels for the DLT and starts the joint solve.
    ///
    /// # Errors
    ///
    /// As [`Self::calibrate_depth_camera`], plus
    /// [`CalibrationError::DegenerateGeometry`] when the DLT cannot seed the pose.
    pub fn calibrate_color_camera(
        &mut self,
        world_points: &[Vector3<f64>],
        color_pixels: &[Vector2<f64>],
        seed: &CameraIntrinsics,
    ) -> Result<CameraCalibration, CalibrationError> {
        self.calibrate_with_pose(
            CalibrationStage::ColorIntrinsicsAndPose,
            world_points,
            color_pixels,
            seed,
        )
    }

    /// Calibrates a projector from the depth-space points it lit and the
    /// projector pixels that lit them. The projector is treated as an inverse
    /// camera, so this is the color stage with projector pixels.
    ///
    /// # Errors
    ///
    /// Same as [`Self::calibrate_color_camera`].
    pub fn calibrate_projector(
        &mut self,
        world_points: &[Vector3<f64>],
        projector_pixels: &[Vector2<f64>],
        seed: &CameraIntrinsics,
    ) -> Result<CameraCalibration, CalibrationError> {
        self.calibrate_with_pose(
            CalibrationStage::ProjectorIntrinsicsAndPose,
            world_points,
            projector_pixels,
            seed,
        )
    }

    /// Runs the full depth+color pipeline with the configured seeds.
    ///
    /// The depth stage uses every correspondence; the color stage uses those
    /// with a color pixel.
    ///
    /// # Errors
    ///
    /// The first error of any stage.
    pub fn run(
        &mut self,
        correspondences: &[Correspondence],
    ) -> Result<CalibrationResult, CalibrationError> {
        if correspondences.is_empty() {
            return Err(CalibrationError::InvalidInput(
                "No correspondences to calibrate from".to_string(),
            ));
        }

        let world: Vec<Vector3<f64>> = correspondences.iter().map(|c| c.world).collect();
        let depth_pixels: Vec<Vector2<f64>> =
            correspondences.iter().map(|c| c.depth_pixel).collect();
        let (color_world, color_pixels): (Vec<Vector3<f64>>, Vec<Vector2<f64>>) = correspondences
            .iter()
            .filter_map(|c| c.color_pixel.map(|pixel| (c.world, pixel)))
            .unzip();

        info!(
            "Calibrating rig from {} correspondences ({} seen by the color camera)",
            correspondences.len(),
            color_world.len()
        );

        let depth_seed = self.config.depth_seed;
        let color_seed = self.config.color_seed;
        let depth = self.calibrate_depth_camera(&world, &depth_pixels, &depth_seed)?;
        let color = self.calibrate_color_camera(&color_world, &color_pixels, &color_seed)?;

        let depth_error = compute_reprojection_error(
            &world,
            &depth_pixels,
            &depth.intrinsics,
            &Pose::identity(),
        )?;
        let color_error =
            compute_reprojection_error(&color_world, &color_pixels, &color.intrinsics, &color.pose)?;
        info!("Depth camera {:?}", depth_error);
        info!("Color camera {:?}", color_error);

        Ok(CalibrationResult {
            depth_intrinsics: depth.intrinsics,
            color_intrinsics: color.intrinsics,
            depth_to_color: color.pose,
            depth_to_color_matrix: compose_depth_to_color(&color.pose),
            depth_rms: depth_error.rmse,
            color_rms: color_error.rmse,
            depth_error,
            color_error,
            depth_report: depth.report,
            color_report: color.report,
        })
    }

    fn calibrate_with_pose(
        &mut self,
        stage: CalibrationStage,
        world_points: &[Vector3<f64>],
        pixels: &[Vector2<f64>],
        seed: &CameraIntrinsics,
    ) -> Result<CameraCalibration, CalibrationError> {
        validate_intrinsics(seed)?;
        let cost = CameraPoseCost::new(world_points, pixels)?;

        let estimate =
            PoseEstimator::new(self.config.dlt).estimate_pose(world_points, pixels, seed)?;
        info!(
            "DLT seed for {}: rotation {:?}, translation {:?}",
            stage,
            estimate.pose.rotation_vector().as_slice(),
            estimate.pose.translation.as_slice()
        );

        let mut parameters = pack_camera_pose(seed, &estimate.pose);
        let report = self.solve_stage(stage, &cost, &mut parameters, polish_camera_pose)?;

        let (intrinsics, pose) = unpack_camera_pose(&parameters)?;
        validate_intrinsics(&intrinsics)?;
        info!(
            "{}: fx {:.4}, fy {:.4}, cx {:.4}, cy {:.4}, k1 {:.6}, k2 {:.6}, t {:?} (rms {:.6})",
            stage,
            intrinsics.fx,
            intrinsics.fy,
            intrinsics.cx,
            intrinsics.cy,
            intrinsics.k1,
            intrinsics.k2,
            pose.translation.as_slice(),
            report.final_rms
        );

        Ok(CameraCalibration {
            intrinsics,
            pose,
            rms: report.final_rms,
            report,
        })
    }

    /// Minimises `function` from `parameters`, then optionally polishes.
    fn solve_stage<F, P>(
        &mut self,
        stage: CalibrationStage,
        function: &F,
        parameters: &mut DVector<f64>,
        polish: P,
    ) -> Result<SolverReport, CalibrationError>
    where
        F: ResidualFunction,
        P: FnOnce(&F, &DVector<f64>) -> Option<DVector<f64>>,
    {
        info!(
            "Solving {} with {} parameters over {} residuals",
            stage,
            function.num_parameters(),
            function.num_residuals()
        );

        let callback = &mut self.progress;
        let mut solver = LevenbergMarquardtSolver::new(function, self.config.solver);
        let mut report = solver.minimize(parameters, |record| {
            if let Some(callback) = callback.as_mut() {
                callback(stage, record);
            }
        })?;

        if !report.termination.is_convergence() {
            warn!(
                "{} stopped after {} iterations: {:?} (rms {:.6})",
                stage, report.iterations, report.termination, report.final_rms
            );
            return Err(CalibrationError::SolverDivergence {
                reason: format!(
                    "{} stopped with {:?} after {} iterations",
                    stage, report.termination, report.iterations
                ),
                rms: report.final_rms,
                parameters: parameters.iter().copied().collect(),
            });
        }

        if self.config.polish_with_batch_solver {
            match polish(function, parameters) {
                Some(polished) => match function.residuals(&polished) {
                    Ok(residuals) if rms_of(&residuals) <= report.final_rms => {
                        info!(
                            "Polish of {} improved rms {:.6e} -> {:.6e}",
                            stage,
                            report.final_rms,
                            rms_of(&residuals)
                        );
                        parameters.copy_from(&polished);
                        report.final_rms = rms_of(&residuals);
                        report.polished = true;
                    }
                    _ => debug!("Polish of {} did not improve the fit", stage),
                },
                None => warn!("Polish of {} failed, keeping the solver result", stage),
            }
        }

        Ok(report)
    }
}

/// Homogeneous `[R | t; 0 0 0 1]` of the depth→color pose.
pub fn compose_depth_to_color(pose: &Pose) -> Matrix4<f64> {
    pose.to_matrix()
}
