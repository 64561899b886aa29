//! Optional polish of a finished stage with `tiny_solver`.
//!
//! The same reprojection cost is handed to `tiny_solver`'s autodiff
//! Levenberg-Marquardt. Callers compare the polished RMS with the stepwise
//! solver's and keep whichever is lower.

use crate::optimization::{CameraPoseCost, DepthIntrinsicsCost, ResidualFunction};

use log::{debug, info};
use nalgebra::DVector;
use std::collections::HashMap;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

const PARAMS: &str = "params";

/// Refines `[fx, fy, cx, cy, k1, k2]` of the depth camera.
///
/// Returns `None` if `tiny_solver` gives up.
pub fn polish_depth_intrinsics(
    cost: &DepthIntrinsicsCost,
    seed: &DVector<f64>,
) -> Option<DVector<f64>> {
    let mut problem = tiny_solver::Problem::new();
    problem.add_residual_block(
        cost.num_residuals(),
        &[PARAMS],
        Box::new(cost.clone()),
        None,
    );
    optimize(&problem, seed)
}

/// Refines the 12 intrinsics and pose parameters of the color camera or projector.
///
/// Returns `None` if `tiny_solver` gives up.
pub fn polish_camera_pose(cost: &CameraPoseCost, seed: &DVector<f64>) -> Option<DVector<f64>> {
    let mut problem = tiny_solver::Problem::new();
    problem.add_residual_block(
        cost.num_residuals(),
        &[PARAMS],
        Box::new(cost.clone()),
        None,
    );
    optimize(&problem, seed)
}

fn optimize(problem: &tiny_solver::Problem, seed: &DVector<f64>) -> Option<DVector<f64>> {
    let mut initial_values = HashMap::new();
    initial_values.insert(PARAMS.to_string(), seed.clone());

    debug!("tiny_solver polish of {} parameters", seed.len());
    let optimizer = LevenbergMarquardtOptimizer::default();
    let result = optimizer.optimize(problem, &initial_values, None)?;
    let polished = result.get(PARAMS)?.clone();

    if polished.iter().all(|v| v.is_finite()) {
        info!("tiny_solver polish finished");
        Some(polished)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::synthetic::SyntheticRig;
    use crate::optimization::residuals::pack_intrinsics;
    use crate::optimization::rms_of;

    #[test]
    fn test_polish_depth_intrinsics_from_close_seed() {
        let rig = SyntheticRig::kinect_like();
        let samples = rig.correspondences(60).unwrap();
        let world: Vec<_> = samples.iter().map(|s| s.world).collect();
        let depth: Vec<_> = samples.iter().map(|s| s.depth_pixel).collect();
        let cost = DepthIntrinsicsCost::new(&world, &depth).unwrap();

        let mut seed = pack_intrinsics(&rig.depth);
        seed[0] += 2.0;
        seed[3] -= 1.5;
        let seed_rms = rms_of(&cost.residuals(&seed).unwrap());

        let polished = polish_depth_intrinsics(&cost, &seed).unwrap();
        let polished_rms = rms_of(&cost.residuals(&polished).unwrap());
        assert!(polished_rms < seed_rms);
        assert!(polished_rms < 1e-4);
    }
}
