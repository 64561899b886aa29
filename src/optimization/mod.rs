//! Non-linear least squares for the calibration stages.
//!
//! The [`ResidualFunction`] trait is the seam between the solver and the
//! calibration problems. [`LevenbergMarquardtSolver`] drives any residual
//! function one step at a time, so callers can observe or stop the iteration.
//! The reprojection costs in [`residuals`] implement both this trait and
//! `tiny_solver`'s `Factor`, which lets [`batch`] hand the same problem to
//! `tiny_solver` for an optional polish.

use crate::error::CalibrationError;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

pub mod batch;
pub mod levenberg_marquardt;
pub mod residuals;

pub use levenberg_marquardt::LevenbergMarquardtSolver;
pub use residuals::{CameraPoseCost, DepthIntrinsicsCost};

/// A vector-valued function whose sum of squares the solver minimises.
pub trait ResidualFunction {
    /// Length of the parameter vector.
    fn num_parameters(&self) -> usize;

    /// Length of the residual vector.
    fn num_residuals(&self) -> usize;

    /// Evaluates the residuals at `parameters`.
    ///
    /// Errors mark the parameters as infeasible (for example a point that ends
    /// up on the camera plane). The solver treats such trial steps as rejected.
    fn residuals(&self, parameters: &DVector<f64>) -> Result<DVector<f64>, CalibrationError>;
}

/// Tuning of [`LevenbergMarquardtSolver`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Steps (accepted or not) before the solver gives up.
    pub max_iterations: usize,
    /// `λ0 = initial_damping_scale · max(diag(JᵀJ))`.
    pub initial_damping_scale: f64,
    pub damping_increase: f64,
    pub damping_decrease: f64,
    /// Damping beyond which the problem is considered numerically broken.
    pub max_damping: f64,
    /// Relative cost decrease below which an accepted step converges.
    pub cost_tolerance: f64,
    /// Relative step norm below which the solver converges.
    pub step_tolerance: f64,
    /// Absolute RMS floor that counts as an exact fit.
    pub min_rms: f64,
    pub max_rejections_per_step: usize,
    /// Relative finite-difference step of the Jacobian.
    pub jacobian_step: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            max_iterations: 100,
            initial_damping_scale: 1e-3,
            damping_increase: 10.0,
            damping_decrease: 1.0 / 3.0,
            max_damping: 1e32,
            cost_tolerance: 1e-12,
            step_tolerance: 1e-12,
            min_rms: 1e-10,
            max_rejections_per_step: 10,
            jacobian_step: 1e-6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolverState {
    Initialized,
    Running,
    Converged,
    Failed,
}

/// Why the solver stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    /// RMS dropped below `min_rms`.
    MinRms,
    /// Relative cost change dropped below `cost_tolerance`.
    CostTolerance,
    /// Relative step norm dropped below `step_tolerance`.
    StepTolerance,
    /// `max_iterations` reached without converging.
    IterationCap,
    /// Cholesky failures or non-finite residuals up to `max_damping`.
    NumericalBreakdown,
}

impl Termination {
    pub fn is_convergence(self) -> bool {
        matches!(
            self,
            Termination::MinRms | Termination::CostTolerance | Termination::StepTolerance
        )
    }
}

/// One entry of the solver's iteration log.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: usize,
    /// RMS at the parameters held after this step.
    pub rms: f64,
    /// Damping used by the last trial of this step.
    pub damping: f64,
    pub step_norm: f64,
    pub accepted: bool,
}

/// Summary of one solver run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverReport {
    pub iterations: usize,
    pub initial_rms: f64,
    pub final_rms: f64,
    pub termination: Termination,
    pub history: Vec<IterationRecord>,
    /// Whether the `tiny_solver` polish replaced the solver's result.
    pub polished: bool,
}

/// `sqrt(Σr² / n)`.
pub fn rms_of(residuals: &DVector<f64>) -> f64 {
    if residuals.is_empty() {
        return 0.0;
    }
    (residuals.norm_squared() / residuals.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_from_partial_yaml() {
        let config: SolverConfig = serde_yaml::from_str("max_iterations: 7\nmin_rms: 0.5\n").unwrap();
        assert_eq!(config.max_iterations, 7);
        assert_eq!(config.min_rms, 0.5);
        assert_eq!(config.damping_increase, 10.0);
        assert_eq!(config.max_rejections_per_step, 10);
    }

    #[test]
    fn test_rms_of() {
        assert_eq!(rms_of(&DVector::from_vec(vec![3.0, 4.0])), (12.5f64).sqrt());
        assert_eq!(rms_of(&DVector::zeros(0)), 0.0);
    }

    #[test]
    fn test_termination_kinds() {
        assert!(Termination::MinRms.is_convergence());
        assert!(Termination::StepTolerance.is_convergence());
        assert!(!Termination::IterationCap.is_convergence());
        assert!(!Termination::NumericalBreakdown.is_convergence());
    }
}
