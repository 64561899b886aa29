//! Stepwise Levenberg-Marquardt.
//!
//! Each call to [`LevenbergMarquardtSolver::minimize_one_step`] performs one
//! damped Gauss-Newton iteration: a central-difference Jacobian, a Cholesky
//! solve of `(JᵀJ + λI)·Δp = Jᵀr`, and a bounded number of damping retries
//! until the cost decreases. The parameter vector is only written on an
//! accepted step, so it always holds the best estimate seen so far.

use crate::error::CalibrationError;
use crate::optimization::{
    rms_of, IterationRecord, ResidualFunction, SolverConfig, SolverReport, SolverState,
    Termination,
};

use log::{debug, warn};
use nalgebra::{DMatrix, DVector};

pub struct LevenbergMarquardtSolver<'a, F: ResidualFunction + ?Sized> {
    function: &'a F,
    config: SolverConfig,
    state: SolverState,
    termination: Option<Termination>,
    damping: f64,
    iteration: usize,
    /// Residuals at the caller's current parameters.
    residuals: DVector<f64>,
    initial_rms: f64,
    history: Vec<IterationRecord>,
}

impl<'a, F: ResidualFunction + ?Sized> LevenbergMarquardtSolver<'a, F> {
    pub fn new(function: &'a F, config: SolverConfig) -> Self {
        LevenbergMarquardtSolver {
            function,
            config,
            state: SolverState::Initialized,
            termination: None,
            damping: 0.0,
            iteration: 0,
            residuals: DVector::zeros(0),
            initial_rms: f64::NAN,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> SolverState {
        self.state
    }

    pub fn termination(&self) -> Option<Termination> {
        self.termination
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, SolverState::Converged | SolverState::Failed)
    }

    pub fn iterations(&self) -> usize {
        self.iteration
    }

    pub fn damping(&self) -> f64 {
        self.damping
    }

    /// RMS at the best parameters so far (`NaN` before the first step).
    pub fn rms(&self) -> f64 {
        if self.residuals.is_empty() {
            f64::NAN
        } else {
            rms_of(&self.residuals)
        }
    }

    pub fn history(&self) -> &[IterationRecord] {
        &self.history
    }

    /// Report of the run so far. `None` until the solver has stopped.
    pub fn report(&self) -> Option<SolverReport> {
        let termination = self.termination?;
        Some(SolverReport {
            iterations: self.iteration,
            initial_rms: self.initial_rms,
            final_rms: self.rms(),
            termination,
            history: self.history.clone(),
            polished: false,
        })
    }

    /// Runs one iteration and returns the RMS at `parameters` afterwards.
    ///
    /// A solver that already converged or failed returns its last RMS and
    /// leaves `parameters` untouched.
    ///
    /// # Errors
    ///
    /// * [`CalibrationError::InvalidInput`] if `parameters` has the wrong length.
    /// * The residual function's error if it cannot be evaluated at the seed.
    /// * [`CalibrationError::SolverDivergence`] if the seed residuals are not finite.
    pub fn minimize_one_step(
        &mut self,
        parameters: &mut DVector<f64>,
    ) -> Result<f64, CalibrationError> {
        if self.is_terminal() {
            return Ok(self.rms());
        }

        if self.state == SolverState::Initialized {
            self.start(parameters)?;
            if self.is_terminal() {
                return Ok(self.rms());
            }
        }

        let cost = self.residuals.norm_squared();
        let jacobian = match self.jacobian(parameters) {
            Some(jacobian) => jacobian,
            None => {
                warn!("Jacobian could not be evaluated at the current parameters");
                self.finish(SolverState::Failed, Termination::NumericalBreakdown);
                return Ok(self.rms());
            }
        };
        let hessian = jacobian.transpose() * &jacobian;
        let gradient = jacobian.transpose() * &self.residuals;

        if self.iteration == 0 && self.history.is_empty() {
            let max_diagonal = hessian.diagonal().max();
            self.damping = self.config.initial_damping_scale * max_diagonal.max(1.0);
        }

        let n = parameters.len();
        let mut step_norm = 0.0;
        for _ in 0..self.config.max_rejections_per_step.max(1) {
            let augmented = &hessian + DMatrix::<f64>::identity(n, n) * self.damping;
            let step = match augmented.cholesky() {
                Some(cholesky) => cholesky.solve(&gradient),
                None => {
                    if !self.grow_damping() {
                        return Ok(self.rms());
                    }
                    continue;
                }
            };

            step_norm = step.norm();
            let step_floor =
                self.config.step_tolerance * (parameters.norm() + self.config.step_tolerance);
            if step_norm <= step_floor {
                self.record(step_norm, false);
                self.finish(SolverState::Converged, Termination::StepTolerance);
                return Ok(self.rms());
            }

            let candidate = &*parameters - &step;
            let trial = match self.function.residuals(&candidate) {
                Ok(r) if r.iter().all(|v| v.is_finite()) => Some(r),
                _ => None,
            };

            match trial {
                Some(trial) if trial.norm_squared() < cost => {
                    let new_cost = trial.norm_squared();
                    parameters.copy_from(&candidate);
                    self.residuals = trial;
                    self.damping =
                        (self.damping * self.config.damping_decrease).max(f64::MIN_POSITIVE);
                    self.record(step_norm, true);

                    let relative_decrease = (cost - new_cost) / cost.max(f64::MIN_POSITIVE);
                    if self.rms() < self.config.min_rms {
                        self.finish(SolverState::Converged, Termination::MinRms);
                    } else if relative_decrease < self.config.cost_tolerance {
                        self.finish(SolverState::Converged, Termination::CostTolerance);
                    } else {
                        self.check_iteration_cap();
                    }
                    return Ok(self.rms());
                }
                Some(trial) => {
                    // The step no longer changes the cost measurably: at a minimum.
                    let relative_change =
                        (trial.norm_squared() - cost).abs() / cost.max(f64::MIN_POSITIVE);
                    if relative_change < self.config.cost_tolerance {
                        self.record(step_norm, false);
                        self.finish(SolverState::Converged, Termination::CostTolerance);
                        return Ok(self.rms());
                    }
                    if !self.grow_damping() {
                        return Ok(self.rms());
                    }
                }
                None => {
                    if !self.grow_damping() {
                        return Ok(self.rms());
                    }
                }
            }
        }

        self.record(step_norm, false);
        self.check_iteration_cap();
        Ok(self.rms())
    }

    /// Steps until the solver stops, calling `progress` after every step.
    ///
    /// # Errors
    ///
    /// Same as [`Self::minimize_one_step`].
    pub fn minimize<P>(
        &mut self,
        parameters: &mut DVector<f64>,
        mut progress: P,
    ) -> Result<SolverReport, CalibrationError>
    where
        P: FnMut(&IterationRecord),
    {
        while !self.is_terminal() {
            let logged = self.history.len();
            self.minimize_one_step(parameters)?;
            for record in &self.history[logged..] {
                progress(record);
            }
        }
        self.report().ok_or_else(|| {
            CalibrationError::InvalidInput("solver stopped without a termination reason".to_string())
        })
    }

    fn start(&mut self, parameters: &DVector<f64>) -> Result<(), CalibrationError> {
        if parameters.len() != self.function.num_parameters() {
            return Err(CalibrationError::InvalidInput(format!(
                "Expected {} parameters, got {}",
                self.function.num_parameters(),
                parameters.len()
            )));
        }

        let residuals = match self.function.residuals(parameters) {
            Ok(residuals) => residuals,
            Err(err) => {
                self.finish(SolverState::Failed, Termination::NumericalBreakdown);
                return Err(err);
            }
        };
        if residuals.iter().any(|v| !v.is_finite()) {
            self.finish(SolverState::Failed, Termination::NumericalBreakdown);
            return Err(CalibrationError::SolverDivergence {
                reason: "residuals are not finite at the initial parameters".to_string(),
                rms: f64::NAN,
                parameters: parameters.iter().copied().collect(),
            });
        }

        self.residuals = residuals;
        self.initial_rms = self.rms();
        self.state = SolverState::Running;
        debug!(
            "LM start: {} parameters, {} residuals, rms {:.6e}",
            parameters.len(),
            self.residuals.len(),
            self.initial_rms
        );

        if self.initial_rms < self.config.min_rms {
            self.finish(SolverState::Converged, Termination::MinRms);
        }
        Ok(())
    }

    /// Central differences with a step relative to each parameter's magnitude.
    fn jacobian(&self, parameters: &DVector<f64>) -> Option<DMatrix<f64>> {
        let m = self.residuals.len();
        let n = parameters.len();
        let mut jacobian = DMatrix::zeros(m, n);
        let mut shifted = parameters.clone();

        for j in 0..n {
            let h = self.config.jacobian_step * parameters[j].abs().max(1.0);
            shifted[j] = parameters[j] + h;
            let forward = self.function.residuals(&shifted).ok()?;
            shifted[j] = parameters[j] - h;
            let backward = self.function.residuals(&shifted).ok()?;
            shifted[j] = parameters[j];

            let column = (forward - backward) / (2.0 * h);
            if column.iter().any(|v| !v.is_finite()) {
                return None;
            }
            jacobian.set_column(j, &column);
        }
        Some(jacobian)
    }

    /// Returns `false` (and fails the solver) once damping exceeds its bound.
    fn grow_damping(&mut self) -> bool {
        self.damping *= self.config.damping_increase;
        if self.damping > self.config.max_damping {
            warn!(
                "LM damping {:.3e} exceeded {:.3e}, giving up",
                self.damping, self.config.max_damping
            );
            self.record(0.0, false);
            self.finish(SolverState::Failed, Termination::NumericalBreakdown);
            return false;
        }
        true
    }

    fn record(&mut self, step_norm: f64, accepted: bool) {
        self.iteration += 1;
        let record = IterationRecord {
            iteration: self.iteration,
            rms: self.rms(),
            damping: self.damping,
            step_norm,
            accepted,
        };
        debug!(
            "LM iter {:>3}: rms {:.6e}, lambda {:.3e}, |dp| {:.3e}, {}",
            record.iteration,
            record.rms,
            record.damping,
            record.step_norm,
            if accepted { "accepted" } else { "rejected" }
        );
        self.history.push(record);
    }

    fn check_iteration_cap(&mut self) {
        if !self.is_terminal() && self.iteration >= self.config.max_iterations {
            self.finish(SolverState::Failed, Termination::IterationCap);
        }
    }

    fn finish(&mut self, state: SolverState, termination: Termination) {
        self.state = state;
        self.termination = Some(termination);
        debug!("LM stopped after {} iterations: {:?}", self.iteration, termination);
    }
}
