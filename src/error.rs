use crate::camera::CameraModelError;

#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    #[error(transparent)]
    Camera(#[from] CameraModelError),

    /// Too few correspondences, or points that are (nearly) coplanar or
    /// collinear so the linear pose system has no unique solution.
    #[error(
        "Degenerate geometry: {reason} (smallest/second-smallest singular value ratio {singular_value_ratio:.3e}, conditioning {conditioning:.3e})"
    )]
    DegenerateGeometry {
        reason: String,
        singular_value_ratio: f64,
        conditioning: f64,
    },

    /// The solver stopped without converging. `parameters` is the best
    /// estimate found and `rms` its residual.
    #[error("Solver diverged: {reason} (best rms {rms:.6})")]
    SolverDivergence {
        reason: String,
        rms: f64,
        parameters: Vec<f64>,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
