use thiserror::Error;

/// The error taxonomy for the whole crate.
///
/// Every integrator reports through this one enum rather than panicking;
/// conditions that are not failures (stop-time reached, a root found) are
/// reported through [`crate::cvode::AdvanceFlag`] instead, never here.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{method} failed: step size collapsed to machine precision at t = {t}")]
    StepCollapse { method: &'static str, t: f64 },

    #[error("more than {limit} consecutive error-test failures")]
    ErrorTestFailureExceeded { limit: u32 },

    #[error("more than {limit} consecutive nonlinear solver failures")]
    ConvergenceFailureExceeded { limit: u32 },

    #[error("linear solver failed: zero pivot in the iteration matrix")]
    LinearSolverFailure,

    #[error("right-hand-side evaluation failed (recoverable = {recoverable}) at t = {t}")]
    RhsFailure { t: f64, recoverable: bool },

    #[error("root function evaluation failed")]
    RootFunctionFailure,

    #[error("two roots within the rootfinder's time tolerance at initialisation")]
    RootsTooClose,

    #[error("internal step count exceeded max_steps = {max_steps} within one advance")]
    TooMuchWork { max_steps: u32 },

    #[error("requested tolerance is below what floating point allows at this state (suggested scale factor {suggested_scale_factor})")]
    TooMuchAccuracy { suggested_scale_factor: f64 },

    #[error("integration cancelled by caller-supplied callback")]
    CallbackAbort,
}

pub type Result<T> = std::result::Result<T, Error>;
