//! The shared adaptive single-step skeleton (§9 "deep inheritance" note,
//! §4.0 of SPEC_FULL): predict with an embedded pair, estimate error,
//! accept-or-shrink, interpolate to the output grid. Every single-step
//! family (RK, Rosenbrock-W) implements [`StepOperator`] and is driven by
//! [`integrate_adaptive`] instead of re-deriving the outer loop.

use nalgebra::DVector;

use crate::error::{Error, Result};
use crate::grid::GridSampler;
use crate::ivp::{Argument, SolverCallback, Solution};

/// One trial step of size `h`, not yet committed to persistent state.
pub struct TrialStep {
    pub y_new: DVector<f64>,
    /// <= 1.0 means the step is within tolerance and may be accepted.
    pub error_norm: f64,
}

/// Step-size control knobs that differ slightly between families (§4.1,
/// §4.2): safety factor, growth/shrink clips, and the exponents used to
/// convert an error-norm ratio into a step-size ratio.
#[derive(Debug, Clone, Copy)]
pub struct StepControl {
    pub safety: f64,
    pub max_growth: f64,
    pub min_shrink: f64,
    pub pgrow: f64,
    pub pshrink: f64,
}

/// A single-step method's per-step computation, reified as described in
/// §9: "a small trait/interface over a step operator... consumed by a
/// generic driver."
pub trait StepOperator {
    fn name(&self) -> &'static str;

    /// Attempts one trial step of size `h` from `(t, y)`. Must be callable
    /// repeatedly with shrinking `h` without side effects that persist
    /// across rejected attempts.
    fn try_step(&mut self, t: f64, y: &DVector<f64>, h: f64) -> Result<TrialStep>;

    fn step_control(&self) -> StepControl;

    /// Called once a trial step is accepted, so FSAL-style operators can
    /// cache the last stage for reuse as the first stage of the next step.
    fn on_accept(&mut self, t: f64, y: &DVector<f64>, h: f64, trial: &TrialStep);

    /// A reasonable initial step-size guess, direction-signed. `t1` is the
    /// integration horizon's endpoint, so the Hairer-Norsett-Wanner-style
    /// heuristics (§4.2) can clip against the remaining distance.
    fn initial_step(&mut self, t0: f64, t1: f64, y0: &DVector<f64>, h_hint: f64) -> f64;

    /// Interpolates inside the step just accepted by `try_step`/`on_accept`,
    /// at fraction `theta` (`0` at the step start, `1` at the step end).
    /// Defaults to linear interpolation between the accepted endpoints;
    /// operators with a genuine continuous extension override this.
    fn dense_eval(&self, theta: f64, y_prev: &DVector<f64>, y_new: &DVector<f64>) -> DVector<f64> {
        y_prev + theta * (y_new - y_prev)
    }
}

/// Runs the outer accept/reject/grid-sample loop described in §9 and §4.1,
/// shared by every single-step family.
///
/// Takes `argument`/`y0` rather than a whole `&mut Ivp` so that a
/// [`StepOperator`] holding its own borrow of the right-hand side (as every
/// single-step operator does) doesn't alias a borrow of the problem struct
/// itself.
pub fn integrate_adaptive(
    arg: &Argument,
    y0: &DVector<f64>,
    op: &mut dyn StepOperator,
    mut callback: Option<&mut dyn SolverCallback>,
) -> Result<Solution> {
    let dir = arg.direction();
    let h_max = 10.0 * arg.step;

    let mut sol = Solution::with_capacity(arg.grid_len());
    let mut sampler = GridSampler::new(arg);

    let mut t = arg.start;
    let mut y = y0.clone();
    sol.push(t, y.clone());

    let mut h = op.initial_step(t, arg.finish, &y, arg.step).abs().max(1e-12) * dir.signum();
    if h == 0.0 {
        h = arg.step * dir;
    }

    loop {
        if let Some(cb) = callback.as_deref_mut() {
            cb.iteration_start()?;
        }

        // never step past the endpoint
        let remaining = arg.finish - t;
        if remaining.abs() <= 1e-13 * arg.finish.abs().max(1.0) {
            break;
        }
        if dir > 0.0 {
            if h > remaining {
                h = remaining;
            }
        } else if h < remaining {
            h = remaining;
        }
        if h.abs() > h_max {
            h = h_max * dir.signum();
        }

        let control = op.step_control();
        let trial = op.try_step(t, &y, h)?;

        if trial.error_norm <= 1.0 {
            let t_new = t + h;
            sampler.advance(&mut sol, t, t_new, dir, |theta| {
                op.dense_eval(theta, &y, &trial.y_new)
            });
            op.on_accept(t, &y, h, &trial);
            t = t_new;
            y = trial.y_new;

            let err = trial.error_norm.max(1e-300);
            let mut h_next = control.safety * h * err.powf(control.pgrow);
            if h_next.abs() > control.max_growth * h.abs() {
                h_next = control.max_growth * h.abs() * dir.signum();
            }
            h = h_next;
        } else {
            let err = trial.error_norm.max(1e-300);
            let mut h_new = control.safety * h * err.powf(control.pshrink);
            if h_new.abs() < control.min_shrink * h.abs() {
                h_new = control.min_shrink * h.abs() * dir.signum();
            }
            if t + h_new == t {
                return Err(Error::StepCollapse { method: op.name(), t });
            }
            h = h_new;
        }
    }

    sampler.finish(&mut sol, arg.finish, y);
    if let Some(cb) = callback.as_deref_mut() {
        cb.computation_complete();
    }
    Ok(sol)
}
