//! Reifies §9's "dynamic dispatch on method name" design note: the
//! method-switching configuration map (§6.3) names a method by a closed set
//! of string-like keys; this module is the one `match` that turns
//! [`MethodName`] into a call against the family that implements it, rather
//! than scattering that decision across callers.
//!
//! Unknown method names never reach here: [`MethodName::default`] already
//! falls back to `ros34prw` at deserialization time (§6.3, §9).

use std::time::Instant;

use crate::error::Result;
use crate::ivp::{Ivp, Solution, SolverCallback};
use crate::options::{Lmm, MethodName, MethodOptions, Options};
use crate::rk::RkMethod;
use crate::rosenbrock::RosenbrockMethod;

/// A [`SolverCallback`] enforcing the `max_time_ms`/`max_iterations` budget
/// of a [`MethodOptions`] (§6.3, §5 "Timeouts... enforced externally through
/// the iteration-start callback").
pub struct BudgetCallback {
    deadline: Option<Instant>,
    max_iterations: Option<u64>,
    iterations: u64,
}

impl BudgetCallback {
    pub fn new(options: &MethodOptions) -> Self {
        Self {
            deadline: (options.max_time_ms >= 0)
                .then(|| Instant::now() + std::time::Duration::from_millis(options.max_time_ms as u64)),
            max_iterations: options.max_iterations,
            iterations: 0,
        }
    }
}

impl SolverCallback for BudgetCallback {
    fn iteration_start(&mut self) -> Result<()> {
        self.iterations += 1;
        if let Some(max) = self.max_iterations {
            if self.iterations > max {
                return Err(crate::error::Error::CallbackAbort);
            }
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(crate::error::Error::CallbackAbort);
            }
        }
        Ok(())
    }
}

/// Runs `ivp` to its output grid with whichever family `options.method`
/// names, honouring `max_time_ms`/`max_iterations` via [`BudgetCallback`]
/// chained ahead of any caller-supplied callback.
///
/// `cvode`'s native interface (`create`/`advance`/`dky`) doesn't produce a
/// grid-shaped [`Solution`] directly; here it is driven one output-grid
/// point at a time via `AdvanceMode::Normal`, matching every other family's
/// public contract (§6.1) so a caller can pick a method by name without
/// caring which internal shape backs it.
pub fn solve(
    options: &MethodOptions,
    ivp: &mut Ivp<'_>,
    mut user_callback: Option<&mut dyn SolverCallback>,
) -> Result<Solution> {
    let mut budget = BudgetCallback::new(options);
    let mut chained = ChainedCallback { budget: &mut budget, user: user_callback.as_deref_mut() };
    let callback: Option<&mut dyn SolverCallback> = Some(&mut chained);

    match options.method {
        MethodName::Rk3 => crate::rk::integrate(RkMethod::BogackiShampine32, ivp, callback),
        MethodName::Rk4 => crate::rk::integrate(RkMethod::Fehlberg45, ivp, callback),
        MethodName::Rkdp => crate::rk::integrate(RkMethod::DormandPrince54, ivp, callback),
        MethodName::Mrt => crate::rosenbrock::integrate(RosenbrockMethod::Mrt, ivp, callback),
        MethodName::Ros3prw => crate::rosenbrock::integrate(RosenbrockMethod::Ros3prw, ivp, callback),
        MethodName::Ros34prw => crate::rosenbrock::integrate(RosenbrockMethod::Ros34prw, ivp, callback),
        MethodName::Ab4 => crate::multistep::integrate_fixed(crate::multistep::Family::Adams, ivp, callback),
        MethodName::Ab5 => crate::multistep::integrate(ivp, callback),
        MethodName::Lsoda => crate::multistep::integrate(ivp, callback),
        MethodName::Cvode => solve_via_cvode(ivp, callback),
    }
}

fn solve_via_cvode(ivp: &mut Ivp<'_>, mut callback: Option<&mut dyn SolverCallback>) -> Result<Solution> {
    use crate::cvode::{AdvanceFlag, AdvanceMode, CvodeIntegrator};

    let arg = ivp.argument.clone();
    let mut options = Options::default();
    options.rtol = ivp.tolerance;
    let mut cvode = CvodeIntegrator::create(Lmm::Bdf, &ivp.y0, arg.start, options, &mut *ivp.rhs)?;

    let dir = arg.direction();
    let n = arg.grid_len();
    let mut sol = Solution::with_capacity(n);
    sol.push(arg.start, ivp.y0.clone());

    for k in 1..n {
        if let Some(cb) = callback.as_deref_mut() {
            cb.iteration_start()?;
        }
        let t_target = if k + 1 == n { arg.finish } else { arg.start + dir * arg.step * (k as f64) };
        let result = cvode.advance(t_target, AdvanceMode::Normal)?;
        match result.flag {
            AdvanceFlag::Success => sol.push(result.t, result.y),
            AdvanceFlag::StopTimeReached => {
                sol.push(result.t, result.y);
                break;
            }
            other => {
                return Err(crate::error::Error::InvalidInput(format!(
                    "cvode advance returned non-success flag {other:?}"
                )))
            }
        }
    }
    if let Some(cb) = callback.as_deref_mut() {
        cb.computation_complete();
    }
    Ok(sol)
}

/// Runs the budget check first, then the user's own callback, so a
/// time/iteration abort always takes precedence (§5: the callback is "the
/// only cancellation path").
struct ChainedCallback<'a, 'b> {
    budget: &'a mut BudgetCallback,
    user: Option<&'b mut dyn SolverCallback>,
}

impl<'a, 'b> SolverCallback for ChainedCallback<'a, 'b> {
    fn iteration_start(&mut self) -> Result<()> {
        self.budget.iteration_start()?;
        if let Some(user) = self.user.as_deref_mut() {
            user.iteration_start()?;
        }
        Ok(())
    }

    fn computation_complete(&mut self) {
        self.budget.computation_complete();
        if let Some(user) = self.user.as_deref_mut() {
            user.computation_complete();
        }
    }
}
