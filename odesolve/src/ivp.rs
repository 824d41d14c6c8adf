use nalgebra::DVector;

use crate::error::{Error, Result};

/// Outcome of one right-hand-side evaluation.
///
/// A recoverable failure asks the caller to halve `h` and retry (bounded by
/// the usual error-test/convergence retry budgets); an unrecoverable failure
/// terminates the advance immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RhsOutcome {
    Ok,
    RecoverableFailure,
    UnrecoverableFailure,
}

/// The calling convention for f(t, y) -> y', §6.1.
///
/// `f` reads `y` (length D) and writes exactly D values into `out`; it must
/// be deterministic and total over the reachable domain and must not mutate
/// `y`. Implementations may still be `FnMut` to let a caller count
/// evaluations or cache intermediate results.
pub type RhsFn<'a> = dyn FnMut(f64, &DVector<f64>, &mut DVector<f64>) -> RhsOutcome + 'a;

/// The independent-variable descriptor: name, start, finish, output-grid step.
///
/// `step` is the spacing of the *output* grid the caller wants sampled, not
/// the internal adaptive step size.
#[derive(Debug, Clone)]
pub struct Argument {
    pub name: String,
    pub start: f64,
    pub finish: f64,
    pub step: f64,
}

impl Argument {
    pub fn validate(&self) -> Result<()> {
        if self.start == self.finish {
            return Err(Error::InvalidInput(
                "argument start and finish must differ".into(),
            ));
        }
        if !(self.step > 0.0) {
            return Err(Error::InvalidInput("argument step must be positive".into()));
        }
        Ok(())
    }

    /// Direction of integration: +1.0 if finish > start, else -1.0.
    pub fn direction(&self) -> f64 {
        if self.finish >= self.start {
            1.0
        } else {
            -1.0
        }
    }

    /// N = floor((finish - start) / step) + 1, the number of output rows.
    pub fn grid_len(&self) -> usize {
        (((self.finish - self.start) / self.step).abs().floor() as usize) + 1
    }
}

/// A caller-owned, immutable snapshot of an initial-value problem.
pub struct Ivp<'a> {
    pub model_name: String,
    pub argument: Argument,
    pub y0: DVector<f64>,
    pub rhs: Box<RhsFn<'a>>,
    pub tolerance: f64,
    pub output_names: Vec<String>,
}

impl<'a> Ivp<'a> {
    pub fn new(
        model_name: impl Into<String>,
        argument: Argument,
        y0: DVector<f64>,
        rhs: impl FnMut(f64, &DVector<f64>, &mut DVector<f64>) -> RhsOutcome + 'a,
        tolerance: f64,
        output_names: Vec<String>,
    ) -> Result<Self> {
        let ivp = Self {
            model_name: model_name.into(),
            argument,
            y0,
            rhs: Box::new(rhs),
            tolerance,
            output_names,
        };
        ivp.validate()?;
        Ok(ivp)
    }

    pub fn dim(&self) -> usize {
        self.y0.len()
    }

    pub fn validate(&self) -> Result<()> {
        self.argument.validate()?;
        if self.y0.is_empty() {
            return Err(Error::InvalidInput("y0 must have length D > 0".into()));
        }
        if !(self.tolerance > 0.0) {
            return Err(Error::InvalidInput("tolerance must be positive".into()));
        }
        if !self.output_names.is_empty() && self.output_names.len() != self.y0.len() {
            return Err(Error::InvalidInput(
                "output column names must have length D".into(),
            ));
        }
        Ok(())
    }
}

/// Optional collaborator that lets a caller enforce wall-clock or iteration
/// budgets, §5. Must not mutate the IVP or the integrator.
pub trait SolverCallback {
    /// Invoked once per outer accepted step. Return `Err` to abort.
    fn iteration_start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Invoked exactly once after successful termination.
    fn computation_complete(&mut self) {}

    /// Invoked when the Nordsieck Adams/BDF switcher (§4.3) changes family:
    /// `to_bdf` is `true` for an Adams->BDF switch, `false` for the reverse.
    /// Default no-op; callers that want to observe switching without a
    /// dedicated statistics field can override it.
    fn family_switch(&mut self, _to_bdf: bool) {}
}

/// A no-op callback, used when the caller doesn't need cancellation.
pub struct NoCallback;
impl SolverCallback for NoCallback {}

/// The result of integrating an IVP to its output grid: column 0 is `t`,
/// columns 1..=D are the solution components, sampled at `argument.step`
/// spacing with the first row pinned to (start, y0) and the last row pinned
/// to (finish, y_final), §6.1.
#[derive(Debug, Clone)]
pub struct Solution {
    pub t: Vec<f64>,
    pub y: Vec<DVector<f64>>,
}

impl Solution {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            t: Vec::with_capacity(n),
            y: Vec::with_capacity(n),
        }
    }

    pub fn push(&mut self, t: f64, y: DVector<f64>) {
        self.t.push(t);
        self.y.push(y);
    }

    pub fn len(&self) -> usize {
        self.t.len()
    }

    pub fn is_empty(&self) -> bool {
        self.t.is_empty()
    }

    /// Materialises the D+1 column-major arrays the IVP boundary (§6.1)
    /// describes: `columns()[0]` is the argument axis, `columns()[1+i]` is
    /// component `i`.
    pub fn columns(&self) -> Vec<Vec<f64>> {
        let d = self.y.first().map(|y| y.len()).unwrap_or(0);
        let mut cols = vec![Vec::with_capacity(self.t.len()); d + 1];
        for (t, y) in self.t.iter().zip(self.y.iter()) {
            cols[0].push(*t);
            for i in 0..d {
                cols[i + 1].push(y[i]);
            }
        }
        cols
    }
}
