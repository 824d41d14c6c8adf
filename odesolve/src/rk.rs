//! Adaptive single-step Runge-Kutta integrators (§4.1): Bogacki-Shampine
//! 3(2), Fehlberg 4(5), Dormand-Prince 5(4).

use nalgebra::DVector;

use crate::driver::{integrate_adaptive, StepControl, StepOperator, TrialStep};
use crate::error::Result;
use crate::ivp::{Ivp, RhsOutcome, SolverCallback};
use crate::linalg::{scale_vector, weighted_max};
use crate::tableau::Tableau;

const SAFETY: f64 = 0.9;
const GROWTH: f64 = 4.0;
const SHRINK: f64 = 0.25;
const TINY: f64 = 1e-20;

pub struct RkIntegrator<'f, 'ivp> {
    tableau: Tableau,
    tolerance: f64,
    rhs: &'ivp mut (dyn FnMut(f64, &DVector<f64>, &mut DVector<f64>) -> RhsOutcome + 'f),
    k: Vec<DVector<f64>>,
    fsal_k0: Option<DVector<f64>>,
    dim: usize,
}

impl<'f, 'ivp> RkIntegrator<'f, 'ivp> {
    fn new(
        tableau: Tableau,
        tolerance: f64,
        dim: usize,
        rhs: &'ivp mut (dyn FnMut(f64, &DVector<f64>, &mut DVector<f64>) -> RhsOutcome + 'f),
    ) -> Self {
        let stages = tableau.stages();
        Self {
            tableau,
            tolerance,
            rhs,
            k: vec![DVector::zeros(dim); stages],
            fsal_k0: None,
            dim,
        }
    }
}

impl<'f, 'ivp> StepOperator for RkIntegrator<'f, 'ivp> {
    fn name(&self) -> &'static str {
        self.tableau.name
    }

    fn try_step(&mut self, t: f64, y: &DVector<f64>, h: f64) -> Result<TrialStep> {
        let stages = self.tableau.stages();
        let mut y_stage = y.clone();

        if self.tableau.fsal {
            if let Some(k0) = &self.fsal_k0 {
                self.k[0] = k0.clone();
            } else {
                self.rhs.call(t, y, &mut self.k[0]);
            }
        } else {
            self.rhs.call(t, y, &mut self.k[0]);
        }

        for i in 1..stages {
            y_stage.copy_from(y);
            for j in 0..i {
                let aij = self.tableau.a[i][j];
                if aij != 0.0 {
                    y_stage.axpy(h * aij, &self.k[j], 1.0);
                }
            }
            let ti = t + h * self.tableau.c[i];
            self.rhs.call(ti, &y_stage, &mut self.k[i]);
        }

        let mut y_new = y.clone();
        let mut y_err = DVector::zeros(self.dim);
        for i in 0..stages {
            if self.tableau.b[i] != 0.0 {
                y_new.axpy(h * self.tableau.b[i], &self.k[i], 1.0);
            }
            let d = self.tableau.b[i] - self.tableau.b_hat[i];
            if d != 0.0 {
                y_err.axpy(h * d, &self.k[i], 1.0);
            }
        }

        let mut f0 = DVector::zeros(self.dim);
        self.rhs.call(t, y, &mut f0);
        let scale = scale_vector(y, h, &f0, TINY);
        let error_norm = weighted_max(&y_err, &scale.map(|s| 1.0 / s)) / self.tolerance;

        Ok(TrialStep { y_new, error_norm })
    }

    fn step_control(&self) -> StepControl {
        let p = self.tableau.order as f64;
        StepControl {
            safety: SAFETY,
            max_growth: GROWTH,
            min_shrink: SHRINK,
            pgrow: -1.0 / (p + 1.0),
            pshrink: -1.0 / p,
        }
    }

    fn on_accept(&mut self, _t: f64, _y: &DVector<f64>, _h: f64, _trial: &TrialStep) {
        if self.tableau.fsal {
            self.fsal_k0 = Some(self.k[self.tableau.stages() - 1].clone());
        }
    }

    fn initial_step(&mut self, _t0: f64, _t1: f64, _y0: &DVector<f64>, h_hint: f64) -> f64 {
        h_hint
    }
}

/// Small extension trait so `self.rhs.call(...)` reads naturally against the
/// `RhsFn` calling convention (§6.1) without threading a `Result` through
/// every stage evaluation: a non-`Ok` outcome degrades to "treat as zero
/// derivative for this trial, let the error test reject it," letting the
/// usual shrink-and-retry policy (§7) handle recoverable rhs failures
/// without a parallel control path through the stage loop.
trait RhsCall {
    fn call(&mut self, t: f64, y: &DVector<f64>, out: &mut DVector<f64>);
}

impl<'f> RhsCall for dyn FnMut(f64, &DVector<f64>, &mut DVector<f64>) -> RhsOutcome + 'f {
    fn call(&mut self, t: f64, y: &DVector<f64>, out: &mut DVector<f64>) {
        if (self)(t, y, out) != RhsOutcome::Ok {
            out.fill(f64::NAN);
        }
    }
}

/// Which of the three adaptive single-step families to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RkMethod {
    BogackiShampine32,
    Fehlberg45,
    DormandPrince54,
}

impl RkMethod {
    fn tableau(self) -> Tableau {
        match self {
            RkMethod::BogackiShampine32 => Tableau::bogacki_shampine32(),
            RkMethod::Fehlberg45 => Tableau::fehlberg45(),
            RkMethod::DormandPrince54 => Tableau::dormand_prince54(),
        }
    }
}

/// `integrate(ivp, callback?) -> solution`, the public contract of §4.1.
pub fn integrate(
    method: RkMethod,
    ivp: &mut Ivp<'_>,
    callback: Option<&mut dyn SolverCallback>,
) -> Result<crate::ivp::Solution> {
    let dim = ivp.dim();
    let tolerance = ivp.tolerance;
    let tableau = method.tableau();
    let mut op = RkIntegrator::new(tableau, tolerance, dim, &mut *ivp.rhs);
    integrate_adaptive(&ivp.argument, &ivp.y0, &mut op, callback)
}
