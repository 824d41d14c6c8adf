use nalgebra::{DMatrix, DVector};

use crate::error::{Error, Result};

/// LU factorisation with partial pivoting over a dense `D`-by-`D` matrix.
///
/// Thin wrapper around `nalgebra`'s LU decomposition that turns a singular
/// (zero-pivot) factorisation into [`Error::LinearSolverFailure`] instead of
/// silently returning `None`, matching the dense-direct-solver-only
/// restriction of §1 (Non-goals: sparse or banded solvers).
pub struct Lu {
    decomp: nalgebra::linalg::LU<f64, nalgebra::Dyn, nalgebra::Dyn>,
}

impl Lu {
    /// Factors `a` in place. This is the crate's only linear-algebra entry
    /// point: the single-step, Rosenbrock, multistep, and CVODE families all
    /// funnel their iteration-matrix solves through it.
    pub fn factor(a: &DMatrix<f64>) -> Result<Self> {
        let decomp = nalgebra::linalg::LU::new(a.clone());
        if decomp.is_invertible() {
            Ok(Self { decomp })
        } else {
            Err(Error::LinearSolverFailure)
        }
    }

    /// Solves `A x = b` using the cached factorisation.
    pub fn solve(&self, b: &DVector<f64>) -> Result<DVector<f64>> {
        self.decomp
            .solve(b)
            .ok_or(Error::LinearSolverFailure)
    }

    /// Solves `A x = b` in place, overwriting `b` with `x`.
    pub fn solve_in_place(&self, b: &mut DVector<f64>) -> Result<()> {
        let x = self.solve(b)?;
        b.copy_from(&x);
        Ok(())
    }
}
