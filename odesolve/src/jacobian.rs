//! Finite-difference Jacobian and time-derivative estimators (§2 item 2).

use nalgebra::{DMatrix, DVector};

use crate::ivp::{RhsFn, RhsOutcome};

/// `sqrt(machine epsilon)`, the base perturbation scale for forward
/// differences.
pub const SQRT_UROUND: f64 = 1.490_116_119_384_765_6e-8; // sqrt(2^-52)

/// Column-by-column scaled forward-difference approximation of `df/dy`
/// (§2 item 2, §4.2(i)).
///
/// `f0` must already hold `f(t, y)`. Each column's perturbation follows
/// §6.4: `max(sqrt(UROUND) * |y_j|, min_inc / ewt_j)`, where `min_inc` is
/// proportional to `||f||` so that problems with tiny or zero components
/// still perturb meaningfully.
pub fn finite_difference_jacobian(
    f: &mut RhsFn<'_>,
    t: f64,
    y: &DVector<f64>,
    f0: &DVector<f64>,
    ewt: &DVector<f64>,
) -> DMatrix<f64> {
    let n = y.len();
    let mut jac = DMatrix::zeros(n, n);
    let f_norm = f0.norm().max(1e-30);
    let mut y_pert = y.clone();
    let mut f_pert = DVector::zeros(n);
    for j in 0..n {
        let min_inc = f_norm / ewt[j].max(1e-30) * 1e-6;
        let dy = (SQRT_UROUND * y[j].abs()).max(min_inc).max(1e-12);
        let saved = y_pert[j];
        y_pert[j] = saved + dy;
        let _ = f(t, &y_pert, &mut f_pert);
        y_pert[j] = saved;
        for i in 0..n {
            jac[(i, j)] = (f_pert[i] - f0[i]) / dy;
        }
    }
    jac
}

/// Forward difference of `f` with respect to `t`, used by the Rosenbrock-W
/// family (§4.2(i)) to assemble the explicit time-dependence term.
pub fn finite_difference_dfdt(
    f: &mut RhsFn<'_>,
    t: f64,
    y: &DVector<f64>,
    f0: &DVector<f64>,
    perturbation: f64,
) -> DVector<f64> {
    let mut f_pert = DVector::zeros(y.len());
    let dt = perturbation.max(1e-12) * t.abs().max(1.0);
    if f(t + dt, y, &mut f_pert) != RhsOutcome::Ok {
        return DVector::zeros(y.len());
    }
    (f_pert - f0) / dt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_analytic_jacobian_of_linear_decay() {
        // y' = -k y, J = -k * I
        let k = 3.0;
        let mut f = |_t: f64, y: &DVector<f64>, out: &mut DVector<f64>| {
            out[0] = -k * y[0];
            RhsOutcome::Ok
        };
        let y = DVector::from_vec(vec![1.0]);
        let mut f0 = DVector::zeros(1);
        f(0.0, &y, &mut f0);
        let ewt = DVector::from_vec(vec![1.0]);
        let jac = finite_difference_jacobian(&mut f, 0.0, &y, &f0, &ewt);
        assert!((jac[(0, 0)] - (-k)).abs() < 1e-5);
    }
}
