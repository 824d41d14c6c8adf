//! Dense output (§4.6): evaluating the Nordsieck polynomial at arbitrary
//! times, both live (against the integrator's current array) and deferred
//! (against a recorded sequence of immutable snapshots).

use nalgebra::DVector;

use crate::error::{Error, Result};
use crate::nordsieck::NordsieckArray;

/// An immutable record captured at each accepted step when dense output is
/// enabled: `{t_n, h_n, h_used, q_n, Z[0..q]}` (§3).
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub t: f64,
    pub h: f64,
    pub h_used: f64,
    pub q: usize,
    rows: Vec<DVector<f64>>,
}

impl Snapshot {
    pub fn capture(t: f64, h: f64, h_used: f64, q: usize, z: &NordsieckArray) -> Self {
        Self {
            t,
            h,
            h_used,
            q,
            rows: (0..=q).map(|k| z.row(k).clone()).collect(),
        }
    }

    /// Evaluates the k-th derivative of the order-q interpolating polynomial
    /// at `t`, via Horner's rule with coefficients `c(j, k) = j(j-1)...(j-k+1)`
    /// (§4.6(a)).
    pub fn eval(&self, t: f64, k: usize) -> DVector<f64> {
        horner_eval(&self.rows, self.t, self.h_used, t, k)
    }

    /// The right edge of the interval this snapshot's step produced, used by
    /// [`DenseHistory`]'s binary search.
    pub fn right_edge(&self) -> f64 {
        self.t
    }

    pub fn left_edge(&self) -> f64 {
        self.t - self.h_used
    }
}

/// Horner evaluation of the k-th derivative of the Nordsieck polynomial
/// anchored at `t_n` with step `h_used`, shared by live and deferred dense
/// output.
fn horner_eval(rows: &[DVector<f64>], t_n: f64, h_used: f64, t: f64, k: usize) -> DVector<f64> {
    let q = rows.len() - 1;
    let dim = rows[0].len();
    if k > q {
        return DVector::zeros(dim);
    }
    let s = if h_used.abs() > 0.0 { (t - t_n) / h_used } else { 0.0 };

    let mut result = DVector::zeros(dim);
    let mut h_pow = 1.0;
    // Horner from the top row down: result = rows[q]; result = result*s + rows[q-1]; ...
    // with each row scaled by its falling-factorial derivative coefficient
    // c(j, k) = j*(j-1)*...*(j-k+1), and dividing by h_used^k to convert the
    // scaled Nordsieck derivative back into an ordinary derivative.
    for j in (k..=q).rev() {
        let coeff = falling_factorial(j, k);
        if coeff != 0.0 {
            result = result * s + &rows[j] * coeff;
        } else {
            result *= s;
        }
    }
    for _ in 0..k {
        h_pow *= h_used;
    }
    if h_pow.abs() > 0.0 {
        result /= h_pow;
    }
    result
}

fn falling_factorial(j: usize, k: usize) -> f64 {
    if k > j {
        return 0.0;
    }
    let mut result = 1.0;
    for i in 0..k {
        result *= (j - i) as f64;
    }
    result
}

/// The deferred dense-output timeline: a sorted sequence of immutable
/// snapshots, queried by binary search (§4.6(b)).
#[derive(Debug, Clone, Default)]
pub struct DenseHistory {
    snapshots: Vec<Snapshot>,
}

impl DenseHistory {
    pub fn new() -> Self {
        Self { snapshots: Vec::new() }
    }

    pub fn push(&mut self, snapshot: Snapshot) {
        self.snapshots.push(snapshot);
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn range(&self) -> Option<(f64, f64)> {
        let first = self.snapshots.first()?;
        let last = self.snapshots.last()?;
        Some((first.left_edge(), last.right_edge()))
    }

    /// Resolves `t` to the snapshot whose right edge is the smallest `>= t`,
    /// via binary search over the sorted timeline.
    fn locate(&self, t: f64) -> Result<&Snapshot> {
        let idx = self
            .snapshots
            .partition_point(|s| s.right_edge() < t - 1e-12 * t.abs().max(1.0));
        self.snapshots
            .get(idx)
            .or_else(|| self.snapshots.last())
            .ok_or_else(|| Error::InvalidInput("dense output queried with no snapshots recorded".into()))
    }

    /// Evaluates the k-th derivative of the interpolant at a single time.
    pub fn eval(&self, t: f64, k: usize) -> Result<DVector<f64>> {
        let snap = self.locate(t)?;
        Ok(snap.eval(t, k))
    }

    /// Evaluates the 0-th derivative at every time in a sorted array with a
    /// single linear scan over snapshots (§4.6(b): "batch queries on sorted
    /// time arrays use a single linear scan"), returning one column per
    /// component plus the time column itself.
    pub fn eval_batch(&self, times: &[f64]) -> Result<Vec<Vec<f64>>> {
        if self.snapshots.is_empty() {
            return Err(Error::InvalidInput("dense output queried with no snapshots recorded".into()));
        }
        let dim = self.snapshots[0].rows[0].len();
        let mut cols = vec![Vec::with_capacity(times.len()); dim + 1];
        let mut idx = 0usize;
        for &t in times {
            while idx + 1 < self.snapshots.len() && self.snapshots[idx].right_edge() < t {
                idx += 1;
            }
            let y = self.snapshots[idx].eval(t, 0);
            cols[0].push(t);
            for i in 0..dim {
                cols[i + 1].push(y[i]);
            }
        }
        Ok(cols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_snapshot(t_n: f64, h: f64) -> Snapshot {
        // y(t) = 2 + 3*(t - (t_n - h)): q=1, row0 = y(t_n), row1 = h*y'.
        let mut z = NordsieckArray::new(1, 1);
        z.set_row(0, DVector::from_vec(vec![2.0 + 3.0 * h]));
        z.set_row(1, DVector::from_vec(vec![3.0 * h]));
        Snapshot::capture(t_n, h, h, 1, &z)
    }

    #[test]
    fn horner_eval_reproduces_linear_function() {
        let snap = linear_snapshot(1.0, 0.5);
        // at t_n - h = 0.5, y should equal 2.0
        let y = snap.eval(0.5, 0);
        assert!((y[0] - 2.0).abs() < 1e-10, "y={}", y[0]);
        let y_mid = snap.eval(0.75, 0);
        assert!((y_mid[0] - 3.5).abs() < 1e-10, "y_mid={}", y_mid[0]);
    }

    #[test]
    fn first_derivative_matches_constant_slope() {
        let snap = linear_snapshot(1.0, 0.5);
        let dy = snap.eval(0.75, 1);
        assert!((dy[0] - 3.0).abs() < 1e-9, "dy={}", dy[0]);
    }

    #[test]
    fn history_locates_snapshot_by_binary_search() {
        let mut hist = DenseHistory::new();
        hist.push(linear_snapshot(0.5, 0.5));
        hist.push(linear_snapshot(1.0, 0.5));
        hist.push(linear_snapshot(1.5, 0.5));
        let y = hist.eval(1.25, 0).unwrap();
        assert!(y[0].is_finite());
    }

    #[test]
    fn batch_eval_is_monotone_in_time() {
        let mut hist = DenseHistory::new();
        hist.push(linear_snapshot(0.5, 0.5));
        hist.push(linear_snapshot(1.0, 0.5));
        let times = vec![0.1, 0.3, 0.6, 0.9];
        let cols = hist.eval_batch(&times).unwrap();
        for w in cols[0].windows(2) {
            assert!(w[1] > w[0]);
        }
    }
}
