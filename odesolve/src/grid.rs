//! Sampling an adaptive integrator's accepted steps onto the caller's
//! uniform output grid (§6.1), by linear interpolation between consecutive
//! accepted points.

use nalgebra::DVector;

use crate::ivp::{Argument, Solution};

pub struct GridSampler {
    times: Vec<f64>,
    next_idx: usize,
}

impl GridSampler {
    /// `next_idx` starts at 1, not 0: every caller pushes the grid-point-0
    /// sample `(arg.start, y0)` itself before driving the integrator, so
    /// re-emitting it here would duplicate that row (breaking §4.1's grid
    /// length invariant and strict monotonicity).
    pub fn new(arg: &Argument) -> Self {
        let n = arg.grid_len();
        let dir = arg.direction();
        let times = (0..n)
            .map(|k| arg.start + dir * arg.step * (k as f64))
            .collect();
        Self { times, next_idx: 1 }
    }

    /// Emits every grid sample crossed while advancing from `(t_prev,
    /// y_prev)` to `(t, y)`. `interp(theta)` maps a fraction of the step
    /// (`0` at `t_prev`, `1` at `t`) to the sampled state; callers with no
    /// better dense output pass plain linear interpolation, operators with a
    /// genuine continuous extension (e.g. MRT, §4.2) pass that instead.
    pub fn advance(
        &mut self,
        sol: &mut Solution,
        t_prev: f64,
        t: f64,
        dir: f64,
        mut interp: impl FnMut(f64) -> DVector<f64>,
    ) {
        let reached = |tg: f64| {
            if dir >= 0.0 {
                tg <= t + 1e-9 * t.abs().max(1.0)
            } else {
                tg >= t - 1e-9 * t.abs().max(1.0)
            }
        };
        while self.next_idx < self.times.len() && reached(self.times[self.next_idx]) {
            let tg = self.times[self.next_idx];
            let denom = t - t_prev;
            let theta = if denom.abs() > 0.0 { (tg - t_prev) / denom } else { 0.0 };
            let yi = interp(theta);
            sol.push(tg, yi);
            self.next_idx += 1;
        }
    }

    /// Pins the exact final row (finish, y_final), per §4.1's invariant that
    /// the last output row matches regardless of interpolation rounding.
    pub fn finish(&mut self, sol: &mut Solution, finish_t: f64, y_final: DVector<f64>) {
        if let Some(last) = sol.t.len().checked_sub(1) {
            if (sol.t[last] - finish_t).abs() < 1e-6 * finish_t.abs().max(1.0) {
                sol.t[last] = finish_t;
                sol.y[last] = y_final;
                return;
            }
        }
        sol.push(finish_t, y_final);
    }
}
