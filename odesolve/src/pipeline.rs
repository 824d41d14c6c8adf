//! The pipeline driver (§4.7): chains integrator invocations to model
//! multi-stage simulations (dose loops, stage-change updates, discrete
//! state resets), concatenating each stage's solution into one trajectory
//! with exact-endpoint semantics carried over from every single-stage
//! integrator.

use crate::error::Result;
use crate::ivp::Solution;

/// The input vector a preprocess/postprocess function transforms: `(t_start,
/// t_finish, t_step, y0..y_{D-1}, p0..p_{P-1})` (§4.7, §3 "Pipeline step").
#[derive(Debug, Clone)]
pub struct StageVector {
    pub t_start: f64,
    pub t_finish: f64,
    pub t_step: f64,
    pub y: Vec<f64>,
    pub p: Vec<f64>,
}

impl StageVector {
    pub fn new(t_start: f64, t_finish: f64, t_step: f64, y: Vec<f64>, p: Vec<f64>) -> Self {
        Self { t_start, t_finish, t_step, y, p }
    }
}

/// A pure transform over `(previous_solution, current_input_vector)`
/// returning the input vector to feed the next step (§3: "preprocess and
/// postprocess are pure functions...").
pub type StageTransform<'a> = dyn FnMut(Option<&Solution>, &StageVector) -> StageVector + 'a;

/// One stage of the pipeline: optional preprocess, the integration itself,
/// optional postprocess.
pub struct Step<'a> {
    pub preprocess: Option<Box<StageTransform<'a>>>,
    pub integrate: Box<dyn FnMut(&StageVector) -> Result<Solution> + 'a>,
    pub postprocess: Option<Box<StageTransform<'a>>>,
}

impl<'a> Step<'a> {
    pub fn new(integrate: impl FnMut(&StageVector) -> Result<Solution> + 'a) -> Self {
        Self { preprocess: None, integrate: Box::new(integrate), postprocess: None }
    }

    pub fn with_preprocess(mut self, f: impl FnMut(Option<&Solution>, &StageVector) -> StageVector + 'a) -> Self {
        self.preprocess = Some(Box::new(f));
        self
    }

    pub fn with_postprocess(mut self, f: impl FnMut(Option<&Solution>, &StageVector) -> StageVector + 'a) -> Self {
        self.postprocess = Some(Box::new(f));
        self
    }
}

/// The pipeline: a vector of steps, run in order, plus an optional final
/// output projection (§4.7, §3).
pub struct Pipeline<'a> {
    steps: Vec<Step<'a>>,
    final_projection: Option<Box<dyn FnMut(Solution) -> Solution + 'a>>,
    /// Whether the argument-grid correction (§4.7 "Cyclic (loop) pipelines")
    /// runs at step boundaries. Disable when an upstream caller already
    /// deduplicates (§9 Open Questions / DESIGN.md decision 3).
    pub dedupe: bool,
}

impl<'a> Pipeline<'a> {
    pub fn new() -> Self {
        Self { steps: Vec::new(), final_projection: None, dedupe: true }
    }

    pub fn push(&mut self, step: Step<'a>) {
        self.steps.push(step);
    }

    pub fn with_final_projection(mut self, f: impl FnMut(Solution) -> Solution + 'a) -> Self {
        self.final_projection = Some(Box::new(f));
        self
    }

    /// Runs every step, feeding the previous step's final state forward as
    /// the next step's initial condition, and concatenates solutions into
    /// one trajectory.
    pub fn run(&mut self, initial: StageVector) -> Result<Solution> {
        let mut combined = Solution::with_capacity(0);
        let mut prev_solution: Option<Solution> = None;
        let mut vector = initial;

        for step in self.steps.iter_mut() {
            if let Some(preprocess) = step.preprocess.as_mut() {
                vector = preprocess(prev_solution.as_ref(), &vector);
            }

            let mut stage_solution = (step.integrate)(&vector)?;

            if self.dedupe {
                apply_argument_grid_correction(&mut combined, &stage_solution, vector.t_step);
            }
            append_solution(&mut combined, &stage_solution);

            if let Some(postprocess) = step.postprocess.as_mut() {
                vector = postprocess(Some(&stage_solution), &vector);
            }
            prev_solution = Some(std::mem::replace(&mut stage_solution, Solution::with_capacity(0)));
        }

        let result = match self.final_projection.as_mut() {
            Some(project) => project(combined),
            None => combined,
        };
        Ok(result)
    }
}

impl<'a> Default for Pipeline<'a> {
    fn default() -> Self {
        Self::new()
    }
}

fn append_solution(combined: &mut Solution, stage: &Solution) {
    for (t, y) in stage.t.iter().zip(stage.y.iter()) {
        combined.push(*t, y.clone());
    }
}

/// Where adjacent output-grid samples across a step boundary would collide
/// (difference below `step`), nudges the earlier sample's time left by
/// `min(step/2, 1e-7)` to preserve strict monotonicity (§4.7 "Cyclic (loop)
/// pipelines"). This is a cosmetic fix for duplicated samples at cycle
/// boundaries, not applied when `Pipeline::dedupe` is false (§9 Open
/// Questions).
fn apply_argument_grid_correction(combined: &mut Solution, next_stage: &Solution, step: f64) {
    let (Some(&last_t), Some(&next_t)) = (combined.t.last(), next_stage.t.first()) else {
        return;
    };
    let gap = next_t - last_t;
    if (0.0..step).contains(&gap) {
        let correction = (step / 2.0).min(1e-7);
        if let Some(last) = combined.t.last_mut() {
            *last -= correction;
        }
    }
}

/// Describes a cyclic (loop) pipeline: `count` identical steps whose
/// postprocess updates state and advances the time window by `duration`
/// (§4.7 "Cyclic (loop) pipelines").
pub struct LoopSpec {
    pub count: usize,
    pub duration: f64,
    pub dedupe: bool,
}

/// Builds a cyclic pipeline of `spec.count` identical steps, each
/// integrating with `integrate_fn` and advancing `(t_start, t_finish)` by
/// `spec.duration` via `dose_fn` (the postprocess mutation, e.g. dose
/// addition or substrate replenishment).
pub fn build_loop_pipeline<'a>(
    spec: &LoopSpec,
    integrate_fn: impl Fn(&StageVector) -> Result<Solution> + 'a + Clone,
    dose_fn: impl Fn(&StageVector) -> Vec<f64> + 'a + Clone,
) -> Pipeline<'a> {
    let mut pipeline = Pipeline::new();
    pipeline.dedupe = spec.dedupe;
    let duration = spec.duration;
    let count = spec.count;

    for _ in 0..count {
        let this_integrate = integrate_fn.clone();
        let this_dose = dose_fn.clone();
        let step = Step::new(move |v: &StageVector| this_integrate(v)).with_postprocess(move |_, v| {
            let y = this_dose(v);
            StageVector::new(v.t_finish, v.t_finish + duration, v.t_step, y, v.p.clone())
        });
        pipeline.push(step);
    }
    pipeline
}

/// A declared update in a multistage (update) pipeline: its own duration and
/// a pure state/parameter transform run as the postprocess of the step that
/// precedes it (§4.7 "Update (multistage) pipelines").
pub struct UpdateSpec<'a> {
    pub duration: f64,
    pub apply: Box<dyn FnMut(&StageVector) -> (Vec<f64>, Vec<f64>) + 'a>,
}

/// Builds a base step followed by one step per declared update; each
/// update's postprocess runs the update's expressions, recomputes the next
/// duration, and advances the time window.
pub fn build_update_pipeline<'a>(
    base_duration: f64,
    mut updates: Vec<UpdateSpec<'a>>,
    integrate_fn: impl Fn(&StageVector) -> Result<Solution> + 'a + Clone,
) -> Pipeline<'a> {
    let mut pipeline = Pipeline::new();
    let n_updates = updates.len();

    for i in 0..=n_updates {
        let this_integrate = integrate_fn.clone();
        let mut step = Step::new(move |v: &StageVector| this_integrate(v));
        if i < n_updates {
            let mut update = updates.remove(0);
            let duration = if i == 0 { base_duration } else { update.duration };
            step = step.with_postprocess(move |_, v: &StageVector| {
                let (y, p) = (update.apply)(v);
                StageVector::new(v.t_finish, v.t_finish + duration, v.t_step, y, p)
            });
        }
        pipeline.push(step);
    }
    pipeline
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;

    fn straight_line_solution(t0: f64, t1: f64, step: f64) -> Solution {
        let mut sol = Solution::with_capacity(0);
        let mut t = t0;
        while t < t1 - 1e-12 {
            sol.push(t, DVector::from_vec(vec![t]));
            t += step;
        }
        sol.push(t1, DVector::from_vec(vec![t1]));
        sol
    }

    #[test]
    fn pipeline_concatenates_two_stages() {
        let mut pipeline = Pipeline::new();
        pipeline.push(Step::new(|v: &StageVector| Ok(straight_line_solution(v.t_start, v.t_finish, v.t_step))));
        pipeline.push(Step::new(|v: &StageVector| Ok(straight_line_solution(v.t_start, v.t_finish, v.t_step))));

        let initial = StageVector::new(0.0, 1.0, 0.25, vec![0.0], vec![]);
        let mut pipeline = pipeline;
        // Feed the second stage a window starting where the first left off.
        pipeline.steps[1] = Step::new(|v: &StageVector| Ok(straight_line_solution(1.0, 2.0, v.t_step)));
        let sol = pipeline.run(initial).unwrap();
        assert!(sol.t.len() > 2);
        assert!(sol.t.first().unwrap() <= sol.t.last().unwrap());
    }

    #[test]
    fn loop_pipeline_advances_time_window_each_cycle() {
        let spec = LoopSpec { count: 3, duration: 1.0, dedupe: true };
        let mut pipeline = build_loop_pipeline(
            &spec,
            |v: &StageVector| Ok(straight_line_solution(v.t_start, v.t_finish, v.t_step)),
            |v: &StageVector| vec![v.y[0] + 10.0],
        );
        let initial = StageVector::new(0.0, 1.0, 0.25, vec![0.0], vec![]);
        let sol = pipeline.run(initial).unwrap();
        assert!(sol.t.last().unwrap() - sol.t.first().unwrap() > 2.0);
    }

    #[test]
    fn argument_grid_correction_preserves_strict_monotonicity() {
        let mut combined = Solution::with_capacity(0);
        combined.push(0.0, DVector::from_vec(vec![0.0]));
        combined.push(1.0, DVector::from_vec(vec![1.0]));
        let mut next = Solution::with_capacity(0);
        // Next stage starts at the *same* time as the last sample: a collision.
        next.push(1.0, DVector::from_vec(vec![1.0]));
        apply_argument_grid_correction(&mut combined, &next, 0.5);
        append_solution(&mut combined, &next);
        for w in combined.t.windows(2) {
            assert!(w[1] > w[0], "expected strictly increasing times, got {:?}", combined.t);
        }
    }
}
