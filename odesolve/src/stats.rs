//! Solver statistics (ambient, SPEC_FULL §3): step/evaluation counters
//! attached to every integrator, mirroring the `number_of_*` fields the
//! teacher's `ode_solver` tests snapshot with `insta`.

/// Running counters for one integration. Cheap to carry (all `u64`), updated
/// in place by the integrator that owns it rather than reconstructed per
/// step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SolverStatistics {
    pub steps: u64,
    pub accepted_steps: u64,
    pub rejected_steps: u64,
    pub rhs_evals: u64,
    pub jacobian_evals: u64,
    pub lu_factorizations: u64,
    pub error_test_failures: u64,
    pub nonlinear_solver_failures: u64,
    pub root_evals: u64,
}

impl SolverStatistics {
    pub fn record_accept(&mut self) {
        self.steps += 1;
        self.accepted_steps += 1;
    }

    pub fn record_reject(&mut self) {
        self.steps += 1;
        self.rejected_steps += 1;
        self.error_test_failures += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let stats = SolverStatistics::default();
        assert_eq!(stats.steps, 0);
        assert_eq!(stats.rhs_evals, 0);
    }

    #[test]
    fn record_accept_increments_steps_and_accepted() {
        let mut stats = SolverStatistics::default();
        stats.record_accept();
        stats.record_reject();
        assert_eq!(stats.steps, 2);
        assert_eq!(stats.accepted_steps, 1);
        assert_eq!(stats.rejected_steps, 1);
        assert_eq!(stats.error_test_failures, 1);
    }

    /// Pins the field layout callers observe after a representative mix of
    /// accepts/rejects/evals, so a future field rename or reorder shows up
    /// as a diff instead of silently changing what gets reported.
    #[test]
    fn snapshot_after_a_representative_run() {
        let mut stats = SolverStatistics::default();
        for _ in 0..3 {
            stats.record_accept();
        }
        stats.record_reject();
        stats.rhs_evals += 11;
        stats.jacobian_evals += 2;
        stats.lu_factorizations += 2;
        stats.nonlinear_solver_failures += 1;
        stats.root_evals += 1;
        insta::assert_yaml_snapshot!(stats);
    }
}
