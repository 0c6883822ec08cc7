//! Verification gate
//!
//! Interprets runner results for one plan step. The gate decides pass, fail
//! or skip and persists what it saw; it never decides whether to retry.

use crate::collaborators::CheckResult;
use crate::types::{CheckId, CheckStatus, FailureClass, PlanStep, StepId, TargetId, VerificationCheck};
use chrono::Utc;
use dashmap::DashMap;

/// Where a verification failure came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureSource {
    /// A check reported `fail` or stayed `pending`
    Check,
    /// Patch engine rejected or failed the step
    PatchRejected,
    /// Collaborator call exceeded its timeout
    Timeout,
    /// Runner itself failed
    RunnerError,
}

impl FailureSource {
    /// Failure class implied by the source alone, if any
    #[inline]
    #[must_use]
    pub fn implied_class(self) -> Option<FailureClass> {
        match self {
            FailureSource::PatchRejected => Some(FailureClass::PatchRejected),
            FailureSource::Timeout => Some(FailureClass::Timeout),
            FailureSource::Check | FailureSource::RunnerError => None,
        }
    }
}

/// Signal consumed by the reflection loop
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("verification failed for check '{check}': {error}")]
pub struct VerificationFailure {
    pub target_id: TargetId,
    pub step_id: StepId,
    pub check: String,
    pub file: String,
    pub error: String,
    pub origin: FailureSource,
}

/// Gate decision for one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    Pass,
    Fail(VerificationFailure),
    /// Nothing ran that could pass or fail
    Skip,
}

impl VerificationOutcome {
    /// Step may complete
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, VerificationOutcome::Pass | VerificationOutcome::Skip)
    }

    /// Metric and trace label
    #[inline]
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            VerificationOutcome::Pass => "pass",
            VerificationOutcome::Fail(_) => "fail",
            VerificationOutcome::Skip => "skip",
        }
    }
}

/// Pass / fail / skip interpreter and check store
#[derive(Debug, Default)]
pub struct VerificationGate {
    checks: DashMap<TargetId, Vec<VerificationCheck>>,
    runs: DashMap<StepId, u32>,
}

impl VerificationGate {
    /// Create empty gate
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide the outcome for `step` and persist every result
    ///
    /// Skipped checks are excluded. If nothing remains the outcome is
    /// `Skip`. Any `fail` or unresolved `pending` check fails the step with
    /// the first such check's name and error.
    pub fn evaluate(&self, step: &PlanStep, results: &[CheckResult]) -> VerificationOutcome {
        let run = self.next_run(step.id);
        let recorded_at = Utc::now();
        let rows = results.iter().map(|r| VerificationCheck {
            id: CheckId::new(),
            target_id: step.target_id,
            step_id: Some(step.id),
            run,
            name: r.name.clone(),
            file: r.file.clone(),
            status: r.status,
            error: r.error.clone(),
            recorded_at,
        });
        self.checks.entry(step.target_id).or_default().extend(rows);

        let outcome = decide(step, results);
        metrics::counter!("pilot_verification_outcomes_total", "outcome" => outcome.label()).increment(1);
        tracing::debug!(
            step = %step.id,
            run,
            checks = results.len(),
            outcome = outcome.label(),
            "evaluated verification results"
        );
        outcome
    }

    /// Record a failure that happened before any check ran
    ///
    /// Patch failures, runner errors and timeouts are persisted as one
    /// failing check named after the stage so they read like any other
    /// verification failure.
    pub fn record_failure(
        &self,
        step: &PlanStep,
        stage: &str,
        error: impl Into<String>,
        origin: FailureSource,
    ) -> VerificationFailure {
        let error = error.into();
        let run = self.next_run(step.id);
        self.checks.entry(step.target_id).or_default().push(VerificationCheck {
            id: CheckId::new(),
            target_id: step.target_id,
            step_id: Some(step.id),
            run,
            name: stage.to_string(),
            file: String::new(),
            status: CheckStatus::Fail,
            error: Some(error.clone()),
            recorded_at: Utc::now(),
        });
        metrics::counter!("pilot_verification_outcomes_total", "outcome" => "fail").increment(1);

        VerificationFailure {
            target_id: step.target_id,
            step_id: step.id,
            check: stage.to_string(),
            file: String::new(),
            error,
            origin,
        }
    }

    /// Checks of a target, optionally narrowed to one step, in record order
    #[must_use]
    pub fn checks(&self, target: TargetId, step: Option<StepId>) -> Vec<VerificationCheck> {
        self.checks
            .get(&target)
            .map(|rows| {
                rows.iter()
                    .filter(|c| step.map_or(true, |s| c.step_id == Some(s)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Latest run number recorded for a step
    #[must_use]
    pub fn runs(&self, step: StepId) -> u32 {
        self.runs.get(&step).map_or(0, |r| *r)
    }

    fn next_run(&self, step: StepId) -> u32 {
        let mut run = self.runs.entry(step).or_insert(0);
        *run += 1;
        *run
    }
}

fn decide(step: &PlanStep, results: &[CheckResult]) -> VerificationOutcome {
    let considered: Vec<&CheckResult> = results.iter().filter(|r| r.status != CheckStatus::Skipped).collect();
    if considered.is_empty() {
        return VerificationOutcome::Skip;
    }

    match considered
        .iter()
        .find(|r| matches!(r.status, CheckStatus::Fail | CheckStatus::Pending))
    {
        Some(failed) => VerificationOutcome::Fail(VerificationFailure {
            target_id: step.target_id,
            step_id: step.id,
            check: failed.name.clone(),
            file: failed.file.clone(),
            error: failed.error.clone().unwrap_or_else(|| match failed.status {
                CheckStatus::Pending => "check did not complete".to_string(),
                _ => "check failed".to_string(),
            }),
            origin: FailureSource::Check,
        }),
        None => VerificationOutcome::Pass,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StepStatus;
    use proptest::prelude::*;

    fn step() -> PlanStep {
        PlanStep {
            id: StepId::new(),
            target_id: TargetId::new(),
            ordinal: 2,
            description: "Await session.invalidate()".to_string(),
            status: StepStatus::InProgress,
            supporting_rules: Vec::new(),
            priority: None,
            manual_review: false,
            low_confidence: false,
            generation: 1,
        }
    }

    #[test]
    fn all_passing_is_pass() {
        let gate = VerificationGate::new();
        let step = step();
        let outcome = gate.evaluate(
            &step,
            &[
                CheckResult::pass("Token Validation", "tests/test_auth.py"),
                CheckResult::skipped("Legacy Fallback", "tests/test_auth.py"),
            ],
        );
        assert_eq!(outcome, VerificationOutcome::Pass);
        assert_eq!(gate.checks(step.target_id, Some(step.id)).len(), 2);
    }

    #[test]
    fn no_checks_is_skip_not_pass() {
        let gate = VerificationGate::new();
        assert_eq!(gate.evaluate(&step(), &[]), VerificationOutcome::Skip);
        assert_eq!(
            gate.evaluate(&step(), &[CheckResult::skipped("Lint", "a.py")]),
            VerificationOutcome::Skip
        );
    }

    #[test]
    fn first_failure_is_reported() {
        let gate = VerificationGate::new();
        let step = step();
        let outcome = gate.evaluate(
            &step,
            &[
                CheckResult::pass("Token Validation", "tests/test_auth.py"),
                CheckResult::fail(
                    "Session Invalidation",
                    "tests/test_auth.py",
                    "TypeError: session.invalidate() is async, detected missing await",
                ),
                CheckResult::fail("Refresh", "tests/test_auth.py", "other"),
            ],
        );
        let VerificationOutcome::Fail(failure) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(failure.check, "Session Invalidation");
        assert!(failure.error.contains("missing await"));
        assert_eq!(failure.origin, FailureSource::Check);
    }

    #[test]
    fn pending_checks_fail_the_step() {
        let gate = VerificationGate::new();
        let pending = CheckResult {
            name: "Integration".to_string(),
            status: CheckStatus::Pending,
            error: None,
            file: String::new(),
        };
        let outcome = gate.evaluate(&step(), &[CheckResult::pass("Unit", ""), pending]);
        assert!(matches!(outcome, VerificationOutcome::Fail(f) if f.error == "check did not complete"));
    }

    #[test]
    fn reruns_append_with_higher_run_numbers() {
        let gate = VerificationGate::new();
        let step = step();
        gate.evaluate(&step, &[CheckResult::fail("Session Invalidation", "t.py", "missing await")]);
        gate.evaluate(&step, &[CheckResult::pass("Session Invalidation", "t.py")]);

        let rows = gate.checks(step.target_id, Some(step.id));
        assert_eq!(rows.len(), 2);
        assert_eq!((rows[0].run, rows[0].status), (1, CheckStatus::Fail));
        assert_eq!((rows[1].run, rows[1].status), (2, CheckStatus::Pass));
        assert_eq!(gate.runs(step.id), 2);
    }

    #[test]
    fn stage_failures_are_persisted_as_checks() {
        let gate = VerificationGate::new();
        let step = step();
        let failure = gate.record_failure(&step, "patch-application", "hunk does not apply", FailureSource::PatchRejected);
        assert_eq!(failure.origin.implied_class(), Some(FailureClass::PatchRejected));

        let rows = gate.checks(step.target_id, None);
        assert_eq!(rows[0].name, "patch-application");
        assert_eq!(rows[0].status, CheckStatus::Fail);
    }

    fn arb_status() -> impl Strategy<Value = CheckStatus> {
        prop_oneof![
            Just(CheckStatus::Pass),
            Just(CheckStatus::Fail),
            Just(CheckStatus::Skipped),
            Just(CheckStatus::Pending),
        ]
    }

    proptest! {
        #[test]
        fn prop_outcome_matches_statuses(statuses in proptest::collection::vec(arb_status(), 0..8)) {
            let results: Vec<CheckResult> = statuses
                .iter()
                .enumerate()
                .map(|(i, s)| CheckResult { name: format!("c{i}"), status: *s, error: None, file: String::new() })
                .collect();
            let outcome = VerificationGate::new().evaluate(&step(), &results);

            let considered: Vec<_> = statuses.iter().filter(|s| **s != CheckStatus::Skipped).collect();
            if considered.is_empty() {
                prop_assert_eq!(outcome, VerificationOutcome::Skip);
            } else if considered.iter().all(|s| **s == CheckStatus::Pass) {
                prop_assert_eq!(outcome, VerificationOutcome::Pass);
            } else {
                prop_assert!(matches!(outcome, VerificationOutcome::Fail(_)));
            }
        }
    }
}
