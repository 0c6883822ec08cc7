//! Reflection loop
//!
//! Bounded autonomous recovery from a verification failure:
//! 1. Classify the failure text
//! 2. Find the knowledge rule that best explains it
//! 3. Produce a diagnosis and a fix description
//! 4. Ask the controller to re-run patching and verification with the fix
//!
//! Attempts are numbered per target and never mutated once recorded. The
//! budget is `max_attempts`, counted per target or per step.

use crate::config::{AttemptScope, BackoffPolicy, PilotConfig};
use crate::error::{PilotError, ReflectionError};
use crate::types::{
    AttemptId, AttemptOutcome, FailureClass, MigrationTarget, PlanStep, ReflectionAttempt, StepId, TargetId,
};
use crate::verification::{VerificationFailure, VerificationOutcome};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use pilot_knowledge::{KnowledgeContext, RuleId};
use regex::Regex;

static CLASSIFIERS: Lazy<Vec<(FailureClass, Regex)>> = Lazy::new(|| {
    [
        (
            FailureClass::AsyncMisuse,
            r"(?i)missing await|not awaited|never awaited|is async|is a coroutine|unhandled promise",
        ),
        (FailureClass::Timeout, r"(?i)timed? ?out|deadline exceeded"),
        (
            FailureClass::ImportPath,
            r"(?i)importerror|modulenotfounderror|no module named|cannot find module|cannot import name|unresolved import",
        ),
        (
            FailureClass::RemovedApi,
            r"(?i)has no attribute|is not a function|no longer (exists|available|supported)|was removed|is removed|undefined method|deprecated",
        ),
        (
            FailureClass::TypeMismatch,
            r"(?i)typeerror|type mismatch|mismatched types|expected .+ (got|found)|incompatible type",
        ),
    ]
    .into_iter()
    .filter_map(|(class, pattern)| Regex::new(pattern).ok().map(|re| (class, re)))
    .collect()
});

impl FailureClass {
    /// Classify raw failure text
    #[must_use]
    pub fn classify(text: &str) -> Self {
        CLASSIFIERS
            .iter()
            .find(|(_, re)| re.is_match(text))
            .map_or(FailureClass::Unknown, |(class, _)| *class)
    }

    /// Generic remedy for the class
    #[must_use]
    pub fn remedy(self) -> &'static str {
        match self {
            FailureClass::AsyncMisuse => "Await the async call and propagate async to its callers",
            FailureClass::RemovedApi => "Replace the removed API with its documented successor",
            FailureClass::TypeMismatch => "Adapt arguments and return values to the new signatures",
            FailureClass::ImportPath => "Update import paths to the new module layout",
            FailureClass::Timeout => "Narrow the patch so the affected checks finish in time",
            FailureClass::PatchRejected => "Regenerate the patch against the current file contents",
            FailureClass::Unknown => "Re-derive the change from the migration rule and the failing check",
        }
    }

    /// Human label
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            FailureClass::AsyncMisuse => "async misuse",
            FailureClass::RemovedApi => "removed API",
            FailureClass::TypeMismatch => "type mismatch",
            FailureClass::ImportPath => "import path",
            FailureClass::Timeout => "timeout",
            FailureClass::PatchRejected => "patch rejected",
            FailureClass::Unknown => "unknown",
        }
    }
}

/// Explanation of a failure and the proposed fix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnosis {
    pub class: FailureClass,
    pub rule: Option<RuleId>,
    pub diagnosis: String,
    pub fix: String,
}

/// Diagnose `failure` using the target's knowledge
///
/// `previous` holds earlier attempts on the same step; a repeated failure
/// widens the proposed fix.
#[must_use]
pub fn diagnose(
    failure: &VerificationFailure,
    knowledge: &KnowledgeContext,
    previous: &[ReflectionAttempt],
) -> Diagnosis {
    let class = failure
        .origin
        .implied_class()
        .unwrap_or_else(|| FailureClass::classify(&failure.error));
    let rule = knowledge.best_match(&format!("{} {}", failure.check, failure.error));

    let mut diagnosis = format!("{} in '{}': {}", class.label(), failure.check, failure.error);
    if let Some(rule) = rule {
        diagnosis.push_str(&format!(" (see {})", rule.id));
    }

    let mut fix = class.remedy().to_string();
    if let Some(rule) = rule {
        fix.push_str(&format!(". Apply {}: {}", rule.id, rule.text));
    }
    if !failure.file.is_empty() {
        fix.push_str(&format!(". Check {}", failure.file));
    }
    if !previous.is_empty() {
        fix.push_str(&format!(
            ". Previous {} attempt(s) did not resolve it; extend the change to every call site",
            previous.len()
        ));
    }

    Diagnosis {
        class,
        rule: rule.map(|r| r.id.clone()),
        diagnosis,
        fix,
    }
}

/// Controller hook that re-runs patching and verification for a step
#[async_trait]
pub trait RetryStage: Send + Sync {
    /// Patch `step` again with `fix` as extra context, then verify
    ///
    /// # Errors
    /// Cancellation or trace failures; verification failures are returned as
    /// an outcome, not an error.
    async fn retry(&self, step: &PlanStep, fix: &str, attempt: u32) -> Result<VerificationOutcome, PilotError>;

    /// Called with each finished attempt before it is stored
    ///
    /// # Errors
    /// An error discards the attempt and aborts the loop.
    fn attempted(&self, attempt: &ReflectionAttempt) -> Result<(), PilotError>;
}

/// Bounded retry loop, one open loop per target at most
///
/// Attempt numbers keep counting across reruns of a target; the budget
/// only counts attempts made since the last [`ReflectionLoop::reset_budget`].
#[derive(Debug)]
pub struct ReflectionLoop {
    max_attempts: u32,
    scope: AttemptScope,
    backoff: BackoffPolicy,
    attempts: DashMap<TargetId, Vec<ReflectionAttempt>>,
    /// Index of the first attempt charged to the current budget
    budget_start: DashMap<TargetId, usize>,
    open: DashMap<TargetId, StepId>,
}

impl ReflectionLoop {
    /// Create loop with explicit bounds
    #[must_use]
    pub fn new(max_attempts: u32, scope: AttemptScope, backoff: BackoffPolicy) -> Self {
        Self {
            max_attempts,
            scope,
            backoff,
            attempts: DashMap::new(),
            budget_start: DashMap::new(),
            open: DashMap::new(),
        }
    }

    /// Create loop from configuration
    #[must_use]
    pub fn from_config(config: &PilotConfig) -> Self {
        Self::new(config.max_attempts, config.attempt_scope, config.reflection_backoff)
    }

    /// Run attempts until the step verifies or the budget is spent
    ///
    /// Returns the resolving attempt.
    ///
    /// # Errors
    /// `ReflectionError::Exhausted` with the full history when the budget
    /// runs out, `AlreadyOpen` if the target already has a loop, and any
    /// error raised by `stage`.
    pub async fn resolve(
        &self,
        target: &MigrationTarget,
        step: &PlanStep,
        failure: VerificationFailure,
        knowledge: &KnowledgeContext,
        stage: &dyn RetryStage,
    ) -> Result<ReflectionAttempt, PilotError> {
        let _open = self.open_loop(target.id, step.id)?;
        let mut failure = failure;
        let mut in_loop = 0u32;

        loop {
            if self.remaining(target.id, step.id) == 0 {
                return Err(self.exhausted(target.id, step.id).into());
            }

            in_loop += 1;
            let delay = self.backoff.delay_for(in_loop);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let (record, outcome) = self.attempt(target, step, &failure, knowledge, stage).await?;
            match outcome {
                VerificationOutcome::Fail(next) => failure = next,
                VerificationOutcome::Pass | VerificationOutcome::Skip => return Ok(record),
            }
        }
    }

    /// One diagnose-and-retry cycle
    ///
    /// # Errors
    /// `ReflectionError::Exhausted` if no budget is left, otherwise errors
    /// from `stage`. Nothing is recorded on error.
    pub async fn attempt(
        &self,
        target: &MigrationTarget,
        step: &PlanStep,
        failure: &VerificationFailure,
        knowledge: &KnowledgeContext,
        stage: &dyn RetryStage,
    ) -> Result<(ReflectionAttempt, VerificationOutcome), PilotError> {
        if self.remaining(target.id, step.id) == 0 {
            return Err(self.exhausted(target.id, step.id).into());
        }

        let history = self.attempts(target.id);
        let number = u32::try_from(history.len()).unwrap_or(u32::MAX - 1) + 1;
        let same_step: Vec<ReflectionAttempt> = history.into_iter().filter(|a| a.step_id == step.id).collect();
        let diagnosis = diagnose(failure, knowledge, &same_step);

        tracing::info!(
            target = %target.library,
            step = step.ordinal,
            attempt = number,
            class = diagnosis.class.label(),
            "reflection attempt"
        );

        let outcome = stage.retry(step, &diagnosis.fix, number).await?;
        let record = ReflectionAttempt {
            id: AttemptId::new(),
            target_id: target.id,
            step_id: step.id,
            attempt: number,
            trigger: failure.to_string(),
            failure_class: diagnosis.class,
            diagnosis: diagnosis.diagnosis,
            fix: diagnosis.fix,
            rule: diagnosis.rule,
            outcome: if outcome.is_success() {
                AttemptOutcome::Resolved
            } else {
                AttemptOutcome::Unresolved
            },
            created_at: Utc::now(),
        };

        stage.attempted(&record)?;
        self.attempts.entry(target.id).or_default().push(record.clone());
        metrics::counter!(
            "pilot_reflection_attempts_total",
            "outcome" => if record.is_resolved() { "resolved" } else { "unresolved" }
        )
        .increment(1);

        Ok((record, outcome))
    }

    /// Attempts of a target, oldest first
    #[must_use]
    pub fn attempts(&self, target: TargetId) -> Vec<ReflectionAttempt> {
        self.attempts.get(&target).map(|a| a.clone()).unwrap_or_default()
    }

    /// Start a fresh budget for a target taken up by another run
    ///
    /// Earlier attempts stay in the history.
    pub fn reset_budget(&self, target: TargetId) {
        let used = self.attempts.get(&target).map_or(0, |a| a.len());
        self.budget_start.insert(target, used);
    }

    /// Attempts left for `step` under the configured scope
    #[must_use]
    pub fn remaining(&self, target: TargetId, step: StepId) -> u32 {
        let start = self.budget_start.get(&target).map_or(0, |s| *s);
        let used = self.attempts.get(&target).map_or(0, |attempts| {
            let charged = attempts.get(start..).unwrap_or_default();
            match self.scope {
                AttemptScope::PerTarget => charged.len(),
                AttemptScope::PerStep => charged.iter().filter(|a| a.step_id == step).count(),
            }
        });
        self.max_attempts
            .saturating_sub(u32::try_from(used).unwrap_or(u32::MAX))
    }

    /// Target has a loop in progress
    #[must_use]
    pub fn is_open(&self, target: TargetId) -> bool {
        self.open.contains_key(&target)
    }

    /// Configured bound
    #[inline]
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn exhausted(&self, target: TargetId, step: StepId) -> ReflectionError {
        let start = self.budget_start.get(&target).map_or(0, |s| *s);
        let mut attempts = self.attempts(target);
        attempts.drain(..start.min(attempts.len()));
        ReflectionError::Exhausted { target, step, attempts }
    }

    fn open_loop(&self, target: TargetId, step: StepId) -> Result<OpenLoop<'_>, ReflectionError> {
        match self.open.entry(target) {
            Entry::Occupied(_) => Err(ReflectionError::AlreadyOpen(target)),
            Entry::Vacant(slot) => {
                slot.insert(step);
                Ok(OpenLoop {
                    open: &self.open,
                    target,
                })
            }
        }
    }
}

/// Marks a target's loop open until dropped
struct OpenLoop<'a> {
    open: &'a DashMap<TargetId, StepId>,
    target: TargetId,
}

impl Drop for OpenLoop<'_> {
    fn drop(&mut self) {
        self.open.remove(&self.target);
    }
}
