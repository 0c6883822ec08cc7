//! Core records owned by the migration controller
//!
//! - Targets discovered in a project snapshot
//! - Plan steps and their guarded status
//! - Verification checks (append-only per run)
//! - Reflection attempts (immutable once created)

use crate::phase::Phase;
use chrono::{DateTime, Utc};
use pilot_knowledge::{Priority, RuleId};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unique migration target identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TargetId(pub Ulid);

impl TargetId {
    /// Generate new target ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for TargetId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique plan step identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StepId(pub Ulid);

impl StepId {
    /// Generate new step ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for StepId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique verification check identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CheckId(pub Ulid);

impl CheckId {
    /// Generate new check ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for CheckId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CheckId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique reflection attempt identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AttemptId(pub Ulid);

impl AttemptId {
    /// Generate new attempt ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AttemptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Named actors that appear in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Agent {
    DiscoveryAgent,
    RetrievalAgent,
    PlanningAgent,
    CodingAgent,
    VerificationAgent,
    ReflectionAgent,
    PipelineController,
    Operator,
}

impl Agent {
    /// Name used in trace events
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Agent::DiscoveryAgent => "DiscoveryAgent",
            Agent::RetrievalAgent => "RetrievalAgent",
            Agent::PlanningAgent => "PlanningAgent",
            Agent::CodingAgent => "CodingAgent",
            Agent::VerificationAgent => "VerificationAgent",
            Agent::ReflectionAgent => "ReflectionAgent",
            Agent::PipelineController => "PipelineController",
            Agent::Operator => "Operator",
        }
    }
}

impl std::fmt::Display for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A library the project should migrate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationTarget {
    pub id: TargetId,
    pub library: String,
    pub current_version: String,
    pub target_version: String,
    /// Analyzer confidence in `[0, 1]`
    pub confidence: f64,
    pub enabled: bool,
    /// Operator set `enabled` explicitly; re-discovery keeps it
    pub enabled_override: bool,
    pub phase: Phase,
    /// Discovery generation that last reported this target
    pub discovery_run: u64,
    /// Missing from the latest discovery run
    pub superseded: bool,
    /// Versions changed after the workflow finished
    #[serde(default)]
    pub outdated: bool,
}

impl MigrationTarget {
    /// Eligible for the next run
    #[inline]
    #[must_use]
    pub fn is_runnable(&self) -> bool {
        self.enabled && !self.superseded && self.phase == Phase::Idle
    }

    /// Finished target the next run takes up again
    ///
    /// Failed and cancelled workflows are retried; a completed one only
    /// when discovery reported different versions since.
    #[inline]
    #[must_use]
    pub fn needs_rerun(&self) -> bool {
        self.enabled
            && !self.superseded
            && match self.phase {
                Phase::Failed | Phase::Cancelled => true,
                Phase::Completed => self.outdated,
                _ => false,
            }
    }

    /// `library current -> target`, as shown in reports
    #[must_use]
    pub fn label(&self) -> String {
        format!("{} {} -> {}", self.library, self.current_version, self.target_version)
    }
}

/// Plan step lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
}

impl StepStatus {
    /// Forward-only: `pending -> in_progress -> complete | failed`
    #[inline]
    #[must_use]
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        matches!(
            (self, next),
            (StepStatus::Pending, StepStatus::InProgress)
                | (StepStatus::InProgress, StepStatus::Complete)
                | (StepStatus::InProgress, StepStatus::Failed)
        )
    }

    /// No further transition possible
    #[inline]
    #[must_use]
    pub fn is_final(self) -> bool {
        matches!(self, StepStatus::Complete | StepStatus::Failed)
    }
}

/// One ordered unit of migration work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: StepId,
    pub target_id: TargetId,
    /// 1-based position within the target's plan
    pub ordinal: usize,
    pub description: String,
    pub status: StepStatus,
    /// Compiled rules backing this step, folded ids included
    pub supporting_rules: Vec<RuleId>,
    pub priority: Option<Priority>,
    /// Needs a human decision before patching
    pub manual_review: bool,
    pub low_confidence: bool,
    /// Planning pass of the target that produced the step, from 1
    #[serde(default)]
    pub generation: u32,
}

/// Result of one check run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pending,
    Pass,
    Fail,
    Skipped,
}

/// Persisted verification result, immutable once recorded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationCheck {
    pub id: CheckId,
    pub target_id: TargetId,
    pub step_id: Option<StepId>,
    /// Verification run for the step, starting at 1
    pub run: u32,
    pub name: String,
    pub file: String,
    pub status: CheckStatus,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Coarse category of a verification failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    AsyncMisuse,
    RemovedApi,
    TypeMismatch,
    ImportPath,
    Timeout,
    PatchRejected,
    Unknown,
}

/// How a reflection attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Resolved,
    Unresolved,
}

/// One autonomous diagnose-and-retry cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionAttempt {
    pub id: AttemptId,
    pub target_id: TargetId,
    pub step_id: StepId,
    /// 1-based, strictly increasing per target
    pub attempt: u32,
    /// Failure text that triggered the attempt
    pub trigger: String,
    pub failure_class: FailureClass,
    pub diagnosis: String,
    pub fix: String,
    /// Knowledge rule the fix was drawn from
    pub rule: Option<RuleId>,
    pub outcome: AttemptOutcome,
    pub created_at: DateTime<Utc>,
}

impl ReflectionAttempt {
    /// Attempt fixed the failing step
    #[inline]
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.outcome == AttemptOutcome::Resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_status_is_forward_only() {
        use StepStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Complete));
        assert!(InProgress.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Complete));
        assert!(!Complete.can_transition_to(InProgress));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!InProgress.can_transition_to(Pending));
        assert!(Complete.is_final() && Failed.is_final());
    }

    #[test]
    fn ids_are_unique_and_sortable() {
        let a = TargetId::new();
        let b = TargetId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 26);
    }

    #[test]
    fn runnable_requires_enabled_idle_and_current() {
        let mut target = MigrationTarget {
            id: TargetId::new(),
            library: "auth-sdk-legacy".to_string(),
            current_version: "v1.2.4".to_string(),
            target_version: "v2.0.0".to_string(),
            confidence: 0.98,
            enabled: true,
            enabled_override: false,
            phase: Phase::Idle,
            discovery_run: 1,
            superseded: false,
            outdated: false,
        };
        assert!(target.is_runnable());
        assert_eq!(target.label(), "auth-sdk-legacy v1.2.4 -> v2.0.0");

        target.superseded = true;
        assert!(!target.is_runnable());
        target.superseded = false;
        target.phase = Phase::Completed;
        assert!(!target.is_runnable());
        assert!(!target.needs_rerun());

        target.outdated = true;
        assert!(target.needs_rerun());
        target.outdated = false;
        target.phase = Phase::Failed;
        assert!(target.needs_rerun());
        target.enabled = false;
        assert!(!target.needs_rerun());
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&StepStatus::InProgress).unwrap(), "\"in_progress\"");
        assert_eq!(serde_json::to_string(&FailureClass::AsyncMisuse).unwrap(), "\"async_misuse\"");
    }
}
