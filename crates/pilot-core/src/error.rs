//! Error types for the migration core
//!
//! One enum per concern, folded into [`PilotError`]:
//! - Discovery and planning failures surface to the caller
//! - Patch and verification failures feed the reflection loop
//! - Trace write failures abort the affected target only

use crate::phase::{IllegalTransition, Phase};
use crate::types::{ReflectionAttempt, StepId, StepStatus, TargetId};
use pilot_trace::TraceError;
use std::path::PathBuf;

/// Main error type of the core
#[derive(Debug, thiserror::Error)]
pub enum PilotError {
    /// Analyzer could not produce a target set
    #[error("discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    /// No plan could be produced
    #[error("planning failed: {0}")]
    Planning(#[from] PlanningError),

    /// Reflection gave up or could not start
    #[error("reflection failed: {0}")]
    Reflection(#[from] ReflectionError),

    /// Audit trail rejected an event
    #[error("trace write failed: {0}")]
    TraceWrite(#[from] TraceError),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Phase change outside the transition table
    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    /// Store rejected a write
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Workflow pool refused admission
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    /// Workflow cancelled
    #[error("target {0} cancelled")]
    Cancelled(TargetId),
}

impl PilotError {
    /// Error ends the target's workflow
    #[inline]
    #[must_use]
    pub fn is_fatal_for_target(&self) -> bool {
        !matches!(self, PilotError::Discovery(_) | PilotError::Config(_))
    }

    /// Running again with the same inputs may succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            PilotError::Discovery(e) => e.is_retryable(),
            PilotError::TraceWrite(e) => !e.is_integrity_violation(),
            PilotError::Cancelled(_) => true,
            _ => false,
        }
    }

    /// Workflow ended by cancellation
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PilotError::Cancelled(_))
    }
}

/// Discovery failures; the registry is left unchanged
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DiscoveryError {
    /// Analyzer could not be reached
    #[error("analyzer unreachable: {0}")]
    Unreachable(String),

    /// Analyzer answered with unusable data
    #[error("malformed analyzer response: {0}")]
    Malformed(String),

    /// Analyzer did not answer in time
    #[error("analyzer timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    /// Run was cancelled while analyzing
    #[error("discovery cancelled")]
    Cancelled,
}

impl DiscoveryError {
    /// Transient failure
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, DiscoveryError::Unreachable(_) | DiscoveryError::Timeout { .. })
    }
}

/// Planning failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanningError {
    /// Nothing to plan
    #[error("no enabled migration targets")]
    NoEnabledTargets,

    /// Enabled target without usable knowledge; it gets a manual-review step
    #[error("no usable knowledge for {library} ({target})")]
    MissingKnowledge { target: TargetId, library: String },

    /// Priority constraints form a cycle
    #[error("priority rule is cyclic: {}", .0.join(" -> "))]
    CyclicPriority(Vec<String>),

    /// A target this one must follow ended without completing
    #[error("{library} must follow {predecessor}, which ended {phase}")]
    PredecessorUnfinished {
        target: TargetId,
        library: String,
        predecessor: String,
        phase: Phase,
    },
}

/// Reflection loop failures
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReflectionError {
    /// Bound reached without a passing verification
    #[error("reflection exhausted for target {target} after {} attempts", .attempts.len())]
    Exhausted {
        target: TargetId,
        step: StepId,
        /// Attempts charged to the target's current budget, oldest first
        attempts: Vec<ReflectionAttempt>,
    },

    /// Target already has an open loop
    #[error("reflection loop already open for target {0}")]
    AlreadyOpen(TargetId),
}

/// Configuration failures
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Value out of range
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// File could not be read
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TOML did not parse
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Collaborator call failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    /// Service not reachable
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// Response could not be interpreted
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Service reported a failure
    #[error("{0}")]
    Failed(String),
}

/// Store write rejections
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("unknown target {0}")]
    UnknownTarget(TargetId),

    #[error("unknown plan step {0}")]
    UnknownStep(StepId),

    /// Step status would regress or skip
    #[error("step {step} cannot move from {from:?} to {to:?}")]
    IllegalStepTransition {
        step: StepId,
        from: StepStatus,
        to: StepStatus,
    },

    /// Target is mid-workflow
    #[error("target {0} is active")]
    TargetActive(TargetId),
}

/// Workflow pool failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// Pool no longer admits workflows
    #[error("workflow pool closed")]
    Closed,
}
