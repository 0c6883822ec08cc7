//! Per-target workflow phases and the legal transition table

use serde::{Deserialize, Serialize};

/// Phase of one target's migration workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Discovering,
    Retrieving,
    Planning,
    Patching,
    Verifying,
    Reflecting,
    Completed,
    Failed,
    Cancelled,
}

impl Phase {
    /// Every phase, in stepper order
    pub const ALL: [Phase; 10] = [
        Phase::Idle,
        Phase::Discovering,
        Phase::Retrieving,
        Phase::Planning,
        Phase::Patching,
        Phase::Verifying,
        Phase::Reflecting,
        Phase::Completed,
        Phase::Failed,
        Phase::Cancelled,
    ];

    /// No workflow transition leaves this phase; only [`validate_reopen`]
    /// takes a finished target back to `Idle` for a later run
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Cancelled)
    }

    /// A workflow task currently owns the target
    #[inline]
    #[must_use]
    pub fn is_active(self) -> bool {
        !self.is_terminal() && self != Phase::Idle
    }

    /// Stable string tag
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Discovering => "discovering",
            Phase::Retrieving => "retrieving",
            Phase::Planning => "planning",
            Phase::Patching => "patching",
            Phase::Verifying => "verifying",
            Phase::Reflecting => "reflecting",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
            Phase::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected phase change
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: Phase,
    pub to: Phase,
}

/// Phases reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: Phase) -> Vec<Phase> {
    use Phase::*;
    match from {
        Idle => vec![Discovering, Failed, Cancelled],
        Discovering => vec![Retrieving, Failed, Cancelled],
        Retrieving => vec![Planning, Failed, Cancelled],
        Planning => vec![Patching, Failed, Cancelled],
        Patching => vec![Verifying, Failed, Cancelled],
        Verifying => vec![Patching, Completed, Reflecting, Failed, Cancelled],
        Reflecting => vec![Patching, Failed, Cancelled],
        Completed | Failed | Cancelled => vec![],
    }
}

/// Validate a phase change
///
/// # Errors
/// `IllegalTransition` if `to` is not reachable from `from`.
pub fn validate_transition(from: Phase, to: Phase) -> Result<(), IllegalTransition> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(IllegalTransition { from, to })
    }
}

/// Validate taking a finished target back to `Idle` for another run
///
/// This is not a workflow step and is not part of
/// [`allowed_transitions`]; callers must trace it as a rerun.
///
/// # Errors
/// `IllegalTransition` unless `from` is terminal.
pub fn validate_reopen(from: Phase) -> Result<(), IllegalTransition> {
    if from.is_terminal() {
        Ok(())
    } else {
        Err(IllegalTransition { from, to: Phase::Idle })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn happy_path_is_legal() {
        let path = [
            Phase::Idle,
            Phase::Discovering,
            Phase::Retrieving,
            Phase::Planning,
            Phase::Patching,
            Phase::Verifying,
            Phase::Reflecting,
            Phase::Patching,
            Phase::Verifying,
            Phase::Patching,
            Phase::Verifying,
            Phase::Completed,
        ];
        for pair in path.windows(2) {
            assert!(validate_transition(pair[0], pair[1]).is_ok(), "{:?}", pair);
        }
    }

    #[test]
    fn skipping_phases_is_rejected() {
        let err = validate_transition(Phase::Idle, Phase::Patching).unwrap_err();
        assert_eq!(err.to_string(), "illegal transition idle -> patching");
        assert!(validate_transition(Phase::Planning, Phase::Completed).is_err());
        assert!(validate_transition(Phase::Reflecting, Phase::Completed).is_err());
    }

    #[test]
    fn terminal_phases_are_sinks() {
        for phase in [Phase::Completed, Phase::Failed, Phase::Cancelled] {
            assert!(phase.is_terminal());
            assert!(allowed_transitions(phase).is_empty());
        }
        assert!(!Phase::Idle.is_active());
        assert!(Phase::Reflecting.is_active());
    }

    #[test]
    fn only_finished_targets_reopen() {
        for phase in Phase::ALL {
            assert_eq!(validate_reopen(phase).is_ok(), phase.is_terminal(), "{phase}");
        }
        let err = validate_reopen(Phase::Patching).unwrap_err();
        assert_eq!(err.to_string(), "illegal transition patching -> idle");
    }

    fn arb_phase() -> impl Strategy<Value = Phase> {
        proptest::sample::select(Phase::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn prop_non_terminal_phases_can_fail_and_cancel(phase in arb_phase()) {
            if !phase.is_terminal() {
                prop_assert!(validate_transition(phase, Phase::Failed).is_ok());
                prop_assert!(validate_transition(phase, Phase::Cancelled).is_ok());
            }
        }

        #[test]
        fn prop_nothing_returns_to_idle(phase in arb_phase()) {
            prop_assert!(validate_transition(phase, Phase::Idle).is_err());
        }
    }
}
