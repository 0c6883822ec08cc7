//! Run reports

use crate::phase::Phase;
use crate::types::TargetId;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// How one target's workflow ended
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetOutcome {
    pub target_id: TargetId,
    pub library: String,
    pub phase: Phase,
    pub steps_total: usize,
    pub steps_completed: usize,
    pub attempts: usize,
    /// Error that ended the workflow, if any
    pub error: Option<String>,
}

impl TargetOutcome {
    /// Workflow reached `Completed`
    #[inline]
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.phase == Phase::Completed
    }
}

/// Result of one controller run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// One entry per admitted target, in plan order
    pub outcomes: Vec<TargetOutcome>,
    /// Libraries of enabled targets already completed for their versions
    pub up_to_date: Vec<String>,
    /// Trace length when the run finished
    pub trace_events: usize,
}

impl RunReport {
    /// Outcome for a library
    #[must_use]
    pub fn outcome(&self, library: &str) -> Option<&TargetOutcome> {
        self.outcomes.iter().find(|o| o.library.eq_ignore_ascii_case(library))
    }

    /// Targets that completed
    #[must_use]
    pub fn completed(&self) -> Vec<&TargetOutcome> {
        self.outcomes.iter().filter(|o| o.is_completed()).collect()
    }

    /// Targets that ended in `Failed`
    #[must_use]
    pub fn failed(&self) -> Vec<&TargetOutcome> {
        self.outcomes.iter().filter(|o| o.phase == Phase::Failed).collect()
    }

    /// Every admitted target completed
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(TargetOutcome::is_completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(library: &str, phase: Phase) -> TargetOutcome {
        TargetOutcome {
            target_id: TargetId::new(),
            library: library.to_string(),
            phase,
            steps_total: 2,
            steps_completed: if phase == Phase::Completed { 2 } else { 1 },
            attempts: 0,
            error: None,
        }
    }

    #[test]
    fn report_partitions_outcomes() {
        let report = RunReport {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            outcomes: vec![
                outcome("auth-sdk-legacy", Phase::Completed),
                outcome("database-connector", Phase::Failed),
            ],
            up_to_date: vec!["ui-components".to_string()],
            trace_events: 12,
        };
        assert_eq!(report.completed().len(), 1);
        assert_eq!(report.failed()[0].library, "database-connector");
        assert!(report.outcome("AUTH-SDK-LEGACY").is_some());
        assert!(!report.is_success());
    }
}
