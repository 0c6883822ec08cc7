//! PatchPilot Core - migration orchestration
//!
//! Drives library migrations across a project:
//! - Discovers migration targets and keeps them in a registry
//! - Retrieves knowledge and plans ordered steps per target
//! - Patches and verifies each step through injected collaborators
//! - Recovers failing steps with a bounded reflection loop
//! - Mirrors every action into a hash-chained trace
//!
//! # Example
//!
//! ```rust,ignore
//! use pilot_core::prelude::*;
//! use pilot_core::collaborators::scripted::Fixture;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let scripted = Fixture::load("demos/auth-migration.toml")?.into_scripted();
//! let controller = PipelineController::new(PilotConfig::default(), scripted.collaborators())?;
//!
//! let snapshot = ProjectSnapshot::scan(".", AnalysisDepth::QuickScan)?;
//! let report = controller.run(&snapshot).await?;
//!
//! println!("{} targets completed", report.completed().len());
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod collaborators;
pub mod config;
pub mod controller;
pub mod error;
pub mod phase;
pub mod plan;
pub mod pool;
pub mod reflection;
pub mod registry;
pub mod report;
pub mod snapshot;
pub mod types;
pub mod verification;

pub use collaborators::{
    Analyzer, CheckResult, Collaborators, DiscoveredTarget, FileDiff, KnowledgeRetriever, PatchEngine, PatchRequest,
    RetrievalRequest, RunRequest, TestRunner,
};
pub use config::{AttemptScope, BackoffPolicy, OrderingConstraint, PilotConfig, PriorityRule};
pub use controller::PipelineController;
pub use error::{
    CollaboratorError, ConfigError, DiscoveryError, PilotError, PlanningError, PoolError, ReflectionError,
    StoreError,
};
pub use phase::{allowed_transitions, validate_reopen, validate_transition, IllegalTransition, Phase};
pub use plan::{Plan, PlanStore, Planner};
pub use pool::{PoolStats, WorkflowPool, WorkflowSlot};
pub use reflection::{diagnose, Diagnosis, ReflectionLoop, RetryStage};
pub use registry::TargetRegistry;
pub use report::{RunReport, TargetOutcome};
pub use snapshot::{AnalysisDepth, Inventory, Language, ProjectSnapshot, SnapshotError, SourceFile};
pub use types::{
    Agent, AttemptId, AttemptOutcome, CheckId, CheckStatus, FailureClass, MigrationTarget, PlanStep,
    ReflectionAttempt, StepId, StepStatus, TargetId, VerificationCheck,
};
pub use verification::{FailureSource, VerificationFailure, VerificationGate, VerificationOutcome};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for driving a migration
    pub use crate::{
        AnalysisDepth, Collaborators, MigrationTarget, Phase, PilotConfig, PilotError, PipelineController, PlanStep,
        ProjectSnapshot, RunReport, TargetId,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
