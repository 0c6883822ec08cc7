//! Contracts for the external services the core drives
//!
//! The core never analyzes code, searches documentation, writes patches or
//! runs tests itself. Each of those is an async trait injected as
//! `Arc<dyn ...>`; every call is bounded by the configured timeout and can
//! be cancelled.

pub mod scripted;

use crate::error::CollaboratorError;
use crate::snapshot::{AnalysisDepth, ProjectSnapshot};
use crate::types::{CheckStatus, PlanStep, StepId, TargetId};
use async_trait::async_trait;
use pilot_knowledge::{KnowledgeContext, KnowledgeItem};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Analyzer finding: one library that should move versions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredTarget {
    pub library: String,
    pub current_version: String,
    pub target_version: String,
    pub confidence: f64,
}

impl DiscoveredTarget {
    /// Create new finding
    #[must_use]
    pub fn new(
        library: impl Into<String>,
        current_version: impl Into<String>,
        target_version: impl Into<String>,
        confidence: f64,
    ) -> Self {
        Self {
            library: library.into(),
            current_version: current_version.into(),
            target_version: target_version.into(),
            confidence,
        }
    }
}

/// Knowledge lookup for one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalRequest {
    pub target_id: TargetId,
    pub library: String,
    pub current_version: String,
    pub target_version: String,
    pub queries: Vec<String>,
}

/// Patch generation for one plan step
#[derive(Debug, Clone)]
pub struct PatchRequest {
    pub target_id: TargetId,
    pub library: String,
    pub target_version: String,
    pub step: PlanStep,
    pub knowledge: Arc<KnowledgeContext>,
    /// Fix proposed by the previous reflection attempt
    pub prior_fix: Option<String>,
    /// Reflection attempt number, 0 for the first patch of a step
    pub attempt: u32,
}

/// Single file edit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    pub path: String,
    #[serde(default)]
    pub old_text: String,
    #[serde(default)]
    pub new_text: String,
}

/// Test or lint run for the files a patch touched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub target_id: TargetId,
    pub step_id: StepId,
    pub files: Vec<String>,
    pub selectors: Vec<String>,
}

/// One check reported by the runner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub file: String,
}

impl CheckResult {
    /// Passing check
    #[must_use]
    pub fn pass(name: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Pass,
            error: None,
            file: file.into(),
        }
    }

    /// Failing check with an error message
    #[must_use]
    pub fn fail(name: impl Into<String>, file: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Fail,
            error: Some(error.into()),
            file: file.into(),
        }
    }

    /// Check the runner did not execute
    #[must_use]
    pub fn skipped(name: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Skipped,
            error: None,
            file: file.into(),
        }
    }
}

/// Static analysis and dependency scanning
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Find libraries that need migrating
    async fn analyze(
        &self,
        snapshot: &ProjectSnapshot,
        depth: AnalysisDepth,
    ) -> Result<Vec<DiscoveredTarget>, CollaboratorError>;
}

/// Semantic search over docs, issues and release notes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KnowledgeRetriever: Send + Sync {
    /// Ranked evidence, most relevant first
    async fn retrieve(&self, request: &RetrievalRequest) -> Result<Vec<KnowledgeItem>, CollaboratorError>;
}

/// Code patch generation
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PatchEngine: Send + Sync {
    /// Diffs implementing one plan step
    async fn patch(&self, request: &PatchRequest) -> Result<Vec<FileDiff>, CollaboratorError>;
}

/// Test and lint execution
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Run the checks selected for the touched files
    async fn run(&self, request: &RunRequest) -> Result<Vec<CheckResult>, CollaboratorError>;
}

/// The four collaborators a controller drives
#[derive(Clone)]
pub struct Collaborators {
    pub analyzer: Arc<dyn Analyzer>,
    pub retriever: Arc<dyn KnowledgeRetriever>,
    pub patcher: Arc<dyn PatchEngine>,
    pub runner: Arc<dyn TestRunner>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

impl Collaborators {
    /// Bundle collaborators
    #[must_use]
    pub fn new(
        analyzer: Arc<dyn Analyzer>,
        retriever: Arc<dyn KnowledgeRetriever>,
        patcher: Arc<dyn PatchEngine>,
        runner: Arc<dyn TestRunner>,
    ) -> Self {
        Self {
            analyzer,
            retriever,
            patcher,
            runner,
        }
    }

    /// Replace the analyzer
    #[must_use]
    pub fn with_analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    /// Replace the retriever
    #[must_use]
    pub fn with_retriever(mut self, retriever: Arc<dyn KnowledgeRetriever>) -> Self {
        self.retriever = retriever;
        self
    }

    /// Replace the patch engine
    #[must_use]
    pub fn with_patcher(mut self, patcher: Arc<dyn PatchEngine>) -> Self {
        self.patcher = patcher;
        self
    }

    /// Replace the test runner
    #[must_use]
    pub fn with_runner(mut self, runner: Arc<dyn TestRunner>) -> Self {
        self.runner = runner;
        self
    }
}
