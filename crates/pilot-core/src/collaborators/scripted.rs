//! Deterministic collaborators driven by a fixture
//!
//! Used by the `patchpilot` binary for dry runs and by tests. A fixture
//! lists the targets the analyzer reports, the knowledge per library, the
//! diffs per library and a script of check outcomes keyed by selector.
//!
//! ```toml
//! [[targets]]
//! library = "auth-sdk-legacy"
//! current_version = "v1.2.4"
//! target_version = "v2.0.0"
//! confidence = 0.98
//!
//! [[knowledge.auth-sdk-legacy]]
//! type = "doc"
//! summary = "Auth token format changed from Bearer to Token prefix."
//! citation = "docs.auth-sdk.com/v2/migration"
//! relevance = 0.99
//!
//! [[checks]]
//! selector = "rule:RULE-AUTH-01"
//! name = "Token Validation"
//! file = "tests/test_auth.py"
//! outcomes = [{ status = "pass" }]
//! ```

use super::{
    Analyzer, CheckResult, Collaborators, DiscoveredTarget, FileDiff, KnowledgeRetriever, PatchEngine, PatchRequest,
    RetrievalRequest, RunRequest, TestRunner,
};
use crate::error::{CollaboratorError, ConfigError};
use crate::snapshot::{AnalysisDepth, ProjectSnapshot};
use crate::types::CheckStatus;
use async_trait::async_trait;
use parking_lot::Mutex;
use pilot_knowledge::KnowledgeItem;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Artificial latency per collaborator, in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Delays {
    pub analyzer_ms: u64,
    pub retriever_ms: u64,
    pub patcher_ms: u64,
    pub runner_ms: u64,
}

/// One scripted check outcome
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScriptedOutcome {
    pub status: CheckStatus,
    #[serde(default)]
    pub error: Option<String>,
}

/// A check that runs whenever its selector is requested
///
/// Successive runs consume `outcomes` in order; the last outcome repeats.
/// No outcomes means the check always passes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScriptedCheck {
    pub selector: String,
    pub name: String,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub outcomes: Vec<ScriptedOutcome>,
}

/// Complete scripted environment
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Fixture {
    pub targets: Vec<DiscoveredTarget>,
    pub knowledge: BTreeMap<String, Vec<KnowledgeItem>>,
    pub patches: BTreeMap<String, Vec<FileDiff>>,
    /// Number of leading patch calls rejected per library
    pub patch_failures: BTreeMap<String, u32>,
    pub checks: Vec<ScriptedCheck>,
    pub delays: Delays,
    pub analyzer_unreachable: bool,
}

impl Fixture {
    /// Parse a fixture document
    ///
    /// # Errors
    /// `ConfigError::Parse` for invalid TOML.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Read a fixture file
    ///
    /// # Errors
    /// `ConfigError::Read` or `ConfigError::Parse`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Build scripted collaborators from this fixture
    #[must_use]
    pub fn into_scripted(self) -> Scripted {
        let mut analyzer = if self.analyzer_unreachable {
            ScriptedAnalyzer::failing(CollaboratorError::Unreachable("scripted analyzer offline".to_string()))
        } else {
            ScriptedAnalyzer::new(self.targets)
        };
        analyzer.delay = Duration::from_millis(self.delays.analyzer_ms);

        let mut retriever = ScriptedRetriever::new(self.knowledge);
        retriever.delay = Duration::from_millis(self.delays.retriever_ms);

        let mut patcher = ScriptedPatchEngine::new(self.patches);
        patcher.delay = Duration::from_millis(self.delays.patcher_ms);
        for (library, count) in self.patch_failures {
            patcher = patcher.reject_first(library, count);
        }

        let mut runner = ScriptedTestRunner::new(self.checks);
        runner.delay = Duration::from_millis(self.delays.runner_ms);

        Scripted {
            analyzer: Arc::new(analyzer),
            retriever: Arc::new(retriever),
            patcher: Arc::new(patcher),
            runner: Arc::new(runner),
        }
    }
}

/// Scripted collaborators with typed handles kept for inspection
#[derive(Debug, Clone)]
pub struct Scripted {
    pub analyzer: Arc<ScriptedAnalyzer>,
    pub retriever: Arc<ScriptedRetriever>,
    pub patcher: Arc<ScriptedPatchEngine>,
    pub runner: Arc<ScriptedTestRunner>,
}

impl Scripted {
    /// Type-erased bundle for a controller
    #[must_use]
    pub fn collaborators(&self) -> Collaborators {
        Collaborators::new(
            self.analyzer.clone(),
            self.retriever.clone(),
            self.patcher.clone(),
            self.runner.clone(),
        )
    }
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

/// Analyzer returning a fixed target list
#[derive(Debug, Default)]
pub struct ScriptedAnalyzer {
    targets: Vec<DiscoveredTarget>,
    failure: Option<CollaboratorError>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedAnalyzer {
    /// Report `targets` on every call
    #[must_use]
    pub fn new(targets: Vec<DiscoveredTarget>) -> Self {
        Self {
            targets,
            ..Self::default()
        }
    }

    /// Fail every call with `error`
    #[must_use]
    pub fn failing(error: CollaboratorError) -> Self {
        Self {
            failure: Some(error),
            ..Self::default()
        }
    }

    /// With response latency
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of analyze calls started
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Analyzer for ScriptedAnalyzer {
    async fn analyze(
        &self,
        _snapshot: &ProjectSnapshot,
        _depth: AnalysisDepth,
    ) -> Result<Vec<DiscoveredTarget>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        pause(self.delay).await;
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(self.targets.clone()),
        }
    }
}

/// Retriever answering from a per-library table
#[derive(Debug, Default)]
pub struct ScriptedRetriever {
    knowledge: BTreeMap<String, Vec<KnowledgeItem>>,
    delay: Duration,
    requests: Mutex<Vec<RetrievalRequest>>,
}

impl ScriptedRetriever {
    /// Answer with `knowledge[library]`, empty when absent
    #[must_use]
    pub fn new(knowledge: BTreeMap<String, Vec<KnowledgeItem>>) -> Self {
        Self {
            knowledge,
            ..Self::default()
        }
    }

    /// With response latency
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Requests received so far
    #[must_use]
    pub fn requests(&self) -> Vec<RetrievalRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl KnowledgeRetriever for ScriptedRetriever {
    async fn retrieve(&self, request: &RetrievalRequest) -> Result<Vec<KnowledgeItem>, CollaboratorError> {
        self.requests.lock().push(request.clone());
        pause(self.delay).await;
        Ok(self.knowledge.get(&request.library).cloned().unwrap_or_default())
    }
}

/// What the patch engine was asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchCall {
    pub library: String,
    pub step_ordinal: usize,
    pub prior_fix: Option<String>,
    pub attempt: u32,
}

/// Patch engine returning fixed diffs per library
#[derive(Debug, Default)]
pub struct ScriptedPatchEngine {
    patches: BTreeMap<String, Vec<FileDiff>>,
    rejections: Mutex<HashMap<String, u32>>,
    delay: Duration,
    calls: Mutex<Vec<PatchCall>>,
}

impl ScriptedPatchEngine {
    /// Answer with `patches[library]`, or one synthetic diff per step
    #[must_use]
    pub fn new(patches: BTreeMap<String, Vec<FileDiff>>) -> Self {
        Self {
            patches,
            ..Self::default()
        }
    }

    /// Reject the first `count` patch calls for `library`
    #[must_use]
    pub fn reject_first(self, library: impl Into<String>, count: u32) -> Self {
        self.rejections.lock().insert(library.into(), count);
        self
    }

    /// With response latency
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Calls received so far
    #[must_use]
    pub fn calls(&self) -> Vec<PatchCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl PatchEngine for ScriptedPatchEngine {
    async fn patch(&self, request: &PatchRequest) -> Result<Vec<FileDiff>, CollaboratorError> {
        self.calls.lock().push(PatchCall {
            library: request.library.clone(),
            step_ordinal: request.step.ordinal,
            prior_fix: request.prior_fix.clone(),
            attempt: request.attempt,
        });
        pause(self.delay).await;

        {
            let mut rejections = self.rejections.lock();
            if let Some(left) = rejections.get_mut(&request.library) {
                if *left > 0 {
                    *left -= 1;
                    return Err(CollaboratorError::Failed(format!(
                        "patch rejected: hunk for step {} does not apply",
                        request.step.ordinal
                    )));
                }
            }
        }

        Ok(self.patches.get(&request.library).cloned().unwrap_or_else(|| {
            vec![FileDiff {
                path: format!("{}/step-{}", request.library, request.step.ordinal),
                old_text: String::new(),
                new_text: request.step.description.clone(),
            }]
        }))
    }
}

/// Test runner replaying scripted outcomes
#[derive(Debug, Default)]
pub struct ScriptedTestRunner {
    checks: Vec<ScriptedCheck>,
    cursors: Mutex<HashMap<usize, usize>>,
    delay: Duration,
    runs: AtomicUsize,
}

impl ScriptedTestRunner {
    /// Replay `checks`
    #[must_use]
    pub fn new(checks: Vec<ScriptedCheck>) -> Self {
        Self {
            checks,
            ..Self::default()
        }
    }

    /// With response latency
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of run calls started
    #[must_use]
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TestRunner for ScriptedTestRunner {
    async fn run(&self, request: &RunRequest) -> Result<Vec<CheckResult>, CollaboratorError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        pause(self.delay).await;

        let mut cursors = self.cursors.lock();
        let mut results = Vec::new();
        for (idx, check) in self.checks.iter().enumerate() {
            if !request.selectors.contains(&check.selector) {
                continue;
            }
            let cursor = cursors.entry(idx).or_insert(0);
            let outcome = check
                .outcomes
                .get((*cursor).min(check.outcomes.len().saturating_sub(1)))
                .cloned()
                .unwrap_or(ScriptedOutcome {
                    status: CheckStatus::Pass,
                    error: None,
                });
            *cursor += 1;
            results.push(CheckResult {
                name: check.name.clone(),
                status: outcome.status,
                error: outcome.error,
                file: check.file.clone(),
            });
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PlanStep, StepId, StepStatus, TargetId};
    use pilot_knowledge::KnowledgeContext;

    const FIXTURE: &str = r#"
        [[targets]]
        library = "auth-sdk-legacy"
        current_version = "v1.2.4"
        target_version = "v2.0.0"
        confidence = 0.98

        [[knowledge.auth-sdk-legacy]]
        type = "doc"
        summary = "Auth token format changed from Bearer to Token prefix."
        citation = "docs.auth-sdk.com/v2/migration"
        relevance = 0.99

        [patch_failures]
        auth-sdk-legacy = 1

        [[checks]]
        selector = "rule:RULE-AUTH-01"
        name = "Token Validation"
        file = "tests/test_auth.py"
        outcomes = [
            { status = "fail", error = "AssertionError: expected Token prefix" },
            { status = "pass" },
        ]
    "#;

    fn step(target_id: TargetId) -> PlanStep {
        PlanStep {
            id: StepId::new(),
            target_id,
            ordinal: 1,
            description: "Update token header".to_string(),
            status: StepStatus::InProgress,
            supporting_rules: Vec::new(),
            priority: None,
            manual_review: false,
            low_confidence: false,
            generation: 1,
        }
    }

    #[tokio::test]
    async fn fixture_drives_all_collaborators() {
        let scripted = Fixture::from_toml_str(FIXTURE).unwrap().into_scripted();
        let collaborators = scripted.collaborators();
        let snapshot = ProjectSnapshot::new(".", AnalysisDepth::QuickScan);

        let targets = collaborators
            .analyzer
            .analyze(&snapshot, AnalysisDepth::QuickScan)
            .await
            .unwrap();
        assert_eq!(targets.len(), 1);

        let target_id = TargetId::new();
        let items = collaborators
            .retriever
            .retrieve(&RetrievalRequest {
                target_id,
                library: "auth-sdk-legacy".to_string(),
                current_version: "v1.2.4".to_string(),
                target_version: "v2.0.0".to_string(),
                queries: Vec::new(),
            })
            .await
            .unwrap();
        assert_eq!(items.len(), 1);

        let request = PatchRequest {
            target_id,
            library: "auth-sdk-legacy".to_string(),
            target_version: "v2.0.0".to_string(),
            step: step(target_id),
            knowledge: Arc::new(KnowledgeContext::empty("auth-sdk-legacy")),
            prior_fix: None,
            attempt: 0,
        };
        assert!(collaborators.patcher.patch(&request).await.is_err());
        let diffs = collaborators.patcher.patch(&request).await.unwrap();
        assert_eq!(diffs[0].path, "auth-sdk-legacy/step-1");
        assert_eq!(scripted.patcher.calls().len(), 2);

        let run = RunRequest {
            target_id,
            step_id: request.step.id,
            files: vec![diffs[0].path.clone()],
            selectors: vec!["rule:RULE-AUTH-01".to_string()],
        };
        let first = collaborators.runner.run(&run).await.unwrap();
        assert_eq!(first[0].status, CheckStatus::Fail);
        let second = collaborators.runner.run(&run).await.unwrap();
        assert_eq!(second[0].status, CheckStatus::Pass);
        let third = collaborators.runner.run(&run).await.unwrap();
        assert_eq!(third[0].status, CheckStatus::Pass);
    }

    #[tokio::test]
    async fn unselected_checks_do_not_run() {
        let runner = ScriptedTestRunner::new(vec![ScriptedCheck {
            selector: "rule:RULE-DATABASE-01".to_string(),
            name: "Pool Config".to_string(),
            file: String::new(),
            outcomes: Vec::new(),
        }]);
        let results = runner
            .run(&RunRequest {
                target_id: TargetId::new(),
                step_id: StepId::new(),
                files: Vec::new(),
                selectors: vec!["target:auth-sdk-legacy".to_string()],
            })
            .await
            .unwrap();
        assert!(results.is_empty());
        assert_eq!(runner.runs(), 1);
    }

    #[tokio::test]
    async fn failing_analyzer_reports_error() {
        let analyzer = ScriptedAnalyzer::failing(CollaboratorError::Unreachable("offline".to_string()));
        let snapshot = ProjectSnapshot::new(".", AnalysisDepth::QuickScan);
        assert!(analyzer.analyze(&snapshot, AnalysisDepth::QuickScan).await.is_err());
        assert_eq!(analyzer.calls(), 1);
    }
}
