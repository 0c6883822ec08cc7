//! Testing utilities for the PatchPilot workspace
//!
//! Scenario fixtures, trace sinks that fail on demand and a small harness
//! around [`PipelineController`].

#![allow(missing_docs)]

use parking_lot::Mutex;
use pilot_core::collaborators::scripted::{Fixture, Scripted, ScriptedCheck, ScriptedOutcome};
use pilot_core::{
    AnalysisDepth, CheckStatus, DiscoveredTarget, FileDiff, MigrationTarget, PilotConfig, PipelineController,
    ProjectSnapshot,
};
use pilot_knowledge::{Evidence, KnowledgeItem};
use pilot_trace::{TraceError, TraceEvent, TraceKind, TraceRecorder, TraceSink};
use std::collections::BTreeMap;

pub const AUTH: &str = "auth-sdk-legacy";
pub const DATABASE: &str = "database-connector";
pub const UI: &str = "ui-components";

pub const MISSING_AWAIT: &str = "TypeError: invalidate() is async, detected missing await";

/// Scenario A: three findings, the last below the default threshold
pub fn scenario_a_targets() -> Vec<DiscoveredTarget> {
    vec![
        DiscoveredTarget::new(AUTH, "v1.2.4", "v2.0.0", 0.98),
        DiscoveredTarget::new(DATABASE, "v4.1.0", "v5.0.0", 0.85),
        DiscoveredTarget::new(UI, "v3.2.1", "v4.0.0", 0.62),
    ]
}

pub fn auth_knowledge() -> Vec<KnowledgeItem> {
    vec![
        KnowledgeItem::Doc(Evidence::new(
            "Auth token format changed from Bearer to Token prefix.",
            "docs.auth-sdk.com/v2/migration",
            0.99,
        )),
        KnowledgeItem::Issue(Evidence::new(
            "Legacy session cleanup method removed; call session.invalidate() and await it.",
            "github.com/auth-sdk/issues/402",
            0.88,
        )),
    ]
}

pub fn database_knowledge() -> Vec<KnowledgeItem> {
    vec![KnowledgeItem::ReleaseNote(Evidence::new(
        "Connection pool config schema flattened.",
        "db-conn v5.0.0 Release Notes",
        0.95,
    ))]
}

fn pass(selector: &str, name: &str, file: &str) -> ScriptedCheck {
    ScriptedCheck {
        selector: selector.to_string(),
        name: name.to_string(),
        file: file.to_string(),
        outcomes: Vec::new(),
    }
}

fn session_check(outcomes: Vec<ScriptedOutcome>) -> ScriptedCheck {
    ScriptedCheck {
        selector: "rule:RULE-AUTH-02".to_string(),
        name: "Session Invalidation".to_string(),
        file: "tests/unit/session_test.ts".to_string(),
        outcomes,
    }
}

fn failing() -> ScriptedOutcome {
    ScriptedOutcome {
        status: CheckStatus::Fail,
        error: Some(MISSING_AWAIT.to_string()),
    }
}

fn passing() -> ScriptedOutcome {
    ScriptedOutcome {
        status: CheckStatus::Pass,
        error: None,
    }
}

/// Scenario B: auth and database enabled, every check passes
pub fn scenario_b_fixture() -> Fixture {
    let mut knowledge = BTreeMap::new();
    knowledge.insert(AUTH.to_string(), auth_knowledge());
    knowledge.insert(DATABASE.to_string(), database_knowledge());

    let mut patches = BTreeMap::new();
    patches.insert(
        AUTH.to_string(),
        vec![FileDiff {
            path: "src/client.ts".to_string(),
            old_text: "'Authorization': `Bearer ${token}`".to_string(),
            new_text: "'Authorization': `Token ${token}`".to_string(),
        }],
    );

    Fixture {
        targets: scenario_a_targets(),
        knowledge,
        patches,
        checks: vec![
            pass("rule:RULE-AUTH-01", "Authentication Flow Test", "tests/integration/auth_test.ts"),
            session_check(Vec::new()),
            pass("target:database-connector", "Connection Pooling", "tests/db/pool_test.ts"),
        ],
        ..Fixture::default()
    }
}

/// Scenario C: "Session Invalidation" fails once with a missing await
pub fn scenario_c_fixture() -> Fixture {
    let mut fixture = scenario_b_fixture();
    fixture.checks[1] = session_check(vec![failing(), passing()]);
    fixture
}

/// Scenario D: "Session Invalidation" never passes
pub fn scenario_d_fixture() -> Fixture {
    let mut fixture = scenario_b_fixture();
    fixture.checks[1] = session_check(vec![failing()]);
    fixture
}

pub fn snapshot() -> ProjectSnapshot {
    ProjectSnapshot::new("/srv/checkout-service", AnalysisDepth::QuickScan)
}

/// Controller wired to scripted collaborators, with handles for inspection
pub struct Harness {
    pub controller: PipelineController,
    pub scripted: Scripted,
}

impl Harness {
    pub fn new(fixture: Fixture) -> Self {
        Self::with_config(fixture, PilotConfig::default())
    }

    pub fn with_config(fixture: Fixture, config: PilotConfig) -> Self {
        Self::with_trace(fixture, config, TraceRecorder::new())
    }

    pub fn with_trace(fixture: Fixture, config: PilotConfig, trace: TraceRecorder) -> Self {
        let scripted = fixture.into_scripted();
        let controller = PipelineController::with_trace(config, scripted.collaborators(), trace)
            .expect("test configuration is valid");
        Self { controller, scripted }
    }

    pub fn target(&self, library: &str) -> MigrationTarget {
        self.controller
            .target_by_library(library)
            .unwrap_or_else(|| panic!("{library} was not discovered"))
    }

    /// Events of a target with the given kind
    pub fn events(&self, library: &str, kind: TraceKind) -> Vec<TraceEvent> {
        self.controller
            .trace_for(self.target(library).id)
            .into_iter()
            .filter(|e| e.kind == kind)
            .collect()
    }
}

/// Sink that rejects events of one library, optionally after some writes
///
/// Matches on the event's library name since target ids are minted during
/// discovery, after the sink is built.
#[derive(Debug)]
pub struct FailingSink {
    library: String,
    allow: usize,
    seen: Mutex<usize>,
    written: Mutex<Vec<u64>>,
}

impl FailingSink {
    pub fn for_target(library: impl Into<String>) -> Self {
        Self {
            library: library.into(),
            allow: 0,
            seen: Mutex::new(0),
            written: Mutex::new(Vec::new()),
        }
    }

    /// Accept the first `n` events of the target before failing
    #[must_use]
    pub fn after(mut self, n: usize) -> Self {
        self.allow = n;
        self
    }

    /// Sequence numbers accepted so far
    pub fn written(&self) -> Vec<u64> {
        self.written.lock().clone()
    }
}

impl TraceSink for FailingSink {
    fn write(&self, event: &TraceEvent) -> Result<(), TraceError> {
        if event.library.as_deref() == Some(self.library.as_str()) {
            let mut seen = self.seen.lock();
            if *seen >= self.allow {
                return Err(TraceError::Sink(format!("disk full while writing seq {}", event.seq)));
            }
            *seen += 1;
        }
        self.written.lock().push(event.seq);
        Ok(())
    }
}
