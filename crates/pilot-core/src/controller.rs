//! Pipeline controller
//!
//! Drives every enabled target through
//! `Discovering -> Retrieving -> Planning -> Patching -> Verifying`, hands
//! verification failures to the reflection loop and records each step in the
//! trace.
//!
//! # Workflow
//! 1. Discover targets in the project snapshot and merge them into the registry
//! 2. Reopen finished targets that need another run, tracing each as a rerun
//! 3. Order runnable targets by the priority rule
//! 4. Admit targets to the bounded pool in that order, one task per target
//! 5. Per target: wait for `after` predecessors, retrieve knowledge, plan,
//!    then patch and verify each step
//! 6. Collect outcomes into a [`RunReport`]
//!
//! A target's failure, cancellation or trace write error ends that target
//! only; other workflows keep running. A target whose predecessor did not
//! complete fails without starting.

use crate::collaborators::{Collaborators, PatchRequest, RetrievalRequest, RunRequest};
use crate::config::PilotConfig;
use crate::error::{CollaboratorError, ConfigError, DiscoveryError, PilotError, PlanningError};
use crate::phase::Phase;
use crate::plan::{Plan, PlanStore, Planner};
use crate::pool::{PoolStats, WorkflowPool};
use crate::reflection::{ReflectionLoop, RetryStage};
use crate::registry::TargetRegistry;
use crate::report::{RunReport, TargetOutcome};
use crate::snapshot::ProjectSnapshot;
use crate::types::{
    Agent, MigrationTarget, PlanStep, ReflectionAttempt, StepId, StepStatus, TargetId, VerificationCheck,
};
use crate::verification::{FailureSource, VerificationGate, VerificationOutcome};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use moka::future::Cache;
use pilot_knowledge::{search_queries, KnowledgeContext};
use pilot_trace::{TraceDraft, TraceError, TraceEvent, TraceFilter, TraceKind, TraceRecorder};
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Knowledge contexts kept across runs
const KNOWLEDGE_CACHE_CAPACITY: u64 = 256;

/// Result of one bounded collaborator call
enum Call<T> {
    Done(T),
    Failed(CollaboratorError),
    TimedOut,
    Cancelled,
}

/// Await `fut` unless the token fires or the limit passes first
///
/// Cancellation wins ties; a result arriving after cancellation is dropped.
async fn call<T, F>(token: &CancellationToken, limit: Duration, fut: F) -> Call<T>
where
    F: Future<Output = Result<T, CollaboratorError>>,
{
    tokio::select! {
        biased;
        () = token.cancelled() => Call::Cancelled,
        res = tokio::time::timeout(limit, fut) => match res {
            Ok(Ok(value)) => Call::Done(value),
            Ok(Err(err)) => Call::Failed(err),
            Err(_) => Call::TimedOut,
        },
    }
}

fn checkpoint(target: &MigrationTarget, token: &CancellationToken) -> Result<(), PilotError> {
    if token.is_cancelled() {
        Err(PilotError::Cancelled(target.id))
    } else {
        Ok(())
    }
}

fn draft(target: &MigrationTarget, agent: Agent, kind: TraceKind) -> TraceDraft {
    TraceDraft::new(agent.as_str(), kind)
        .target(target.id.to_string())
        .library(target.library.clone())
}

/// Library of a predecessor and the signal carrying its final phase
type Predecessor = (String, watch::Receiver<Option<Phase>>);

/// Final phase a predecessor reported; a dropped signal counts as failed
async fn finished_phase(signal: &mut watch::Receiver<Option<Phase>>) -> Phase {
    match signal.wait_for(Option::is_some).await {
        Ok(phase) => (*phase).unwrap_or(Phase::Failed),
        Err(_) => Phase::Failed,
    }
}

fn cache_key(target: &MigrationTarget) -> String {
    format!(
        "{}@{}->{}",
        target.library.to_lowercase(),
        target.current_version,
        target.target_version
    )
}

struct Inner {
    config: PilotConfig,
    collaborators: Collaborators,
    registry: TargetRegistry,
    planner: Planner,
    plans: PlanStore,
    gate: VerificationGate,
    reflection: ReflectionLoop,
    knowledge: DashMap<TargetId, Arc<KnowledgeContext>>,
    knowledge_cache: Cache<String, Arc<KnowledgeContext>>,
    trace: TraceRecorder,
    pool: WorkflowPool,
    errors: DashMap<TargetId, String>,
    /// One `run` at a time
    run_lock: tokio::sync::Mutex<()>,
}

/// Owner of every migration record and driver of target workflows
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct PipelineController {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PipelineController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineController")
            .field("targets", &self.inner.registry.len())
            .field("trace_events", &self.inner.trace.len())
            .field("pool", &self.inner.pool.stats())
            .finish_non_exhaustive()
    }
}

impl PipelineController {
    /// Create controller with an in-memory trace
    ///
    /// # Errors
    /// `ConfigError::Invalid` if the configuration does not validate.
    pub fn new(config: PilotConfig, collaborators: Collaborators) -> Result<Self, ConfigError> {
        Self::with_trace(config, collaborators, TraceRecorder::new())
    }

    /// Create controller writing into `trace`
    ///
    /// # Errors
    /// `ConfigError::Invalid` if the configuration does not validate.
    pub fn with_trace(
        config: PilotConfig,
        collaborators: Collaborators,
        trace: TraceRecorder,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let inner = Inner {
            registry: TargetRegistry::new(config.enable_threshold),
            planner: Planner::new(config.priority.clone()),
            plans: PlanStore::new(),
            gate: VerificationGate::new(),
            reflection: ReflectionLoop::from_config(&config),
            knowledge: DashMap::new(),
            knowledge_cache: Cache::new(KNOWLEDGE_CACHE_CAPACITY),
            trace,
            pool: WorkflowPool::new(config.max_active_targets),
            errors: DashMap::new(),
            run_lock: tokio::sync::Mutex::new(()),
            collaborators,
            config,
        };
        Ok(Self { inner: Arc::new(inner) })
    }

    /// Run a full migration over `snapshot`
    ///
    /// Discovery and planning errors that leave nothing to run are returned;
    /// per-target failures are reported in the [`RunReport`].
    ///
    /// # Errors
    /// `Discovery`, `Planning` (`NoEnabledTargets`, `CyclicPriority`),
    /// `TraceWrite` for run-level events and `Pool` if the pool was closed.
    pub async fn run(&self, snapshot: &ProjectSnapshot) -> Result<RunReport, PilotError> {
        let _running = self.inner.run_lock.lock().await;
        let started_at = Utc::now();
        let run_token = self.inner.pool.begin_run();
        tracing::info!("Starting migration run for {}", snapshot.root.display());

        self.discover_with(snapshot, &run_token).await?;
        for target in self.inner.registry.needing_rerun() {
            let note = if target.phase == Phase::Completed {
                "rerun: versions changed".to_string()
            } else {
                format!("rerun after {}", target.phase)
            };
            self.reopen(&target, note)?;
        }

        let runnable = self.inner.registry.runnable();
        let up_to_date: Vec<String> = self
            .inner
            .registry
            .enabled()
            .into_iter()
            .filter(|t| t.phase == Phase::Completed)
            .map(|t| t.library)
            .collect();
        if runnable.is_empty() && up_to_date.is_empty() {
            let err = PlanningError::NoEnabledTargets;
            self.trace_run_error(Agent::PlanningAgent, &err.to_string())?;
            return Err(err.into());
        }
        let ordered = match self.inner.planner.order_targets(&runnable) {
            Ok(ordered) => ordered,
            Err(err) => {
                self.trace_run_error(Agent::PlanningAgent, &err.to_string())?;
                return Err(err.into());
            }
        };
        let order: Vec<TargetId> = ordered.iter().map(|t| t.id).collect();
        self.inner.plans.set_order(order.clone());

        let waits = self.inner.planner.predecessors(&ordered);
        let mut signals: HashMap<TargetId, watch::Sender<Option<Phase>>> =
            ordered.iter().map(|t| (t.id, watch::channel(None).0)).collect();
        let admissions: Vec<(MigrationTarget, CancellationToken, Vec<Predecessor>)> = ordered
            .into_iter()
            .map(|t| {
                let after = waits
                    .get(&t.id)
                    .into_iter()
                    .flatten()
                    .filter_map(|id| {
                        let library = self.inner.registry.get(*id)?.library;
                        Some((library, signals.get(id)?.subscribe()))
                    })
                    .collect();
                let token = self.inner.pool.register(t.id);
                (t, token, after)
            })
            .collect();
        tracing::info!("Admitting {} targets", admissions.len());

        let mut tasks = JoinSet::new();
        let mut refused = None;
        for (target, token, after) in admissions {
            let slot = match self.inner.pool.admit(target.id).await {
                Ok(slot) => slot,
                Err(err) => {
                    run_token.cancel();
                    refused = Some(err);
                    break;
                }
            };
            let done = signals.remove(&target.id);
            let this = self.clone();
            let span = tracing::info_span!("target", library = %target.library);
            tasks.spawn(
                async move {
                    let phase = this.run_target(&target, &token, after).await;
                    if let Some(done) = done {
                        done.send_replace(Some(phase));
                    }
                    this.inner.pool.release(slot);
                }
                .instrument(span),
            );
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                tracing::error!("Target workflow task aborted: {}", err);
            }
        }
        if let Some(err) = refused {
            return Err(err.into());
        }

        let report = RunReport {
            started_at,
            finished_at: Utc::now(),
            outcomes: order.iter().filter_map(|id| self.outcome(*id)).collect(),
            up_to_date,
            trace_events: self.inner.trace.len(),
        };
        tracing::info!(
            "Run finished: {} completed, {} failed, {} up to date",
            report.completed().len(),
            report.failed().len(),
            report.up_to_date.len()
        );
        Ok(report)
    }

    /// Ask the analyzer for targets and merge them into the registry
    ///
    /// # Errors
    /// `Discovery` (registry unchanged) or `TraceWrite`.
    pub async fn discover(&self, snapshot: &ProjectSnapshot) -> Result<Vec<MigrationTarget>, PilotError> {
        self.discover_with(snapshot, &CancellationToken::new()).await
    }

    async fn discover_with(
        &self,
        snapshot: &ProjectSnapshot,
        token: &CancellationToken,
    ) -> Result<Vec<MigrationTarget>, PilotError> {
        let limit = self.inner.config.collaborator_timeout();
        let analyzer = &self.inner.collaborators.analyzer;

        let found = match call(token, limit, analyzer.analyze(snapshot, snapshot.depth)).await {
            Call::Done(found) => Ok(found),
            Call::Failed(CollaboratorError::Malformed(msg)) => Err(DiscoveryError::Malformed(msg)),
            Call::Failed(err) => Err(DiscoveryError::Unreachable(err.to_string())),
            Call::TimedOut => Err(DiscoveryError::Timeout {
                after_ms: self.inner.config.collaborator_timeout_ms,
            }),
            Call::Cancelled => Err(DiscoveryError::Cancelled),
        };
        let merged = found.and_then(|found| self.inner.registry.merge(found));

        match merged {
            Ok(targets) => {
                let libraries: Vec<&str> = targets.iter().map(|t| t.library.as_str()).collect();
                self.inner.trace.record(
                    TraceDraft::new(Agent::DiscoveryAgent.as_str(), TraceKind::Action)
                        .input(format!("{} ({})", snapshot.root.display(), snapshot.depth.label()))
                        .output(format!("Found {} migration targets", targets.len()))
                        .state(json!({ "libraries": libraries })),
                )?;
                Ok(targets)
            }
            Err(err) => {
                tracing::warn!("Discovery failed: {}", err);
                self.trace_run_error(Agent::DiscoveryAgent, &err.to_string())?;
                Err(err.into())
            }
        }
    }

    async fn run_target(
        &self,
        target: &MigrationTarget,
        token: &CancellationToken,
        after: Vec<Predecessor>,
    ) -> Phase {
        self.inner.errors.remove(&target.id);
        let result = match self.await_predecessors(target, token, after).await {
            Ok(()) => self.drive(target, token).await,
            Err(err) => Err(err),
        };
        let phase = match result {
            Ok(()) => {
                tracing::info!("Migration of {} completed", target.label());
                Phase::Completed
            }
            Err(err) => self.conclude_failure(target, &err),
        };
        metrics::counter!("pilot_targets_finished_total", "phase" => phase.as_str()).increment(1);
        phase
    }

    /// Hold `target` until every `after` predecessor has finished
    ///
    /// Nothing is traced for the target before its predecessors finish.
    async fn await_predecessors(
        &self,
        target: &MigrationTarget,
        token: &CancellationToken,
        after: Vec<Predecessor>,
    ) -> Result<(), PilotError> {
        if after.is_empty() {
            return Ok(());
        }
        let mut finished = Vec::with_capacity(after.len());
        for (predecessor, mut signal) in after {
            let phase = tokio::select! {
                biased;
                () = token.cancelled() => return Err(PilotError::Cancelled(target.id)),
                phase = finished_phase(&mut signal) => phase,
            };
            if phase != Phase::Completed {
                return Err(PlanningError::PredecessorUnfinished {
                    target: target.id,
                    library: target.library.clone(),
                    predecessor,
                    phase,
                }
                .into());
            }
            finished.push(predecessor);
        }
        self.trace(
            draft(target, Agent::PipelineController, TraceKind::Action)
                .input(target.label())
                .output(format!("Predecessors completed: {}", finished.join(", "))),
        )?;
        Ok(())
    }

    async fn drive(&self, target: &MigrationTarget, token: &CancellationToken) -> Result<(), PilotError> {
        let inner = &self.inner;

        checkpoint(target, token)?;
        self.advance(target, Phase::Discovering, "workflow started")?;
        self.trace(
            draft(target, Agent::DiscoveryAgent, TraceKind::Action)
                .input(target.label())
                .output(format!("Confidence {:.2}, enabled", target.confidence)),
        )?;

        checkpoint(target, token)?;
        self.advance(target, Phase::Retrieving, "retrieving migration knowledge")?;
        let knowledge = self.retrieve(target, token).await?;

        checkpoint(target, token)?;
        self.advance(target, Phase::Planning, "planning migration steps")?;
        let steps = inner.plans.insert(target.id, inner.planner.plan_target(target, &knowledge))?;
        if knowledge.is_empty() {
            self.trace(
                draft(target, Agent::PlanningAgent, TraceKind::Action)
                    .input(target.label())
                    .output("Manual review required: no usable migration knowledge"),
            )?;
            return Err(PlanningError::MissingKnowledge {
                target: target.id,
                library: target.library.clone(),
            }
            .into());
        }
        self.trace(
            draft(target, Agent::PlanningAgent, TraceKind::Action)
                .input(format!("{} rules", knowledge.rules().len()))
                .output(format!("Generated {}-step plan", steps.len()))
                .state(json!({ "steps": steps.iter().map(|s| &s.description).collect::<Vec<_>>() })),
        )?;

        for step in steps {
            if let Err(err) = self.run_step(target, step.id, &knowledge, token).await {
                if let Err(store) = inner.plans.transition(target.id, step.id, StepStatus::Failed) {
                    tracing::debug!("Step {} left as is: {}", step.ordinal, store);
                }
                return Err(err);
            }
        }

        self.advance(target, Phase::Completed, "all steps verified")?;
        self.trace(
            draft(target, Agent::PipelineController, TraceKind::Terminal)
                .input(target.label())
                .output(Phase::Completed.as_str()),
        )?;
        Ok(())
    }

    async fn run_step(
        &self,
        target: &MigrationTarget,
        step: StepId,
        knowledge: &Arc<KnowledgeContext>,
        token: &CancellationToken,
    ) -> Result<(), PilotError> {
        checkpoint(target, token)?;
        let step = self.inner.plans.transition(target.id, step, StepStatus::InProgress)?;
        self.advance(target, Phase::Patching, format!("step {}: {}", step.ordinal, step.description))?;

        let outcome = self.patch_and_verify(target, &step, knowledge, None, 0, token).await?;
        if let VerificationOutcome::Fail(failure) = outcome {
            self.advance(target, Phase::Reflecting, failure.to_string())?;
            let stage = WorkflowStage {
                controller: self,
                target,
                knowledge,
                token,
            };
            self.inner
                .reflection
                .resolve(target, &step, failure, knowledge, &stage)
                .await?;
        }

        self.inner.plans.transition(target.id, step.id, StepStatus::Complete)?;
        Ok(())
    }

    async fn retrieve(
        &self,
        target: &MigrationTarget,
        token: &CancellationToken,
    ) -> Result<Arc<KnowledgeContext>, PilotError> {
        let inner = &self.inner;
        let key = cache_key(target);

        if let Some(context) = inner.knowledge_cache.get(&key).await {
            inner.knowledge.insert(target.id, context.clone());
            self.trace(
                draft(target, Agent::RetrievalAgent, TraceKind::Action)
                    .input(key)
                    .output(format!("Reused {} cached rules", context.rules().len())),
            )?;
            return Ok(context);
        }

        let request = RetrievalRequest {
            target_id: target.id,
            library: target.library.clone(),
            current_version: target.current_version.clone(),
            target_version: target.target_version.clone(),
            queries: search_queries(&target.library, &target.current_version, &target.target_version),
        };
        let limit = inner.config.collaborator_timeout();

        let failure = match call(token, limit, inner.collaborators.retriever.retrieve(&request)).await {
            Call::Done(items) => match KnowledgeContext::build(&target.library, items, inner.config.min_relevance) {
                Ok(context) => Ok(context),
                Err(err) => Err(format!("malformed knowledge: {err}")),
            },
            Call::Failed(err) => Err(format!("retrieval failed: {err}")),
            Call::TimedOut => Err(format!(
                "retrieval timed out after {}ms",
                inner.config.collaborator_timeout_ms
            )),
            Call::Cancelled => return Err(PilotError::Cancelled(target.id)),
        };
        let context = match failure {
            Ok(context) => Arc::new(context),
            Err(msg) => {
                tracing::warn!("{}: {}", target.library, msg);
                self.trace(draft(target, Agent::RetrievalAgent, TraceKind::Error).output(msg))?;
                Arc::new(KnowledgeContext::empty(target.library.clone()))
            }
        };

        if !context.is_empty() {
            inner.knowledge_cache.insert(key, context.clone()).await;
        }
        inner.knowledge.insert(target.id, context.clone());
        self.trace(
            draft(target, Agent::RetrievalAgent, TraceKind::Action)
                .input(request.queries.join("; "))
                .output(format!(
                    "Retrieved {} items, {} rules",
                    context.items().len(),
                    context.rules().len()
                )),
        )?;
        Ok(context)
    }

    /// Patch one step, then verify it
    ///
    /// Patch and runner failures come back as a failed outcome so they feed
    /// reflection like any failing check.
    async fn patch_and_verify(
        &self,
        target: &MigrationTarget,
        step: &PlanStep,
        knowledge: &Arc<KnowledgeContext>,
        prior_fix: Option<&str>,
        attempt: u32,
        token: &CancellationToken,
    ) -> Result<VerificationOutcome, PilotError> {
        let inner = &self.inner;
        let limit = inner.config.collaborator_timeout();
        let timeout_msg = |who: &str| format!("{who} timed out after {}ms", inner.config.collaborator_timeout_ms);

        let request = PatchRequest {
            target_id: target.id,
            library: target.library.clone(),
            target_version: target.target_version.clone(),
            step: step.clone(),
            knowledge: knowledge.clone(),
            prior_fix: prior_fix.map(str::to_string),
            attempt,
        };
        let diffs = match call(token, limit, inner.collaborators.patcher.patch(&request)).await {
            Call::Done(diffs) => diffs,
            Call::Failed(err) => {
                return self.stage_failure(target, step, Agent::CodingAgent, err.to_string(), FailureSource::PatchRejected)
            }
            Call::TimedOut => {
                return self.stage_failure(
                    target,
                    step,
                    Agent::CodingAgent,
                    timeout_msg("patch engine"),
                    FailureSource::Timeout,
                )
            }
            Call::Cancelled => return Err(PilotError::Cancelled(target.id)),
        };

        let files: Vec<String> = diffs.iter().map(|d| d.path.clone()).collect();
        self.trace(
            draft(target, Agent::CodingAgent, TraceKind::Action)
                .input(step.description.clone())
                .output(format!("Modified {} files", files.len()))
                .state(json!({ "files": files, "attempt": attempt })),
        )?;
        self.advance(target, Phase::Verifying, format!("step {}", step.ordinal))?;

        let run = RunRequest {
            target_id: target.id,
            step_id: step.id,
            files,
            selectors: self.selectors(target, step),
        };
        let results = match call(token, limit, inner.collaborators.runner.run(&run)).await {
            Call::Done(results) => results,
            Call::Failed(err) => {
                return self.stage_failure(
                    target,
                    step,
                    Agent::VerificationAgent,
                    err.to_string(),
                    FailureSource::RunnerError,
                )
            }
            Call::TimedOut => {
                return self.stage_failure(
                    target,
                    step,
                    Agent::VerificationAgent,
                    timeout_msg("test runner"),
                    FailureSource::Timeout,
                )
            }
            Call::Cancelled => return Err(PilotError::Cancelled(target.id)),
        };

        let outcome = inner.gate.evaluate(step, &results);
        self.trace(
            draft(target, Agent::VerificationAgent, TraceKind::Action)
                .input(format!("{} checks for step {}", results.len(), step.ordinal))
                .output(outcome.label())
                .state(json!({ "checks": results })),
        )?;
        if let VerificationOutcome::Fail(failure) = &outcome {
            self.trace(draft(target, Agent::VerificationAgent, TraceKind::Error).output(failure.to_string()))?;
        }
        Ok(outcome)
    }

    fn stage_failure(
        &self,
        target: &MigrationTarget,
        step: &PlanStep,
        agent: Agent,
        error: String,
        origin: FailureSource,
    ) -> Result<VerificationOutcome, PilotError> {
        if self.inner.registry.phase(target.id)? == Phase::Patching {
            self.advance(target, Phase::Verifying, "patch failed")?;
        }
        let stage = match origin {
            FailureSource::PatchRejected => "patch-application",
            FailureSource::Timeout if agent == Agent::CodingAgent => "patch-application",
            _ => "test-runner",
        };
        let failure = self.inner.gate.record_failure(step, stage, error, origin);
        tracing::warn!("{} step {}: {}", target.library, step.ordinal, failure);
        self.trace(draft(target, agent, TraceKind::Error).output(failure.to_string()))?;
        Ok(VerificationOutcome::Fail(failure))
    }

    /// Selectors passed to the test runner for a step
    fn selectors(&self, target: &MigrationTarget, step: &PlanStep) -> Vec<String> {
        let mut selectors = vec![
            format!("target:{}", target.library),
            format!("step:{}#{}", target.library, step.ordinal),
        ];
        selectors.extend(step.supporting_rules.iter().map(|r| format!("rule:{r}")));
        selectors.extend(self.inner.config.check_selectors.iter().cloned());
        selectors
    }

    /// Move `target` to `to`, tracing the transition before committing it
    fn advance(&self, target: &MigrationTarget, to: Phase, note: impl Into<String>) -> Result<(), PilotError> {
        let from = self.inner.registry.check_transition(target.id, to)?;
        self.trace(
            draft(target, Agent::PipelineController, TraceKind::Transition)
                .input(from.as_str())
                .output(to.as_str())
                .state(json!({ "note": note.into() })),
        )?;
        self.inner.registry.transition(target.id, to)?;
        tracing::debug!(library = %target.library, %from, %to, "phase transition");
        Ok(())
    }

    /// Return a finished target to `Idle`, tracing the rerun before committing it
    ///
    /// The target's reflection budget starts afresh; earlier attempts and
    /// plan steps stay queryable.
    fn reopen(&self, target: &MigrationTarget, note: impl Into<String>) -> Result<(), PilotError> {
        let from = self.inner.registry.check_reopen(target.id)?;
        self.trace(
            draft(target, Agent::PipelineController, TraceKind::Transition)
                .input(from.as_str())
                .output(Phase::Idle.as_str())
                .state(json!({ "note": note.into(), "rerun": true })),
        )?;
        self.inner.registry.reopen(target.id)?;
        self.inner.reflection.reset_budget(target.id);
        tracing::info!(library = %target.library, %from, "target reopened for rerun");
        Ok(())
    }

    fn trace(&self, draft: TraceDraft) -> Result<TraceEvent, PilotError> {
        Ok(self.inner.trace.record(draft)?)
    }

    fn trace_run_error(&self, agent: Agent, message: &str) -> Result<(), PilotError> {
        self.trace(TraceDraft::new(agent.as_str(), TraceKind::Error).output(message))?;
        Ok(())
    }

    /// End a target after an error and return its final phase
    fn conclude_failure(&self, target: &MigrationTarget, err: &PilotError) -> Phase {
        let to = if err.is_cancelled() {
            Phase::Cancelled
        } else {
            Phase::Failed
        };
        if err.is_cancelled() {
            tracing::info!("Migration of {} cancelled", target.label());
        } else {
            tracing::error!("Migration of {} failed: {}", target.label(), err);
        }
        self.inner.errors.insert(target.id, err.to_string());

        let traced = match err {
            PilotError::TraceWrite(_) => Err(()),
            _ => self.trace_failure(target, to, err).map_err(|trace_err| {
                tracing::error!("Could not trace end of {}: {}", target.library, trace_err);
            }),
        };
        if traced.is_err() {
            self.inner.registry.force_terminal(target.id, to);
        }
        self.inner.registry.phase(target.id).unwrap_or(to)
    }

    fn trace_failure(&self, target: &MigrationTarget, to: Phase, err: &PilotError) -> Result<(), PilotError> {
        if !err.is_cancelled() {
            self.trace(draft(target, Agent::PipelineController, TraceKind::Error).output(err.to_string()))?;
        }
        self.advance(target, to, err.to_string())?;
        self.trace(
            draft(target, Agent::PipelineController, TraceKind::Terminal)
                .input(target.label())
                .output(to.as_str())
                .state(json!({ "error": err.to_string() })),
        )?;
        Ok(())
    }

    fn outcome(&self, id: TargetId) -> Option<TargetOutcome> {
        let target = self.inner.registry.get(id)?;
        let steps = self.inner.plans.steps(id);
        Some(TargetOutcome {
            target_id: id,
            library: target.library,
            phase: target.phase,
            steps_total: steps.len(),
            steps_completed: steps.iter().filter(|s| s.status == StepStatus::Complete).count(),
            attempts: self.inner.reflection.attempts(id).len(),
            error: self.inner.errors.get(&id).map(|e| e.clone()),
        })
    }

    /// Operator override of a target's `enabled` flag
    ///
    /// # Errors
    /// `Store` for unknown ids, `TraceWrite` if the toggle cannot be traced.
    pub fn set_enabled(&self, id: TargetId, enabled: bool) -> Result<MigrationTarget, PilotError> {
        let target = self.inner.registry.set_enabled(id, enabled)?;
        self.trace(
            draft(&target, Agent::Operator, TraceKind::Action)
                .input("toggle enabled")
                .output(if enabled { "enabled" } else { "disabled" }),
        )?;
        Ok(target)
    }

    /// Cancel one target's workflow; false if it is not running
    pub fn cancel(&self, id: TargetId) -> bool {
        self.inner.pool.cancel(id)
    }

    /// Cancel every workflow of the current run
    pub fn cancel_all(&self) {
        self.inner.pool.cancel_all();
    }

    /// Preview the plan for the current targets and retrieved knowledge
    ///
    /// Nothing is stored.
    ///
    /// # Errors
    /// `NoEnabledTargets` or `CyclicPriority`.
    pub fn generate_plan(&self) -> Result<Plan, PlanningError> {
        let knowledge: HashMap<TargetId, Arc<KnowledgeContext>> = self
            .inner
            .knowledge
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        self.inner.planner.generate_plan(&self.inner.registry.list(), &knowledge)
    }

    /// Every known target, in discovery order
    #[must_use]
    pub fn targets(&self) -> Vec<MigrationTarget> {
        self.inner.registry.list()
    }

    #[must_use]
    pub fn target(&self, id: TargetId) -> Option<MigrationTarget> {
        self.inner.registry.get(id)
    }

    #[must_use]
    pub fn target_by_library(&self, library: &str) -> Option<MigrationTarget> {
        self.inner.registry.by_library(library)
    }

    /// Current plan steps of a target, by ordinal
    #[must_use]
    pub fn steps(&self, id: TargetId) -> Vec<PlanStep> {
        self.inner.plans.steps(id)
    }

    /// Every generation of a target's plan steps, oldest first
    #[must_use]
    pub fn step_history(&self, id: TargetId) -> Vec<PlanStep> {
        self.inner.plans.history(id)
    }

    #[must_use]
    pub fn step(&self, id: StepId) -> Option<PlanStep> {
        self.inner.plans.step(id)
    }

    /// Every stored step, grouped by target in plan order
    #[must_use]
    pub fn plan(&self) -> Vec<PlanStep> {
        self.inner.plans.all()
    }

    /// Verification checks of a target, optionally one step only
    #[must_use]
    pub fn checks(&self, id: TargetId, step: Option<StepId>) -> Vec<VerificationCheck> {
        self.inner.gate.checks(id, step)
    }

    /// Reflection attempts of a target, oldest first
    #[must_use]
    pub fn attempts(&self, id: TargetId) -> Vec<ReflectionAttempt> {
        self.inner.reflection.attempts(id)
    }

    /// Trace events of one target, in sequence order
    #[must_use]
    pub fn trace_for(&self, id: TargetId) -> Vec<TraceEvent> {
        self.inner
            .trace
            .query(TraceFilter::default().target(id.to_string()))
            .iter()
            .collect()
    }

    /// The shared trace
    #[inline]
    #[must_use]
    pub fn trace_log(&self) -> &TraceRecorder {
        &self.inner.trace
    }

    /// Knowledge retrieved for a target
    #[must_use]
    pub fn knowledge(&self, id: TargetId) -> Option<Arc<KnowledgeContext>> {
        self.inner.knowledge.get(&id).map(|k| k.clone())
    }

    /// Last error that ended a target's workflow
    #[must_use]
    pub fn error(&self, id: TargetId) -> Option<String> {
        self.inner.errors.get(&id).map(|e| e.clone())
    }

    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &PilotConfig {
        &self.inner.config
    }
}

/// Re-runs patching and verification for the reflection loop
struct WorkflowStage<'a> {
    controller: &'a PipelineController,
    target: &'a MigrationTarget,
    knowledge: &'a Arc<KnowledgeContext>,
    token: &'a CancellationToken,
}

#[async_trait]
impl RetryStage for WorkflowStage<'_> {
    async fn retry(&self, step: &PlanStep, fix: &str, attempt: u32) -> Result<VerificationOutcome, PilotError> {
        checkpoint(self.target, self.token)?;
        self.controller
            .advance(self.target, Phase::Patching, format!("reflection attempt {attempt}"))?;
        let outcome = self
            .controller
            .patch_and_verify(self.target, step, self.knowledge, Some(fix), attempt, self.token)
            .await?;
        if let VerificationOutcome::Fail(failure) = &outcome {
            self.controller
                .advance(self.target, Phase::Reflecting, failure.to_string())?;
        }
        Ok(outcome)
    }

    fn attempted(&self, attempt: &ReflectionAttempt) -> Result<(), PilotError> {
        let state = serde_json::to_value(attempt).map_err(TraceError::Serialize)?;
        self.controller.trace(
            draft(self.target, Agent::ReflectionAgent, TraceKind::ReflectionAttempt)
                .input(attempt.diagnosis.clone())
                .output(attempt.fix.clone())
                .state(state),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{
        CheckResult, DiscoveredTarget, FileDiff, MockAnalyzer, MockKnowledgeRetriever, MockPatchEngine,
        MockTestRunner,
    };
    use crate::snapshot::AnalysisDepth;
    use pilot_knowledge::{Evidence, KnowledgeItem};

    fn snapshot() -> ProjectSnapshot {
        ProjectSnapshot::new("/srv/app", AnalysisDepth::QuickScan)
    }

    fn analyzer(found: Vec<DiscoveredTarget>) -> MockAnalyzer {
        let mut analyzer = MockAnalyzer::new();
        analyzer.expect_analyze().returning(move |_, _| Ok(found.clone()));
        analyzer
    }

    fn retriever() -> MockKnowledgeRetriever {
        let mut retriever = MockKnowledgeRetriever::new();
        retriever.expect_retrieve().returning(|request| {
            Ok(vec![KnowledgeItem::Doc(Evidence::new(
                format!("{} renamed connect() to open().", request.library),
                format!("docs.example.com/{}", request.library),
                0.9,
            ))])
        });
        retriever
    }

    fn patcher() -> MockPatchEngine {
        let mut patcher = MockPatchEngine::new();
        patcher.expect_patch().returning(|request| {
            Ok(vec![FileDiff {
                path: format!("src/{}.py", request.library),
                old_text: "connect()".to_string(),
                new_text: "open()".to_string(),
            }])
        });
        patcher
    }

    fn runner(results: Vec<CheckResult>) -> MockTestRunner {
        let mut runner = MockTestRunner::new();
        runner.expect_run().returning(move |_| Ok(results.clone()));
        runner
    }

    fn controller(analyzer: MockAnalyzer, runner: MockTestRunner) -> PipelineController {
        let collaborators = Collaborators::new(
            Arc::new(analyzer),
            Arc::new(retriever()),
            Arc::new(patcher()),
            Arc::new(runner),
        );
        PipelineController::new(PilotConfig::default(), collaborators).unwrap()
    }

    #[test]
    fn invalid_config_is_rejected() {
        let collaborators = Collaborators::new(
            Arc::new(MockAnalyzer::new()),
            Arc::new(MockKnowledgeRetriever::new()),
            Arc::new(MockPatchEngine::new()),
            Arc::new(MockTestRunner::new()),
        );
        let config = PilotConfig::default().with_max_attempts(0);
        assert!(PipelineController::new(config, collaborators).is_err());
    }

    #[tokio::test]
    async fn passing_target_completes() {
        let controller = controller(
            analyzer(vec![DiscoveredTarget::new("database-connector", "v4.1.0", "v5.0.0", 0.85)]),
            runner(vec![CheckResult::pass("Connection Pool", "tests/test_db.py")]),
        );

        let report = controller.run(&snapshot()).await.unwrap();
        let outcome = report.outcome("database-connector").unwrap();
        assert_eq!(outcome.phase, Phase::Completed);
        assert_eq!(outcome.steps_completed, outcome.steps_total);
        assert_eq!(outcome.attempts, 0);
        assert!(controller.trace_log().verify_integrity().is_ok());
    }

    #[tokio::test]
    async fn malformed_analyzer_output_leaves_registry_unchanged() {
        let mut analyzer = MockAnalyzer::new();
        analyzer
            .expect_analyze()
            .returning(|_, _| Err(CollaboratorError::Malformed("not json".to_string())));
        let controller = controller(analyzer, runner(Vec::new()));

        let err = controller.discover(&snapshot()).await.unwrap_err();
        assert!(matches!(err, PilotError::Discovery(DiscoveryError::Malformed(_))));
        assert!(controller.targets().is_empty());

        let errors = controller
            .trace_log()
            .query(TraceFilter::default().kind(TraceKind::Error))
            .iter()
            .count();
        assert_eq!(errors, 1);
    }

    #[tokio::test]
    async fn nothing_enabled_is_surfaced() {
        let controller = controller(
            analyzer(vec![DiscoveredTarget::new("ui-components", "v0.9.8", "v1.0.0", 0.62)]),
            runner(Vec::new()),
        );
        let err = controller.run(&snapshot()).await.unwrap_err();
        assert!(matches!(err, PilotError::Planning(PlanningError::NoEnabledTargets)));
        assert_eq!(controller.targets()[0].phase, Phase::Idle);
    }

    #[tokio::test]
    async fn operator_toggle_is_traced_and_runs_target() {
        let controller = controller(
            analyzer(vec![DiscoveredTarget::new("ui-components", "v0.9.8", "v1.0.0", 0.62)]),
            runner(vec![CheckResult::pass("Render", "tests/test_ui.py")]),
        );
        let ui = controller.discover(&snapshot()).await.unwrap()[0].id;
        controller.set_enabled(ui, true).unwrap();

        let report = controller.run(&snapshot()).await.unwrap();
        assert!(report.is_success());
        assert!(controller
            .trace_for(ui)
            .iter()
            .any(|e| e.agent == Agent::Operator.as_str()));
    }

    #[tokio::test]
    async fn skipped_checks_still_complete_the_step() {
        let controller = controller(
            analyzer(vec![DiscoveredTarget::new("database-connector", "v4.1.0", "v5.0.0", 0.85)]),
            runner(Vec::new()),
        );
        let report = controller.run(&snapshot()).await.unwrap();
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn plan_preview_uses_retrieved_knowledge() {
        let controller = controller(
            analyzer(vec![DiscoveredTarget::new("database-connector", "v4.1.0", "v5.0.0", 0.85)]),
            runner(Vec::new()),
        );
        controller.run(&snapshot()).await.unwrap();

        let plan = controller.generate_plan().unwrap();
        assert!(plan.blocked.is_empty());
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].supporting_rules[0].as_str(), "RULE-DATABASE-01");
    }

    #[tokio::test]
    async fn version_change_reopens_completed_target() {
        let mut analyzer = MockAnalyzer::new();
        let mut seq = mockall::Sequence::new();
        analyzer
            .expect_analyze()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(vec![DiscoveredTarget::new("database-connector", "v4.1.0", "v5.0.0", 0.85)]));
        analyzer
            .expect_analyze()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(vec![DiscoveredTarget::new("database-connector", "v4.1.0", "v6.0.0", 0.85)]));
        let controller = controller(analyzer, runner(Vec::new()));

        controller.run(&snapshot()).await.unwrap();
        let report = controller.run(&snapshot()).await.unwrap();

        let outcome = report.outcome("database-connector").unwrap();
        assert_eq!(outcome.phase, Phase::Completed);
        assert!(report.up_to_date.is_empty());

        let target = controller.target(outcome.target_id).unwrap();
        assert_eq!(target.target_version, "v6.0.0");
        assert!(!target.outdated);
        let reopened: Vec<TraceEvent> = controller
            .trace_for(target.id)
            .into_iter()
            .filter(|e| e.kind == TraceKind::Transition && e.output == "idle")
            .collect();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened[0].input, "completed");
        assert_eq!(reopened[0].state["note"], "rerun: versions changed");
    }

    #[tokio::test]
    async fn cancel_unknown_target_is_a_no_op() {
        let controller = controller(analyzer(Vec::new()), runner(Vec::new()));
        assert!(!controller.cancel(TargetId::new()));
        controller.cancel_all();
    }
}
