//! Migration planning
//!
//! The planner turns enabled targets and their knowledge into ordered plan
//! steps. Targets are ordered by the configured priority rule (explicit
//! `after` edges, then concern rank, then library name); steps within a
//! target follow the compiled rules in citation order. The store keeps the
//! steps per target and guards their status transitions; replanning a target
//! supersedes its earlier steps without forgetting them.

use crate::config::PriorityRule;
use crate::error::{PlanningError, StoreError};
use crate::types::{MigrationTarget, PlanStep, StepId, StepStatus, TargetId};
use dashmap::DashMap;
use parking_lot::RwLock;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use pilot_knowledge::{KnowledgeContext, Priority};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

/// Output of [`Planner::generate_plan`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    /// Target ids in execution priority order
    pub order: Vec<TargetId>,
    /// Steps grouped by target, in `order`
    pub steps: Vec<PlanStep>,
    /// Targets whose plan degenerated to manual review
    pub blocked: Vec<PlanningError>,
}

impl Plan {
    /// Steps of one target
    #[must_use]
    pub fn steps_for(&self, target: TargetId) -> Vec<&PlanStep> {
        self.steps.iter().filter(|s| s.target_id == target).collect()
    }
}

/// Stateless step generator
#[derive(Debug, Clone, Default)]
pub struct Planner {
    priority: PriorityRule,
}

impl Planner {
    /// Create planner with a priority rule
    #[inline]
    #[must_use]
    pub fn new(priority: PriorityRule) -> Self {
        Self { priority }
    }

    /// Plan every enabled target
    ///
    /// Deterministic for identical inputs apart from freshly minted step ids.
    ///
    /// # Errors
    /// `NoEnabledTargets` if nothing is enabled, `CyclicPriority` if the
    /// priority rule cannot be satisfied.
    pub fn generate_plan(
        &self,
        targets: &[MigrationTarget],
        knowledge: &HashMap<TargetId, Arc<KnowledgeContext>>,
    ) -> Result<Plan, PlanningError> {
        let enabled: Vec<MigrationTarget> = targets
            .iter()
            .filter(|t| t.enabled && !t.superseded)
            .cloned()
            .collect();
        if enabled.is_empty() {
            return Err(PlanningError::NoEnabledTargets);
        }

        let ordered = self.order_targets(&enabled)?;
        let mut plan = Plan::default();
        for target in &ordered {
            let context = knowledge
                .get(&target.id)
                .cloned()
                .unwrap_or_else(|| Arc::new(KnowledgeContext::empty(target.library.clone())));
            if context.is_empty() {
                plan.blocked.push(PlanningError::MissingKnowledge {
                    target: target.id,
                    library: target.library.clone(),
                });
            }
            plan.order.push(target.id);
            plan.steps.extend(self.plan_target(target, &context));
        }
        Ok(plan)
    }

    /// Steps for one target
    ///
    /// Without usable knowledge the plan is a single manual-review step
    /// flagged low-confidence.
    #[must_use]
    pub fn plan_target(&self, target: &MigrationTarget, knowledge: &KnowledgeContext) -> Vec<PlanStep> {
        if knowledge.is_empty() {
            return vec![PlanStep {
                id: StepId::new(),
                target_id: target.id,
                ordinal: 1,
                description: format!(
                    "Manual review: no usable migration knowledge for {}",
                    target.label()
                ),
                status: StepStatus::Pending,
                supporting_rules: Vec::new(),
                priority: None,
                manual_review: true,
                low_confidence: true,
                generation: 1,
            }];
        }

        knowledge
            .rules()
            .iter()
            .enumerate()
            .map(|(i, rule)| PlanStep {
                id: StepId::new(),
                target_id: target.id,
                ordinal: i + 1,
                description: rule.text.clone(),
                status: StepStatus::Pending,
                supporting_rules: rule.all_ids(),
                priority: Some(rule.priority),
                manual_review: false,
                low_confidence: rule.priority == Priority::Low,
                generation: 1,
            })
            .collect()
    }

    /// Predecessors each target must wait for under the `after` edges
    ///
    /// Only edges between members of `targets` count; targets without
    /// predecessors are left out.
    #[must_use]
    pub fn predecessors(&self, targets: &[MigrationTarget]) -> HashMap<TargetId, Vec<TargetId>> {
        let index: HashMap<String, TargetId> = targets.iter().map(|t| (t.library.to_lowercase(), t.id)).collect();
        let mut waits: HashMap<TargetId, Vec<TargetId>> = HashMap::new();
        for constraint in &self.priority.after {
            let later = index.get(&constraint.target.to_lowercase());
            let earlier = index.get(&constraint.after.to_lowercase());
            if let (Some(&later), Some(&earlier)) = (later, earlier) {
                let list = waits.entry(later).or_default();
                if later != earlier && !list.contains(&earlier) {
                    list.push(earlier);
                }
            }
        }
        waits.retain(|_, list| !list.is_empty());
        waits
    }

    /// Order targets by the priority rule
    ///
    /// # Errors
    /// `CyclicPriority` naming the libraries on the cycle.
    pub fn order_targets(&self, targets: &[MigrationTarget]) -> Result<Vec<MigrationTarget>, PlanningError> {
        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let nodes: Vec<NodeIndex> = (0..targets.len()).map(|i| graph.add_node(i)).collect();
        let index: HashMap<String, usize> = targets
            .iter()
            .enumerate()
            .map(|(i, t)| (t.library.to_lowercase(), i))
            .collect();

        for constraint in &self.priority.after {
            let later = index.get(&constraint.target.to_lowercase());
            let earlier = index.get(&constraint.after.to_lowercase());
            if let (Some(&later), Some(&earlier)) = (later, earlier) {
                if later != earlier {
                    graph.update_edge(nodes[earlier], nodes[later], ());
                }
            }
        }

        if let Some(cycle) = tarjan_scc(&graph).into_iter().find(|scc| scc.len() > 1) {
            let mut names: Vec<String> = cycle.iter().map(|n| targets[graph[*n]].library.clone()).collect();
            names.sort();
            names.push(names[0].clone());
            return Err(PlanningError::CyclicPriority(names));
        }

        let key = |i: usize| {
            Reverse((
                self.priority.concern_rank(&targets[i].library),
                targets[i].library.to_lowercase(),
                targets[i].id,
                i,
            ))
        };

        let mut indegree: Vec<usize> = nodes
            .iter()
            .map(|n| graph.neighbors_directed(*n, Direction::Incoming).count())
            .collect();
        let mut ready: BinaryHeap<_> = (0..targets.len()).filter(|&i| indegree[i] == 0).map(key).collect();
        let mut ordered = Vec::with_capacity(targets.len());

        while let Some(Reverse((_, _, _, i))) = ready.pop() {
            ordered.push(targets[i].clone());
            for next in graph.neighbors_directed(nodes[i], Direction::Outgoing) {
                let j = graph[next];
                indegree[j] -= 1;
                if indegree[j] == 0 {
                    ready.push(key(j));
                }
            }
        }

        Ok(ordered)
    }
}

/// Plan steps per target
///
/// Only the latest generation of a target's steps is its plan; earlier
/// generations stay queryable by id.
#[derive(Debug, Default)]
pub struct PlanStore {
    steps: DashMap<TargetId, Vec<PlanStep>>,
    /// Replaced generations, oldest first
    superseded: DashMap<TargetId, Vec<PlanStep>>,
    order: RwLock<Vec<TargetId>>,
}

impl PlanStore {
    /// Create empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `steps` the target's plan, superseding the current one
    ///
    /// Returns the stored steps, stamped with their generation.
    ///
    /// # Errors
    /// `TargetActive` if a step of the current plan is in progress.
    pub fn insert(&self, target: TargetId, mut steps: Vec<PlanStep>) -> Result<Vec<PlanStep>, StoreError> {
        let mut entry = self.steps.entry(target).or_default();
        if entry.iter().any(|s| s.status == StepStatus::InProgress) {
            return Err(StoreError::TargetActive(target));
        }
        let generation = entry.first().map_or(0, |s| s.generation) + 1;
        for step in &mut steps {
            step.generation = generation;
        }
        let previous = std::mem::replace(&mut *entry, steps.clone());
        drop(entry);
        if !previous.is_empty() {
            tracing::debug!(%target, generation, superseded = previous.len(), "plan replaced");
            self.superseded.entry(target).or_default().extend(previous);
        }

        let mut order = self.order.write();
        if !order.contains(&target) {
            order.push(target);
        }
        Ok(steps)
    }

    /// Set target order for [`PlanStore::all`]
    pub fn set_order(&self, order: Vec<TargetId>) {
        *self.order.write() = order;
    }

    /// Steps of a target, by ordinal
    #[must_use]
    pub fn steps(&self, target: TargetId) -> Vec<PlanStep> {
        self.steps.get(&target).map(|s| s.clone()).unwrap_or_default()
    }

    /// Step by id, current or superseded
    #[must_use]
    pub fn step(&self, id: StepId) -> Option<PlanStep> {
        let find = |map: &DashMap<TargetId, Vec<PlanStep>>| {
            map.iter()
                .find_map(|entry| entry.value().iter().find(|s| s.id == id).cloned())
        };
        find(&self.steps).or_else(|| find(&self.superseded))
    }

    /// Every generation of a target's steps, oldest first
    #[must_use]
    pub fn history(&self, target: TargetId) -> Vec<PlanStep> {
        let mut history = self.superseded.get(&target).map(|s| s.clone()).unwrap_or_default();
        history.extend(self.steps(target));
        history
    }

    /// Every step, grouped by target in plan order
    #[must_use]
    pub fn all(&self) -> Vec<PlanStep> {
        let order = self.order.read().clone();
        let mut all = Vec::new();
        for target in &order {
            all.extend(self.steps(*target));
        }
        for entry in &self.steps {
            if !order.contains(entry.key()) {
                all.extend(entry.value().iter().cloned());
            }
        }
        all
    }

    /// Move a step forward
    ///
    /// # Errors
    /// `UnknownStep`, or `IllegalStepTransition` if the move would regress.
    pub fn transition(&self, target: TargetId, step: StepId, to: StepStatus) -> Result<PlanStep, StoreError> {
        let mut steps = self.steps.get_mut(&target).ok_or(StoreError::UnknownTarget(target))?;
        let entry = steps
            .iter_mut()
            .find(|s| s.id == step)
            .ok_or(StoreError::UnknownStep(step))?;
        if !entry.status.can_transition_to(to) {
            return Err(StoreError::IllegalStepTransition {
                step,
                from: entry.status,
                to,
            });
        }
        entry.status = to;
        Ok(entry.clone())
    }

    /// Every step of the target is complete
    #[must_use]
    pub fn is_complete(&self, target: TargetId) -> bool {
        self.steps
            .get(&target)
            .map_or(false, |s| !s.is_empty() && s.iter().all(|s| s.status == StepStatus::Complete))
    }
}
