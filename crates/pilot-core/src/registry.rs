//! Target registry
//!
//! Holds every target ever discovered. Discovery merges analyzer findings
//! by library identity: ids are stable across runs, targets are never
//! deleted (missing ones are flagged superseded) and an operator override of
//! `enabled` survives re-discovery. Re-discovery never changes a phase: a
//! finished target only returns to `Idle` through [`TargetRegistry::reopen`].

use crate::collaborators::DiscoveredTarget;
use crate::error::{DiscoveryError, StoreError};
use crate::phase::{validate_reopen, validate_transition, IllegalTransition, Phase};
use crate::types::{MigrationTarget, TargetId};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// Store of migration targets
#[derive(Debug)]
pub struct TargetRegistry {
    targets: DashMap<TargetId, MigrationTarget>,
    /// Lower-cased library name to id
    libraries: DashMap<String, TargetId>,
    /// Discovery order, for stable listing
    order: Mutex<Vec<TargetId>>,
    enable_threshold: f64,
    runs: AtomicU64,
}

impl TargetRegistry {
    /// Create empty registry
    #[inline]
    #[must_use]
    pub fn new(enable_threshold: f64) -> Self {
        Self {
            targets: DashMap::new(),
            libraries: DashMap::new(),
            order: Mutex::new(Vec::new()),
            enable_threshold,
            runs: AtomicU64::new(0),
        }
    }

    /// Validate analyzer findings, then merge them in one commit
    ///
    /// Returns the merged targets in analyzer order. On error nothing is
    /// changed.
    ///
    /// # Errors
    /// `DiscoveryError::Malformed` naming the first bad finding.
    pub fn merge(&self, found: Vec<DiscoveredTarget>) -> Result<Vec<MigrationTarget>, DiscoveryError> {
        validate_findings(&found)?;

        // One commit at a time; concurrent readers see old or new state
        let mut order = self.order.lock();
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        let mut seen = HashSet::with_capacity(found.len());
        let mut merged = Vec::with_capacity(found.len());

        for finding in found {
            let key = finding.library.trim().to_lowercase();
            let id = match self.libraries.get(&key) {
                Some(id) => *id,
                None => {
                    let id = TargetId::new();
                    self.libraries.insert(key, id);
                    order.push(id);
                    id
                }
            };
            seen.insert(id);

            let target = self
                .targets
                .entry(id)
                .and_modify(|t| {
                    let current = finding.current_version.trim();
                    let wanted = finding.target_version.trim();
                    if t.phase.is_terminal() && (t.current_version != current || t.target_version != wanted) {
                        t.outdated = true;
                    }
                    t.current_version = current.to_string();
                    t.target_version = wanted.to_string();
                    t.confidence = finding.confidence;
                    if !t.enabled_override {
                        t.enabled = finding.confidence >= self.enable_threshold;
                    }
                    t.discovery_run = run;
                    t.superseded = false;
                })
                .or_insert_with(|| MigrationTarget {
                    id,
                    library: finding.library.trim().to_string(),
                    current_version: finding.current_version.trim().to_string(),
                    target_version: finding.target_version.trim().to_string(),
                    confidence: finding.confidence,
                    enabled: finding.confidence >= self.enable_threshold,
                    enabled_override: false,
                    phase: Phase::Idle,
                    discovery_run: run,
                    superseded: false,
                    outdated: false,
                })
                .clone();
            merged.push(target);
        }

        for mut entry in self.targets.iter_mut() {
            if !seen.contains(entry.key()) {
                entry.superseded = true;
            }
        }

        tracing::info!(run, targets = merged.len(), "merged discovery results");
        Ok(merged)
    }

    /// Operator override of `enabled`, regardless of confidence
    ///
    /// # Errors
    /// `StoreError::UnknownTarget`.
    pub fn set_enabled(&self, id: TargetId, enabled: bool) -> Result<MigrationTarget, StoreError> {
        let mut target = self.targets.get_mut(&id).ok_or(StoreError::UnknownTarget(id))?;
        target.enabled = enabled;
        target.enabled_override = true;
        tracing::info!(target = %target.library, enabled, "operator toggled target");
        Ok(target.clone())
    }

    /// Current phase of a target
    ///
    /// # Errors
    /// `StoreError::UnknownTarget`.
    pub fn phase(&self, id: TargetId) -> Result<Phase, StoreError> {
        self.targets
            .get(&id)
            .map(|t| t.phase)
            .ok_or(StoreError::UnknownTarget(id))
    }

    /// Check that `to` is reachable without changing anything
    ///
    /// # Errors
    /// `StoreError` for unknown ids, `IllegalTransition` otherwise.
    pub(crate) fn check_transition(&self, id: TargetId, to: Phase) -> Result<Phase, TransitionCheck> {
        let from = self.phase(id)?;
        validate_transition(from, to)?;
        Ok(from)
    }

    /// Move a target to `to`, returning the previous phase
    ///
    /// # Errors
    /// As [`TargetRegistry::check_transition`].
    pub(crate) fn transition(&self, id: TargetId, to: Phase) -> Result<Phase, TransitionCheck> {
        let mut target = self.targets.get_mut(&id).ok_or(StoreError::UnknownTarget(id))?;
        let from = target.phase;
        validate_transition(from, to)?;
        target.phase = to;
        Ok(from)
    }

    /// Check that a finished target may be reopened, returning its phase
    ///
    /// # Errors
    /// `StoreError` for unknown ids, `IllegalTransition` unless terminal.
    pub(crate) fn check_reopen(&self, id: TargetId) -> Result<Phase, TransitionCheck> {
        let from = self.phase(id)?;
        validate_reopen(from)?;
        Ok(from)
    }

    /// Return a finished target to `Idle` for another run
    ///
    /// # Errors
    /// As [`TargetRegistry::check_reopen`].
    pub(crate) fn reopen(&self, id: TargetId) -> Result<Phase, TransitionCheck> {
        let mut target = self.targets.get_mut(&id).ok_or(StoreError::UnknownTarget(id))?;
        let from = target.phase;
        validate_reopen(from)?;
        target.phase = Phase::Idle;
        target.outdated = false;
        Ok(from)
    }

    /// Force a terminal phase after the trace itself failed
    pub(crate) fn force_terminal(&self, id: TargetId, to: Phase) {
        if let Some(mut target) = self.targets.get_mut(&id) {
            if !target.phase.is_terminal() && to.is_terminal() {
                target.phase = to;
            }
        }
    }

    /// Target by id
    #[must_use]
    pub fn get(&self, id: TargetId) -> Option<MigrationTarget> {
        self.targets.get(&id).map(|t| t.clone())
    }

    /// Target by library name, case-insensitive
    #[must_use]
    pub fn by_library(&self, library: &str) -> Option<MigrationTarget> {
        let id = *self.libraries.get(&library.trim().to_lowercase())?;
        self.get(id)
    }

    /// Every target in discovery order
    #[must_use]
    pub fn list(&self) -> Vec<MigrationTarget> {
        self.order.lock().iter().filter_map(|id| self.get(*id)).collect()
    }

    /// Targets eligible for the next run
    #[must_use]
    pub fn runnable(&self) -> Vec<MigrationTarget> {
        self.list().into_iter().filter(MigrationTarget::is_runnable).collect()
    }

    /// Finished targets the next run should take up again
    #[must_use]
    pub fn needing_rerun(&self) -> Vec<MigrationTarget> {
        self.list().into_iter().filter(MigrationTarget::needs_rerun).collect()
    }

    /// Enabled, current targets regardless of phase
    #[must_use]
    pub fn enabled(&self) -> Vec<MigrationTarget> {
        self.list()
            .into_iter()
            .filter(|t| t.enabled && !t.superseded)
            .collect()
    }

    /// Number of known targets
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// No target known
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Completed discovery runs
    #[inline]
    #[must_use]
    pub fn discovery_runs(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }
}

/// Failure of a phase change request
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionCheck {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Illegal(#[from] IllegalTransition),
}

impl From<TransitionCheck> for crate::error::PilotError {
    fn from(err: TransitionCheck) -> Self {
        match err {
            TransitionCheck::Store(e) => e.into(),
            TransitionCheck::Illegal(e) => e.into(),
        }
    }
}

fn validate_findings(found: &[DiscoveredTarget]) -> Result<(), DiscoveryError> {
    let mut libraries = HashSet::with_capacity(found.len());
    for finding in found {
        let library = finding.library.trim();
        if library.is_empty() {
            return Err(DiscoveryError::Malformed("target with empty library name".to_string()));
        }
        if !finding.confidence.is_finite() || !(0.0..=1.0).contains(&finding.confidence) {
            return Err(DiscoveryError::Malformed(format!(
                "{library}: confidence {} outside [0, 1]",
                finding.confidence
            )));
        }
        for version in [&finding.current_version, &finding.target_version] {
            if !is_version(version) {
                return Err(DiscoveryError::Malformed(format!("{library}: invalid version {version:?}")));
            }
        }
        if !libraries.insert(library.to_lowercase()) {
            return Err(DiscoveryError::Malformed(format!("{library} reported twice")));
        }
    }
    Ok(())
}

/// Semantic version (`v2.0.0`) or version range (`1.x`, `^4.2`)
fn is_version(raw: &str) -> bool {
    let raw = raw.trim();
    if raw.is_empty() {
        return false;
    }
    let bare = raw.strip_prefix(['v', 'V']).unwrap_or(raw);
    semver::Version::parse(bare).is_ok() || semver::VersionReq::parse(bare).is_ok()
}
