//! Bounded pool of target workflows
//!
//! Admits at most `max_active` workflows at once and owns the cancellation
//! tokens: one token per run, one child token per target.

use crate::error::PoolError;
use crate::types::TargetId;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Workflows admitted since creation
    pub total_admitted: usize,
    /// Currently running workflows
    pub active_count: usize,
    /// Highest simultaneous workflow count observed
    pub peak_active: usize,
    /// Workflows that have released their slot
    pub finished: usize,
}

/// Admission ticket; the slot is freed when dropped
#[derive(Debug)]
pub struct WorkflowSlot {
    target: TargetId,
    _permit: OwnedSemaphorePermit,
}

impl WorkflowSlot {
    /// Target owning the slot
    #[inline]
    #[must_use]
    pub fn target(&self) -> TargetId {
        self.target
    }
}

/// Bounded workflow pool
#[derive(Debug)]
pub struct WorkflowPool {
    max_active: usize,
    semaphore: Arc<Semaphore>,
    run: Mutex<CancellationToken>,
    tokens: DashMap<TargetId, CancellationToken>,
    active: DashMap<TargetId, ()>,
    stats: Mutex<PoolStats>,
}

impl WorkflowPool {
    /// Create pool admitting `max_active` workflows at once
    #[must_use]
    pub fn new(max_active: usize) -> Self {
        Self {
            max_active,
            semaphore: Arc::new(Semaphore::new(max_active)),
            run: Mutex::new(CancellationToken::new()),
            tokens: DashMap::new(),
            active: DashMap::new(),
            stats: Mutex::new(PoolStats::default()),
        }
    }

    /// Start a new run and return its token
    pub fn begin_run(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.run.lock() = token.clone();
        token
    }

    /// Create the cancellation token of a target under the current run
    pub fn register(&self, target: TargetId) -> CancellationToken {
        let token = self.run.lock().child_token();
        self.tokens.insert(target, token.clone());
        token
    }

    /// Wait for a free slot
    ///
    /// # Errors
    /// `PoolError::Closed` if the pool was shut down.
    pub async fn admit(&self, target: TargetId) -> Result<WorkflowSlot, PoolError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        self.active.insert(target, ());

        let mut stats = self.stats.lock();
        stats.total_admitted += 1;
        stats.active_count = self.active.len();
        stats.peak_active = stats.peak_active.max(stats.active_count);
        drop(stats);

        tracing::debug!(%target, active = self.active.len(), "admitted workflow");
        Ok(WorkflowSlot {
            target,
            _permit: permit,
        })
    }

    /// Return a slot after the workflow ended
    pub fn release(&self, slot: WorkflowSlot) {
        self.active.remove(&slot.target);
        self.tokens.remove(&slot.target);
        let mut stats = self.stats.lock();
        stats.finished += 1;
        stats.active_count = self.active.len();
        drop(stats);
        drop(slot);
    }

    /// Cancel one target; false if it has no live workflow token
    pub fn cancel(&self, target: TargetId) -> bool {
        match self.tokens.get(&target) {
            Some(token) => {
                token.cancel();
                tracing::info!(%target, "cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Cancel the current run and every target in it
    pub fn cancel_all(&self) {
        self.run.lock().cancel();
        tracing::info!("cancellation of all targets requested");
    }

    /// Stop admitting workflows
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.stats.lock().clone()
    }

    /// Running workflow count
    #[inline]
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Configured bound
    #[inline]
    #[must_use]
    pub fn max_active(&self) -> usize {
        self.max_active
    }
}
