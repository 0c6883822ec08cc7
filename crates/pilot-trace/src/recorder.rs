//! Append-only trace recorder and lazy queries

use crate::error::TraceError;
use crate::event::{TraceDraft, TraceEvent, TraceKind};
use crate::sink::TraceSink;
use parking_lot::RwLock;

#[derive(Debug, Default)]
struct LogState {
    events: Vec<TraceEvent>,
    next_seq: u64,
}

/// Globally ordered, append-only audit log
///
/// Sequence assignment, sink write and append happen under one write lock,
/// so storage order is sequence order.
pub struct TraceRecorder {
    state: RwLock<LogState>,
    sink: Option<Box<dyn TraceSink>>,
}

impl std::fmt::Debug for TraceRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceRecorder")
            .field("len", &self.len())
            .field("durable", &self.sink.is_some())
            .finish()
    }
}

impl Default for TraceRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceRecorder {
    /// Create in-memory recorder
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LogState {
                events: Vec::new(),
                next_seq: 1,
            }),
            sink: None,
        }
    }

    /// Create recorder that mirrors every event into `sink`
    #[must_use]
    pub fn with_sink(sink: Box<dyn TraceSink>) -> Self {
        Self {
            sink: Some(sink),
            ..Self::new()
        }
    }

    /// Append an event
    ///
    /// # Errors
    /// Returns the sink error if the durable write fails. The event is then
    /// not committed and its sequence number is not consumed.
    pub fn record(&self, draft: TraceDraft) -> Result<TraceEvent, TraceError> {
        let mut guard = self.state.write();
        let prev_hash = guard.events.last().map_or([0u8; 32], |e| e.hash);
        let event = TraceEvent::seal(draft, guard.next_seq, prev_hash);

        if let Some(sink) = &self.sink {
            sink.write(&event)?;
        }

        guard.next_seq += 1;
        guard.events.push(event.clone());
        tracing::trace!(seq = event.seq, agent = %event.agent, kind = event.kind.as_str(), "trace event recorded");
        Ok(event)
    }

    /// Lazy query over the log
    #[inline]
    #[must_use]
    pub fn query(&self, filter: TraceFilter) -> TraceQuery<'_> {
        TraceQuery {
            recorder: self,
            filter,
        }
    }

    /// Snapshot of every event
    #[must_use]
    pub fn events(&self) -> Vec<TraceEvent> {
        self.state.read().events.clone()
    }

    /// Number of committed events
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().events.len()
    }

    /// Whether the log is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Recompute the hash chain
    ///
    /// # Errors
    /// `TraceError::IntegrityViolation` naming the first broken sequence.
    pub fn verify_integrity(&self) -> Result<(), TraceError> {
        let guard = self.state.read();
        let mut prev = [0u8; 32];
        let mut last_seq = 0u64;
        for e in &guard.events {
            if e.prev_hash != prev || e.seq <= last_seq || e.hash != e.compute_hash() {
                return Err(TraceError::IntegrityViolation { seq: e.seq });
            }
            prev = e.hash;
            last_seq = e.seq;
        }
        Ok(())
    }

    fn get(&self, index: usize) -> Option<TraceEvent> {
        self.state.read().events.get(index).cloned()
    }
}

/// Selection criteria for trace queries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceFilter {
    /// Target identifier, see [`TraceDraft::target`](crate::TraceDraft::target)
    pub target: Option<String>,
    pub agent: Option<String>,
    pub kind: Option<TraceKind>,
    /// Only events with a sequence number greater than this
    pub after_seq: Option<u64>,
}

impl TraceFilter {
    /// Restrict to one target by identifier
    #[inline]
    #[must_use]
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Restrict to one agent
    #[inline]
    #[must_use]
    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    /// Restrict to one kind
    #[inline]
    #[must_use]
    pub fn kind(mut self, kind: TraceKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Resume after a known sequence number
    #[inline]
    #[must_use]
    pub fn after(mut self, seq: u64) -> Self {
        self.after_seq = Some(seq);
        self
    }

    /// Whether `event` passes the filter
    #[must_use]
    pub fn matches(&self, event: &TraceEvent) -> bool {
        self.target.as_deref().map_or(true, |t| event.is_for(t))
            && self.agent.as_deref().map_or(true, |a| event.agent == a)
            && self.kind.map_or(true, |k| event.kind == k)
            && self.after_seq.map_or(true, |s| event.seq > s)
    }
}

/// Restartable view over the log
///
/// Each call to [`TraceQuery::iter`] starts again from the beginning and
/// sees events appended since the previous pass.
#[derive(Debug, Clone)]
pub struct TraceQuery<'a> {
    recorder: &'a TraceRecorder,
    filter: TraceFilter,
}

impl<'a> TraceQuery<'a> {
    /// Iterate matching events in sequence order
    #[inline]
    #[must_use]
    pub fn iter(&self) -> TraceIter<'a> {
        TraceIter {
            recorder: self.recorder,
            filter: self.filter.clone(),
            cursor: 0,
        }
    }

    /// Filter in use
    #[inline]
    #[must_use]
    pub fn filter(&self) -> &TraceFilter {
        &self.filter
    }
}

impl<'a> IntoIterator for &TraceQuery<'a> {
    type Item = TraceEvent;
    type IntoIter = TraceIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Cursor over the log, takes the read lock one event at a time
#[derive(Debug)]
pub struct TraceIter<'a> {
    recorder: &'a TraceRecorder,
    filter: TraceFilter,
    cursor: usize,
}

impl Iterator for TraceIter<'_> {
    type Item = TraceEvent;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let event = self.recorder.get(self.cursor)?;
            self.cursor += 1;
            if self.filter.matches(&event) {
                return Some(event);
            }
        }
    }
}
