//! Trace event types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ulid::Ulid;

/// Unique trace event identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub Ulid);

impl EventId {
    /// Generate new event ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What an event records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    /// Phase change of a target
    Transition,
    /// Work performed by an agent (call into a collaborator, plan, gate)
    Action,
    /// One reflection attempt, resolved or not
    ReflectionAttempt,
    /// Error occurrence, recovered or fatal
    Error,
    /// Terminal marker for a target workflow
    Terminal,
}

impl TraceKind {
    /// Stable string tag
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TraceKind::Transition => "transition",
            TraceKind::Action => "action",
            TraceKind::ReflectionAttempt => "reflection_attempt",
            TraceKind::Error => "error",
            TraceKind::Terminal => "terminal",
        }
    }
}

/// Event contents before the recorder stamps sequence, time and hash
#[derive(Debug, Clone, PartialEq)]
pub struct TraceDraft {
    pub agent: String,
    /// Stable identifier of the target the event belongs to
    pub target: Option<String>,
    /// Library name of the target, for display
    pub library: Option<String>,
    pub kind: TraceKind,
    pub input: String,
    pub output: String,
    pub state: serde_json::Value,
}

impl TraceDraft {
    /// Create new draft for an agent
    #[inline]
    #[must_use]
    pub fn new(agent: impl Into<String>, kind: TraceKind) -> Self {
        Self {
            agent: agent.into(),
            target: None,
            library: None,
            kind,
            input: String::new(),
            output: String::new(),
            state: serde_json::Value::Null,
        }
    }

    /// With target identifier
    #[inline]
    #[must_use]
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// With the target's library name
    #[inline]
    #[must_use]
    pub fn library(mut self, library: impl Into<String>) -> Self {
        self.library = Some(library.into());
        self
    }

    /// With input summary
    #[inline]
    #[must_use]
    pub fn input(mut self, input: impl Into<String>) -> Self {
        self.input = input.into();
        self
    }

    /// With output summary
    #[inline]
    #[must_use]
    pub fn output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    /// With structured state snapshot
    #[inline]
    #[must_use]
    pub fn state(mut self, state: serde_json::Value) -> Self {
        self.state = state;
        self
    }
}

/// Immutable, sequenced audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub id: EventId,
    /// Global sequence number, strictly increasing across all targets
    pub seq: u64,
    pub agent: String,
    /// Stable target identifier; queries match on this
    pub target: Option<String>,
    #[serde(default)]
    pub library: Option<String>,
    pub kind: TraceKind,
    pub input: String,
    pub output: String,
    pub state: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub prev_hash: [u8; 32],
    pub hash: [u8; 32],
}

impl TraceEvent {
    pub(crate) fn seal(draft: TraceDraft, seq: u64, prev_hash: [u8; 32]) -> Self {
        let mut event = Self {
            id: EventId::new(),
            seq,
            agent: draft.agent,
            target: draft.target,
            library: draft.library,
            kind: draft.kind,
            input: draft.input,
            output: draft.output,
            state: draft.state,
            timestamp: Utc::now(),
            prev_hash,
            hash: [0u8; 32],
        };
        event.hash = event.compute_hash();
        event
    }

    /// Hex form of the chain hash
    #[must_use]
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    /// Whether the event belongs to the target with identifier `target`
    #[inline]
    #[must_use]
    pub fn is_for(&self, target: &str) -> bool {
        self.target.as_deref() == Some(target)
    }

    pub(crate) fn compute_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.id.0.to_bytes());
        hasher.update(self.seq.to_le_bytes());
        hasher.update(self.timestamp.timestamp_micros().to_le_bytes());
        hasher.update(self.agent.as_bytes());
        hasher.update([0]);
        hasher.update(self.target.as_deref().unwrap_or_default().as_bytes());
        hasher.update([0]);
        hasher.update(self.library.as_deref().unwrap_or_default().as_bytes());
        hasher.update([0]);
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(self.input.as_bytes());
        hasher.update([0]);
        hasher.update(self.output.as_bytes());
        hasher.update([0]);
        hasher.update(self.state.to_string().as_bytes());
        hasher.update(self.prev_hash);
        hasher.finalize().into()
    }
}
