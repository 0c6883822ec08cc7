//! Migration rules synthesized from knowledge items

use crate::item::{KnowledgeItem, KnowledgeKind};
use serde::{Deserialize, Serialize};

/// Rule priority, highest first in `Ord`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    /// The more urgent of two priorities
    #[inline]
    #[must_use]
    pub fn max_urgency(self, other: Self) -> Self {
        std::cmp::min(self, other)
    }

    /// Priority for an item, derived from its kind, relevance and wording
    ///
    /// `Critical` is reserved for highly relevant breaking changes; issues
    /// never exceed `High`.
    #[must_use]
    pub fn assess(item: &KnowledgeItem) -> Self {
        let relevance = item.relevance();
        let base = if relevance >= 0.9 {
            Priority::High
        } else if relevance >= 0.75 {
            Priority::Medium
        } else {
            Priority::Low
        };

        let breaking = is_breaking(&item.evidence().summary);
        match (item.kind(), base, breaking) {
            (KnowledgeKind::Issue, _, _) => base,
            (_, Priority::High, true) => Priority::Critical,
            _ => base,
        }
    }
}

const BREAKING_MARKERS: [&str; 6] = ["removed", "breaking", "no longer", "renamed", "dropped", "changed from"];

fn is_breaking(summary: &str) -> bool {
    let lower = summary.to_lowercase();
    BREAKING_MARKERS.iter().any(|m| lower.contains(m))
}

/// Deterministic rule identifier, `RULE-<TAG>-<nn>`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub String);

impl RuleId {
    /// Id for the `ordinal`-th (1-based) rule of `library`
    #[must_use]
    pub fn for_library(library: &str, ordinal: usize) -> Self {
        Self(format!("RULE-{}-{ordinal:02}", library_tag(library)))
    }

    /// String form
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Upper-case first segment of a library name (`auth-sdk-legacy` -> `AUTH`)
fn library_tag(library: &str) -> String {
    let tag: String = library
        .trim_start_matches('@')
        .split(|c: char| matches!(c, '-' | '_' | '.' | '/'))
        .find(|s| !s.is_empty())
        .unwrap_or_default()
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect::<String>()
        .to_ascii_uppercase();
    if tag.is_empty() {
        "LIB".to_string()
    } else {
        tag
    }
}

/// Evidence backing a rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSource {
    /// Canonical citation
    pub citation: String,
    pub evidence_snippet: String,
    pub kind: KnowledgeKind,
}

const SNIPPET_CHARS: usize = 160;

/// One implementation-ready migration rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRule {
    pub id: RuleId,
    pub text: String,
    pub priority: Priority,
    pub sources: Vec<RuleSource>,
    /// Ids of rules folded into this one by the compiler
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged: Vec<RuleId>,
}

impl MigrationRule {
    /// Synthesize a rule from one knowledge item
    #[must_use]
    pub fn synthesize(id: RuleId, item: &KnowledgeItem) -> Self {
        let e = item.evidence();
        let text = e.summary.trim().to_string();
        Self {
            id,
            priority: Priority::assess(item),
            sources: vec![RuleSource {
                citation: item.canonical_citation(),
                evidence_snippet: text.chars().take(SNIPPET_CHARS).collect(),
                kind: item.kind(),
            }],
            text,
            merged: Vec::new(),
        }
    }

    /// This rule's id followed by every folded id
    #[must_use]
    pub fn all_ids(&self) -> Vec<RuleId> {
        std::iter::once(self.id.clone())
            .chain(self.merged.iter().cloned())
            .collect()
    }
}
