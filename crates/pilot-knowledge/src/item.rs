//! Knowledge items returned by retrieval

use crate::citation::canonicalize_citation;
use crate::error::KnowledgeError;
use serde::{Deserialize, Serialize};

/// Shared shape of every knowledge item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub summary: String,
    pub citation: String,
    /// Retrieval relevance in [0, 1]
    pub relevance: f64,
    /// False when the cited source could not be fetched
    #[serde(default = "default_reachable")]
    pub reachable: bool,
}

fn default_reachable() -> bool {
    true
}

impl Evidence {
    /// Create reachable evidence
    #[inline]
    #[must_use]
    pub fn new(summary: impl Into<String>, citation: impl Into<String>, relevance: f64) -> Self {
        Self {
            summary: summary.into(),
            citation: citation.into(),
            relevance,
            reachable: true,
        }
    }

    /// Mark the source as unreachable
    #[inline]
    #[must_use]
    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }
}

/// Source category of a knowledge item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeKind {
    Doc,
    Issue,
    ReleaseNote,
}

impl KnowledgeKind {
    /// Display label
    #[inline]
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            KnowledgeKind::Doc => "Docs",
            KnowledgeKind::Issue => "GitHub Issue",
            KnowledgeKind::ReleaseNote => "Release Note",
        }
    }
}

/// One retrieved piece of evidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KnowledgeItem {
    Doc(Evidence),
    Issue(Evidence),
    ReleaseNote(Evidence),
}

impl KnowledgeItem {
    /// Evidence payload
    #[inline]
    #[must_use]
    pub fn evidence(&self) -> &Evidence {
        match self {
            KnowledgeItem::Doc(e) | KnowledgeItem::Issue(e) | KnowledgeItem::ReleaseNote(e) => e,
        }
    }

    /// Source category
    #[inline]
    #[must_use]
    pub fn kind(&self) -> KnowledgeKind {
        match self {
            KnowledgeItem::Doc(_) => KnowledgeKind::Doc,
            KnowledgeItem::Issue(_) => KnowledgeKind::Issue,
            KnowledgeItem::ReleaseNote(_) => KnowledgeKind::ReleaseNote,
        }
    }

    /// Relevance score
    #[inline]
    #[must_use]
    pub fn relevance(&self) -> f64 {
        self.evidence().relevance
    }

    /// Canonical form of the citation
    #[must_use]
    pub fn canonical_citation(&self) -> String {
        canonicalize_citation(&self.evidence().citation)
    }

    /// Whether the item can back a rule
    #[inline]
    #[must_use]
    pub fn is_usable(&self, min_relevance: f64) -> bool {
        let e = self.evidence();
        e.reachable && e.relevance >= min_relevance
    }

    /// Reject malformed items
    ///
    /// # Errors
    /// Relevance outside [0, 1] or an empty summary.
    pub fn validate(&self) -> Result<(), KnowledgeError> {
        let e = self.evidence();
        if !(0.0..=1.0).contains(&e.relevance) {
            return Err(KnowledgeError::InvalidRelevance {
                citation: e.citation.clone(),
                value: e.relevance,
            });
        }
        if e.summary.trim().is_empty() {
            return Err(KnowledgeError::EmptySummary {
                citation: e.citation.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_and_evidence_accessors() {
        let item = KnowledgeItem::ReleaseNote(Evidence::new(
            "Connection pool config schema flattened.",
            "db-conn v5.0.0 Release Notes",
            0.95,
        ));
        assert_eq!(item.kind(), KnowledgeKind::ReleaseNote);
        assert_eq!(item.kind().label(), "Release Note");
        assert!((item.relevance() - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn validate_rejects_out_of_range_relevance() {
        let item = KnowledgeItem::Doc(Evidence::new("x", "c", 1.5));
        assert!(matches!(item.validate(), Err(KnowledgeError::InvalidRelevance { .. })));

        let nan = KnowledgeItem::Doc(Evidence::new("x", "c", f64::NAN));
        assert!(nan.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_summary() {
        let item = KnowledgeItem::Issue(Evidence::new("  ", "c", 0.5));
        assert!(matches!(item.validate(), Err(KnowledgeError::EmptySummary { .. })));
    }

    #[test]
    fn unreachable_items_are_not_usable() {
        let item = KnowledgeItem::Doc(Evidence::new("x", "c", 0.9).unreachable());
        assert!(!item.is_usable(0.0));
    }

    #[test]
    fn serde_uses_type_tag() {
        let item = KnowledgeItem::Issue(Evidence::new("Legacy session cleanup method removed.", "github.com/auth-sdk/issues/402", 0.88));
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["type"], "issue");
        assert_eq!(json["reachable"], true);

        let back: KnowledgeItem = serde_json::from_value(serde_json::json!({
            "type": "release_note",
            "summary": "s",
            "citation": "c",
            "relevance": 0.4
        }))
        .unwrap();
        assert_eq!(back.kind(), KnowledgeKind::ReleaseNote);
        assert!(back.evidence().reachable);
    }
}
