//! Rule compilation: fold overlapping rules into a consistent set
//!
//! Two rules overlap when their normalized wording is identical
//! (`Duplicate`) or when one rule's terms are a strict subset of another's
//! (`Subsumed`, the more specific rule wins). Folding keeps the position of
//! the first rule, unions sources and keeps the more urgent priority.

use crate::rule::{MigrationRule, RuleId};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Smallest term set that may be folded as subsumed
const MIN_SUBSUME_TERMS: usize = 2;

const STOPWORDS: [&str; 19] = [
    "a", "an", "and", "be", "by", "for", "from", "in", "is", "it", "must", "now", "of", "on", "or",
    "should", "the", "to", "with",
];

/// Why a rule was dropped from the compiled set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "by", rename_all = "snake_case")]
pub enum DiscardReason {
    Duplicate(RuleId),
    Subsumed(RuleId),
    Empty,
}

/// A rule that did not survive compilation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscardedRule {
    pub rule_id: RuleId,
    pub reason: DiscardReason,
}

/// Output of compilation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub rules: Vec<MigrationRule>,
    pub discarded: Vec<DiscardedRule>,
}

impl RuleSet {
    /// Find a rule by its own or a folded id
    #[must_use]
    pub fn find(&self, id: &RuleId) -> Option<&MigrationRule> {
        self.rules
            .iter()
            .find(|r| &r.id == id || r.merged.contains(id))
    }
}

/// Stateless rule compiler
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleCompiler;

impl RuleCompiler {
    /// Create new compiler
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Compile rules, preserving first-appearance order
    #[must_use]
    pub fn compile(&self, rules: Vec<MigrationRule>) -> RuleSet {
        let mut kept: Vec<(BTreeSet<String>, MigrationRule)> = Vec::new();
        let mut discarded = Vec::new();

        for rule in rules {
            let terms = terms(&rule.text);
            if terms.is_empty() {
                discarded.push(DiscardedRule {
                    rule_id: rule.id,
                    reason: DiscardReason::Empty,
                });
                continue;
            }

            let overlap = kept.iter().position(|(k, _)| {
                *k == terms || is_subsumed(&terms, k) || is_subsumed(k, &terms)
            });

            let Some(idx) = overlap else {
                kept.push((terms, rule));
                continue;
            };

            let (kept_terms, kept_rule) = &mut kept[idx];
            if *kept_terms == terms {
                discarded.push(DiscardedRule {
                    rule_id: rule.id.clone(),
                    reason: DiscardReason::Duplicate(kept_rule.id.clone()),
                });
                absorb(kept_rule, rule);
            } else if is_subsumed(&terms, kept_terms) {
                discarded.push(DiscardedRule {
                    rule_id: rule.id.clone(),
                    reason: DiscardReason::Subsumed(kept_rule.id.clone()),
                });
                absorb(kept_rule, rule);
            } else {
                // Incoming rule is more specific: it takes the kept slot
                let loser = std::mem::replace(kept_rule, rule);
                discarded.push(DiscardedRule {
                    rule_id: loser.id.clone(),
                    reason: DiscardReason::Subsumed(kept_rule.id.clone()),
                });
                absorb(kept_rule, loser);
                *kept_terms = terms;
            }
        }

        tracing::debug!(kept = kept.len(), discarded = discarded.len(), "compiled migration rules");

        RuleSet {
            rules: kept.into_iter().map(|(_, r)| r).collect(),
            discarded,
        }
    }
}

fn absorb(into: &mut MigrationRule, other: MigrationRule) {
    into.priority = into.priority.max_urgency(other.priority);

    let mut citations: IndexSet<String> = into.sources.iter().map(|s| s.citation.clone()).collect();
    for source in other.sources {
        if citations.insert(source.citation.clone()) {
            into.sources.push(source);
        }
    }

    for id in std::iter::once(other.id).chain(other.merged) {
        if id != into.id && !into.merged.contains(&id) {
            into.merged.push(id);
        }
    }
}

fn is_subsumed(small: &BTreeSet<String>, large: &BTreeSet<String>) -> bool {
    small.len() >= MIN_SUBSUME_TERMS && small.len() < large.len() && small.is_subset(large)
}

/// Normalized significant terms of a rule text
#[must_use]
pub(crate) fn terms(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}
