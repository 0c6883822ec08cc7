//! Knowledge context for one migration target

use crate::compiler::{terms, RuleCompiler, RuleSet};
use crate::error::KnowledgeError;
use crate::item::KnowledgeItem;
use crate::rule::{MigrationRule, RuleId};
use serde::{Deserialize, Serialize};

/// Ranked evidence and the compiled rules derived from it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeContext {
    library: String,
    items: Vec<KnowledgeItem>,
    rules: RuleSet,
}

impl KnowledgeContext {
    /// Build a context from ranked retrieval results
    ///
    /// Items below `min_relevance` or with unreachable sources are kept for
    /// audit but do not produce rules. Rule ordinals follow retrieval rank.
    ///
    /// # Errors
    /// The first malformed item.
    pub fn build(
        library: impl Into<String>,
        items: Vec<KnowledgeItem>,
        min_relevance: f64,
    ) -> Result<Self, KnowledgeError> {
        let library = library.into();
        for item in &items {
            item.validate()?;
        }

        let synthesized: Vec<MigrationRule> = items
            .iter()
            .filter(|item| item.is_usable(min_relevance))
            .enumerate()
            .map(|(i, item)| MigrationRule::synthesize(RuleId::for_library(&library, i + 1), item))
            .collect();

        let rules = RuleCompiler::new().compile(synthesized);
        Ok(Self {
            library,
            items,
            rules,
        })
    }

    /// Context with no evidence
    #[inline]
    #[must_use]
    pub fn empty(library: impl Into<String>) -> Self {
        Self {
            library: library.into(),
            ..Self::default()
        }
    }

    /// Library this context describes
    #[inline]
    #[must_use]
    pub fn library(&self) -> &str {
        &self.library
    }

    /// Raw ranked items
    #[inline]
    #[must_use]
    pub fn items(&self) -> &[KnowledgeItem] {
        &self.items
    }

    /// Compiled rules, in citation order
    #[inline]
    #[must_use]
    pub fn rules(&self) -> &[MigrationRule] {
        &self.rules.rules
    }

    /// Full compilation output including discarded rules
    #[inline]
    #[must_use]
    pub fn rule_set(&self) -> &RuleSet {
        &self.rules
    }

    /// No rule can be planned from this context
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.rules.is_empty()
    }

    /// Rule sharing the most terms with `text`, ties to the earlier rule
    #[must_use]
    pub fn best_match(&self, text: &str) -> Option<&MigrationRule> {
        let wanted = terms(text);
        let mut best: Option<(usize, &MigrationRule)> = None;
        for rule in &self.rules.rules {
            let score = terms(&rule.text).intersection(&wanted).count();
            if score > 0 && best.map_or(true, |(s, _)| score > s) {
                best = Some((score, rule));
            }
        }
        best.map(|(_, r)| r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Evidence;

    fn auth_items() -> Vec<KnowledgeItem> {
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

    #[test]
    fn build_synthesizes_rules_in_rank_order() {
        let ctx = KnowledgeContext::build("auth-sdk-legacy", auth_items(), 0.0).unwrap();
        let ids: Vec<&str> = ctx.rules().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["RULE-AUTH-01", "RULE-AUTH-02"]);
        assert_eq!(ctx.items().len(), 2);
        assert!(!ctx.is_empty());
    }

    #[test]
    fn min_relevance_filters_rules_but_keeps_items() {
        let ctx = KnowledgeContext::build("auth-sdk-legacy", auth_items(), 0.9).unwrap();
        assert_eq!(ctx.rules().len(), 1);
        assert_eq!(ctx.items().len(), 2);
    }

    #[test]
    fn malformed_items_fail_the_build() {
        let items = vec![KnowledgeItem::Doc(Evidence::new("x", "c", -0.1))];
        assert!(KnowledgeContext::build("lib", items, 0.0).is_err());
    }

    #[test]
    fn best_match_prefers_shared_terms() {
        let ctx = KnowledgeContext::build("auth-sdk-legacy", auth_items(), 0.0).unwrap();
        let hit = ctx
            .best_match("TypeError: invalidate() is async, detected missing await")
            .unwrap();
        assert_eq!(hit.id.as_str(), "RULE-AUTH-02");
        assert!(ctx.best_match("zzz qqq").is_none());
    }

    #[test]
    fn empty_context_has_no_rules() {
        let ctx = KnowledgeContext::empty("ui-components");
        assert!(ctx.is_empty());
        assert_eq!(ctx.library(), "ui-components");
    }
}
