use pilot_knowledge::{
    Evidence, KnowledgeContext, KnowledgeItem, KnowledgeKind, MigrationRule, Priority, RuleCompiler, RuleId,
};
use proptest::prelude::*;
use std::collections::BTreeSet;

#[derive(serde::Deserialize)]
struct Fixture {
    knowledge: Vec<KnowledgeItem>,
}

#[test]
fn test_items_load_from_toml() {
    let fixture: Fixture = toml::from_str(
        r#"
        [[knowledge]]
        type = "doc"
        summary = "Auth token format changed from Bearer to Token prefix."
        citation = "docs.auth-sdk.com/v2/migration"
        relevance = 0.99

        [[knowledge]]
        type = "release_note"
        summary = "Connection pool config schema flattened."
        citation = "db-conn v5.0.0 Release Notes"
        relevance = 0.95
        reachable = false
        "#,
    )
    .unwrap();

    assert_eq!(fixture.knowledge.len(), 2);
    assert_eq!(fixture.knowledge[1].kind(), KnowledgeKind::ReleaseNote);
    assert!(!fixture.knowledge[1].evidence().reachable);

    let ctx = KnowledgeContext::build("auth-sdk-legacy", fixture.knowledge, 0.0).unwrap();
    // Unreachable source does not back a rule
    assert_eq!(ctx.rules().len(), 1);
    assert_eq!(ctx.rules()[0].priority, Priority::Critical);
}

#[test]
fn test_same_page_from_two_retrievals_merges() {
    let items = vec![
        KnowledgeItem::Doc(Evidence::new(
            "BaseModel.parse_obj() removed; use BaseModel.model_validate(data).",
            "https://docs.pydantic.dev/latest/migration/",
            0.91,
        )),
        KnowledgeItem::Issue(Evidence::new(
            "basemodel parse_obj removed use basemodel model_validate data",
            "//duckduckgo.com/l/?uddg=https%3A%2F%2Fdocs.pydantic.dev%2Flatest%2Fmigration",
            0.7,
        )),
    ];
    let ctx = KnowledgeContext::build("pydantic", items, 0.0).unwrap();
    assert_eq!(ctx.rules().len(), 1);
    // Both sources canonicalize to the same page, so only one is kept
    assert_eq!(ctx.rules()[0].sources.len(), 1);
    assert_eq!(ctx.rule_set().discarded.len(), 1);
}

fn arb_text() -> impl Strategy<Value = String> {
    proptest::collection::vec(
        prop_oneof![
            Just("session"),
            Just("invalidate"),
            Just("await"),
            Just("token"),
            Just("header"),
            Just("pool"),
            Just("config"),
        ],
        1..5,
    )
    .prop_map(|words| words.join(" "))
}

proptest! {
    #[test]
    fn prop_every_rule_is_kept_or_discarded(texts in proptest::collection::vec(arb_text(), 0..12)) {
        let rules: Vec<MigrationRule> = texts
            .iter()
            .enumerate()
            .map(|(i, t)| {
                MigrationRule::synthesize(
                    RuleId::for_library("lib", i + 1),
                    &KnowledgeItem::Doc(Evidence::new(t.clone(), format!("example.com/{i}"), 0.8)),
                )
            })
            .collect();
        let input_ids: BTreeSet<RuleId> = rules.iter().map(|r| r.id.clone()).collect();

        let set = RuleCompiler::new().compile(rules);

        let kept: BTreeSet<RuleId> = set.rules.iter().map(|r| r.id.clone()).collect();
        let dropped: BTreeSet<RuleId> = set.discarded.iter().map(|d| d.rule_id.clone()).collect();
        prop_assert!(kept.is_disjoint(&dropped));
        let all: BTreeSet<RuleId> = kept.union(&dropped).cloned().collect();
        prop_assert_eq!(all, input_ids);

        // Kept rules never share identical wording
        let texts: BTreeSet<String> = set.rules.iter().map(|r| r.text.clone()).collect();
        prop_assert_eq!(texts.len(), set.rules.len());
    }
}
