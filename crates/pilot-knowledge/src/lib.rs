//! PatchPilot Knowledge - evidence for migration plans
//!
//! Turns ranked retrieval results into the rules a plan is built from:
//! - Knowledge items are a tagged variant (doc, issue, release note) over a
//!   shared evidence shape
//! - Citations are canonicalized so the same page is recognised twice
//! - Each usable item is synthesized into a prioritized migration rule
//! - Overlapping rules are compiled into a non-overlapping rule set
//!
//! # Example
//!
//! ```rust
//! use pilot_knowledge::{Evidence, KnowledgeContext, KnowledgeItem};
//!
//! let items = vec![
//!     KnowledgeItem::Doc(Evidence::new(
//!         "Auth token format changed from Bearer to Token prefix.",
//!         "docs.auth-sdk.com/v2/migration",
//!         0.99,
//!     )),
//!     KnowledgeItem::Issue(Evidence::new(
//!         "Legacy session cleanup method removed.",
//!         "github.com/auth-sdk/issues/402",
//!         0.88,
//!     )),
//! ];
//!
//! let ctx = KnowledgeContext::build("auth-sdk-legacy", items, 0.0).unwrap();
//! assert_eq!(ctx.rules().len(), 2);
//! assert_eq!(ctx.rules()[0].id.as_str(), "RULE-AUTH-01");
//! ```

#![allow(missing_docs)]

pub mod citation;
pub mod compiler;
pub mod context;
pub mod error;
pub mod item;
pub mod query;
pub mod rule;

pub use citation::{canonicalize_citation, ALLOWED_QUERY_PARAMS};
pub use compiler::{DiscardReason, DiscardedRule, RuleCompiler, RuleSet};
pub use context::KnowledgeContext;
pub use error::KnowledgeError;
pub use item::{Evidence, KnowledgeItem, KnowledgeKind};
pub use query::search_queries;
pub use rule::{MigrationRule, Priority, RuleId, RuleSource};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
