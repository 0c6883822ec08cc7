//! Search query generation for knowledge retrieval
//!
//! Queries are specific enough to stand alone: every one names the library
//! and carries version or breaking-change context.

/// Standalone search queries for migrating `library` from `from` to `to`
#[must_use]
pub fn search_queries(library: &str, from: &str, to: &str) -> Vec<String> {
    let library = library.trim();
    let from = from.trim();
    let to = to.trim();

    let candidates = [
        format!("{library} {from} to {to} migration guide"),
        format!("{library} {to} breaking changes"),
        format!("{library} {from} to {to} deprecation list"),
        format!("{library} {to} release notes"),
        format!("site:github.com {library} {to} upgrade issue"),
        format!("site:stackoverflow.com {library} {to} error after upgrade from {from}"),
    ];

    let mut queries: Vec<String> = Vec::with_capacity(candidates.len());
    for q in candidates {
        let q = q.split_whitespace().collect::<Vec<_>>().join(" ");
        if !queries.contains(&q) {
            queries.push(q);
        }
    }
    queries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_query_names_library_and_version() {
        let queries = search_queries("pydantic", "1.x", "2.x");
        assert_eq!(queries.len(), 6);
        for q in &queries {
            assert!(q.contains("pydantic"));
            assert!(q.contains("2.x"));
        }
        assert_eq!(queries[0], "pydantic 1.x to 2.x migration guide");
    }

    #[test]
    fn whitespace_is_normalized() {
        let queries = search_queries(" auth-sdk-legacy ", "v1.2.4", " v2.0.0");
        assert_eq!(queries[1], "auth-sdk-legacy v2.0.0 breaking changes");
    }
}
