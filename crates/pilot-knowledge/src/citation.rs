//! Citation canonicalization
//!
//! Retrieved links arrive wrapped in search-engine redirects, with tracking
//! parameters and inconsistent casing. Canonical citations let the rule
//! compiler recognise the same source twice.

use url::Url;

/// Query parameters that change page content and are kept
pub const ALLOWED_QUERY_PARAMS: [&str; 8] = ["page", "p", "q", "tag", "version", "lang", "sort", "order"];

/// Canonical form of a citation
///
/// URLs (with or without scheme) are normalized; free-text citations such as
/// `"db-conn v5.0.0 Release Notes"` are returned trimmed but otherwise as is.
#[must_use]
pub fn canonicalize_citation(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return String::new();
    }

    let Some(url) = parse_link(raw) else {
        return raw.to_string();
    };
    let url = unwrap_redirect(url);
    if !matches!(url.scheme(), "http" | "https") {
        return raw.to_string();
    }
    canonical(url)
}

fn parse_link(raw: &str) -> Option<Url> {
    if raw.contains(char::is_whitespace) {
        return None;
    }
    if let Some(rest) = raw.strip_prefix("//") {
        return Url::parse(&format!("https://{rest}")).ok();
    }
    match Url::parse(raw) {
        Ok(url) if url.has_host() => Some(url),
        _ if looks_like_bare_host(raw) => Url::parse(&format!("https://{raw}")).ok(),
        _ => None,
    }
}

fn looks_like_bare_host(raw: &str) -> bool {
    let host = raw.split('/').next().unwrap_or_default();
    host.contains('.')
        && !host.starts_with('.')
        && !host.ends_with('.')
        && host.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':'))
}

/// `duckduckgo.com/l/?uddg=<encoded target>&rut=...` -> target
fn unwrap_redirect(url: Url) -> Url {
    let target = url
        .query_pairs()
        .find(|(k, _)| k == "uddg")
        .map(|(_, v)| v.into_owned());
    match target.and_then(|t| parse_link(&t)) {
        Some(inner) => inner,
        None => url,
    }
}

fn canonical(mut url: Url) -> String {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| ALLOWED_QUERY_PARAMS.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
    url.set_fragment(None);

    let trimmed = url.path().trim_end_matches('/').to_string();
    if trimmed.is_empty() {
        url.set_path("/");
    } else {
        url.set_path(&trimmed);
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_host_and_strips_trailing_slash() {
        assert_eq!(
            canonicalize_citation("HTTPS://Docs.Pydantic.dev/latest/migration/"),
            "https://docs.pydantic.dev/latest/migration"
        );
    }

    #[test]
    fn drops_tracking_params_and_fragment() {
        assert_eq!(
            canonicalize_citation("https://example.com/guide?utm_source=x&version=2&ref=y#section"),
            "https://example.com/guide?version=2"
        );
    }

    #[test]
    fn unwraps_search_redirects() {
        let raw = "//duckduckgo.com/l/?uddg=https%3A%2F%2Fgithub.com%2Fpydantic%2Fpydantic%2Freleases%2F&rut=abc";
        assert_eq!(canonicalize_citation(raw), "https://github.com/pydantic/pydantic/releases");
    }

    #[test]
    fn bare_hosts_get_a_scheme() {
        assert_eq!(
            canonicalize_citation("github.com/auth-sdk/issues/402"),
            "https://github.com/auth-sdk/issues/402"
        );
    }

    #[test]
    fn free_text_citations_are_kept() {
        assert_eq!(
            canonicalize_citation("  db-conn v5.0.0 Release Notes "),
            "db-conn v5.0.0 Release Notes"
        );
    }

    #[test]
    fn root_path_is_slash() {
        assert_eq!(canonicalize_citation("https://Example.com"), "https://example.com/");
    }

    #[test]
    fn equivalent_links_converge() {
        let a = canonicalize_citation("https://docs.auth-sdk.com/v2/migration/?utm_campaign=x");
        let b = canonicalize_citation("docs.auth-sdk.com/v2/migration");
        assert_eq!(a, b);
    }
}
