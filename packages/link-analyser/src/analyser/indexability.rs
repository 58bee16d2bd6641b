//! Indexability and canonical-URL computation (spec §4.3 step 6).

use scraper::{Html, Selector};
use url::Url;

/// Result of combining header and meta robots directives, plus the canonical check.
#[derive(Debug, Clone)]
pub struct IndexabilitySignals {
    pub indexable: bool,
    /// Directive that made the page non-indexable (e.g. `"X-Robots-Tag: noindex"`), or the
    /// canonicalisation reason when the page is indexable but canonicalised elsewhere.
    pub reason: Option<String>,
    pub canonical_url: Option<String>,
}

fn directive_has_noindex(value: &str) -> bool {
    value
        .split(',')
        .map(|t| t.trim().to_lowercase())
        .any(|t| t == "noindex" || t == "none")
}

/// `noindex`/`none` from either the header or the meta tag makes the page non-indexable (OR
/// rule). `nofollow` alone is recorded but leaves `indexable = true`.
pub fn compute_indexability(
    html: &str,
    x_robots_tag: Option<&str>,
    final_url: &Url,
) -> IndexabilitySignals {
    let document = Html::parse_document(html);

    let meta_robots = Selector::parse(r#"meta[name="robots" i]"#)
        .ok()
        .and_then(|sel| document.select(&sel).next())
        .and_then(|el| el.value().attr("content").map(str::to_string));

    let header_noindex = x_robots_tag.is_some_and(|v| directive_has_noindex(v));
    let meta_noindex = meta_robots.as_deref().is_some_and(directive_has_noindex);

    let (indexable, reason) = if header_noindex || meta_noindex {
        let directive_source = if header_noindex {
            format!("X-Robots-Tag: {}", x_robots_tag.unwrap_or_default())
        } else {
            format!("meta robots: {}", meta_robots.clone().unwrap_or_default())
        };
        (false, Some(directive_source))
    } else {
        let has_nofollow_directive = x_robots_tag.is_some_and(|v| v.to_lowercase().contains("nofollow"))
            || meta_robots
                .as_deref()
                .is_some_and(|v| v.to_lowercase().contains("nofollow"));
        let reason = has_nofollow_directive.then(|| {
            if x_robots_tag.is_some_and(|v| v.to_lowercase().contains("nofollow")) {
                format!("X-Robots-Tag: {}", x_robots_tag.unwrap_or_default())
            } else {
                format!("meta robots: {}", meta_robots.unwrap_or_default())
            }
        });
        (true, reason)
    };

    let canonical_url = Selector::parse(r#"link[rel="canonical"]"#)
        .ok()
        .and_then(|sel| document.select(&sel).next())
        .and_then(|el| el.value().attr("href"))
        .and_then(|href| final_url.join(href).ok())
        .map(|u| u.to_string());

    IndexabilitySignals {
        indexable,
        reason,
        canonical_url,
    }
}

/// `true` when the canonical resolves to a different URL than `final_url` — the
/// "canonicalised" case, which is `ok`, not a failure.
pub fn is_canonicalised(canonical_url: Option<&str>, final_url: &str) -> bool {
    canonical_url.is_some_and(|c| c != final_url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn noindex_header_wins_even_with_index_meta() {
        let html = r#"<html><head><meta name="robots" content="index"></head></html>"#;
        let signals = compute_indexability(html, Some("noindex"), &url("https://a.com/"));
        assert!(!signals.indexable);
    }

    #[test]
    fn or_rule_header_index_meta_noindex() {
        let html = r#"<html><head><meta name="robots" content="noindex"></head></html>"#;
        let signals = compute_indexability(html, Some("index"), &url("https://a.com/"));
        assert!(!signals.indexable);
    }

    #[test]
    fn nofollow_alone_stays_indexable() {
        let html = r#"<html><head><meta name="robots" content="nofollow"></head></html>"#;
        let signals = compute_indexability(html, None, &url("https://a.com/"));
        assert!(signals.indexable);
        assert!(signals.reason.is_some());
    }

    #[test]
    fn canonical_mismatch_detected() {
        let html = r#"<html><head><link rel="canonical" href="https://a.com/b"></head></html>"#;
        let signals = compute_indexability(html, None, &url("https://a.com/a"));
        assert!(is_canonicalised(signals.canonical_url.as_deref(), "https://a.com/a"));
    }
}
