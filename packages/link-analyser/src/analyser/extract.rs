//! Link-candidate extraction (spec §4.3 step 2, DOM-free fallback for step 5).

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

use crate::normalise::host_matches_target;

/// One kept candidate: a URL whose host matched the target, plus the source element's markup
/// (or an annotated stub for script/attribute-only origins) and its `rel` tokens.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub url: Url,
    pub outer_html: String,
    pub rel_tokens: Vec<String>,
}

/// Enumerate every link carrier the spec names, resolve relative to `base`, and keep only
/// candidates whose host equals `target_domain` or is a subdomain of it.
pub fn extract_dom_candidates(html: &str, base: &Url, target_domain: &str) -> Vec<Candidate> {
    let document = Html::parse_document(html);
    let mut candidates = Vec::new();

    // `a[href]` also covers "images inside anchors" since the anchor itself carries the href.
    push_href_candidates(&document, &base, target_domain, "a[href]", &mut candidates);
    push_href_candidates(&document, &base, target_domain, "area[href]", &mut candidates);
    push_attr_candidates(
        &document,
        &base,
        target_domain,
        "[xlink\\:href]",
        "xlink:href",
        &mut candidates,
    );
    push_attr_candidates(&document, &base, target_domain, "form[action]", "action", &mut candidates);
    for attr in ["data-href", "data-url", "data-link"] {
        push_attr_candidates(&document, &base, target_domain, &format!("[{attr}]"), attr, &mut candidates);
    }
    push_event_handler_candidates(&document, &base, target_domain, &mut candidates);
    push_inline_script_candidates(&document, &base, target_domain, &mut candidates);

    candidates
}

fn push_href_candidates(
    document: &Html,
    base: &Url,
    target_domain: &str,
    selector_str: &str,
    out: &mut Vec<Candidate>,
) {
    let Ok(selector) = Selector::parse(selector_str) else {
        return;
    };
    for el in document.select(&selector) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        let Ok(resolved) = base.join(href) else {
            continue;
        };
        let Some(host) = resolved.host_str() else {
            continue;
        };
        if !host_matches_target(host, target_domain) {
            continue;
        }
        let rel_tokens = el
            .value()
            .attr("rel")
            .map(|r| r.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        out.push(Candidate {
            url: resolved,
            outer_html: el.html(),
            rel_tokens,
        });
    }
}

fn push_attr_candidates(
    document: &Html,
    base: &Url,
    target_domain: &str,
    selector_str: &str,
    attr_name: &str,
    out: &mut Vec<Candidate>,
) {
    let Ok(selector) = Selector::parse(selector_str) else {
        return;
    };
    for el in document.select(&selector) {
        let Some(value) = el.value().attr(attr_name) else {
            continue;
        };
        let Ok(resolved) = base.join(value) else {
            continue;
        };
        let Some(host) = resolved.host_str() else {
            continue;
        };
        if !host_matches_target(host, target_domain) {
            continue;
        }
        out.push(Candidate {
            url: resolved,
            outer_html: format!("<!-- {attr_name} attribute --> {}", el.html()),
            rel_tokens: Vec::new(),
        });
    }
}

static ONCLICK_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?:location\.href|window\.open)\s*=?\s*\(?['"]([^'"]+)['"]"#).unwrap());

fn push_event_handler_candidates(
    document: &Html,
    base: &Url,
    target_domain: &str,
    out: &mut Vec<Candidate>,
) {
    let Ok(selector) = Selector::parse("[onclick]") else {
        return;
    };
    for el in document.select(&selector) {
        let Some(onclick) = el.value().attr("onclick") else {
            continue;
        };
        for caps in ONCLICK_URL_RE.captures_iter(onclick) {
            let raw = &caps[1];
            let Ok(resolved) = base.join(raw) else {
                continue;
            };
            let Some(host) = resolved.host_str() else {
                continue;
            };
            if !host_matches_target(host, target_domain) {
                continue;
            }
            out.push(Candidate {
                url: resolved,
                outer_html: format!("<!-- onclick handler --> {}", el.html()),
                rel_tokens: Vec::new(),
            });
        }
    }
}

static SCRIPT_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s'"<>\\]+"#).unwrap());

fn push_inline_script_candidates(
    document: &Html,
    base: &Url,
    target_domain: &str,
    out: &mut Vec<Candidate>,
) {
    let Ok(selector) = Selector::parse("script:not([src])") else {
        return;
    };
    for el in document.select(&selector) {
        let body: String = el.text().collect();
        for m in SCRIPT_URL_RE.find_iter(&body) {
            let Ok(resolved) = Url::parse(m.as_str()) else {
                continue;
            };
            let Some(host) = resolved.host_str() else {
                continue;
            };
            if !host_matches_target(host, target_domain) {
                continue;
            }
            let _ = base; // scripts carry absolute URLs; base is unused but kept for symmetry
            out.push(Candidate {
                url: resolved,
                outer_html: format!("<!-- inline script literal --> {}", m.as_str()),
                rel_tokens: Vec::new(),
            });
        }
    }
}

/// DOM-free extraction over proxy-returned HTML (spec §4.3 step 5). Tries each method in
/// order, stopping at the first that yields at least one candidate.
pub fn extract_dom_free(html: &str, base: &Url, target_domain: &str) -> Vec<Candidate> {
    let regex_hits = extract_regex_anchors(html, target_domain);
    if !regex_hits.is_empty() {
        return regex_hits;
    }

    let text_hits = extract_text_urls(html, target_domain);
    if !text_hits.is_empty() {
        return text_hits;
    }

    let meta_hits = extract_meta_tag_urls(html, base, target_domain);
    if !meta_hits.is_empty() {
        return meta_hits;
    }

    let data_attr_hits = extract_data_attribute_json(html, target_domain);
    if !data_attr_hits.is_empty() {
        return data_attr_hits;
    }

    extract_script_and_jsonld(html, target_domain)
}

static ANCHOR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<a\s+([^>]*?)href=["']([^"']+)["']([^>]*)>"#).unwrap()
});
static REL_ATTR_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r#"rel=["']([^"']+)["']"#).unwrap());

fn extract_regex_anchors(html: &str, target_domain: &str) -> Vec<Candidate> {
    let mut out = Vec::new();
    for caps in ANCHOR_REGEX.captures_iter(html) {
        let href = &caps[2];
        let Ok(url) = Url::parse(href) else { continue };
        let Some(host) = url.host_str() else { continue };
        if !host_matches_target(host, target_domain) {
            continue;
        }
        let attrs = format!("{}{}", &caps[1], &caps[3]);
        let rel_tokens = REL_ATTR_REGEX
            .captures(&attrs)
            .map(|c| c[1].split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        out.push(Candidate {
            url,
            outer_html: caps[0].to_string(),
            rel_tokens,
        });
    }
    out
}

fn extract_text_urls(html: &str, target_domain: &str) -> Vec<Candidate> {
    SCRIPT_URL_RE
        .find_iter(html)
        .filter_map(|m| {
            let url = Url::parse(m.as_str()).ok()?;
            let host = url.host_str()?;
            host_matches_target(host, target_domain).then(|| Candidate {
                url,
                outer_html: format!("<!-- bare url in text --> {}", m.as_str()),
                rel_tokens: Vec::new(),
            })
        })
        .collect()
}

fn extract_meta_tag_urls(html: &str, base: &Url, target_domain: &str) -> Vec<Candidate> {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse("meta[content]") else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for el in document.select(&selector) {
        let Some(content) = el.value().attr("content") else {
            continue;
        };
        if let Ok(resolved) = base.join(content) {
            if let Some(host) = resolved.host_str() {
                if host_matches_target(host, target_domain) {
                    out.push(Candidate {
                        url: resolved,
                        outer_html: format!("<!-- meta tag --> {}", el.html()),
                        rel_tokens: Vec::new(),
                    });
                }
            }
        }
    }
    out
}

fn extract_data_attribute_json(html: &str, target_domain: &str) -> Vec<Candidate> {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse("[data-props], [data-state], [data-json]") else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for el in document.select(&selector) {
        for attr in ["data-props", "data-state", "data-json"] {
            let Some(raw) = el.value().attr(attr) else {
                continue;
            };
            let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) else {
                continue;
            };
            collect_urls_from_json(&value, target_domain, &mut out);
        }
    }
    out
}

fn extract_script_and_jsonld(html: &str, target_domain: &str) -> Vec<Candidate> {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse(r#"script[type="application/ld+json"], script:not([src])"#)
    else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for el in document.select(&selector) {
        let body: String = el.text().collect();
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&body) {
            collect_urls_from_json(&value, target_domain, &mut out);
        } else {
            out.extend(extract_text_urls(&body, target_domain));
        }
    }
    out
}

fn collect_urls_from_json(value: &serde_json::Value, target_domain: &str, out: &mut Vec<Candidate>) {
    match value {
        serde_json::Value::String(s) => {
            if let Ok(url) = Url::parse(s) {
                if let Some(host) = url.host_str() {
                    if host_matches_target(host, target_domain) {
                        out.push(Candidate {
                            url,
                            outer_html: format!("<!-- json blob --> {s}"),
                            rel_tokens: Vec::new(),
                        });
                    }
                }
            }
        }
        serde_json::Value::Array(arr) => {
            for v in arr {
                collect_urls_from_json(v, target_domain, out);
            }
        }
        serde_json::Value::Object(map) => {
            for v in map.values() {
                collect_urls_from_json(v, target_domain, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://src.example.com/page").unwrap()
    }

    #[test]
    fn dofollow_anchor_is_kept() {
        let html = r#"<html><body><a href="https://target.com/x">x</a></body></html>"#;
        let candidates = extract_dom_candidates(html, &base(), "target.com");
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].rel_tokens.is_empty());
    }

    #[test]
    fn nofollow_ugc_anchor_captures_rel_tokens() {
        let html =
            r#"<html><body><a rel="nofollow ugc" href="https://target.com/x">x</a></body></html>"#;
        let candidates = extract_dom_candidates(html, &base(), "target.com");
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].rel_tokens.contains(&"ugc".to_string()));
        assert!(candidates[0].rel_tokens.contains(&"nofollow".to_string()));
    }

    #[test]
    fn off_target_links_are_dropped() {
        let html = r#"<html><body><a href="https://other.com/x">x</a></body></html>"#;
        let candidates = extract_dom_candidates(html, &base(), "target.com");
        assert!(candidates.is_empty());
    }

    #[test]
    fn subdomain_of_target_is_kept() {
        let html = r#"<html><body><a href="https://cdn.target.com/x">x</a></body></html>"#;
        let candidates = extract_dom_candidates(html, &base(), "target.com");
        assert_eq!(candidates.len(), 1);
    }

    #[test]
    fn regex_fallback_finds_anchor_in_raw_html() {
        let html = r#"<a href="https://target.com/x" rel="sponsored">x</a>"#;
        let candidates = extract_dom_free(html, &base(), "target.com");
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].rel_tokens.contains(&"sponsored".to_string()));
    }
}
