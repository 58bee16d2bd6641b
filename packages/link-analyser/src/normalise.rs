//! Target-domain normalisation (spec §3, §8).
//!
//! `normalise("https://www.Foo.com/bar") == "foo.com" == normalise("FOO.com")`.

use crate::error::MalformedInput;

/// Normalise a user-supplied target domain (bare host or full URL) to its registrable host:
/// lowercased, leading `www.` stripped. Preserves the original string separately — callers
/// should keep both (`Link::original_target_domain` vs `Link::target_domain`).
pub fn normalise_domain(input: &str) -> Result<String, MalformedInput> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(MalformedInput::InvalidUrl(input.to_string()));
    }

    let host = if trimmed.contains("://") {
        url::Url::parse(trimmed)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .ok_or_else(|| MalformedInput::InvalidUrl(input.to_string()))?
    } else {
        // Bare host — strip any accidental path/query the caller left on.
        trimmed
            .split(['/', '?', '#'])
            .next()
            .unwrap_or(trimmed)
            .to_string()
    };

    let lower = host.to_lowercase();
    let stripped = lower.strip_prefix("www.").unwrap_or(&lower);
    if stripped.is_empty() {
        return Err(MalformedInput::InvalidUrl(input.to_string()));
    }
    Ok(stripped.to_string())
}

/// True when `host` equals `target_domain` or is a subdomain of it (spec §4.3 step 2:
/// "host equals `target_domain` or ends with `.target_domain`").
pub fn host_matches_target(host: &str, target_domain: &str) -> bool {
    let host = host.to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    host == target_domain || host.ends_with(&format!(".{target_domain}"))
}
