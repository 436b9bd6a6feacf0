//! Canonical product names from `User-Agent` headers.
//!
//! Registry clients identify themselves with a leading product token
//! (`docker/27.1.1 go/go1.22.5 ...`, `containerd/1.7.20`, `skopeo/1.15.1`).
//! Browsers all claim to be `Mozilla/5.0`, so they are recognised by their
//! distinguishing tokens first.

use once_cell::sync::Lazy;
use regex::Regex;

/// Ordered: the first match wins, so more specific engines come first.
static BROWSER_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (Regex::new(r"\bEdg(e|A|iOS)?/").expect("valid regex"), "Edge"),
        (Regex::new(r"\b(OPR|Opera)/").expect("valid regex"), "Opera"),
        (Regex::new(r"\bFirefox/").expect("valid regex"), "Firefox"),
        (Regex::new(r"\b(Chrome|CriOS|Chromium)/").expect("valid regex"), "Chrome"),
        (Regex::new(r"\bVersion/[\d.]+.*\bSafari/").expect("valid regex"), "Safari"),
    ]
});

static PRODUCT_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*([A-Za-z0-9][A-Za-z0-9._+-]*)").expect("valid regex"));

/// Extract the canonical product name of a `User-Agent` value.
///
/// Returns `None` for empty or unparseable values.
pub fn product_name(user_agent: &str) -> Option<String> {
    let user_agent = user_agent.trim();
    if user_agent.is_empty() {
        return None;
    }

    if user_agent.starts_with("Mozilla/") {
        if let Some((_, name)) = BROWSER_PATTERNS
            .iter()
            .find(|(pattern, _)| pattern.is_match(user_agent))
        {
            return Some((*name).to_string());
        }
    }

    PRODUCT_TOKEN
        .captures(user_agent)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}
