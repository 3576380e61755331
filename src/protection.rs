//! Anti-automation protection classifier
//!
//! Maps an HTTP outcome (status code + body text) to a blocking category.
//! The rule table is ordered: explicit status-code rules run before generic
//! keyword scanning, so tie-breaks are deterministic and unit-testable.
//! Classification is a pure function with no side effects.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionKind {
    None,
    RateLimited,
    Captcha,
    CloudflareChallenge,
    JsChallenge,
    AccessDenied,
    Unknown,
}

impl ProtectionKind {
    /// Challenge-class blocks cannot be resolved by retrying.
    pub fn needs_manual_intervention(self) -> bool {
        matches!(
            self,
            ProtectionKind::Captcha
                | ProtectionKind::CloudflareChallenge
                | ProtectionKind::JsChallenge
        )
    }

    pub fn diagnostic_code(self) -> &'static str {
        match self {
            ProtectionKind::None => "none",
            ProtectionKind::RateLimited => "protection_rate_limited",
            ProtectionKind::Captcha => "protection_captcha",
            ProtectionKind::CloudflareChallenge => "protection_cloudflare",
            ProtectionKind::JsChallenge => "protection_js_challenge",
            ProtectionKind::AccessDenied => "protection_access_denied",
            ProtectionKind::Unknown => "protection_unknown",
        }
    }
}

impl fmt::Display for ProtectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProtectionKind::None => "none",
            ProtectionKind::RateLimited => "rate-limit",
            ProtectionKind::Captcha => "CAPTCHA",
            ProtectionKind::CloudflareChallenge => "Cloudflare challenge",
            ProtectionKind::JsChallenge => "JavaScript challenge",
            ProtectionKind::AccessDenied => "access-denied",
            ProtectionKind::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Result of classifying one HTTP outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub kind: ProtectionKind,
    /// 401 responses are authentication failures, not protection blocks;
    /// the executor re-authenticates instead of retrying.
    pub authentication: bool,
    pub site_key: Option<String>,
    /// Server-suggested wait before the next attempt.
    pub retry_after: Option<Duration>,
    pub markers: Vec<&'static str>,
}

impl Classification {
    fn of(kind: ProtectionKind) -> Self {
        Self {
            kind,
            authentication: false,
            site_key: None,
            retry_after: None,
            markers: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind == ProtectionKind::None && !self.authentication
    }
}

const CLOUDFLARE_MARKERS: &[&str] = &["cloudflare", "cf-ray", "challenge-form", "jschl-answer"];
const CAPTCHA_MARKERS: &[&str] = &["g-recaptcha", "recaptcha", "hcaptcha", "captcha"];
const BLOCK_MARKERS: &[&str] = &["ddos", "protection"];
const RATE_LIMIT_MARKERS: &[&str] = &["rate limit", "too many requests"];

/// Classify one HTTP outcome. `retry_after` is the raw `Retry-After` header
/// value when the server sent one.
pub fn classify(status: u16, body: &str, retry_after: Option<&str>) -> Classification {
    let content = body.to_lowercase();

    // Status-code rules first.
    if status == 401 {
        let mut c = Classification::of(ProtectionKind::Unknown);
        c.authentication = true;
        return c;
    }

    if status == 429 {
        let mut c = Classification::of(ProtectionKind::RateLimited);
        c.retry_after = parse_retry_after(retry_after);
        return c;
    }

    if status == 403 {
        let markers = matched_markers(&content, CLOUDFLARE_MARKERS);
        if !markers.is_empty() {
            let mut c = Classification::of(ProtectionKind::CloudflareChallenge);
            c.markers = markers;
            return c;
        }
    }

    // Keyword rules, in priority order.
    let captcha_markers = matched_markers(&content, CAPTCHA_MARKERS);
    if !captcha_markers.is_empty() {
        let mut c = Classification::of(ProtectionKind::Captcha);
        c.markers = captcha_markers;
        c.site_key = extract_site_key(&content);
        return c;
    }

    if content.contains("<script>") && content.contains("challenge") {
        let mut c = Classification::of(ProtectionKind::JsChallenge);
        c.markers = vec!["challenge"];
        return c;
    }

    let rate_markers = matched_markers(&content, RATE_LIMIT_MARKERS);
    if !rate_markers.is_empty() {
        let mut c = Classification::of(ProtectionKind::RateLimited);
        c.markers = rate_markers;
        c.retry_after = parse_retry_after(retry_after);
        return c;
    }

    let block_markers = matched_markers(&content, BLOCK_MARKERS);
    if !block_markers.is_empty() {
        let mut c = Classification::of(ProtectionKind::AccessDenied);
        c.markers = block_markers;
        return c;
    }

    if status == 403 {
        return Classification::of(ProtectionKind::AccessDenied);
    }

    if (200..300).contains(&status) {
        return Classification::of(ProtectionKind::None);
    }

    Classification::of(ProtectionKind::Unknown)
}

fn matched_markers(content: &str, markers: &[&'static str]) -> Vec<&'static str> {
    markers
        .iter()
        .filter(|m| content.contains(**m))
        .copied()
        .collect()
}

fn parse_retry_after(header: Option<&str>) -> Option<Duration> {
    header
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Pull a `sitekey: "..."` / `sitekey = '...'` value out of challenge markup.
fn extract_site_key(content: &str) -> Option<String> {
    let idx = content.find("sitekey")?;
    let rest = &content[idx + "sitekey".len()..];
    let rest = rest.trim_start_matches(|c: char| {
        c.is_whitespace() || c == ':' || c == '=' || c == '"' || c == '\''
    });
    let end = rest.find(|c: char| c == '"' || c == '\'' || c == '<' || c.is_whitespace())?;
    let key = &rest[..end];
    if key.is_empty() {
        None
    } else {
        Some(key.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_classifies_as_none() {
        let c = classify(200, r#"{"result": true}"#, None);
        assert_eq!(c.kind, ProtectionKind::None);
        assert!(c.is_success());
    }

    #[test]
    fn test_429_is_rate_limited_regardless_of_body() {
        for body in ["", "<html>captcha</html>", "anything at all"] {
            let c = classify(429, body, None);
            assert_eq!(c.kind, ProtectionKind::RateLimited);
        }
    }

    #[test]
    fn test_429_carries_retry_after() {
        let c = classify(429, "", Some("120"));
        assert_eq!(c.retry_after, Some(Duration::from_secs(120)));

        let c = classify(429, "", Some("not-a-number"));
        assert_eq!(c.retry_after, None);
    }

    #[test]
    fn test_401_is_authentication() {
        let c = classify(401, "", None);
        assert!(c.authentication);
        assert!(!c.is_success());
    }

    #[test]
    fn test_403_with_cloudflare_markers() {
        let c = classify(403, "<html>Checking your browser... cf-ray: abc</html>", None);
        assert_eq!(c.kind, ProtectionKind::CloudflareChallenge);
        assert!(c.markers.contains(&"cf-ray"));
    }

    #[test]
    fn test_403_with_captcha_keyword_is_captcha_not_access_denied() {
        let c = classify(403, "<html>please solve the captcha below</html>", None);
        assert_eq!(c.kind, ProtectionKind::Captcha);
    }

    #[test]
    fn test_cloudflare_rule_wins_over_captcha_on_403() {
        // Both marker sets present: the status-code rule is checked first.
        let c = classify(403, "cloudflare challenge-form with captcha", None);
        assert_eq!(c.kind, ProtectionKind::CloudflareChallenge);
    }

    #[test]
    fn test_bare_403_is_access_denied() {
        let c = classify(403, "forbidden", None);
        assert_eq!(c.kind, ProtectionKind::AccessDenied);
    }

    #[test]
    fn test_site_key_extraction() {
        let c = classify(
            403,
            r#"<div class="g-recaptcha" sitekey: "6LfABCDEF-ghijk">"#,
            None,
        );
        assert_eq!(c.kind, ProtectionKind::Captcha);
        assert_eq!(c.site_key.as_deref(), Some("6lfabcdef-ghijk"));
    }

    #[test]
    fn test_js_challenge() {
        let c = classify(503, "<script>runChallenge()</script> challenge page", None);
        assert_eq!(c.kind, ProtectionKind::JsChallenge);
    }

    #[test]
    fn test_ddos_keywords_are_generic_block() {
        let c = classify(503, "ddos mitigation in progress", None);
        assert_eq!(c.kind, ProtectionKind::AccessDenied);
    }

    #[test]
    fn test_unmatched_server_error_is_unknown() {
        let c = classify(500, "internal server error", None);
        assert_eq!(c.kind, ProtectionKind::Unknown);
    }

    #[test]
    fn test_deterministic() {
        let a = classify(403, "captcha here", None);
        let b = classify(403, "captcha here", None);
        assert_eq!(a, b);
    }
}
