//! Quick-tunnel readiness URL extraction.
//!
//! The agent announces readiness by printing its assigned public URL, a
//! single-label subdomain of `trycloudflare.com`, somewhere in its output.
//! The agent also logs API endpoints under the same zone, so the `api`
//! label is blacklisted.

use std::sync::OnceLock;

use regex::Regex;

/// Subdomain labels that are never session URLs.
const LABEL_BLACKLIST: &[&str] = &["api"];

fn url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"https://([A-Za-z0-9-]+)\.trycloudflare\.com").expect("readiness regex compiles")
    })
}

/// Scan one output line for the first valid quick-tunnel URL.
pub fn extract_quick_tunnel_url(line: &str) -> Option<String> {
    for captures in url_regex().captures_iter(line) {
        let label = &captures[1];
        if LABEL_BLACKLIST.contains(&label.to_ascii_lowercase().as_str()) {
            continue;
        }
        return Some(format!("https://{}.trycloudflare.com", label));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_url_from_noise() {
        let line = "2026-08-02T10:00:00Z INF |  https://witty-otter-demo.trycloudflare.com  |";
        assert_eq!(
            extract_quick_tunnel_url(line),
            Some("https://witty-otter-demo.trycloudflare.com".to_string())
        );
    }

    #[test]
    fn test_blacklisted_label_is_skipped() {
        assert_eq!(
            extract_quick_tunnel_url("connecting to https://api.trycloudflare.com"),
            None
        );
        // A valid URL later on the same line still wins.
        let line = "https://api.trycloudflare.com then https://real-one.trycloudflare.com";
        assert_eq!(
            extract_quick_tunnel_url(line),
            Some("https://real-one.trycloudflare.com".to_string())
        );
    }

    #[test]
    fn test_multi_label_subdomain_is_single_label_only() {
        // The regex captures the innermost label; `a.b.trycloudflare.com`
        // yields `b` which is a valid single label.
        assert_eq!(
            extract_quick_tunnel_url("https://a.b.trycloudflare.com"),
            Some("https://b.trycloudflare.com".to_string())
        );
    }

    #[test]
    fn test_no_url_in_line() {
        assert_eq!(extract_quick_tunnel_url("starting tunnel"), None);
        assert_eq!(
            extract_quick_tunnel_url("https://example.com/x"),
            None
        );
    }
}
