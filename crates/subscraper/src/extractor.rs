//! Hostname extraction from arbitrary provider payloads.
//!
//! One compiled pattern finds hostname-shaped tokens, then each token is kept only if it is
//! bounded (not a slice of a longer name) and belongs to the queried domain.

use lazy_regex::{regex, Regex};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy)]
pub struct Extractor {
    pattern: &'static Regex,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new()
    }
}

impl Extractor {
    pub fn new() -> Self {
        Self {
            pattern: regex!(
                r"(?i)(?:[a-z0-9_](?:[a-z0-9_-]{0,61}[a-z0-9_])?\.)+[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?"
            ),
        }
    }

    /// Every distinct hostname of `text` that is `domain` itself or one of its subdomains,
    /// lowercased, in order of first appearance.
    pub fn find_all<'a>(&'a self, text: &'a str, domain: &str) -> impl Iterator<Item = String> + 'a {
        let domain = normalize(domain);
        let mut seen = HashSet::new();

        self.pattern
            .find_iter(text)
            .filter(move |found| is_bounded(text, found.start(), found.end()))
            .map(|found| found.as_str().to_ascii_lowercase())
            .filter(move |host| is_subdomain_of(host, &domain) && seen.insert(host.clone()))
    }

    pub fn find_string(&self, text: &str, domain: &str) -> Option<String> {
        self.find_all(text, domain).next()
    }
}

// region:        --- Hostname utils

/// Lowercase, trimmed, without the trailing root dot.
pub fn normalize(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// `host` equals `domain` or ends with `.domain`. Both sides are expected normalized.
pub fn is_subdomain_of(host: &str, domain: &str) -> bool {
    if domain.is_empty() {
        return false;
    }
    match host.strip_suffix(domain) {
        Some(rest) => rest.is_empty() || rest.ends_with('.'),
        None => false,
    }
}

/// Syntactic DNS check: non-empty labels of at most 63 chars, no leading/trailing hyphen.
pub fn is_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    })
}

fn is_label_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_'
}

// a match glued to more name characters is a fragment of another name, except behind "*."
fn is_bounded(text: &str, start: usize, end: usize) -> bool {
    let bytes = text.as_bytes();
    let before = match start.checked_sub(1).map(|i| bytes[i]) {
        None => true,
        Some(b'.') => start >= 2 && bytes[start - 2] == b'*',
        Some(b) => !is_label_byte(b),
    };
    let after = bytes.get(end).map_or(true, |&b| !is_label_byte(b));
    before && after
}

// endregion:     --- Hostname utils

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_subdomains_in_html() {
        let extractor = Extractor::new();
        let html = r#"<a href="https://www.example.com/login">x</a> mail.Example.COM api.example.com"#;

        let found: Vec<String> = extractor.find_all(html, "example.com").collect();

        assert_eq!(
            found,
            vec!["www.example.com", "mail.example.com", "api.example.com"]
        );
    }

    #[test]
    fn rejects_unanchored_suffix() {
        let extractor = Extractor::new();
        let text = "notexample.com www.notexample.com example.com.evil.net";

        assert_eq!(extractor.find_all(text, "example.com").count(), 0);
    }

    #[test]
    fn dedups_within_a_call() {
        let extractor = Extractor::new();
        let text = "a.example.com\nA.EXAMPLE.COM\na.example.com.";

        let found: Vec<String> = extractor.find_all(text, "example.com").collect();

        assert_eq!(found, vec!["a.example.com"]);
    }

    #[test]
    fn wildcard_entry_yields_the_domain() {
        let extractor = Extractor::new();

        assert_eq!(
            extractor.find_string("*.example.com", "example.com"),
            Some("example.com".to_string())
        );
        assert_eq!(
            extractor.find_string("*.dev.example.com", "example.com"),
            Some("dev.example.com".to_string())
        );
    }

    #[test]
    fn find_string_is_none_without_match() {
        let extractor = Extractor::new();

        assert_eq!(extractor.find_string("nothing to see", "example.com"), None);
        assert_eq!(extractor.find_string("other.org", "example.com"), None);
    }

    #[test]
    fn nested_domain_filter() {
        let extractor = Extractor::new();
        let text = "a.x.example.com b.example.com x.example.com";

        let found: Vec<String> = extractor.find_all(text, "x.example.com").collect();

        assert_eq!(found, vec!["a.x.example.com", "x.example.com"]);
    }

    #[test]
    fn suffix_check() {
        assert!(is_subdomain_of("www.example.com", "example.com"));
        assert!(is_subdomain_of("example.com", "example.com"));
        assert!(!is_subdomain_of("notexample.com", "example.com"));
        assert!(!is_subdomain_of("example.com", ""));
    }

    #[test]
    fn hostname_syntax() {
        assert!(is_hostname("www.example.com"));
        assert!(is_hostname("_dmarc.example.com"));
        assert!(!is_hostname("-bad.example.com"));
        assert!(!is_hostname("a..example.com"));
        assert!(!is_hostname("sp ace.example.com"));
        assert!(!is_hostname(&format!("{}.example.com", "a".repeat(64))));
    }

    #[test]
    fn normalizes() {
        assert_eq!(normalize(" WWW.Example.com. "), "www.example.com");
    }
}
