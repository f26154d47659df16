//! Wildcard host pattern matching.
//!
//! Used by both the domain filter in the proxies and the SSH host filter.
//! Patterns are case-insensitive; `*` matches one or more label-safe
//! characters (letters, digits, `-`, `_`, `.`), so `*.example.com` matches
//! `api.example.com` and `a.b.example.com` but not `example.com` itself.
//! The bare pattern `*` matches any host.

/// Returns true if `pattern` matches `host`.
pub fn host_matches(pattern: &str, host: &str) -> bool {
    if pattern.is_empty() || host.is_empty() {
        return false;
    }
    if pattern == "*" {
        return true;
    }

    let pattern = pattern.to_ascii_lowercase();
    let host = host.to_ascii_lowercase();
    match_wildcard(pattern.as_bytes(), host.as_bytes())
}

/// Returns true if any entry in `patterns` matches `host`.
pub fn any_host_matches(patterns: &[String], host: &str) -> bool {
    patterns.iter().any(|p| host_matches(p, host))
}

fn is_label_safe(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.'
}

/// Backtracking matcher where `*` consumes one or more label-safe bytes.
fn match_wildcard(pattern: &[u8], host: &[u8]) -> bool {
    match pattern.first() {
        None => host.is_empty(),
        Some(b'*') => {
            // Consume at least one byte, then try every split point.
            for i in 1..=host.len() {
                if !is_label_safe(host[i - 1]) {
                    break;
                }
                if match_wildcard(&pattern[1..], &host[i..]) {
                    return true;
                }
            }
            false
        }
        Some(&c) => !host.is_empty() && host[0] == c && match_wildcard(&pattern[1..], &host[1..]),
    }
}
