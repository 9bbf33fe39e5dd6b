//! Scrubbing of backend error text before it is persisted.
//!
//! Backend failures often echo request headers or connection strings. Fallback
//! events keep only a redacted, single-line, bounded summary.

use regex::Regex;
use std::sync::LazyLock;

/// Upper bound on a persisted error summary, in characters.
pub const MAX_SUMMARY_CHARS: usize = 240;

static SECRET_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        // Provider API keys (sk-..., xai-..., pplx-...)
        (r"\b(sk|xai|pplx)-[A-Za-z0-9_\-]{20,}", "[API_KEY_REDACTED]"),
        // Bearer tokens
        (r"(?i)bearer\s+[a-zA-Z0-9_\-\.]{20,}", "[BEARER_REDACTED]"),
        // AWS Access Key ID
        (
            r"(A3T[A-Z0-9]|AKIA|AGPA|AIDA|AROA|AIPA|ANPA|ANVA|ASIA)[0-9A-Z]{16}",
            "[AWS_KEY_REDACTED]",
        ),
        // Connection strings with inline credentials
        (
            r#"(?i)(postgres|mysql|mongodb|redis|https?)://[^\s'"]+:[^\s'"]+@[^\s'"]+"#,
            "[CONNECTION_STRING_REDACTED]",
        ),
        // Generic key assignments
        (
            r#"(?i)(api[_-]?key|apikey|api_secret|secret[_-]?key|access[_-]?token)['"]?\s*[:=]\s*['"]?[a-zA-Z0-9_\-]{16,}['"]?"#,
            "[API_KEY_REDACTED]",
        ),
        // Password assignments
        (
            r#"(?i)(password|passwd|pwd)['"]?\s*[:=]\s*['"]?[^\s'"]{8,}['"]?"#,
            "[PASSWORD_REDACTED]",
        ),
    ]
    .into_iter()
    .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, replacement)))
    .collect()
});

/// Redact secrets from a plain string value.
pub fn redact_string(input: &str) -> String {
    let mut result = input.to_string();
    for (pattern, replacement) in SECRET_PATTERNS.iter() {
        result = pattern.replace_all(&result, *replacement).to_string();
    }
    result
}

/// Redacted, single-line, length-bounded form of an error message.
pub fn summarize_error(message: &str) -> String {
    let flat = redact_string(message)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if flat.chars().count() <= MAX_SUMMARY_CHARS {
        return flat;
    }
    let mut out: String = flat.chars().take(MAX_SUMMARY_CHARS - 1).collect();
    out.push('…');
    out
}
