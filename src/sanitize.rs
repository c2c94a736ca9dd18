//! Cleans marketing parameter values before they are stored or sent to the CRM.

use once_cell::sync::Lazy;
use regex::Regex;

/// Longest value kept for a single marketing parameter.
pub(crate) const DEFAULT_MAX_VALUE_LENGTH: usize = 200;

/// Trailing text glued onto tagged links by QA runs ("... Expected First-Touch: ...").
static TRAILING_MARKERS: Lazy<[Regex; 2]> = Lazy::new(|| {
    [
        Regex::new(r"(?i)\s+Expected").expect("expected-marker pattern is valid"),
        Regex::new(r"(?i)\s+Test").expect("test-marker pattern is valid"),
    ]
});

/// Strips concatenated test markers, trims, and truncates to `max_len` characters.
///
/// Over-long values are truncated with a warning, never rejected.
pub(crate) fn sanitize_value(value: &str, max_len: usize) -> String {
    let mut sanitized = value;
    for marker in TRAILING_MARKERS.iter() {
        if let Some(found) = marker.find(sanitized) {
            sanitized = &sanitized[..found.start()];
        }
    }
    let sanitized = sanitized.trim();

    if sanitized.chars().count() > max_len {
        let preview: String = value.chars().take(50).collect();
        tracing::warn!(
            "Attribution value exceeded {} characters, truncating: {}...",
            max_len,
            preview
        );
        return sanitized.chars().take(max_len).collect();
    }

    sanitized.to_string()
}

/// Sanitizes an optional value, treating an empty result as absent.
pub(crate) fn sanitize_optional(value: Option<&str>, max_len: usize) -> Option<String> {
    value
        .map(|v| sanitize_value(v, max_len))
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncates_long_values() {
        let value = "a".repeat(250);
        let sanitized = sanitize_value(&value, DEFAULT_MAX_VALUE_LENGTH);
        assert_eq!(sanitized.len(), 200);
    }

    #[test]
    fn test_strips_expected_marker() {
        assert_eq!(
            sanitize_value(
                "ad-variant-a Expected First-Touch: google-ads/cpc/diploma-2026",
                DEFAULT_MAX_VALUE_LENGTH
            ),
            "ad-variant-a"
        );
        assert_eq!(
            sanitize_value("ad-variant-a Expected Test Data", DEFAULT_MAX_VALUE_LENGTH),
            "ad-variant-a"
        );
    }

    #[test]
    fn test_strips_test_marker_case_insensitively() {
        assert_eq!(
            sanitize_value("diploma-2026   test run 4", DEFAULT_MAX_VALUE_LENGTH),
            "diploma-2026"
        );
    }

    #[test]
    fn test_leaves_clean_values_alone() {
        assert_eq!(sanitize_value("google", DEFAULT_MAX_VALUE_LENGTH), "google");
        assert_eq!(sanitize_value("  cpc  ", DEFAULT_MAX_VALUE_LENGTH), "cpc");
        // Markers only count when separated by whitespace.
        assert_eq!(
            sanitize_value("UnexpectedTesting", DEFAULT_MAX_VALUE_LENGTH),
            "UnexpectedTesting"
        );
    }

    #[test]
    fn test_truncation_counts_characters() {
        let value = "é".repeat(210);
        let sanitized = sanitize_value(&value, DEFAULT_MAX_VALUE_LENGTH);
        assert_eq!(sanitized.chars().count(), 200);
    }

    #[test]
    fn test_optional_empty_becomes_absent() {
        assert_eq!(sanitize_optional(Some(" Expected x"), 200), None);
        assert_eq!(sanitize_optional(None, 200), None);
        assert_eq!(sanitize_optional(Some("fb"), 200).as_deref(), Some("fb"));
    }
}
