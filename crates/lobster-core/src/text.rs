//! Small text helpers shared across crates.
//!
//! All truncation is by `char`, never by byte, so multi-byte content can't
//! be split mid-codepoint.

/// Collapse every run of whitespace into a single space and trim both ends.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lowercase and collapse whitespace.
pub fn normalize(text: &str) -> String {
    collapse_whitespace(&text.to_lowercase())
}

/// Return at most `max_chars` characters of `text`.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Truncate to `max_chars`, replacing the tail with `...` when cut.
///
/// The result never exceeds `max_chars` characters.
pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    format!("{}...", truncate_chars(text, keep).trim_end())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
