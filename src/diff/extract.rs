//! Pull a unified diff out of free-form model output.

use regex::Regex;
use std::sync::LazyLock;

pub const BEGIN_MARK: &str = "BEGIN_PATCH";
pub const END_MARK: &str = "END_PATCH";

static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[^\n`]*\n(.*?)```").expect("fence regex"));

/// Extract a diff, trying in order: the `BEGIN_PATCH`/`END_PATCH` region,
/// the first fenced block that looks like a diff, the raw text if it looks
/// like a diff. Returns an empty string when none of these apply.
pub fn extract_diff(text: &str) -> String {
    if let Some(inner) = between_markers(text) {
        let inner = first_fenced_diff(inner).unwrap_or(inner);
        return trim_block(inner).to_string();
    }
    if let Some(block) = first_fenced_diff(text) {
        return trim_block(block).to_string();
    }
    if looks_like_diff(text) {
        return trim_block(text).to_string();
    }
    String::new()
}

/// Heuristic: a `diff --git` line, an `@@` hunk marker, or both `--- ` and `+++ ` lines.
pub fn looks_like_diff(text: &str) -> bool {
    let mut has_old = false;
    let mut has_new = false;
    for line in text.lines() {
        if line.starts_with("diff --git") || line.starts_with("@@") {
            return true;
        }
        has_old |= line.starts_with("--- ");
        has_new |= line.starts_with("+++ ");
    }
    has_old && has_new
}

/// Text after `BEGIN_PATCH` up to `END_PATCH`. A reply cut off before the end
/// marker still yields everything after the begin marker.
fn between_markers(text: &str) -> Option<&str> {
    let start = text.find(BEGIN_MARK)? + BEGIN_MARK.len();
    let rest = &text[start..];
    match rest.find(END_MARK) {
        Some(end) => Some(&rest[..end]),
        None => Some(rest.trim_end().trim_end_matches("```")),
    }
}

fn first_fenced_diff(text: &str) -> Option<&str> {
    FENCE_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
        .find(|body| looks_like_diff(body))
}

/// Drop blank lines before the body and line breaks after it. Trailing spaces
/// are kept: a lone " " is a legitimate empty context line.
fn trim_block(text: &str) -> &str {
    let mut start = 0;
    for line in text.split_inclusive('\n') {
        if line.trim().is_empty() {
            start += line.len();
        } else {
            break;
        }
    }
    text[start..].trim_end_matches(['\n', '\r'])
}
