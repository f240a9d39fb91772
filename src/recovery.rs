//! Best-effort recovery of JSON values from provider text.
//!
//! Providers asked for JSON still wrap it in prose, fence it in markdown, or
//! return a bare object where a list was expected. Recovery never retries
//! and never repairs syntax: it only locates the JSON-shaped part of the
//! text. Callers decide what a failure means.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

/// Number of characters of the raw text kept in error previews.
pub const PREVIEW_CHARS: usize = 150;

static FENCED_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```(?:json|JSON)?[ \t]*\r?\n?(.*?)```").expect("fenced block pattern")
});

#[derive(Debug, Clone, Error)]
pub enum RecoveryError {
    #[error("no JSON object could be recovered from response: {preview}")]
    NoObject { raw: String, preview: String },
    #[error("no JSON array could be recovered from response: {preview}")]
    NoArray { raw: String, preview: String },
}

impl RecoveryError {
    fn no_object(raw: &str) -> Self {
        Self::NoObject {
            raw: raw.to_string(),
            preview: preview(raw),
        }
    }

    fn no_array(raw: &str) -> Self {
        Self::NoArray {
            raw: raw.to_string(),
            preview: preview(raw),
        }
    }

    /// The trimmed text recovery was attempted on.
    pub fn raw(&self) -> &str {
        match self {
            Self::NoObject { raw, .. } | Self::NoArray { raw, .. } => raw,
        }
    }

    pub fn preview(&self) -> &str {
        match self {
            Self::NoObject { preview, .. } | Self::NoArray { preview, .. } => preview,
        }
    }
}

/// First [`PREVIEW_CHARS`] characters of `text`.
pub fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}

/// Recover a JSON object from `raw`.
///
/// Tried in order, first success wins:
/// 1. the trimmed text as-is,
/// 2. the inside of the first fenced code block,
/// 3. the first balanced `{...}` span, ignoring braces inside strings.
///
/// Arrays never count as success.
pub fn recover_object(raw: &str) -> Result<Map<String, Value>, RecoveryError> {
    let trimmed = raw.trim();

    if let Some(object) = parse_object(trimmed) {
        return Ok(object);
    }

    if let Some(object) = fenced_block(trimmed).and_then(parse_object) {
        return Ok(object);
    }

    if let Some(object) = balanced_span(trimmed, '{', '}').and_then(parse_object) {
        return Ok(object);
    }

    Err(RecoveryError::no_object(trimmed))
}

/// Recover a JSON array from `raw`.
///
/// A fenced block, when present, replaces the text. Then the direct parse,
/// the first balanced `[...]` and the first balanced `{...}` are tried in
/// that order. An object is accepted if one of its properties is an array
/// (the first such is returned) or if it looks like a single chart plan
/// (has both `chartType` and `title`), which is wrapped as a singleton.
pub fn recover_array(raw: &str) -> Result<Vec<Value>, RecoveryError> {
    let trimmed = raw.trim();
    let text = fenced_block(trimmed).unwrap_or(trimmed);

    let parsed = serde_json::from_str::<Value>(text)
        .ok()
        .or_else(|| balanced_span(text, '[', ']').and_then(|s| serde_json::from_str(s).ok()))
        .or_else(|| balanced_span(text, '{', '}').and_then(|s| serde_json::from_str(s).ok()));

    match parsed {
        Some(Value::Array(items)) => Ok(items),
        Some(Value::Object(object)) => {
            array_from_object(object).ok_or_else(|| RecoveryError::no_array(trimmed))
        }
        _ => Err(RecoveryError::no_array(trimmed)),
    }
}

fn array_from_object(object: Map<String, Value>) -> Option<Vec<Value>> {
    if let Some(items) = object.values().find_map(Value::as_array) {
        return Some(items.clone());
    }
    if object.contains_key("chartType") && object.contains_key("title") {
        return Some(vec![Value::Object(object)]);
    }
    None
}

fn parse_object(text: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(object)) => Some(object),
        _ => None,
    }
}

/// Inner text of the first fenced code block, if any.
pub fn fenced_block(text: &str) -> Option<&str> {
    FENCED_BLOCK
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
}

/// First balanced `open ... close` span in `text`.
///
/// Depth only moves on delimiters outside string literals; quote state
/// honours backslash escapes. Returns `None` when the first opening
/// delimiter is never closed.
pub fn balanced_span(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let remainder = &text[start..];

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;

    for (i, c) in remainder.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        if c == '\\' && in_string {
            escape = true;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        if c == open {
            depth += 1;
        } else if c == close {
            depth -= 1;
            if depth == 0 {
                return Some(&remainder[..i + c.len_utf8()]);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_pure() {
        let obj = recover_object(r#"{"actions": []}"#).unwrap();
        assert_eq!(Value::Object(obj), json!({"actions": []}));
    }

    #[test]
    fn object_in_fence_with_prose() {
        let raw = "Here is my answer:\n```json\n{\"intent\": \"aggregate\"}\n```\nHope that helps.";
        let obj = recover_object(raw).unwrap();
        assert_eq!(obj["intent"], "aggregate");
    }

    #[test]
    fn object_in_untagged_fence() {
        let raw = "```\n{\"a\": 1}\n```";
        assert_eq!(recover_object(raw).unwrap()["a"], 1);
    }

    #[test]
    fn object_embedded_in_prose() {
        let raw = r#"Sure! {"desc": "a {b} c", "x": 2} That's it."#;
        let obj = recover_object(raw).unwrap();
        assert_eq!(Value::Object(obj), json!({"desc": "a {b} c", "x": 2}));
    }

    #[test]
    fn braces_inside_escaped_strings_do_not_confuse_depth() {
        let raw = r#"Result: {"title": "Fix \"}\" thing", "n": {"m": 1}} trailing }"#;
        let obj = recover_object(raw).unwrap();
        assert_eq!(obj["title"], "Fix \"}\" thing");
        assert_eq!(obj["n"]["m"], 1);
    }

    #[test]
    fn array_is_not_an_object() {
        let err = recover_object("[1, 2, 3]").unwrap_err();
        assert!(matches!(err, RecoveryError::NoObject { .. }));
    }

    #[test]
    fn failure_exposes_trimmed_text() {
        let err = recover_object("   no json here at all   ").unwrap_err();
        assert_eq!(err.raw(), "no json here at all");
        assert_eq!(err.preview(), "no json here at all");
    }

    #[test]
    fn preview_is_capped() {
        let raw = "x".repeat(400);
        let err = recover_array(&raw).unwrap_err();
        assert_eq!(err.preview().chars().count(), PREVIEW_CHARS);
        assert_eq!(err.raw().len(), 400);
    }

    #[test]
    fn unclosed_object_fails() {
        assert!(recover_object(r#"{"a": {"b": 1}"#).is_err());
    }

    #[test]
    fn array_direct() {
        let items = recover_array(r#"[{"title": "a"}, {"title": "b"}]"#).unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn array_in_prose() {
        let raw = "Plans follow: [{\"title\": \"a [1]\"}] end";
        let items = recover_array(raw).unwrap();
        assert_eq!(items, vec![json!({"title": "a [1]"})]);
    }

    #[test]
    fn array_from_wrapper_object() {
        let raw = "```json\n{\"note\": \"x\", \"plans\": [{\"title\": \"a\"}]}\n```";
        let items = recover_array(raw).unwrap();
        assert_eq!(items, vec![json!({"title": "a"})]);
    }

    #[test]
    fn single_plan_object_is_wrapped() {
        let raw = r#"{"chartType": "bar", "title": "Sales by region"}"#;
        let items = recover_array(raw).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["chartType"], "bar");
    }

    #[test]
    fn object_without_array_or_plan_shape_fails() {
        let err = recover_array(r#"{"title": "only a title"}"#).unwrap_err();
        assert!(matches!(err, RecoveryError::NoArray { .. }));
    }

    #[test]
    fn broken_bracket_falls_back_to_object() {
        let raw = r#"See [note] then {"plans": [{"title": "a"}]}"#;
        let items = recover_array(raw).unwrap();
        assert_eq!(items, vec![json!({"title": "a"})]);
    }

    #[test]
    fn balanced_span_handles_multibyte_text() {
        let raw = "résumé → {\"k\": \"é\"} ✓";
        assert_eq!(balanced_span(raw, '{', '}'), Some("{\"k\": \"é\"}"));
    }
}
