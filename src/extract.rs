//! Tolerant extraction of structured content from raw model output.
//!
//! Models wrap their answers in XML-ish tags or markdown code fences, and
//! get it wrong often enough that strict parsing is not an option. Both
//! entry points here degrade instead of failing: a sentinel string for
//! missing tags, an empty JSON object for unparseable JSON.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Returned by [`extract_tag`] when the tags are absent or unrecoverable.
pub const MISSING_TAG_SENTINEL: &str = "###";

static JSON_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```json[ \t]*\n(?s)(.*?)\n?```").unwrap());
static ANY_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```\w*[ \t]*\n(?s)(.*?)\n?(?:```|\z)").unwrap());
static LINE_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)//.*$").unwrap());
static BLOCK_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)/\*.*?\*/").unwrap());

fn find_all(haystack: &str, needle: &str) -> Vec<usize> {
    let mut indices = Vec::new();
    let mut from = 0;
    while let Some(pos) = haystack[from..].find(needle) {
        indices.push(from + pos);
        from += pos + needle.len();
    }
    indices
}

/// Extracts the content of every `<tag>...</tag>` pair in `text`, joined
/// with newlines.
///
/// When the counts are off by exactly one the missing tag is assumed to sit
/// at the corresponding end of the string and the content is recovered from
/// there. Anything more broken yields [`MISSING_TAG_SENTINEL`].
pub fn extract_tag(text: &str, tag: &str) -> String {
    let opening = format!("<{}>", tag);
    let closing = format!("</{}>", tag);

    let opening_indices = find_all(text, &opening);
    let closing_indices = find_all(text, &closing);

    // Balanced pairs first: each opening tag paired with the nearest
    // closing tag after it.
    let mut segments = Vec::new();
    let mut pos = 0;
    while let Some(open_rel) = text[pos..].find(&opening) {
        let content_start = pos + open_rel + opening.len();
        match text[content_start..].find(&closing) {
            Some(close_rel) => {
                let content_end = content_start + close_rel;
                segments.push(text[content_start..content_end].trim().to_string());
                pos = content_end + closing.len();
            }
            None => break,
        }
    }
    if !segments.is_empty() {
        return segments.join("\n");
    }

    let opening_count = opening_indices.len();
    let closing_count = closing_indices.len();

    // One more closing than opening: the first opening tag is missing, so
    // the first segment starts at the beginning of the string.
    if closing_count == opening_count + 1 {
        log::warn!(
            "Missing first opening tag <{}>, attempting recovery:\n{}",
            tag,
            text
        );
        let mut recovered = vec![text[..closing_indices[0]].trim().to_string()];
        for (i, open_at) in opening_indices.iter().enumerate() {
            let start = open_at + opening.len();
            let end = closing_indices[i + 1];
            recovered.push(text[start..end].trim().to_string());
        }
        return recovered.join("\n");
    }

    // One more opening than closing: the final closing tag is missing, so
    // the last segment runs to the end of the string.
    if opening_count == closing_count + 1 {
        log::warn!(
            "Missing last closing tag </{}>, attempting recovery:\n{}",
            tag,
            text
        );
        let mut recovered = Vec::new();
        for (i, close_at) in closing_indices.iter().enumerate() {
            let start = opening_indices[i] + opening.len();
            recovered.push(text[start..*close_at].trim().to_string());
        }
        let last_start = opening_indices[opening_count - 1] + opening.len();
        recovered.push(text[last_start..].trim().to_string());
        return recovered.join("\n");
    }

    if opening_count == 0 && closing_count == 0 {
        log::warn!("No <{}> tags found:\n{}", tag, text);
    } else {
        log::warn!(
            "Tags too malformed to recover (opening: {}, closing: {}):\n{}",
            opening_count,
            closing_count,
            text
        );
    }
    MISSING_TAG_SENTINEL.to_string()
}

fn strip_comments(text: &str) -> String {
    let without_line = LINE_COMMENT.replace_all(text, "");
    BLOCK_COMMENT.replace_all(&without_line, "").into_owned()
}

fn parse_with_comment_retry(candidate: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str(candidate) {
        return Some(value);
    }
    serde_json::from_str(&strip_comments(candidate)).ok()
}

/// Finds the first balanced `{...}` or `[...]` span in `text`, skipping
/// brackets inside string literals.
fn balanced_span(text: &str) -> Option<&str> {
    for (open, close) in [('{', '}'), ('[', ']')] {
        let start = match text.find(open) {
            Some(i) => i,
            None => continue,
        };

        let mut depth = 0usize;
        let mut in_string = false;
        let mut escape_next = false;

        for (i, ch) in text[start..].char_indices() {
            if escape_next {
                escape_next = false;
                continue;
            }
            match ch {
                '\\' => escape_next = true,
                '"' => in_string = !in_string,
                c if !in_string && c == open => depth += 1,
                c if !in_string && c == close => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(&text[start..start + i + close.len_utf8()]);
                    }
                }
                _ => {}
            }
        }
    }
    None
}

/// Extracts the first JSON value from raw model output.
///
/// Tries a ```json fence, then any code fence, then a raw balanced
/// object/array scan; each stage retries after stripping JS-style comments.
/// Returns an empty object (and logs the raw output) if nothing parses.
pub fn extract_json(text: &str) -> Value {
    if let Some(caps) = JSON_FENCE.captures(text) {
        if let Ok(value) = serde_json::from_str::<Value>(caps[1].trim()) {
            return value;
        }
    }

    for caps in ANY_FENCE.captures_iter(text) {
        if let Some(value) = parse_with_comment_retry(caps[1].trim()) {
            return value;
        }
    }

    if let Some(span) = balanced_span(text) {
        if let Some(value) = parse_with_comment_retry(span) {
            return value;
        }
    }

    log::error!("No valid JSON found in model output. Raw response:\n{}", text);
    Value::Object(serde_json::Map::new())
}
