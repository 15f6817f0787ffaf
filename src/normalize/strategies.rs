//! JSON extraction strategies, tried in order from strict to permissive.
//!
//! Each strategy is a pure `text -> Option<Value>`; the caller decodes the
//! value against the expected shape and moves on when decoding rejects it.

use crate::subject::Shape;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

pub type Strategy = fn(&str, Shape) -> Option<Value>;

/// The cascade, in the order it is tried.
pub const STRATEGIES: [(&str, Strategy); 4] = [
    ("direct", parse_direct),
    ("fenced", parse_fenced),
    ("anchored", parse_anchored),
    ("bracketed", parse_bracketed),
];

static FENCED_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[a-zA-Z]*\s*(.*?)```").expect("valid regex"));

static TREE_ANCHOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\{\s*"root"\s*:"#).expect("valid regex"));

static LIST_ANCHOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\[\s*\{\s*"name"\s*:"#).expect("valid regex"));

static TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",(\s*[\]}])").expect("valid regex"));

/// 1. The whole text is JSON.
fn parse_direct(text: &str, _shape: Shape) -> Option<Value> {
    parse_lenient(text.trim())
}

/// 2. JSON inside markdown code fences.
fn parse_fenced(text: &str, _shape: Shape) -> Option<Value> {
    if let Some(caps) = FENCED_BLOCK.captures(text) {
        if let Some(value) = caps.get(1).and_then(|m| parse_lenient(m.as_str().trim())) {
            return Some(value);
        }
    }
    // Unterminated fence (response cut off after the JSON)
    let stripped = strip_markdown_fences(text);
    if stripped.len() != text.trim().len() {
        return parse_lenient(stripped);
    }
    None
}

/// 3. The exact opening token of the expected shape, matched to its close.
fn parse_anchored(text: &str, shape: Shape) -> Option<Value> {
    let anchor = match shape {
        Shape::Influences => &*TREE_ANCHOR,
        Shape::Recommendations => &*LIST_ANCHOR,
    };
    anchor.find_iter(text).find_map(|m| {
        let end = balanced_end(text, m.start())?;
        parse_lenient(&text[m.start()..=end])
    })
}

/// 4. First opening bracket to the last matching closing bracket.
fn parse_bracketed(text: &str, _shape: Shape) -> Option<Value> {
    let array_first = match (text.find('['), text.find('{')) {
        (Some(a), Some(o)) => a < o,
        (Some(_), None) => true,
        _ => false,
    };
    let order = if array_first {
        [('[', ']'), ('{', '}')]
    } else {
        [('{', '}'), ('[', ']')]
    };
    order
        .iter()
        .filter_map(|&(open, close)| extract_json_fragment(text, open, close))
        .find_map(parse_lenient)
}

/// Parse as-is, then once more after sanitizing near-miss JSON.
fn parse_lenient(candidate: &str) -> Option<Value> {
    if candidate.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<Value>(candidate) {
        return Some(value);
    }
    let fixed = fix_json_issues(candidate);
    if fixed != candidate {
        return serde_json::from_str::<Value>(&fixed).ok();
    }
    None
}

/// Strip markdown code fences from a response
pub fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = if trimmed.starts_with("```json") {
        trimmed.strip_prefix("```json").unwrap_or(trimmed)
    } else if trimmed.starts_with("```") {
        trimmed.strip_prefix("```").unwrap_or(trimmed)
    } else {
        trimmed
    };
    let clean = if clean.ends_with("```") {
        clean.strip_suffix("```").unwrap_or(clean)
    } else {
        clean
    };
    clean.trim()
}

/// Extract a JSON fragment between matching delimiters
pub fn extract_json_fragment(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if start <= end {
        Some(&text[start..=end])
    } else {
        None
    }
}

/// Fix common JSON issues from LLM responses
pub fn fix_json_issues(json: &str) -> String {
    let mut fixed = json.to_string();

    // Smart quotes to regular quotes
    fixed = fixed.replace(['\u{201C}', '\u{201D}'], "\"");
    fixed = fixed.replace(['\u{2018}', '\u{2019}'], "'");

    fixed = TRAILING_COMMA.replace_all(&fixed, "$1").into_owned();

    fixed
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t' || *c == '\r')
        .collect()
}

/// Byte index of the bracket closing the one at `start`, skipping string
/// contents. `None` when the text ends first.
pub fn balanced_end(text: &str, start: usize) -> Option<usize> {
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset);
                }
                if depth < 0 {
                    return None;
                }
            }
            _ => {}
        }
    }
    None
}
