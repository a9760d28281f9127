//! Structured-answer recovery from free-form agent replies

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)\s*```").expect("fence pattern is valid")
});

/// Recover the single JSON object embedded in `text`.
///
/// A fenced code block wins if its body parses as an object. Otherwise the
/// text is scanned for balanced `{...}` spans (string literals and escapes
/// respected) and the first span that parses is returned. Malformed spans are
/// skipped rather than ending the search.
pub fn extract(text: &str) -> Option<Map<String, Value>> {
    if let Some(body) = FENCED_BLOCK.captures(text).and_then(|c| c.get(1)) {
        if let Ok(Value::Object(map)) = serde_json::from_str(body.as_str()) {
            return Some(map);
        }
    }

    let bytes = text.as_bytes();
    let mut from = 0;
    while let Some(offset) = text[from..].find('{') {
        let start = from + offset;
        match balanced_end(bytes, start) {
            Some(end) => {
                if let Ok(Value::Object(map)) = serde_json::from_str(&text[start..=end]) {
                    return Some(map);
                }
                from = end + 1;
            }
            // Never closes; a later brace may still open a complete object
            None => from = start + 1,
        }
    }
    None
}

/// Index of the brace closing the one at `start`
fn balanced_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// `extract`, falling back to parsing the whole reply
pub fn extract_or_parse(text: &str) -> Result<Map<String, Value>, String> {
    if let Some(map) = extract(text) {
        return Ok(map);
    }
    match serde_json::from_str::<Value>(text.trim()) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("expected a JSON object, found {}", kind(&other))),
        Err(e) => Err(e.to_string()),
    }
}

/// Lenient count. Accepts numbers and numeric strings with separators
/// (`"1,500"`); null and anything unparsable count as 0.
pub fn coerce_count(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f > 0.0).map(|f| f as u64))
            .unwrap_or(0),
        Some(Value::String(s)) => {
            let cleaned: String = s
                .trim()
                .chars()
                .filter(|c| !matches!(c, ',' | '_' | ' ' | '+'))
                .collect();
            cleaned
                .parse::<u64>()
                .ok()
                .or_else(|| cleaned.parse::<f64>().ok().filter(|f| *f > 0.0).map(|f| f as u64))
                .unwrap_or(0)
        }
        _ => 0,
    }
}

/// String field of an answer; numbers are stringified, anything else is empty
pub fn text_field(answer: &Map<String, Value>, key: &str) -> String {
    match answer.get(key) {
        Some(Value::String(s)) => s.trim().to_owned(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

/// Truthy flag: `true`, non-zero numbers, `"true"`/`"yes"`
pub fn flag_field(answer: &Map<String, Value>, key: &str) -> bool {
    match answer.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes"),
        _ => false,
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
