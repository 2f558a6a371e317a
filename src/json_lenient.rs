//! Tolerant JSON extraction for agent replies.
//!
//! Every agent output is free text that is *supposed* to contain a single
//! JSON value, but language models routinely wrap it in prose, fence it in
//! a ` ```json ` block, or truncate it mid-object when they hit a token
//! limit. [`extract_value`] tries four strategies in order and returns the
//! first value that both parses and matches the caller's expected shape.
//!
//! Consumers declare the expected shape explicitly via [`Shape`] so that,
//! e.g., a lone JSON array embedded in prose doesn't get mistaken for the
//! expected object.

use serde_json::Value;

/// The top-level JSON shape a caller expects back from an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Object,
    Array,
}

impl Shape {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Shape::Object => value.is_object(),
            Shape::Array => value.is_array(),
        }
    }
}

/// Parse `text` as a JSON value of the given [`Shape`], tolerating prose
/// wrapping, fenced code blocks, and a trailing unbalanced-brace cutoff.
///
/// Returns `None` if none of the four tiers produce a matching value. The
/// raw text is not retained here — callers that need it for error reporting
/// should keep their own copy alongside the call.
pub fn extract_value(text: &str, shape: Shape) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if shape.matches(&value) {
            return Some(value);
        }
    }

    if let Some(value) = try_fenced_blocks(trimmed, shape) {
        return Some(value);
    }

    if let Some(value) = try_brace_scan(trimmed, shape) {
        return Some(value);
    }

    if let Some(value) = try_unbalanced_repair(trimmed, shape) {
        return Some(value);
    }

    None
}

/// Convenience wrapper over [`extract_value`] for object-shaped replies.
pub fn extract_object(text: &str) -> Option<Value> {
    extract_value(text, Shape::Object)
}

/// Convenience wrapper over [`extract_value`] for array-shaped replies.
pub fn extract_array(text: &str) -> Option<Value> {
    extract_value(text, Shape::Array)
}

/// Tier 2: scan for ` ``` ` fenced blocks, try to parse the body directly,
/// and if that fails fall back to a brace-matched extraction of the
/// outermost `{...}`/`[...]` inside the block.
fn try_fenced_blocks(text: &str, shape: Shape) -> Option<Value> {
    let mut rest = text;
    while let Some(start) = rest.find("```") {
        let after_open = &rest[start + 3..];
        // Skip an optional language tag (e.g. "json") up to the newline.
        let body_start = after_open.find('\n').map(|i| i + 1).unwrap_or(0);
        let body_and_tail = &after_open[body_start..];
        let end = match body_and_tail.find("```") {
            Some(e) => e,
            None => break,
        };
        let block = &body_and_tail[..end];

        if let Ok(value) = serde_json::from_str::<Value>(block.trim()) {
            if shape.matches(&value) {
                return Some(value);
            }
        }
        if let Some(value) = scan_balanced_spans(block, shape).into_iter().next() {
            return Some(value);
        }

        rest = &body_and_tail[end + 3..];
    }
    None
}

/// Tier 3: scan the whole text character-by-character tracking
/// brace/bracket depth, collecting every maximally-nested balanced span and
/// trying to parse each as JSON, returning the first match of the expected
/// shape.
fn try_brace_scan(text: &str, shape: Shape) -> Option<Value> {
    scan_balanced_spans(text, shape).into_iter().next()
}

fn scan_balanced_spans(text: &str, shape: Shape) -> Vec<Value> {
    let bytes: Vec<char> = text.chars().collect();
    let mut results = Vec::new();
    let (open, close) = match shape {
        Shape::Object => ('{', '}'),
        Shape::Array => ('[', ']'),
    };

    let mut depth: i32 = 0;
    let mut start: Option<usize> = None;
    let mut in_string = false;
    let mut escape = false;

    for (i, &c) in bytes.iter().enumerate() {
        if in_string {
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            c if c == open => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            c if c == close => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        if let Some(s) = start.take() {
                            let span: String = bytes[s..=i].iter().collect();
                            if let Ok(value) = serde_json::from_str::<Value>(&span) {
                                if shape.matches(&value) {
                                    results.push(value);
                                }
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }

    results
}

/// Tier 4: if the text ends with an unterminated object/array (depth never
/// returned to zero — the model ran out of tokens mid-reply), close the
/// missing brackets and attempt to parse the completion.
fn try_unbalanced_repair(text: &str, shape: Shape) -> Option<Value> {
    let (open, close) = match shape {
        Shape::Object => ('{', '}'),
        Shape::Array => ('[', ']'),
    };

    let start = text.find(open)?;
    let candidate = &text[start..];

    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escape = false;
    for c in candidate.chars() {
        if in_string {
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => depth -= 1,
            _ => {}
        }
    }

    if depth <= 0 {
        return None; // balanced (tier 3 would have caught it) or malformed in another way
    }

    let mut repaired = candidate.trim_end().to_string();
    if in_string {
        repaired.push('"');
    }
    for _ in 0..depth {
        repaired.push(close);
    }

    let value: Value = serde_json::from_str(&repaired).ok()?;
    if shape.matches(&value) {
        Some(value)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn direct_parse_object() {
        let value = extract_object(r#"{"actions":[{"type":"reply","payload":"hi"}]}"#).unwrap();
        assert_eq!(value["actions"][0]["payload"], "hi");
    }

    #[test]
    fn fenced_block_object() {
        let text = "Sure thing!\n```json\n{\"a\":1}\n```\nLet me know if that works.";
        assert_eq!(extract_object(text).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn prose_wrapped_object() {
        let text = "Here is the plan: {\"actions\":[]} as requested.";
        assert_eq!(extract_object(text).unwrap(), json!({"actions": []}));
    }

    #[test]
    fn array_shape_is_respected() {
        let text = r#"{"actions":[]} and also [1,2,3]"#;
        assert_eq!(extract_array(text).unwrap(), json!([1, 2, 3]));
    }

    #[test]
    fn nested_object_picks_outermost() {
        let text = r#"noise {"action":"call","calls":[{"tool":"x","input":{"a":1}}]} trailing"#;
        let value = extract_object(text).unwrap();
        assert_eq!(value["action"], "call");
    }

    #[test]
    fn unbalanced_brace_repair() {
        let text = r#"{"action":"finish","summary":"done""#;
        let value = extract_object(text).unwrap();
        assert_eq!(value["action"], "finish");
        assert_eq!(value["summary"], "done");
    }

    #[test]
    fn empty_and_garbage_return_none() {
        assert!(extract_object("").is_none());
        assert!(extract_object("not json at all").is_none());
    }

    #[test]
    fn round_trip_all_wrappings() {
        let original = json!({"actions": [{"type": "reply", "payload": "hello"}]});
        let s = serde_json::to_string(&original).unwrap();
        assert_eq!(extract_object(&s).unwrap(), original);
        assert_eq!(
            extract_object(&format!("```json\n{}\n```", s)).unwrap(),
            original
        );
        assert_eq!(extract_object(&format!("prose {} prose", s)).unwrap(), original);
    }
}
