//! JSON repair cascade for almost-JSON model output.
//!
//! Models asked for strict JSON still produce trailing commas, unbalanced
//! braces, fenced code blocks, single quotes, or prose around the payload.
//! The cascade applies repair strategies cumulatively, in a fixed order,
//! re-trying the caller's schema (its serde type) after each step:
//!
//! 1. `trim-noise`            — cut leading/trailing non-JSON text
//! 2. `strip-trailing-commas` — remove `,` before `}`/`]`
//! 3. `unescape-quotes`       — undo a doubly-escaped payload
//! 4. `balance-braces`        — close unterminated strings/objects/arrays
//! 5. `extract-fenced`        — pull the first object out of a code fence
//! 6. `single-quotes`         — convert single-quoted keys/strings
//! 7. `general-repair`        — permissive last-ditch pass
//!
//! Unescaping runs before brace balancing: a doubly-escaped payload reads
//! as one endless string to the balancer, which would otherwise "close" it
//! and bury the real quotes.
//!
//! Each transform is a no-op on already-valid JSON, so a repaired input is
//! never un-repaired by a later strategy. The strategies that actually
//! changed the text are returned for audit logging.

use serde::de::DeserializeOwned;

use crate::error_handler::AiLlmError;

type Strategy = (&'static str, fn(&str) -> String);

const STRATEGIES: &[Strategy] = &[
    ("trim-noise", trim_noise),
    ("strip-trailing-commas", strip_trailing_commas),
    ("unescape-quotes", unescape_quotes),
    ("balance-braces", balance_braces),
    ("extract-fenced", extract_fenced),
    ("single-quotes", single_quotes),
    ("general-repair", general_repair),
];

/// Runs the cascade until `raw` deserializes into `T`.
///
/// Returns the value together with the names of the strategies that changed
/// the text along the way (empty when the input was already valid).
///
/// # Errors
/// [`AiLlmError::Schema`] when no strategy yields a conforming value.
pub fn repair_to<T: DeserializeOwned>(raw: &str) -> Result<(T, Vec<&'static str>), AiLlmError> {
    let mut text = raw.to_string();
    let mut applied: Vec<&'static str> = Vec::new();

    if let Ok(v) = serde_json::from_str::<T>(&text) {
        return Ok((v, applied));
    }

    for &(name, f) in STRATEGIES {
        let next = f(&text);
        if next != text {
            applied.push(name);
            text = next;
        }
        if let Ok(v) = serde_json::from_str::<T>(&text) {
            return Ok((v, applied));
        }
    }

    Err(AiLlmError::Schema(format!(
        "unparseable after {} strategies; head: {}",
        applied.len(),
        text.chars().take(120).collect::<String>()
    )))
}

/* ======================= strategies ======================= */

/// Cut everything before the first `{`/`[`, and trailing prose after the
/// last `}`/`]`. The tail is only cut when it looks like prose — a tail
/// still carrying JSON punctuation usually means the payload was truncated
/// mid-value and must be preserved for the balancer.
fn trim_noise(s: &str) -> String {
    let Some(start) = s.find(['{', '[']) else {
        return s.trim().to_string();
    };
    let t = &s[start..];
    if let Some(end) = t.rfind(['}', ']']) {
        let tail = &t[end + 1..];
        if !tail.contains(['"', '{', '[', ':']) {
            return t[..=end].to_string();
        }
    }
    t.to_string()
}

/// Remove commas directly preceding a closing brace/bracket (outside
/// string literals).
fn strip_trailing_commas(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' => {
                // Lookahead past whitespace: drop the comma when the next
                // significant char closes a container.
                let mut j = i + 1;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                    // skip the comma
                } else {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
        i += 1;
    }
    out
}

/// Close an unterminated string and append missing closers for any
/// still-open objects/arrays.
fn balance_braces(s: &str) -> String {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in s.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    if !in_string && stack.is_empty() {
        return s.to_string();
    }

    let mut out = s.to_string();
    if in_string {
        out.push('"');
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

/// Undo a payload that arrived with every quote escaped
/// (e.g. `{\"comments\": ...}`).
fn unescape_quotes(s: &str) -> String {
    let t = s.trim_start();
    if t.starts_with("{\\\"") || t.starts_with("[\\\"") {
        s.replace("\\\"", "\"")
    } else {
        s.to_string()
    }
}

/// Pull the first balanced top-level object/array out of a fenced code
/// block.
fn extract_fenced(s: &str) -> String {
    let Some(open) = s.find("```") else {
        return s.to_string();
    };
    let after = &s[open + 3..];
    // Skip an optional language tag up to the first newline.
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after[body_start..];
    let body = match body.find("```") {
        Some(close) => &body[..close],
        None => body,
    };
    match first_balanced_json(body) {
        Some(obj) => obj,
        None => s.to_string(),
    }
}

/// Extract the first balanced `{...}`/`[...]` span from `s`, string-aware.
fn first_balanced_json(s: &str) -> Option<String> {
    let bytes: Vec<char> = s.chars().collect();
    let start = bytes.iter().position(|&c| c == '{' || c == '[')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(bytes[start..=i].iter().collect());
                }
            }
            _ => {}
        }
    }
    None
}

/// Convert single-quoted keys/strings to double-quoted, escaping embedded
/// double quotes.
fn single_quotes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_double = false;
    let mut in_single = false;
    let mut escaped = false;

    for c in s.chars() {
        if in_double {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_double = false;
            }
            continue;
        }
        if in_single {
            if escaped {
                // Keep real escapes; \' just becomes a plain quote.
                if c != '\'' {
                    out.push('\\');
                }
                out.push(c);
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '\'' {
                out.push('"');
                in_single = false;
            } else if c == '"' {
                out.push_str("\\\"");
            } else {
                out.push(c);
            }
            continue;
        }
        match c {
            '"' => {
                in_double = true;
                out.push(c);
            }
            '\'' => {
                in_single = true;
                out.push('"');
            }
            _ => out.push(c),
        }
    }
    out
}

/// Permissive last-ditch pass: Python-style literals, unquoted keys, then
/// the comma/brace fixes again.
fn general_repair(s: &str) -> String {
    let t = replace_bare_words(s);
    let t = quote_bare_keys(&t);
    let t = strip_trailing_commas(&t);
    balance_braces(&t)
}

/// `None`/`True`/`False` → `null`/`true`/`false`, outside strings.
fn replace_bare_words(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut word = String::new();

    let flush = |word: &mut String, out: &mut String| {
        if !word.is_empty() {
            match word.as_str() {
                "None" => out.push_str("null"),
                "True" => out.push_str("true"),
                "False" => out.push_str("false"),
                other => out.push_str(other),
            }
            word.clear();
        }
    };

    for c in s.chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        if c.is_alphanumeric() || c == '_' {
            word.push(c);
            continue;
        }
        flush(&mut word, &mut out);
        if c == '"' {
            in_string = true;
        }
        out.push(c);
    }
    flush(&mut word, &mut out);
    out
}

/// Quote bare identifiers used as object keys (`{key: 1}` → `{"key": 1}`).
fn quote_bare_keys(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut expect_key = false;

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                expect_key = false;
                out.push(c);
            }
            '{' => {
                expect_key = true;
                out.push(c);
            }
            ',' => {
                expect_key = true;
                out.push(c);
            }
            c if expect_key && (c.is_alphabetic() || c == '_') => {
                // Capture the identifier; only quote it when a ':' follows.
                let mut j = i;
                let mut ident = String::new();
                while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_') {
                    ident.push(chars[j]);
                    j += 1;
                }
                let mut k = j;
                while k < chars.len() && chars[k].is_whitespace() {
                    k += 1;
                }
                if k < chars.len() && chars[k] == ':' {
                    out.push('"');
                    out.push_str(&ident);
                    out.push('"');
                    expect_key = false;
                    i = j;
                    continue;
                }
                out.push_str(&ident);
                expect_key = false;
                i = j;
                continue;
            }
            c if c.is_whitespace() => out.push(c),
            _ => {
                expect_key = false;
                out.push(c);
            }
        }
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::Value;

    #[derive(Debug, Deserialize)]
    struct Comments {
        comments: Vec<Value>,
    }

    #[test]
    fn valid_json_needs_no_repair() {
        let (v, applied) = repair_to::<Comments>(r#"{"comments": [{"a": 1}]}"#).unwrap();
        assert_eq!(v.comments.len(), 1);
        assert!(applied.is_empty());
    }

    #[test]
    fn trailing_comma_then_missing_brace() {
        // Trailing comma and missing closing brace: the cascade must report
        // strip-trailing-commas followed by balance-braces.
        let raw = r#"{"comments": [{"path": "a.rs", "line": 3},]"#;
        let (v, applied) = repair_to::<Comments>(raw).unwrap();
        assert_eq!(v.comments.len(), 1);
        assert_eq!(applied, vec!["strip-trailing-commas", "balance-braces"]);
    }

    #[test]
    fn prose_around_object_is_trimmed() {
        let raw = "Sure! Here is the review:\n{\"comments\": []}\nHope this helps.";
        let (v, applied) = repair_to::<Comments>(raw).unwrap();
        assert!(v.comments.is_empty());
        assert_eq!(applied, vec!["trim-noise"]);
    }

    #[test]
    fn fenced_block_is_extracted() {
        let raw = "Reasoning first. { not json }\n```json\n{\"comments\": [{\"x\": 1}]}\n```";
        let (v, _applied) = repair_to::<Comments>(raw).unwrap();
        assert_eq!(v.comments.len(), 1);
    }

    #[test]
    fn doubly_escaped_payload() {
        let raw = r#"{\"comments\": [{\"a\": 1}]}"#;
        let (v, applied) = repair_to::<Comments>(raw).unwrap();
        assert_eq!(v.comments.len(), 1);
        assert!(applied.contains(&"unescape-quotes"));
    }

    #[test]
    fn single_quoted_keys() {
        let raw = "{'comments': [{'a': 'it''s fine'}]}";
        // Degenerate doubled quote aside, the simple case must pass:
        let raw_simple = "{'comments': [{'a': 1}]}";
        let (v, applied) = repair_to::<Comments>(raw_simple).unwrap();
        assert_eq!(v.comments.len(), 1);
        assert!(applied.contains(&"single-quotes"));
        let _ = raw;
    }

    #[test]
    fn general_repair_quotes_keys_and_python_literals() {
        let raw = "{comments: [{done: True, note: None}]}";
        let (v, applied) = repair_to::<Comments>(raw).unwrap();
        assert_eq!(v.comments.len(), 1);
        assert_eq!(v.comments[0]["done"], Value::Bool(true));
        assert_eq!(v.comments[0]["note"], Value::Null);
        assert!(applied.contains(&"general-repair"));
    }

    #[test]
    fn unterminated_string_is_closed() {
        let raw = r#"{"comments": [], "summary": "truncated midw"#;
        let (v, _applied) = repair_to::<Value>(raw).unwrap();
        assert!(v["summary"].as_str().unwrap().starts_with("truncated"));
    }

    #[test]
    fn hopeless_input_is_schema_error() {
        let err = repair_to::<Comments>("the model refused to answer").unwrap_err();
        assert!(matches!(err, AiLlmError::Schema(_)));
    }

    #[test]
    fn strategies_are_noops_on_valid_json() {
        // Monotonicity: once an input is valid JSON, no later strategy may
        // un-repair it.
        let valid = r#"{"comments": [{"a": "tricky, ]} value"}], "n": 1}"#;
        assert!(serde_json::from_str::<Value>(valid).is_ok());
        for (name, f) in STRATEGIES {
            let after = f(valid);
            assert!(
                serde_json::from_str::<Value>(&after).is_ok(),
                "strategy {name} broke valid JSON: {after}"
            );
        }
    }
}
