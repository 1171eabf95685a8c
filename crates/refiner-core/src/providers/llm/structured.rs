//! Turning free-form completion text into a JSON object.
//!
//! Models wrap JSON in markdown fences or surround it with prose often enough
//! that a strict parse alone is not usable. Extraction is tried in order:
//! the whole text, the first fenced code block, then the first balanced
//! `{...}` that parses. The result is checked against the caller's schema.

use crate::errors::MalformedResponse;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```[A-Za-z]*[ \t]*\r?\n?([\s\S]*?)```").expect("static regex"))
}

pub fn parse_structured(raw: &str, schema: Option<&Value>) -> Result<Value, MalformedResponse> {
    let value = extract_object(raw).ok_or_else(|| MalformedResponse {
        reason: "no JSON object found in response".into(),
        raw: raw.to_string(),
    })?;

    if let Some(schema) = schema {
        validate(schema, &value).map_err(|reason| MalformedResponse {
            reason,
            raw: raw.to_string(),
        })?;
    }
    Ok(value)
}

pub fn extract_object(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if let Some(v) = parse_object(trimmed) {
        return Some(v);
    }
    if let Some(v) = fence_re()
        .captures_iter(raw)
        .filter_map(|c| c.get(1))
        .find_map(|m| parse_object(m.as_str().trim()))
    {
        return Some(v);
    }
    balanced_objects(raw).find_map(parse_object)
}

fn parse_object(s: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(s) {
        Ok(v @ Value::Object(_)) => Some(v),
        _ => None,
    }
}

/// Candidate `{...}` spans in order of their opening brace. String literals
/// are respected so braces inside them do not unbalance the scan.
fn balanced_objects(text: &str) -> impl Iterator<Item = &str> {
    let bytes = text.as_bytes();
    (0..bytes.len())
        .filter(move |&i| bytes[i] == b'{')
        .filter_map(move |start| {
            let mut depth = 0usize;
            let mut in_str = false;
            let mut escaped = false;
            for (off, &b) in bytes[start..].iter().enumerate() {
                if in_str {
                    match b {
                        _ if escaped => escaped = false,
                        b'\\' => escaped = true,
                        b'"' => in_str = false,
                        _ => {}
                    }
                    continue;
                }
                match b {
                    b'"' => in_str = true,
                    b'{' => depth += 1,
                    b'}' => {
                        depth -= 1;
                        if depth == 0 {
                            return text.get(start..start + off + 1);
                        }
                    }
                    _ => {}
                }
            }
            None
        })
}

fn validate(schema: &Value, instance: &Value) -> Result<(), String> {
    let compiled = jsonschema::JSONSchema::options()
        .compile(schema)
        .map_err(|e| format!("invalid response schema: {}", e))?;
    let result = compiled.validate(instance);
    match result {
        Ok(()) => Ok(()),
        Err(errors) => {
            let msgs: Vec<String> = errors
                .map(|e| {
                    let path = e.instance_path.to_string();
                    if path.is_empty() {
                        e.to_string()
                    } else {
                        format!("{}: {}", path, e)
                    }
                })
                .collect();
            Err(format!("response does not match schema: {}", msgs.join("; ")))
        }
    }
}
