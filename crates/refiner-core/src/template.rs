use crate::errors::DatasetError;
use crate::model::InputData;
use regex::Regex;
use std::sync::OnceLock;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // `{{` / `}}` are escapes; a single brace pair around a word is a placeholder.
    RE.get_or_init(|| Regex::new(r"\{\{|\}\}|\{(\w+)\}").expect("static regex"))
}

/// Placeholder names in first-appearance order, without duplicates.
pub fn placeholders(template: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for caps in placeholder_re().captures_iter(template) {
        if let Some(name) = caps.get(1) {
            let name = name.as_str().to_string();
            if !out.contains(&name) {
                out.push(name);
            }
        }
    }
    out
}

/// Substitute `{column}` with the row value. Missing columns render as empty
/// text; non-string values are rendered as compact JSON.
pub fn render(template: &str, values: &InputData) -> String {
    placeholder_re()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            match caps.get(1) {
                Some(name) => values.get(name.as_str()).map(value_text).unwrap_or_default(),
                None => {
                    // escaped brace
                    caps[0][..1].to_string()
                }
            }
        })
        .into_owned()
}

/// Like `render`, but only the listed names are substituted; other braces are
/// left untouched. Used for the fixed judge/improver instruction templates,
/// whose bodies contain literal JSON.
pub fn fill(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{}}}", name), value);
    }
    out
}

pub fn value_text(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Placeholders of `template` that do not name an input column.
pub fn check_columns(template: &str, input_columns: &[String]) -> Result<(), DatasetError> {
    let missing: Vec<String> = placeholders(template)
        .into_iter()
        .filter(|p| !input_columns.contains(p))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(DatasetError::UnknownPlaceholders {
            missing,
            available: input_columns.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(pairs: &[(&str, serde_json::Value)]) -> InputData {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_placeholders_deduplicated_in_order() {
        let p = placeholders("Translate {text} to {lang}. Again: {text}");
        assert_eq!(p, vec!["text".to_string(), "lang".to_string()]);
    }

    #[test]
    fn test_escaped_braces_are_not_placeholders() {
        assert!(placeholders("Return {{\"a\": 1}}").is_empty());
        let out = render("Return {{x}} for {q}", &data(&[("q", json!("2+2"))]));
        assert_eq!(out, "Return {x} for 2+2");
    }

    #[test]
    fn test_missing_placeholder_renders_empty() {
        let out = render("Q: {question} / ctx: {context}", &data(&[("question", json!("why"))]));
        assert_eq!(out, "Q: why / ctx: ");
    }

    #[test]
    fn test_non_string_values_render_as_json() {
        let out = render("{n} {flag}", &data(&[("n", json!(3)), ("flag", json!(true))]));
        assert_eq!(out, "3 true");
    }

    #[test]
    fn test_fill_leaves_other_braces() {
        let out = fill(r#"{"score": 0.5} for {actual}"#, &[("actual", "hi")]);
        assert_eq!(out, r#"{"score": 0.5} for hi"#);
    }

    #[test]
    fn test_check_columns_reports_unknown() {
        let cols = vec!["question".to_string()];
        assert!(check_columns("{question}", &cols).is_ok());
        match check_columns("{question} {topic}", &cols) {
            Err(DatasetError::UnknownPlaceholders { missing, .. }) => {
                assert_eq!(missing, vec!["topic".to_string()])
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
