use crate::errors::{GatewayError, ProviderError};
use crate::model::{ScoreStats, Summary, TestResultRow};
use crate::providers::llm::Gateway;
use crate::template::value_text;
use serde_json::{json, Value};
use std::fmt::Write;

pub const SUMMARIZER_TEMPERATURE: f32 = 0.3;
pub const FAILURE_THRESHOLD: f64 = 0.7;
pub const SUCCESS_THRESHOLD: f64 = 0.9;
const MAX_LISTED_ROWS: usize = 20;

pub struct SummaryOutcome {
    pub summary: Summary,
    /// Why the qualitative part is missing, when the model's answer was
    /// unusable.
    pub degraded: Option<String>,
}

pub fn summary_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "summary": {"type": "string"},
            "failure_patterns": {"type": "array"},
            "success_patterns": {"type": "array"},
            "specific_issues": {"type": "array"},
            "suggestions": {"type": "array"}
        }
    })
}

pub async fn summarize(
    gateway: &Gateway,
    model: &str,
    prompt_template: &str,
    rows: &[TestResultRow],
    language: &str,
) -> Result<SummaryOutcome, ProviderError> {
    let stats = ScoreStats::from_rows(rows);
    let prompt = build_prompt(prompt_template, rows, &stats, language);

    match gateway
        .complete_structured(&prompt, model, SUMMARIZER_TEMPERATURE, &summary_schema())
        .await
    {
        Ok(v) => Ok(SummaryOutcome {
            summary: Summary {
                stats,
                summary: v.get("summary").map(value_text).unwrap_or_default(),
                failure_patterns: string_list(&v, "failure_patterns"),
                success_patterns: string_list(&v, "success_patterns"),
                specific_issues: string_list(&v, "specific_issues"),
                suggestions: string_list(&v, "suggestions"),
            },
            degraded: None,
        }),
        Err(GatewayError::Malformed(m)) => Ok(SummaryOutcome {
            summary: stats_only(stats, rows.len()),
            degraded: Some(m.to_string()),
        }),
        Err(GatewayError::Provider(e)) => Err(e),
    }
}

/// Summary when the qualitative synthesis is unavailable.
pub fn stats_only(stats: ScoreStats, total: usize) -> Summary {
    let text = match (stats.avg, stats.min, stats.max) {
        (Some(avg), Some(min), Some(max)) => format!(
            "avg {:.3}, min {:.3}, max {:.3} over {} rows",
            avg, min, max, total
        ),
        _ => format!("no scored rows out of {}", total),
    };
    Summary {
        stats,
        summary: text,
        ..Summary::default()
    }
}

fn build_prompt(
    prompt_template: &str,
    rows: &[TestResultRow],
    stats: &ScoreStats,
    language: &str,
) -> String {
    let failures: Vec<&TestResultRow> = rows
        .iter()
        .filter(|r| r.score.unwrap_or(0.0) < FAILURE_THRESHOLD)
        .collect();
    let successes: Vec<&TestResultRow> = rows
        .iter()
        .filter(|r| r.score.unwrap_or(0.0) >= SUCCESS_THRESHOLD)
        .collect();

    let mut p = String::new();
    let _ = writeln!(
        p,
        "You are analyzing how a prompt performed on a labeled test set. Each case was graded by a judge.\n"
    );
    let _ = writeln!(p, "Prompt under evaluation:\n---\n{}\n---\n", prompt_template);
    let _ = writeln!(p, "Scores:");
    let _ = writeln!(p, "- Average: {:.2}", stats.effective());
    let _ = writeln!(p, "- Min: {:.2}", stats.min.unwrap_or(0.0));
    let _ = writeln!(p, "- Max: {:.2}", stats.max.unwrap_or(0.0));
    let _ = writeln!(p, "- Cases: {}", rows.len());
    let _ = writeln!(
        p,
        "- Failed cases (score < {}): {}\n",
        FAILURE_THRESHOLD,
        failures.len()
    );

    let _ = writeln!(p, "Failed cases:");
    write_cases(&mut p, &failures, "No significant failures.");
    let _ = writeln!(p, "\nStrong cases (score >= {}):", SUCCESS_THRESHOLD);
    write_cases(&mut p, &successes, "None.");

    let _ = write!(
        p,
        r#"
Identify what the failures have in common and what the strong cases do right. Reply with ONLY a JSON object:
{{
    "summary": "short overview of performance",
    "failure_patterns": ["pattern", "..."],
    "success_patterns": ["pattern", "..."],
    "specific_issues": ["issue", "..."],
    "suggestions": ["suggestion", "..."]
}}

Write every text value in {}."#,
        language
    );
    p
}

pub(crate) fn write_cases(out: &mut String, rows: &[&TestResultRow], empty: &str) {
    if rows.is_empty() {
        let _ = writeln!(out, "{}", empty);
        return;
    }
    for r in rows.iter().take(MAX_LISTED_ROWS) {
        let _ = writeln!(
            out,
            "  Case {}: score={:.2}\n    Input: {}\n    Expected: {}\n    Actual: {}\n    Judge reasoning: {}",
            r.index,
            r.score.unwrap_or(0.0),
            serde_json::to_string(&r.input_data).unwrap_or_default(),
            r.expected,
            r.actual.as_deref().unwrap_or("N/A"),
            r.judge_reasoning.as_deref().unwrap_or(""),
        );
    }
    if rows.len() > MAX_LISTED_ROWS {
        let _ = writeln!(out, "  ... and {} more", rows.len() - MAX_LISTED_ROWS);
    }
}

fn string_list(v: &Value, key: &str) -> Vec<String> {
    match v.get(key) {
        Some(Value::Array(items)) => items.iter().map(value_text).collect(),
        Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}
