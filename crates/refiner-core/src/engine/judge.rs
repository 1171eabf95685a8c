use crate::errors::GatewayError;
use crate::model::TestResultRow;
use crate::providers::llm::Gateway;
use crate::template::{fill, value_text};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Semaphore;

pub const JUDGE_TEMPERATURE: f32 = 0.1;

pub const DEFAULT_JUDGE_PROMPT: &str = r#"You are an expert judge grading an AI-generated answer.

Input: {input_data}
Expected output: {expected}
Actual output: {actual}

Compare the actual output with the expected output:
1. Correctness: does it mean the same thing as the expected output?
2. Completeness: is all required information present?
3. Format: is it shaped the way the expected output is?

Reply with ONLY a JSON object:
{"reason": "your reasoning", "score": 0.0}

The score ranges from 0.0 (completely wrong) to 1.0 (perfect match)."#;

pub fn judge_schema() -> Value {
    json!({
        "type": "object",
        "required": ["score"],
        "properties": {
            "score": {"type": "number"},
            "reason": {"type": "string"},
            "reasoning": {"type": "string"}
        }
    })
}

/// Score every row. Rows without output get 0 without a call; judge failures
/// are absorbed as 0 with the error as reasoning.
pub async fn judge_results(
    gateway: &Gateway,
    rows: Vec<TestResultRow>,
    model: &str,
    custom_prompt: Option<&str>,
    concurrency: usize,
) -> Vec<TestResultRow> {
    let sem = Arc::new(Semaphore::new(concurrency.max(1)));
    let template = Arc::new(custom_prompt.unwrap_or(DEFAULT_JUDGE_PROMPT).to_string());
    let schema = Arc::new(judge_schema());
    let mut out = Vec::with_capacity(rows.len());
    let mut handles = Vec::new();

    for row in rows {
        if row.actual.is_none() {
            out.push(execution_failed(row));
            continue;
        }
        let permit = match sem.clone().acquire_owned().await {
            Ok(p) => p,
            Err(e) => {
                out.push(judged(row, 0.0, format!("judge error: {}", e)));
                continue;
            }
        };
        let gw = gateway.clone();
        let model = model.to_string();
        let template = template.clone();
        let schema = schema.clone();
        let unjudged = row.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            judge_one(&gw, row, &model, &template, &schema).await
        });
        handles.push((unjudged, handle));
    }

    for (unjudged, h) in handles {
        match h.await {
            Ok(row) => out.push(row),
            Err(e) => {
                tracing::error!(row = unjudged.index, error = %e, "judge task aborted");
                out.push(judged(unjudged, 0.0, format!("judge task aborted: {}", e)));
            }
        }
    }
    out.sort_by_key(|r| r.index);
    out
}

async fn judge_one(
    gateway: &Gateway,
    row: TestResultRow,
    model: &str,
    template: &str,
    schema: &Value,
) -> TestResultRow {
    let input = serde_json::to_string(&row.input_data).unwrap_or_default();
    let actual = row.actual.clone().unwrap_or_default();
    let prompt = fill(
        template,
        &[
            ("input_data", &input),
            ("input_prompt", &input),
            ("expected", &row.expected),
            ("actual", &actual),
        ],
    );

    match gateway
        .complete_structured(&prompt, model, JUDGE_TEMPERATURE, schema)
        .await
    {
        Ok(v) => {
            let score = v.get("score").and_then(Value::as_f64).unwrap_or(0.0);
            let reasoning = v
                .get("reason")
                .or_else(|| v.get("reasoning"))
                .map(value_text)
                .unwrap_or_else(|| "no reasoning provided".into());
            judged(row, clamp_score(score), reasoning)
        }
        Err(GatewayError::Malformed(m)) => {
            tracing::debug!(row = row.index, reason = %m.reason, "judge response malformed");
            judged(row, 0.0, m.to_string())
        }
        Err(GatewayError::Provider(e)) => {
            tracing::warn!(event = "judge_failed", row = row.index, error = %e, "judge call failed");
            judged(row, 0.0, format!("judge error: {}", e))
        }
    }
}

fn execution_failed(row: TestResultRow) -> TestResultRow {
    let reasoning = match &row.error {
        Some(e) => format!("execution failed: {}", e),
        None => "execution failed".to_string(),
    };
    judged(row, 0.0, reasoning)
}

fn judged(mut row: TestResultRow, score: f64, reasoning: String) -> TestResultRow {
    row.score = Some(score);
    row.judge_reasoning = Some(reasoning);
    row
}

pub fn clamp_score(s: f64) -> f64 {
    if s.is_nan() {
        0.0
    } else {
        s.clamp(0.0, 1.0)
    }
}
