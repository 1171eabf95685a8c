use crate::errors::{GatewayError, ProviderError};
use crate::model::{Summary, TestResultRow};
use crate::providers::llm::Gateway;
use crate::template::{placeholders, value_text};
use serde_json::{json, Value};
use std::fmt::Write;

use super::summarizer::{write_cases, FAILURE_THRESHOLD, SUCCESS_THRESHOLD};

pub const IMPROVER_TEMPERATURE: f32 = 0.7;

pub struct ImproveRequest<'a> {
    pub current_prompt: &'a str,
    pub summary: &'a Summary,
    pub rows: &'a [TestResultRow],
    pub target_score: f64,
    pub input_columns: &'a [String],
    pub feedback: &'a str,
    pub language: &'a str,
    pub enforce_placeholders: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Improvement {
    /// Prompt for the next iteration; the current one when the rewrite was
    /// unusable or rejected.
    pub prompt: String,
    pub reasoning: String,
    /// Exact text sent to the model.
    pub improver_prompt: String,
    pub changed: bool,
    pub dropped_placeholders: Vec<String>,
    pub malformed: Option<String>,
}

pub fn improve_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "reasoning": {"type": "string"},
            "improved_prompt": {"type": "string"}
        }
    })
}

pub async fn improve(
    gateway: &Gateway,
    model: &str,
    req: &ImproveRequest<'_>,
) -> Result<Improvement, ProviderError> {
    let improver_prompt = build_improver_prompt(req);
    let keep = |reasoning: String, malformed: Option<String>| Improvement {
        prompt: req.current_prompt.to_string(),
        reasoning,
        improver_prompt: improver_prompt.clone(),
        changed: false,
        dropped_placeholders: Vec::new(),
        malformed,
    };

    let v = match gateway
        .complete_structured(&improver_prompt, model, IMPROVER_TEMPERATURE, &improve_schema())
        .await
    {
        Ok(v) => v,
        Err(GatewayError::Malformed(m)) => {
            return Ok(keep("improver response unusable; prompt kept".into(), Some(m.to_string())))
        }
        Err(GatewayError::Provider(e)) => return Err(e),
    };

    let reasoning = v.get("reasoning").map(value_text).unwrap_or_default();
    let candidate = v
        .get("improved_prompt")
        .map(value_text)
        .unwrap_or_default()
        .trim()
        .to_string();

    if candidate.is_empty() || candidate == req.current_prompt.trim() {
        return Ok(keep(reasoning, None));
    }

    let kept = placeholders(&candidate);
    let dropped: Vec<String> = placeholders(req.current_prompt)
        .into_iter()
        .filter(|p| !kept.contains(p))
        .collect();

    if !dropped.is_empty() && req.enforce_placeholders {
        let mut out = keep(reasoning, None);
        out.dropped_placeholders = dropped;
        return Ok(out);
    }

    Ok(Improvement {
        prompt: candidate,
        reasoning,
        improver_prompt,
        changed: true,
        dropped_placeholders: dropped,
        malformed: None,
    })
}

pub fn build_improver_prompt(req: &ImproveRequest<'_>) -> String {
    let s = req.summary;
    let mut p = String::new();
    let _ = writeln!(
        p,
        "You are an expert prompt engineer. Rewrite the prompt below so it scores higher on the test set.\n"
    );
    let _ = writeln!(p, "Current prompt:\n---\n{}\n---\n", req.current_prompt);
    let _ = writeln!(
        p,
        "Average score: {:.2} (target {:.2})\n",
        s.stats.effective(),
        req.target_score
    );
    let _ = writeln!(p, "Analysis: {}\n", s.summary);
    write_list(&mut p, "Failure patterns", &s.failure_patterns);
    write_list(&mut p, "Success patterns", &s.success_patterns);
    write_list(&mut p, "Specific issues", &s.specific_issues);
    write_list(&mut p, "Suggestions", &s.suggestions);

    let failed: Vec<&TestResultRow> = req
        .rows
        .iter()
        .filter(|r| r.score.unwrap_or(0.0) < FAILURE_THRESHOLD)
        .collect();
    let low: Vec<&TestResultRow> = req
        .rows
        .iter()
        .filter(|r| {
            let s = r.score.unwrap_or(0.0);
            (FAILURE_THRESHOLD..SUCCESS_THRESHOLD).contains(&s)
        })
        .collect();
    if !failed.is_empty() || !low.is_empty() {
        let _ = writeln!(p, "Judge feedback on weak cases:");
        if !failed.is_empty() {
            let _ = writeln!(p, "Failed (score < {}):", FAILURE_THRESHOLD);
            write_cases(&mut p, &failed, "");
        }
        if !low.is_empty() {
            let _ = writeln!(
                p,
                "Low scoring ({} to {}):",
                FAILURE_THRESHOLD, SUCCESS_THRESHOLD
            );
            write_cases(&mut p, &low, "");
        }
        p.push('\n');
    }

    let columns: Vec<String> = req.input_columns.iter().map(|c| format!("{{{}}}", c)).collect();
    let _ = writeln!(
        p,
        "Available placeholders: {}\nKeep every placeholder the current prompt uses, spelled exactly the same. Do not invent new ones.\n",
        columns.join(", ")
    );

    if !req.feedback.trim().is_empty() {
        let _ = writeln!(p, "Reviewer feedback (take it into account):\n{}\n", req.feedback.trim());
    }

    let _ = write!(
        p,
        r#"Reply with ONLY a JSON object:
{{
    "reasoning": "what you changed and why",
    "improved_prompt": "the full rewritten prompt"
}}

Write the reasoning in {}."#,
        req.language
    );
    p
}

fn write_list(out: &mut String, title: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    let _ = writeln!(out, "{}:", title);
    for i in items {
        let _ = writeln!(out, "- {}", i);
    }
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InputData, ScoreStats};
    use crate::providers::llm::fake::FakeClient;
    use crate::providers::llm::RetryConfig;
    use std::sync::Arc;

    fn scored(index: usize, score: f64, reasoning: &str) -> TestResultRow {
        TestResultRow {
            index,
            input_data: InputData::new(),
            expected: "e".into(),
            actual: Some("a".into()),
            error: None,
            score: Some(score),
            judge_reasoning: Some(reasoning.into()),
        }
    }

    fn summary() -> Summary {
        Summary {
            stats: ScoreStats {
                avg: Some(0.6),
                min: Some(0.3),
                max: Some(0.95),
            },
            summary: "answers are verbose".into(),
            failure_patterns: vec!["rambling".into()],
            ..Summary::default()
        }
    }

    fn request<'a>(
        summary: &'a Summary,
        rows: &'a [TestResultRow],
        columns: &'a [String],
        feedback: &'a str,
    ) -> ImproveRequest<'a> {
        ImproveRequest {
            current_prompt: "Answer {question} about {topic}",
            summary,
            rows,
            target_score: 0.9,
            input_columns: columns,
            feedback,
            language: "English",
            enforce_placeholders: true,
        }
    }

    #[test]
    fn test_prompt_sections() {
        let s = summary();
        let rows = vec![
            scored(0, 0.3, "missed the point"),
            scored(1, 0.8, "slightly off"),
            scored(2, 0.95, "perfect"),
        ];
        let cols = vec!["question".to_string(), "topic".to_string()];
        let text = build_improver_prompt(&request(&s, &rows, &cols, "be concise"));

        assert!(text.contains("Answer {question} about {topic}"));
        assert!(text.contains("Average score: 0.60 (target 0.90)"));
        assert!(text.contains("- rambling"));
        assert!(text.contains("missed the point"));
        assert!(text.contains("slightly off"));
        assert!(!text.contains("perfect"));
        assert!(text.contains("Available placeholders: {question}, {topic}"));
        assert!(text.contains("be concise"));
        assert!(text.contains("\"improved_prompt\""));
    }

    #[tokio::test]
    async fn test_accepts_rewrite() {
        let fake = Arc::new(FakeClient::fixed(
            r#"{"reasoning": "tighter", "improved_prompt": "Briefly answer {question} ({topic})"}"#,
        ));
        let gw = Gateway::new(fake.clone(), RetryConfig::no_retry());
        let s = summary();
        let cols = vec!["question".to_string(), "topic".to_string()];
        let out = improve(&gw, "m", &request(&s, &[], &cols, "")).await.unwrap();

        assert!(out.changed);
        assert_eq!(out.prompt, "Briefly answer {question} ({topic})");
        assert_eq!(out.reasoning, "tighter");
        assert_eq!(out.improver_prompt, fake.requests()[0].prompt);
        assert_eq!(fake.requests()[0].temperature, IMPROVER_TEMPERATURE);
    }

    #[tokio::test]
    async fn test_rejects_rewrite_that_drops_placeholder() {
        let fake = Arc::new(FakeClient::fixed(
            r#"{"reasoning": "simpler", "improved_prompt": "Answer {question}"}"#,
        ));
        let gw = Gateway::new(fake, RetryConfig::no_retry());
        let s = summary();
        let cols = vec!["question".to_string(), "topic".to_string()];
        let out = improve(&gw, "m", &request(&s, &[], &cols, "")).await.unwrap();

        assert!(!out.changed);
        assert_eq!(out.prompt, "Answer {question} about {topic}");
        assert_eq!(out.dropped_placeholders, vec!["topic"]);

        let mut lax = request(&s, &[], &cols, "");
        lax.enforce_placeholders = false;
        let fake = Arc::new(FakeClient::fixed(
            r#"{"reasoning": "simpler", "improved_prompt": "Answer {question}"}"#,
        ));
        let gw = Gateway::new(fake, RetryConfig::no_retry());
        let out = improve(&gw, "m", &lax).await.unwrap();
        assert!(out.changed);
        assert_eq!(out.dropped_placeholders, vec!["topic"]);
    }

    #[tokio::test]
    async fn test_empty_or_malformed_keeps_prompt() {
        let s = summary();
        let cols = vec!["question".to_string(), "topic".to_string()];
        for raw in [r#"{"reasoning": "none", "improved_prompt": "  "}"#, "no json here"] {
            let gw = Gateway::new(Arc::new(FakeClient::fixed(raw)), RetryConfig::no_retry());
            let out = improve(&gw, "m", &request(&s, &[], &cols, "")).await.unwrap();
            assert!(!out.changed);
            assert_eq!(out.prompt, "Answer {question} about {topic}");
        }
    }
}
