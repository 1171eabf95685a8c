#![allow(dead_code)]

use refiner_core::dataset::{Dataset, Row};
use refiner_core::engine::RunRegistry;
use refiner_core::errors::ProviderError;
use refiner_core::events::{EventBus, EventStream, RunEvent};
use refiner_core::model::{NewRun, RunConfig};
use refiner_core::providers::llm::fake::{FakeClient, FakeRequest};
use refiner_core::providers::llm::RetryConfig;
use refiner_core::providers::registry::ProviderRegistry;
use refiner_core::storage::Store;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

pub const TEST_MODEL: &str = "test-model";
pub const JUDGE_MODEL: &str = "judge-model";
pub const IMPROVER_MODEL: &str = "improver-model";
pub const INITIAL_PROMPT: &str = "[v1] Answer {q}";

/// Prompt version marker `[vN]` found first in `text`.
pub fn version_in(text: &str) -> Option<usize> {
    let start = text.find("[v")? + 2;
    let end = text[start..].find(']')? + start;
    text[start..end].parse().ok()
}

/// A provider that plays all three roles, keyed on the model name:
/// the tester echoes the rendered prompt, the judge scores every row of prompt
/// version N with `scores[N - 1]` (the last entry repeats), and the improver
/// bumps the version marker while keeping the `{q}` placeholder.
pub fn scripted(scores: Vec<f64>) -> FakeClient {
    FakeClient::new(move |req: &FakeRequest| match req.model.as_str() {
        TEST_MODEL => Ok(req.prompt.clone()),
        JUDGE_MODEL => {
            let v = version_in(&req.prompt).unwrap_or(1);
            let score = scores
                .get(v - 1)
                .or_else(|| scores.last())
                .copied()
                .unwrap_or(0.0);
            Ok(json!({"score": score, "reason": format!("graded v{}", v)}).to_string())
        }
        IMPROVER_MODEL if req.prompt.contains("\"improved_prompt\"") => {
            let v = version_in(&req.prompt).unwrap_or(1);
            Ok(json!({
                "reasoning": format!("rewrote v{}", v),
                "improved_prompt": format!("[v{}] Answer {{q}}", v + 1),
            })
            .to_string())
        }
        IMPROVER_MODEL => Ok(json!({
            "summary": "scripted summary",
            "failure_patterns": ["too vague"],
            "suggestions": ["be precise"],
        })
        .to_string()),
        other => Err(ProviderError::ModelNotFound(other.to_string())),
    })
}

pub fn dataset(n: usize) -> Dataset {
    let rows = (0..n)
        .map(|i| {
            let mut r = Row::new();
            r.insert("q".into(), json!(format!("q{}", i)));
            r.insert("a".into(), json!(format!("a{}", i)));
            r
        })
        .collect();
    Dataset::new("rows.jsonl", vec!["q".into(), "a".into()], "a", rows)
        .expect("valid dataset")
}

pub fn config() -> RunConfig {
    RunConfig {
        model: TEST_MODEL.into(),
        judge_model: JUDGE_MODEL.into(),
        improver_model: IMPROVER_MODEL.into(),
        ..RunConfig::default()
    }
}

pub fn new_run(name: &str, config: RunConfig, dataset: &Dataset) -> NewRun {
    NewRun {
        name: name.into(),
        initial_prompt: INITIAL_PROMPT.into(),
        config,
        dataset: dataset.reference(),
    }
}

pub fn registry_with(client: Arc<FakeClient>, feedback_timeout: Duration) -> (RunRegistry, Store) {
    let store = Store::memory().expect("memory store");
    store.init_schema().expect("schema");
    let providers = ProviderRegistry::new(RetryConfig::no_retry())
        .register("fake", client)
        .with_default("fake");
    let registry = RunRegistry::new(
        store.clone(),
        EventBus::default(),
        Arc::new(providers),
        feedback_timeout,
    );
    (registry, store)
}

pub async fn drain(mut stream: EventStream) -> Vec<RunEvent> {
    let mut out = Vec::new();
    while let Some(ev) = stream.next().await {
        out.push(ev);
    }
    out
}

/// Persist, subscribe, then launch, so no event is missed.
pub fn start(
    registry: &RunRegistry,
    run: &NewRun,
    dataset: Dataset,
) -> anyhow::Result<(i64, EventStream)> {
    let run_id = registry.store().create_run(run)?;
    let stream = registry.subscribe(run_id);
    registry.launch(run_id, dataset)?;
    Ok((run_id, stream))
}
