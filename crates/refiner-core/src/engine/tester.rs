use crate::dataset::Dataset;
use crate::model::TestResultRow;
use crate::providers::llm::Gateway;
use crate::template;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Render `prompt_template` for every row and complete it, at most
/// `concurrency` calls at a time. `on_progress(completed, total)` fires once
/// per finished row in completion order; the returned rows are in dataset
/// order. Row failures are recorded on the row, never returned.
pub async fn run_tests<F>(
    gateway: &Gateway,
    prompt_template: &str,
    dataset: &Dataset,
    model: &str,
    temperature: f32,
    concurrency: usize,
    mut on_progress: F,
) -> Vec<TestResultRow>
where
    F: FnMut(usize, usize),
{
    let total = dataset.len();
    let sem = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut rows: Vec<TestResultRow> = (0..total)
        .map(|i| TestResultRow {
            index: i,
            input_data: dataset.input_data(i),
            expected: dataset.expected(i),
            actual: None,
            error: None,
            score: None,
            judge_reasoning: None,
        })
        .collect();

    let mut set = JoinSet::new();
    for row in &rows {
        let sem = sem.clone();
        let gw = gateway.clone();
        let model = model.to_string();
        let prompt = template::render(prompt_template, &row.input_data);
        let index = row.index;
        set.spawn(async move {
            let _permit = match sem.acquire_owned().await {
                Ok(p) => p,
                Err(e) => return (index, Err(e.to_string())),
            };
            let out = gw
                .complete(&prompt, &model, temperature)
                .await
                .map_err(|e| e.to_string());
            (index, out)
        });
    }

    let mut completed = 0;
    while let Some(joined) = set.join_next().await {
        completed += 1;
        match joined {
            Ok((index, Ok(text))) => rows[index].actual = Some(text),
            Ok((index, Err(err))) => {
                tracing::debug!(row = index, error = %err, "row execution failed");
                rows[index].error = Some(err);
            }
            Err(join_err) => {
                // The row index is lost with the task; it stays unanswered below.
                tracing::error!(error = %join_err, "test task aborted");
            }
        }
        on_progress(completed, total);
    }

    for row in rows.iter_mut() {
        if row.actual.is_none() && row.error.is_none() {
            row.error = Some("test task aborted".into());
        }
    }
    rows
}
