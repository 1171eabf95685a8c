use refiner_core::model::{
    DatasetRef, InputData, LogLevel, NewRun, RunConfig, RunStatus, ScoreStats, Stage, Summary,
    TestResultRow,
};
use refiner_core::storage::Store;
use serde_json::json;

fn new_run() -> NewRun {
    NewRun {
        name: "smoke".into(),
        initial_prompt: "Translate {text}".into(),
        config: RunConfig::default(),
        dataset: DatasetRef {
            filename: "pairs.jsonl".into(),
            columns: vec!["text".into(), "translation".into()],
            expected_column: "translation".into(),
        },
    }
}

fn row(index: usize, score: f64) -> TestResultRow {
    let mut input = InputData::new();
    input.insert("text".into(), json!(format!("t{}", index)));
    TestResultRow {
        index,
        input_data: input,
        expected: format!("e{}", index),
        actual: Some(format!("a{}", index)),
        error: None,
        score: Some(score),
        judge_reasoning: Some("ok".into()),
    }
}

#[test]
fn test_on_disk_round_and_cascade() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("nested").join("refiner.db");

    let run_id;
    let iteration_id;
    {
        let store = Store::open(&path)?;
        store.init_schema()?;
        run_id = store.create_run(&new_run())?;
        assert!(store.mark_running(run_id)?);
        assert!(!store.mark_running(run_id)?);

        iteration_id = store.insert_iteration(run_id, 1, "Translate {text}")?;
        let rows = vec![row(1, 0.5), row(0, 1.0)];
        let stats = ScoreStats::from_rows(&rows);
        store.save_scored_results(
            run_id,
            iteration_id,
            &rows,
            &stats,
            Some((0.75, "Translate {text}")),
            1,
        )?;
        let summary = Summary {
            stats,
            summary: "decent".into(),
            ..Summary::default()
        };
        store.record_summary(iteration_id, &summary)?;
        store.append_log(run_id, Some(iteration_id), Stage::Judge, LogLevel::Info, "judged", None)?;
        store.finalize_run(run_id, RunStatus::Completed, None)?;
    }

    // Reopen: everything survived.
    let store = Store::open(&path)?;
    store.init_schema()?;
    let run = store.get_run(run_id)?.expect("run");
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.best_score, Some(0.75));
    assert_eq!(run.total_iterations_completed, 1);
    assert_eq!(run.config, RunConfig::default());
    assert_eq!(run.dataset.input_columns(), vec!["text".to_string()]);

    let it = store.get_iteration(run_id, 1)?.expect("iteration");
    assert_eq!(it.avg_score, Some(0.75));
    assert_eq!(it.summary.as_deref(), Some("decent"));
    let results = store.list_results(iteration_id)?;
    assert_eq!(results.iter().map(|r| r.index).collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(results[0].input_data["text"], json!("t0"));

    // Terminal runs are never rewritten.
    store.finalize_run(run_id, RunStatus::Failed, Some("late"))?;
    assert_eq!(store.get_run(run_id)?.expect("run").status, RunStatus::Completed);

    assert!(store.delete_run(run_id)?);
    assert!(store.get_run(run_id)?.is_none());
    assert!(store.list_iterations(run_id)?.is_empty());
    assert!(store.list_results(iteration_id)?.is_empty());
    assert!(store.list_logs(run_id, None, None)?.is_empty());
    Ok(())
}
