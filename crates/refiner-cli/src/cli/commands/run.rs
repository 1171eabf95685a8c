use super::exit_codes;
use crate::cli::args::{OutputFormat, RunArgs};
use refiner_core::dataset::Dataset;
use refiner_core::engine::RunRegistry;
use refiner_core::events::{EventBus, EventStream, RunEvent};
use refiner_core::model::{NewRun, RunConfig, RunStatus};
use refiner_core::providers::registry::ProviderRegistry;
use refiner_core::report::console;
use refiner_core::template;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;

pub async fn cmd_run(args: RunArgs) -> anyhow::Result<i32> {
    let cfg = match super::load_config(&args.config, args.db.as_ref(), args.strict) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", e);
            return Ok(exit_codes::CONFIG_ERROR);
        }
    };

    let run_cfg = match run_config(&args, cfg.defaults.run_config()) {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("config error: {}", msg);
            return Ok(exit_codes::CONFIG_ERROR);
        }
    };

    let prompt = match (&args.prompt, &args.prompt_file) {
        (Some(p), _) => p.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read prompt {}: {}", path.display(), e))?,
        (None, None) => {
            eprintln!("config error: one of --prompt or --prompt-file is required");
            return Ok(exit_codes::CONFIG_ERROR);
        }
    };

    let dataset = match Dataset::from_jsonl(&args.dataset, &args.expected) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("dataset error: {}", e);
            return Ok(exit_codes::CONFIG_ERROR);
        }
    };
    if run_cfg.enforce_placeholders {
        if let Err(e) = template::check_columns(&prompt, &dataset.input_columns()) {
            eprintln!("dataset error: {}", e);
            return Ok(exit_codes::CONFIG_ERROR);
        }
    }

    let store = super::open_store(&cfg)?;
    let providers = Arc::new(ProviderRegistry::from_config(&cfg));
    let registry = Arc::new(RunRegistry::new(
        store.clone(),
        EventBus::default(),
        providers,
        cfg.defaults.feedback_timeout(),
    ));

    let name = args.name.clone().unwrap_or_else(|| {
        args.dataset
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "run".into())
    });
    let feedback_enabled = run_cfg.human_feedback_enabled;
    let run_id = store.create_run(&NewRun {
        name,
        initial_prompt: prompt,
        config: run_cfg,
        dataset: dataset.reference(),
    })?;
    let mut events = registry.subscribe(run_id);
    registry.launch(run_id, dataset)?;
    eprintln!("run #{} started (db: {})", run_id, cfg.database.display());

    let feedback_reader = feedback_enabled.then(|| spawn_feedback_reader(registry.clone(), run_id));

    let followed = follow(&registry, run_id, &mut events, args.format).await;
    if let Some(reader) = feedback_reader {
        reader.abort();
    }
    if let Err(e) = followed {
        // Stop and join the orchestrator before reporting.
        registry.shutdown().await;
        return Err(e);
    }

    let status = registry.wait(run_id).await?;
    if let Some(run) = store.get_run(run_id)? {
        if args.format == OutputFormat::Text {
            if let Some(best) = &run.best_prompt {
                println!(
                    "\nbest prompt (score {:.3}):\n{}",
                    run.best_score.unwrap_or_default(),
                    best
                );
            }
        }
    }
    Ok(match status {
        RunStatus::Completed => exit_codes::OK,
        _ => exit_codes::RUN_FAILED,
    })
}

/// Print events until the run's stream ends. The first Ctrl-C requests a stop.
async fn follow(
    registry: &RunRegistry,
    run_id: i64,
    events: &mut EventStream,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let mut stopping = false;
    loop {
        tokio::select! {
            ev = events.next() => {
                let Some(ev) = ev else { return Ok(()) };
                print_event(&ev, format)?;
                if matches!(ev, RunEvent::FeedbackRequested { .. }) && format == OutputFormat::Text {
                    eprintln!("feedback> type a line and press enter (empty line to skip)");
                }
            }
            _ = tokio::signal::ctrl_c(), if !stopping => {
                stopping = true;
                eprintln!("stop requested; finishing the current stage");
                if let Err(e) = registry.stop(run_id) {
                    tracing::debug!(run_id, error = %e, "stop ignored");
                }
            }
        }
    }
}

/// Config defaults with command line overrides applied, then validated.
fn run_config(args: &RunArgs, mut rc: RunConfig) -> Result<RunConfig, String> {
    if let Some(p) = &args.provider {
        rc.model_provider = Some(p.clone());
        rc.judge_provider = Some(p.clone());
        rc.improver_provider = Some(p.clone());
    }
    if let Some(p) = &args.judge_provider {
        rc.judge_provider = Some(p.clone());
    }
    if let Some(p) = &args.improver_provider {
        rc.improver_provider = Some(p.clone());
    }
    if let Some(m) = &args.model {
        rc.model = m.clone();
    }
    if let Some(m) = &args.judge_model {
        rc.judge_model = m.clone();
    }
    if let Some(m) = &args.improver_model {
        rc.improver_model = m.clone();
    }
    if let Some(v) = args.max_iterations {
        rc.max_iterations = v;
    }
    if let Some(v) = args.target_score {
        rc.target_score = v;
    }
    if let Some(v) = args.temperature {
        rc.temperature = v;
    }
    if let Some(v) = args.concurrency {
        rc.concurrency = v;
    }
    if let Some(l) = &args.language {
        rc.summary_language = l.clone();
    }
    if args.feedback {
        rc.human_feedback_enabled = true;
    }
    if let Some(path) = &args.judge_prompt_file {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read judge prompt {}: {}", path.display(), e))?;
        rc.judge_prompt = Some(text);
    }
    rc.validate().map_err(|e| e.0)?;
    Ok(rc)
}

fn print_event(ev: &RunEvent, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(ev)?),
        OutputFormat::Text => match ev {
            // Progress is noisy on a terminal; print every row only at debug level.
            RunEvent::TestProgress {
                completed, total, ..
            } if completed != total => {
                tracing::debug!(completed, total, "test progress");
            }
            _ => println!("{}", console::render_event(ev)),
        },
    }
    Ok(())
}

fn spawn_feedback_reader(
    registry: Arc<RunRegistry>,
    run_id: i64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Err(e) = registry.submit_feedback(run_id, line.trim()) {
                eprintln!("note: feedback ignored: {}", e);
            }
        }
    })
}
