use super::exit_codes;
use crate::cli::args::{OutputFormat, RunsArgs, RunsSub};
use refiner_core::model::{LogLevel, Stage};
use refiner_core::report::{self, console};
use refiner_core::storage::Store;
use serde_json::json;

pub fn cmd_runs(args: RunsArgs) -> anyhow::Result<i32> {
    let cfg = match super::load_config(&args.config, args.db.as_ref(), false) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", e);
            return Ok(exit_codes::CONFIG_ERROR);
        }
    };
    let store = super::open_store(&cfg)?;
    let json_out = args.format == OutputFormat::Json;

    match args.cmd {
        RunsSub::List => {
            let runs = store.list_runs()?;
            if json_out {
                println!("{}", serde_json::to_string_pretty(&runs)?);
            } else {
                print!("{}", console::render_runs(&runs));
            }
            Ok(exit_codes::OK)
        }
        RunsSub::Show { run_id, iteration } => show(&store, run_id, iteration, json_out),
        RunsSub::Logs {
            run_id,
            stage,
            level,
        } => {
            let stage = match stage.as_deref().map(|s| Stage::parse(s).ok_or(s)) {
                Some(Err(s)) => {
                    eprintln!("config error: unknown stage '{}'", s);
                    return Ok(exit_codes::CONFIG_ERROR);
                }
                Some(Ok(s)) => Some(s),
                None => None,
            };
            let level = match level.as_deref().map(|l| LogLevel::parse(l).ok_or(l)) {
                Some(Err(l)) => {
                    eprintln!("config error: unknown level '{}'", l);
                    return Ok(exit_codes::CONFIG_ERROR);
                }
                Some(Ok(l)) => Some(l),
                None => None,
            };
            if store.get_run(run_id)?.is_none() {
                eprintln!("run {} not found", run_id);
                return Ok(exit_codes::RUN_FAILED);
            }
            let logs = store.list_logs(run_id, stage, level)?;
            if json_out {
                println!("{}", serde_json::to_string_pretty(&logs)?);
            } else {
                print!("{}", console::render_logs(&logs));
            }
            Ok(exit_codes::OK)
        }
        RunsSub::Delete { run_id } => {
            if store.delete_run(run_id)? {
                eprintln!("deleted run {}", run_id);
                Ok(exit_codes::OK)
            } else {
                eprintln!("run {} not found", run_id);
                Ok(exit_codes::RUN_FAILED)
            }
        }
    }
}

fn show(store: &Store, run_id: i64, iteration: Option<u32>, json_out: bool) -> anyhow::Result<i32> {
    let Some(run) = store.get_run(run_id)? else {
        eprintln!("run {} not found", run_id);
        return Ok(exit_codes::RUN_FAILED);
    };

    match iteration {
        None => {
            let iterations = store.list_iterations(run_id)?;
            if json_out {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report::run_json(&run, &iterations))?
                );
            } else {
                print!("{}", console::render_run(&run, &iterations));
            }
        }
        Some(num) => {
            let Some(it) = store.get_iteration(run_id, num)? else {
                eprintln!("run {} has no iteration {}", run_id, num);
                return Ok(exit_codes::RUN_FAILED);
            };
            let rows = store.list_results(it.id)?;
            if json_out {
                let out = json!({ "iteration": it, "results": rows });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!("Iteration {} of run #{}", it.iteration_num, run_id);
                println!("prompt:\n{}\n", it.prompt_template);
                print!("{}", console::render_results(&rows));
                if let Some(r) = &it.improvement_reasoning {
                    println!("\nimprovement reasoning: {}", r);
                }
            }
        }
    }
    Ok(exit_codes::OK)
}
