use crate::events::RunEvent;
use crate::model::{IterationRecord, LogEntry, RunRecord, TestResultRow};
use std::fmt::Write;

fn score(s: Option<f64>) -> String {
    s.map(|v| format!("{:.3}", v)).unwrap_or_else(|| "-".into())
}

fn one_line(s: &str, max: usize) -> String {
    let flat = s.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max {
        flat
    } else {
        let cut: String = flat.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}

pub fn render_runs(runs: &[RunRecord]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:>5}  {:<24} {:<10} {:>6} {:>6}  {}",
        "ID", "NAME", "STATUS", "BEST", "ITERS", "CREATED"
    );
    for r in runs {
        let _ = writeln!(
            out,
            "{:>5}  {:<24} {:<10} {:>6} {:>6}  {}",
            r.id,
            one_line(&r.name, 24),
            r.status.as_str(),
            score(r.best_score),
            r.total_iterations_completed,
            r.created_at
        );
    }
    out
}

pub fn render_run(run: &RunRecord, iterations: &[IterationRecord]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Run #{} '{}' [{}]", run.id, run.name, run.status);
    let _ = writeln!(
        out,
        "  dataset: {} ({} columns, expected '{}')",
        run.dataset.filename,
        run.dataset.columns.len(),
        run.dataset.expected_column
    );
    let _ = writeln!(
        out,
        "  models: test={} judge={} improver={}",
        run.config.model, run.config.judge_model, run.config.improver_model
    );
    let _ = writeln!(
        out,
        "  target {:.2}, max {} iterations, completed {}",
        run.config.target_score, run.config.max_iterations, run.total_iterations_completed
    );
    if let Some(e) = &run.error_message {
        let _ = writeln!(out, "  error: {}", e);
    }

    let _ = writeln!(out, "\n{:>4} {:>7} {:>7} {:>7}  {}", "#", "AVG", "MIN", "MAX", "SUMMARY");
    for it in iterations {
        let _ = writeln!(
            out,
            "{:>4} {:>7} {:>7} {:>7}  {}",
            it.iteration_num,
            score(it.avg_score),
            score(it.min_score),
            score(it.max_score),
            one_line(it.summary.as_deref().unwrap_or(""), 60)
        );
    }

    if let Some(best) = &run.best_prompt {
        let _ = writeln!(out, "\nBest prompt ({}):\n{}", score(run.best_score), best);
    }
    out
}

pub fn render_results(rows: &[TestResultRow]) -> String {
    let mut out = String::new();
    for r in rows {
        let _ = writeln!(
            out,
            "[{}] score {}  expected: {}  actual: {}",
            r.index,
            score(r.score),
            one_line(&r.expected, 40),
            match (&r.actual, &r.error) {
                (Some(a), _) => one_line(a, 40),
                (None, Some(e)) => format!("ERROR {}", one_line(e, 40)),
                (None, None) => "-".into(),
            }
        );
        if let Some(reason) = &r.judge_reasoning {
            let _ = writeln!(out, "      {}", one_line(reason, 100));
        }
    }
    out
}

pub fn render_logs(logs: &[LogEntry]) -> String {
    let mut out = String::new();
    for l in logs {
        let _ = writeln!(
            out,
            "{} {:<5} {:<9} {}",
            l.created_at,
            l.level.as_str(),
            l.stage.as_str(),
            l.message
        );
    }
    out
}

/// One human-readable line per event, as printed by `refiner run`.
pub fn render_event(ev: &RunEvent) -> String {
    match ev {
        RunEvent::StageStart { iteration, stage } => {
            format!("iteration {}: {}", iteration, stage.as_str())
        }
        RunEvent::TestProgress {
            completed, total, ..
        } => format!("  tested {}/{}", completed, total),
        RunEvent::IterationComplete {
            iteration,
            avg_score,
            best_score,
        } => format!(
            "iteration {} done: avg {} (best {})",
            iteration,
            score(*avg_score),
            score(*best_score)
        ),
        RunEvent::FeedbackRequested { iteration, summary } => format!(
            "iteration {} awaiting feedback: {}",
            iteration,
            one_line(&summary.summary, 120)
        ),
        RunEvent::Converged { reason, best_score } => {
            format!("converged ({}), best {}", reason, score(*best_score))
        }
        RunEvent::Completed {
            reason,
            best_score,
            total_iterations,
        } => format!(
            "completed ({}) after {} iterations, best {}",
            reason,
            total_iterations,
            score(*best_score)
        ),
        RunEvent::Failed { error } => format!("failed: {}", error),
        RunEvent::Stopped {} => "stopped".to_string(),
    }
}
