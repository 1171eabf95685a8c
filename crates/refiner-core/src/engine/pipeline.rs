//! The per-run orchestrator: test, judge, summarize, optional human feedback,
//! convergence check and improve, repeated until the run reaches a terminal
//! state. Everything a subscriber or the CLI can later ask about is written to
//! the store before the matching event is published.

use crate::dataset::Dataset;
use crate::engine::control::{FeedbackOutcome, Phase, RunControl};
use crate::engine::convergence::{ConvergencePolicy, Decision};
use crate::engine::improver::{improve, ImproveRequest};
use crate::engine::judge::judge_results;
use crate::engine::summarizer::summarize;
use crate::engine::tester::run_tests;
use crate::events::{EventBus, RunEvent};
use crate::model::{ConvergenceReason, LogLevel, RunRecord, RunStatus, ScoreStats, Stage};
use crate::providers::llm::Gateway;
use crate::providers::registry::ProviderRegistry;
use crate::storage::Store;
use crate::template;
use anyhow::Context;
use serde_json::{json, Value};
use std::sync::Arc;

pub struct Pipeline {
    pub store: Store,
    pub events: EventBus,
    pub providers: Arc<ProviderRegistry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Converged(ConvergenceReason),
    Stopped,
}

#[derive(Debug, Default)]
struct Progress {
    best_score: Option<f64>,
    completed: u32,
}

struct Gateways {
    tester: Gateway,
    judge: Gateway,
    improver: Gateway,
}

impl Pipeline {
    /// Drive `run_id` from `pending` to a terminal status. Only returns an
    /// error when the run could not be started or its terminal status could
    /// not be written; failures inside the loop end the run as `failed`.
    pub async fn execute(
        &self,
        run_id: i64,
        dataset: Dataset,
        control: Arc<RunControl>,
    ) -> anyhow::Result<RunStatus> {
        let run = match self.start(run_id) {
            Ok(run) => run,
            Err(e) => {
                self.finish(run_id, &control);
                return Err(e);
            }
        };
        control.set_phase(Phase::Running);
        self.log(
            run_id,
            None,
            Stage::System,
            LogLevel::Info,
            &format!("run '{}' started", run.name),
            Some(json!({
                "rows": dataset.len(),
                "max_iterations": run.config.max_iterations,
                "target_score": run.config.target_score,
            })),
        );

        let mut progress = Progress::default();
        let result = self.iterate(&run, &dataset, &control, &mut progress).await;

        let (status, event, error) = match result {
            Ok(Outcome::Converged(reason @ ConvergenceReason::MaxIterations)) => (
                RunStatus::Completed,
                RunEvent::Completed {
                    reason,
                    best_score: progress.best_score,
                    total_iterations: progress.completed,
                },
                None,
            ),
            Ok(Outcome::Converged(reason)) => (
                RunStatus::Completed,
                RunEvent::Converged {
                    reason,
                    best_score: progress.best_score,
                },
                None,
            ),
            Ok(Outcome::Stopped) => (RunStatus::Stopped, RunEvent::Stopped {}, None),
            Err(e) => {
                let msg = format!("{:#}", e);
                (
                    RunStatus::Failed,
                    RunEvent::Failed { error: msg.clone() },
                    Some(msg),
                )
            }
        };

        let finalized = self
            .store
            .finalize_run(run_id, status, error.as_deref())
            .with_context(|| format!("failed to finalize run {}", run_id));
        let level = match status {
            RunStatus::Failed => LogLevel::Error,
            _ => LogLevel::Info,
        };
        self.log(
            run_id,
            None,
            Stage::System,
            level,
            &match &error {
                Some(e) => format!("run failed: {}", e),
                None => format!("run {}", status),
            },
            Some(json!({
                "status": status.as_str(),
                "best_score": progress.best_score,
                "iterations": progress.completed,
            })),
        );
        self.events.publish(run_id, event);
        self.finish(run_id, &control);
        finalized?;
        Ok(status)
    }

    fn start(&self, run_id: i64) -> anyhow::Result<RunRecord> {
        let run = self
            .store
            .get_run(run_id)?
            .ok_or_else(|| anyhow::anyhow!("run {} not found", run_id))?;
        if !self.store.mark_running(run_id)? {
            anyhow::bail!("run {} is {}, expected pending", run_id, run.status);
        }
        Ok(run)
    }

    fn finish(&self, run_id: i64, control: &RunControl) {
        control.set_phase(Phase::Finished);
        self.events.close(run_id);
    }

    async fn iterate(
        &self,
        run: &RunRecord,
        dataset: &Dataset,
        control: &RunControl,
        progress: &mut Progress,
    ) -> anyhow::Result<Outcome> {
        let run_id = run.id;
        let cfg = &run.config;
        dataset.validate()?;
        let input_columns = dataset.input_columns();
        if cfg.enforce_placeholders {
            template::check_columns(&run.initial_prompt, &input_columns)?;
        }
        let gw = self.gateways(run)?;
        let policy = ConvergencePolicy::from(cfg);

        let mut current = run.initial_prompt.clone();
        let mut history: Vec<f64> = Vec::new();

        for iteration in 1..=cfg.max_iterations {
            if control.stop_requested() {
                return Ok(Outcome::Stopped);
            }
            let iteration_id = self.store.insert_iteration(run_id, iteration, &current)?;

            // test
            self.stage_start(run_id, iteration, Stage::Test);
            let rows = run_tests(
                &gw.tester,
                &current,
                dataset,
                &cfg.model,
                cfg.temperature,
                cfg.concurrency,
                |completed, total| {
                    self.events.publish(
                        run_id,
                        RunEvent::TestProgress {
                            iteration,
                            completed,
                            total,
                        },
                    )
                },
            )
            .await;

            let failed = rows.iter().filter(|r| r.actual.is_none()).count();
            if failed == rows.len() {
                self.store.save_results(iteration_id, &rows)?;
                let first = rows
                    .iter()
                    .find_map(|r| r.error.clone())
                    .unwrap_or_default();
                anyhow::bail!(
                    "all {} rows failed execution in iteration {}: {}",
                    rows.len(),
                    iteration,
                    first
                );
            }
            if failed > 0 {
                self.log(
                    run_id,
                    Some(iteration_id),
                    Stage::Test,
                    LogLevel::Warn,
                    &format!("{} of {} rows failed execution", failed, rows.len()),
                    Some(json!({
                        "failed_rows": rows.iter().filter(|r| r.actual.is_none()).map(|r| r.index).collect::<Vec<_>>()
                    })),
                );
            }
            if control.stop_requested() {
                self.store.save_results(iteration_id, &rows)?;
                return Ok(Outcome::Stopped);
            }

            // judge
            self.stage_start(run_id, iteration, Stage::Judge);
            let rows = judge_results(
                &gw.judge,
                rows,
                &cfg.judge_model,
                cfg.judge_prompt.as_deref(),
                cfg.concurrency,
            )
            .await;
            let stats = ScoreStats::from_rows(&rows);
            let mut best_update = None;
            if let Some(avg) = stats.avg {
                if progress.best_score.map_or(true, |b| avg > b) {
                    progress.best_score = Some(avg);
                    best_update = Some((avg, current.as_str()));
                }
            }
            progress.completed = iteration;
            self.store
                .save_scored_results(run_id, iteration_id, &rows, &stats, best_update, iteration)
                .with_context(|| format!("failed to save results of iteration {}", iteration))?;
            self.log(
                run_id,
                Some(iteration_id),
                Stage::Judge,
                LogLevel::Info,
                &format!("judged {} rows", rows.len()),
                Some(json!({"avg": stats.avg, "min": stats.min, "max": stats.max})),
            );
            if control.stop_requested() {
                return Ok(Outcome::Stopped);
            }

            // summarize
            self.stage_start(run_id, iteration, Stage::Summarize);
            let outcome = summarize(
                &gw.improver,
                &cfg.improver_model,
                &current,
                &rows,
                &cfg.summary_language,
            )
            .await
            .context("summarize stage failed")?;
            if let Some(reason) = &outcome.degraded {
                self.log(
                    run_id,
                    Some(iteration_id),
                    Stage::Summarize,
                    LogLevel::Warn,
                    "summary unavailable; keeping score statistics only",
                    Some(json!({ "reason": reason })),
                );
            }
            let summary = outcome.summary;

            self.store.record_summary(iteration_id, &summary)?;
            self.log(
                run_id,
                Some(iteration_id),
                Stage::Summarize,
                LogLevel::Info,
                &format!(
                    "iteration {} scored {:.3} (best {:.3})",
                    iteration,
                    stats.effective(),
                    progress.best_score.unwrap_or(0.0)
                ),
                None,
            );
            self.events.publish(
                run_id,
                RunEvent::IterationComplete {
                    iteration,
                    avg_score: stats.avg,
                    best_score: progress.best_score,
                },
            );
            history.push(stats.effective());
            let decision = policy.evaluate(iteration, &history);

            // feedback, only when an improve stage will consume it
            let mut feedback = String::new();
            if cfg.human_feedback_enabled && decision == Decision::Continue {
                if control.stop_requested() {
                    return Ok(Outcome::Stopped);
                }
                self.events.publish(
                    run_id,
                    RunEvent::FeedbackRequested {
                        iteration,
                        summary: summary.clone(),
                    },
                );
                match control.await_feedback(iteration).await {
                    FeedbackOutcome::Submitted(text) => {
                        self.store.record_feedback(iteration_id, &text)?;
                        self.log(
                            run_id,
                            Some(iteration_id),
                            Stage::System,
                            LogLevel::Info,
                            "human feedback received",
                            Some(json!({ "chars": text.chars().count() })),
                        );
                        feedback = text;
                    }
                    FeedbackOutcome::TimedOut => {
                        self.log(
                            run_id,
                            Some(iteration_id),
                            Stage::System,
                            LogLevel::Warn,
                            "no feedback before timeout; continuing without it",
                            None,
                        );
                    }
                    FeedbackOutcome::Cancelled => return Ok(Outcome::Stopped),
                }
            }

            // convergence
            if let Decision::Stop(reason) = decision {
                let note = match reason {
                    ConvergenceReason::Target => "target score reached",
                    ConvergenceReason::Stagnation => "score stagnated",
                    ConvergenceReason::MaxIterations => "iteration limit reached",
                };
                self.store.record_improvement(iteration_id, note, None)?;
                self.log(
                    run_id,
                    Some(iteration_id),
                    Stage::System,
                    LogLevel::Info,
                    &format!("converged: {}", reason),
                    Some(json!({ "history": history })),
                );
                return Ok(Outcome::Converged(reason));
            }
            if control.stop_requested() {
                return Ok(Outcome::Stopped);
            }

            // improve
            self.stage_start(run_id, iteration, Stage::Improve);
            let imp = improve(
                &gw.improver,
                &cfg.improver_model,
                &ImproveRequest {
                    current_prompt: &current,
                    summary: &summary,
                    rows: &rows,
                    target_score: cfg.target_score,
                    input_columns: &input_columns,
                    feedback: &feedback,
                    language: &cfg.summary_language,
                    enforce_placeholders: cfg.enforce_placeholders,
                },
            )
            .await
            .context("improve stage failed")?;
            self.store
                .record_improvement(iteration_id, &imp.reasoning, Some(&imp.improver_prompt))?;
            if let Some(reason) = &imp.malformed {
                self.log(
                    run_id,
                    Some(iteration_id),
                    Stage::Improve,
                    LogLevel::Warn,
                    "improver response unusable; prompt kept",
                    Some(json!({ "reason": reason })),
                );
            }
            if !imp.dropped_placeholders.is_empty() {
                let msg = if imp.changed {
                    "rewrite dropped placeholders"
                } else {
                    "rewrite rejected: it dropped placeholders"
                };
                self.log(
                    run_id,
                    Some(iteration_id),
                    Stage::Improve,
                    LogLevel::Warn,
                    msg,
                    Some(json!({ "dropped": imp.dropped_placeholders })),
                );
            } else if !imp.changed {
                self.log(
                    run_id,
                    Some(iteration_id),
                    Stage::Improve,
                    LogLevel::Info,
                    "prompt unchanged",
                    None,
                );
            }
            current = imp.prompt;
        }

        // evaluate() stops at max_iterations, so the loop never runs dry.
        Ok(Outcome::Converged(ConvergenceReason::MaxIterations))
    }

    fn gateways(&self, run: &RunRecord) -> anyhow::Result<Gateways> {
        let cfg = &run.config;
        Ok(Gateways {
            tester: self
                .providers
                .gateway(cfg.model_provider.as_deref())
                .context("test provider")?,
            judge: self
                .providers
                .gateway(cfg.judge_provider.as_deref())
                .context("judge provider")?,
            improver: self
                .providers
                .gateway(cfg.improver_provider.as_deref())
                .context("improver provider")?,
        })
    }

    fn stage_start(&self, run_id: i64, iteration: u32, stage: Stage) {
        tracing::debug!(run_id, iteration, stage = stage.as_str(), "stage start");
        self.events
            .publish(run_id, RunEvent::StageStart { iteration, stage });
    }

    /// Persist a log entry and mirror it to tracing. A log that cannot be
    /// stored is reported but never fails the run.
    fn log(
        &self,
        run_id: i64,
        iteration_id: Option<i64>,
        stage: Stage,
        level: LogLevel,
        message: &str,
        data: Option<Value>,
    ) {
        let s = stage.as_str();
        match level {
            LogLevel::Info => tracing::info!(run_id, stage = s, data = ?data, "{}", message),
            LogLevel::Warn => {
                tracing::warn!(event = "run_warning", run_id, stage = s, data = ?data, "{}", message)
            }
            LogLevel::Error => {
                tracing::error!(event = "run_error", run_id, stage = s, data = ?data, "{}", message)
            }
        }
        if let Err(e) = self
            .store
            .append_log(run_id, iteration_id, stage, level, message, data.as_ref())
        {
            tracing::warn!(event = "log_write_failed", run_id, error = %e, "failed to persist log entry");
        }
    }
}
