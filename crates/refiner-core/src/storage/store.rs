use crate::model::{
    DatasetRef, InputData, IterationRecord, LogEntry, LogLevel, NewRun, RunConfig, RunRecord,
    RunStatus, ScoreStats, Stage, Summary, TestResultRow,
};
use anyhow::Context;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone)]
pub struct Store {
    pub conn: Arc<Mutex<Connection>>,
}

const RUN_COLUMNS: &str = "id, name, status, initial_prompt, best_prompt, best_score, config_json,
    dataset_filename, dataset_columns_json, expected_column, total_iterations_completed,
    error_message, created_at, finished_at";

const ITERATION_COLUMNS: &str = "id, run_id, iteration_num, prompt_template, avg_score, min_score,
    max_score, summary, summary_json, improvement_reasoning, improver_prompt, human_feedback,
    created_at";

impl Store {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create db dir {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("failed to open sqlite db")?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite db")?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(crate::storage::schema::DDL)?;
        Ok(())
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("sqlite connection mutex poisoned"))
    }

    // --- runs ---

    pub fn create_run(&self, run: &NewRun) -> anyhow::Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO runs(name, status, initial_prompt, config_json, dataset_filename,
                dataset_columns_json, expected_column, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run.name,
                RunStatus::Pending.as_str(),
                run.initial_prompt,
                serde_json::to_string(&run.config)?,
                run.dataset.filename,
                serde_json::to_string(&run.dataset.columns)?,
                run.dataset.expected_column,
                now_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_run(&self, run_id: i64) -> anyhow::Result<Option<RunRecord>> {
        let conn = self.lock()?;
        let run = conn
            .query_row(
                &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
                params![run_id],
                map_run,
            )
            .optional()?;
        Ok(run)
    }

    /// Newest first.
    pub fn list_runs(&self) -> anyhow::Result<Vec<RunRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM runs ORDER BY id DESC", RUN_COLUMNS))?;
        let rows = stmt.query_map([], map_run)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// `pending -> running`. Returns false when the run was not pending.
    pub fn mark_running(&self, run_id: i64) -> anyhow::Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE runs SET status = ?1 WHERE id = ?2 AND status = ?3",
            params![
                RunStatus::Running.as_str(),
                run_id,
                RunStatus::Pending.as_str()
            ],
        )?;
        Ok(n == 1)
    }

    /// Terminal transition. Never overwrites an already terminal run.
    pub fn finalize_run(
        &self,
        run_id: i64,
        status: RunStatus,
        error_message: Option<&str>,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(status.is_terminal(), "{} is not a terminal status", status);
        let conn = self.lock()?;
        conn.execute(
            "UPDATE runs SET status = ?1, error_message = COALESCE(?2, error_message), finished_at = ?3
             WHERE id = ?4 AND status IN ('pending', 'running')",
            params![status.as_str(), error_message, now_rfc3339(), run_id],
        )?;
        Ok(())
    }

    /// Cascades to iterations, test results and logs.
    pub fn delete_run(&self, run_id: i64) -> anyhow::Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute("DELETE FROM runs WHERE id = ?1", params![run_id])?;
        Ok(n == 1)
    }

    // --- iterations ---

    pub fn insert_iteration(
        &self,
        run_id: i64,
        iteration_num: u32,
        prompt_template: &str,
    ) -> anyhow::Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO iterations(run_id, iteration_num, prompt_template, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![run_id, iteration_num, prompt_template, now_rfc3339()],
        )
        .with_context(|| format!("failed to insert iteration {} of run {}", iteration_num, run_id))?;
        Ok(conn.last_insert_rowid())
    }

    /// Rows that never reached scoring. The iteration's stats stay null.
    pub fn save_results(&self, iteration_id: i64, rows: &[TestResultRow]) -> anyhow::Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        insert_results(&tx, iteration_id, rows)?;
        tx.commit()?;
        Ok(())
    }

    /// Judged rows, their aggregate and the run's progress counters, committed
    /// together so the run's best always matches its scored iterations. `best`
    /// is only written when it changed.
    pub fn save_scored_results(
        &self,
        run_id: i64,
        iteration_id: i64,
        rows: &[TestResultRow],
        stats: &ScoreStats,
        best: Option<(f64, &str)>,
        total_completed: u32,
    ) -> anyhow::Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        insert_results(&tx, iteration_id, rows)?;
        tx.execute(
            "UPDATE iterations SET avg_score = ?1, min_score = ?2, max_score = ?3 WHERE id = ?4",
            params![stats.avg, stats.min, stats.max, iteration_id],
        )?;
        tx.execute(
            "UPDATE runs SET total_iterations_completed = ?1 WHERE id = ?2",
            params![total_completed, run_id],
        )?;
        if let Some((score, prompt)) = best {
            tx.execute(
                "UPDATE runs SET best_score = ?1, best_prompt = ?2 WHERE id = ?3",
                params![score, prompt, run_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn record_summary(&self, iteration_id: i64, summary: &Summary) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE iterations SET summary = ?1, summary_json = ?2 WHERE id = ?3",
            params![summary.summary, serde_json::to_string(summary)?, iteration_id],
        )?;
        Ok(())
    }

    pub fn record_feedback(&self, iteration_id: i64, feedback: &str) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE iterations SET human_feedback = ?1 WHERE id = ?2",
            params![feedback, iteration_id],
        )?;
        Ok(())
    }

    pub fn record_improvement(
        &self,
        iteration_id: i64,
        reasoning: &str,
        improver_prompt: Option<&str>,
    ) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE iterations SET improvement_reasoning = ?1, improver_prompt = ?2 WHERE id = ?3",
            params![reasoning, improver_prompt, iteration_id],
        )?;
        Ok(())
    }

    pub fn list_iterations(&self, run_id: i64) -> anyhow::Result<Vec<IterationRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM iterations WHERE run_id = ?1 ORDER BY iteration_num",
            ITERATION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![run_id], map_iteration)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn get_iteration(
        &self,
        run_id: i64,
        iteration_num: u32,
    ) -> anyhow::Result<Option<IterationRecord>> {
        let conn = self.lock()?;
        let it = conn
            .query_row(
                &format!(
                    "SELECT {} FROM iterations WHERE run_id = ?1 AND iteration_num = ?2",
                    ITERATION_COLUMNS
                ),
                params![run_id, iteration_num],
                map_iteration,
            )
            .optional()?;
        Ok(it)
    }

    /// Ordered by dataset row index.
    pub fn list_results(&self, iteration_id: i64) -> anyhow::Result<Vec<TestResultRow>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT row_index, input_json, expected_output, actual_output, error, score, judge_reasoning
             FROM test_results WHERE iteration_id = ?1 ORDER BY row_index",
        )?;
        let rows = stmt.query_map(params![iteration_id], |row| {
            let input_data: InputData = json_col(row, 1)?;
            Ok(TestResultRow {
                index: row.get::<_, i64>(0)? as usize,
                input_data,
                expected: row.get(2)?,
                actual: row.get(3)?,
                error: row.get(4)?,
                score: row.get(5)?,
                judge_reasoning: row.get(6)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    // --- logs ---

    pub fn append_log(
        &self,
        run_id: i64,
        iteration_id: Option<i64>,
        stage: Stage,
        level: LogLevel,
        message: &str,
        data: Option<&serde_json::Value>,
    ) -> anyhow::Result<i64> {
        let data_json = data.map(serde_json::to_string).transpose()?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO logs(run_id, iteration_id, stage, level, message, data_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run_id,
                iteration_id,
                stage.as_str(),
                level.as_str(),
                message,
                data_json,
                now_rfc3339()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// In insertion order, optionally filtered.
    pub fn list_logs(
        &self,
        run_id: i64,
        stage: Option<Stage>,
        level: Option<LogLevel>,
    ) -> anyhow::Result<Vec<LogEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, run_id, iteration_id, stage, level, message, data_json, created_at
             FROM logs
             WHERE run_id = ?1 AND (?2 IS NULL OR stage = ?2) AND (?3 IS NULL OR level = ?3)
             ORDER BY id",
        )?;
        let rows = stmt.query_map(
            params![run_id, stage.map(|s| s.as_str()), level.map(|l| l.as_str())],
            |row| {
                let stage: String = row.get(3)?;
                let level: String = row.get(4)?;
                let data_json: Option<String> = row.get(6)?;
                Ok(LogEntry {
                    id: row.get(0)?,
                    run_id: row.get(1)?,
                    iteration_id: row.get(2)?,
                    stage: Stage::parse(&stage).unwrap_or(Stage::System),
                    level: LogLevel::parse(&level).unwrap_or(LogLevel::Info),
                    message: row.get(5)?,
                    data: data_json.and_then(|s| serde_json::from_str(&s).ok()),
                    created_at: row.get(7)?,
                })
            },
        )?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

fn insert_results(
    tx: &rusqlite::Transaction<'_>,
    iteration_id: i64,
    rows: &[TestResultRow],
) -> anyhow::Result<()> {
    let mut stmt = tx.prepare(
        "INSERT INTO test_results(iteration_id, row_index, input_json, expected_output,
            actual_output, error, score, judge_reasoning)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for r in rows {
        stmt.execute(params![
            iteration_id,
            r.index as i64,
            serde_json::to_string(&r.input_data)?,
            r.expected,
            r.actual,
            r.error,
            r.score,
            r.judge_reasoning,
        ])?;
    }
    Ok(())
}

fn map_run(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    let status: String = row.get(2)?;
    let config: RunConfig = json_col(row, 6)?;
    let columns: Vec<String> = json_col(row, 8)?;
    Ok(RunRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        status: RunStatus::parse(&status),
        initial_prompt: row.get(3)?,
        best_prompt: row.get(4)?,
        best_score: row.get(5)?,
        config,
        dataset: DatasetRef {
            filename: row.get(7)?,
            columns,
            expected_column: row.get(9)?,
        },
        total_iterations_completed: row.get(10)?,
        error_message: row.get(11)?,
        created_at: row.get(12)?,
        finished_at: row.get(13)?,
    })
}

fn map_iteration(row: &Row<'_>) -> rusqlite::Result<IterationRecord> {
    let summary_json: Option<String> = row.get(8)?;
    Ok(IterationRecord {
        id: row.get(0)?,
        run_id: row.get(1)?,
        iteration_num: row.get(2)?,
        prompt_template: row.get(3)?,
        avg_score: row.get(4)?,
        min_score: row.get(5)?,
        max_score: row.get(6)?,
        summary: row.get(7)?,
        summary_details: summary_json.and_then(|s| serde_json::from_str(&s).ok()),
        improvement_reasoning: row.get(9)?,
        improver_prompt: row.get(10)?,
        human_feedback: row.get(11)?,
        created_at: row.get(12)?,
    })
}

fn json_col<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
