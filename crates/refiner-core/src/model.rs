use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};

/// Column values of one dataset row, minus the expected-output column, in
/// dataset column order.
pub type InputData = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => RunStatus::Running,
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            "stopped" => RunStatus::Stopped,
            _ => RunStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Stopped
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Test,
    Judge,
    Summarize,
    Improve,
    System,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Test => "test",
            Stage::Judge => "judge",
            Stage::Summarize => "summarize",
            Stage::Improve => "improve",
            Stage::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "test" => Some(Stage::Test),
            "judge" => Some(Stage::Judge),
            "summarize" => Some(Stage::Summarize),
            "improve" => Some(Stage::Improve),
            "system" => Some(Stage::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// Immutable per-run settings. Every field is resolved at creation time so the
/// orchestrator never consults global defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub model: String,
    pub model_provider: Option<String>,
    pub judge_model: String,
    pub judge_provider: Option<String>,
    pub improver_model: String,
    pub improver_provider: Option<String>,
    pub max_iterations: u32,
    pub target_score: f64,
    pub temperature: f32,
    pub concurrency: usize,
    pub judge_prompt: Option<String>,
    pub convergence_threshold: f64,
    pub convergence_patience: u32,
    pub human_feedback_enabled: bool,
    pub summary_language: String,
    pub enforce_placeholders: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".into(),
            model_provider: None,
            judge_model: "gpt-4o-mini".into(),
            judge_provider: None,
            improver_model: "gpt-4o".into(),
            improver_provider: None,
            max_iterations: 10,
            target_score: 0.9,
            temperature: 0.7,
            concurrency: 5,
            judge_prompt: None,
            convergence_threshold: 0.02,
            convergence_patience: 2,
            human_feedback_enabled: false,
            summary_language: "English".into(),
            enforce_placeholders: true,
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError(format!(
                "temperature must be within [0, 2], got {}",
                self.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.target_score) {
            return Err(ConfigError(format!(
                "target_score must be within [0, 1], got {}",
                self.target_score
            )));
        }
        if self.concurrency == 0 {
            return Err(ConfigError("concurrency must be at least 1".into()));
        }
        if self.max_iterations == 0 {
            return Err(ConfigError("max_iterations must be at least 1".into()));
        }
        if self.convergence_threshold < 0.0 {
            return Err(ConfigError(
                "convergence_threshold must not be negative".into(),
            ));
        }
        for (label, model) in [
            ("model", &self.model),
            ("judge_model", &self.judge_model),
            ("improver_model", &self.improver_model),
        ] {
            if model.trim().is_empty() {
                return Err(ConfigError(format!("{} must not be empty", label)));
            }
        }
        if let Some(p) = &self.judge_prompt {
            if p.trim().is_empty() {
                return Err(ConfigError("judge_prompt must not be blank".into()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRef {
    pub filename: String,
    pub columns: Vec<String>,
    pub expected_column: String,
}

impl DatasetRef {
    pub fn input_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| **c != self.expected_column)
            .cloned()
            .collect()
    }
}

/// What the submitter provides; the store assigns identity and status.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub name: String,
    pub initial_prompt: String,
    pub config: RunConfig,
    pub dataset: DatasetRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: i64,
    pub name: String,
    pub status: RunStatus,
    pub initial_prompt: String,
    pub best_prompt: Option<String>,
    pub best_score: Option<f64>,
    pub config: RunConfig,
    pub dataset: DatasetRef,
    pub total_iterations_completed: u32,
    pub error_message: Option<String>,
    pub created_at: String,
    pub finished_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    pub id: i64,
    pub run_id: i64,
    pub iteration_num: u32,
    pub prompt_template: String,
    pub avg_score: Option<f64>,
    pub min_score: Option<f64>,
    pub max_score: Option<f64>,
    pub summary: Option<String>,
    #[serde(default)]
    pub summary_details: Option<serde_json::Value>,
    pub improvement_reasoning: Option<String>,
    pub improver_prompt: Option<String>,
    pub human_feedback: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResultRow {
    pub index: usize,
    pub input_data: InputData,
    pub expected: String,
    pub actual: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub score: Option<f64>,
    pub judge_reasoning: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub run_id: i64,
    pub iteration_id: Option<i64>,
    pub stage: Stage,
    pub level: LogLevel,
    pub message: String,
    pub data: Option<serde_json::Value>,
    pub created_at: String,
}

/// Aggregate over the judged rows of one iteration. `None` when nothing was
/// scored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreStats {
    pub avg: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl ScoreStats {
    pub fn from_rows(rows: &[TestResultRow]) -> Self {
        let scores: Vec<f64> = rows.iter().filter_map(|r| r.score).collect();
        if scores.is_empty() {
            return Self::default();
        }
        let sum: f64 = scores.iter().sum();
        Self {
            avg: Some(sum / scores.len() as f64),
            min: scores.iter().copied().reduce(f64::min),
            max: scores.iter().copied().reduce(f64::max),
        }
    }

    /// Score used by the convergence policy; an unscored iteration counts as 0.
    pub fn effective(&self) -> f64 {
        self.avg.unwrap_or(0.0)
    }
}

/// Qualitative + quantitative outcome of the summarize stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub stats: ScoreStats,
    pub summary: String,
    #[serde(default)]
    pub failure_patterns: Vec<String>,
    #[serde(default)]
    pub success_patterns: Vec<String>,
    #[serde(default)]
    pub specific_issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceReason {
    Target,
    Stagnation,
    MaxIterations,
}

impl ConvergenceReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConvergenceReason::Target => "target",
            ConvergenceReason::Stagnation => "stagnation",
            ConvergenceReason::MaxIterations => "max_iterations",
        }
    }
}

impl std::fmt::Display for ConvergenceReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
