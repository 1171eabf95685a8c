use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "refiner",
    version,
    about = "Iteratively improve a prompt against a labeled dataset"
)]
pub struct Cli {
    /// Diagnostic log format on stderr (filter with REFINER_LOG)
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Write a sample refiner.yaml
    Init(InitArgs),
    /// Create a run and follow it until it finishes
    Run(RunArgs),
    /// Inspect stored runs
    Runs(RunsArgs),
    Version,
}

#[derive(clap::Args, Clone)]
pub struct InitArgs {
    #[arg(long, default_value = "refiner.yaml")]
    pub config: PathBuf,
}

#[derive(clap::Args, Clone)]
pub struct RunArgs {
    #[arg(long, default_value = "refiner.yaml")]
    pub config: PathBuf,

    /// Overrides `database` from the config (also REFINER_DB)
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Reject unknown config keys
    #[arg(long)]
    pub strict: bool,

    /// JSONL file, one object per row
    #[arg(long)]
    pub dataset: PathBuf,

    /// Column holding the expected output
    #[arg(long, default_value = "expected")]
    pub expected: String,

    /// Initial prompt template with {column} placeholders
    #[arg(long, conflicts_with = "prompt_file")]
    pub prompt: Option<String>,

    #[arg(long)]
    pub prompt_file: Option<PathBuf>,

    /// Custom judge instructions ({input_data}, {expected}, {actual})
    #[arg(long)]
    pub judge_prompt_file: Option<PathBuf>,

    #[arg(long)]
    pub name: Option<String>,

    /// Provider id for every stage unless a stage override is given
    #[arg(long)]
    pub provider: Option<String>,
    #[arg(long)]
    pub judge_provider: Option<String>,
    #[arg(long)]
    pub improver_provider: Option<String>,

    #[arg(long)]
    pub model: Option<String>,
    #[arg(long)]
    pub judge_model: Option<String>,
    #[arg(long)]
    pub improver_model: Option<String>,

    #[arg(long)]
    pub max_iterations: Option<u32>,
    #[arg(long)]
    pub target_score: Option<f64>,
    #[arg(long)]
    pub temperature: Option<f32>,
    #[arg(long)]
    pub concurrency: Option<usize>,
    #[arg(long)]
    pub language: Option<String>,

    /// Pause after each summary and read feedback lines from stdin
    #[arg(long)]
    pub feedback: bool,

    /// Emit events as JSON lines on stdout
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

#[derive(clap::Args, Clone)]
pub struct RunsArgs {
    #[arg(long, default_value = "refiner.yaml")]
    pub config: PathBuf,

    #[arg(long)]
    pub db: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub cmd: RunsSub,
}

#[derive(Subcommand, Clone)]
pub enum RunsSub {
    List,
    /// Run details and its iterations; with --iteration, that iteration's rows
    Show {
        run_id: i64,
        #[arg(long)]
        iteration: Option<u32>,
    },
    Logs {
        run_id: i64,
        /// test | judge | summarize | improve | system
        #[arg(long)]
        stage: Option<String>,
        /// info | warn | error
        #[arg(long)]
        level: Option<String>,
    },
    /// Delete a run with its iterations, results and logs
    Delete { run_id: i64 },
}
