pub mod console;

use crate::model::{IterationRecord, RunRecord};
use serde_json::json;

/// Machine-readable view of a run and its iterations.
pub fn run_json(run: &RunRecord, iterations: &[IterationRecord]) -> serde_json::Value {
    json!({
        "run": run,
        "iterations": iterations,
    })
}
