pub const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    initial_prompt TEXT NOT NULL,
    best_prompt TEXT,
    best_score REAL,
    config_json TEXT NOT NULL,
    dataset_filename TEXT NOT NULL,
    dataset_columns_json TEXT NOT NULL,
    expected_column TEXT NOT NULL,
    total_iterations_completed INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    created_at TEXT NOT NULL,
    finished_at TEXT
);

CREATE TABLE IF NOT EXISTS iterations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    iteration_num INTEGER NOT NULL,
    prompt_template TEXT NOT NULL,
    avg_score REAL,
    min_score REAL,
    max_score REAL,
    summary TEXT,
    summary_json TEXT,
    improvement_reasoning TEXT,
    improver_prompt TEXT,
    human_feedback TEXT,
    created_at TEXT NOT NULL,
    UNIQUE(run_id, iteration_num)
);

CREATE TABLE IF NOT EXISTS test_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    iteration_id INTEGER NOT NULL REFERENCES iterations(id) ON DELETE CASCADE,
    row_index INTEGER NOT NULL,
    input_json TEXT NOT NULL,
    expected_output TEXT NOT NULL,
    actual_output TEXT,
    error TEXT,
    score REAL,
    judge_reasoning TEXT,
    UNIQUE(iteration_id, row_index)
);

CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    iteration_id INTEGER REFERENCES iterations(id) ON DELETE CASCADE,
    stage TEXT NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    data_json TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_iterations_run ON iterations(run_id, iteration_num);
CREATE INDEX IF NOT EXISTS idx_results_iteration ON test_results(iteration_id, row_index);
CREATE INDEX IF NOT EXISTS idx_logs_run ON logs(run_id, id);
"#;
