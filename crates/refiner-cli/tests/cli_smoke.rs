use assert_cmd::Command;
use predicates::str::contains;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const DRY_CONFIG: &str = r#"
version: 1
providers:
  - id: dry
    kind: fake
defaults:
  provider: dry
  max_iterations: 2
retry:
  max_attempts: 1
  base_delay_ms: 0
"#;

fn refiner(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("refiner").unwrap();
    cmd.current_dir(dir)
        .env_remove("REFINER_DB")
        .env_remove("REFINER_FEEDBACK_TIMEOUT_SECS")
        .env("REFINER_LOG", "warn");
    cmd
}

fn workspace() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("refiner.yaml"), DRY_CONFIG).unwrap();
    fs::write(
        dir.path().join("qa.jsonl"),
        r#"{"q": "2+2", "expected": "4"}
{"q": "capital of France", "expected": "Paris"}

{"q": "largest planet", "expected": "Jupiter"}
"#,
    )
    .unwrap();
    dir
}

#[test]
fn test_version() {
    let dir = TempDir::new().unwrap();
    refiner(dir.path())
        .arg("version")
        .assert()
        .success()
        .stdout(contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_init_writes_sample_once() {
    let dir = TempDir::new().unwrap();
    refiner(dir.path())
        .arg("init")
        .assert()
        .success()
        .stderr(contains("created refiner.yaml"));
    let written = fs::read_to_string(dir.path().join("refiner.yaml")).unwrap();
    assert!(written.contains("kind: fake"));

    refiner(dir.path())
        .arg("init")
        .assert()
        .success()
        .stderr(contains("already exists"));
}

#[test]
fn test_dry_run_end_to_end() {
    let dir = workspace();

    refiner(dir.path())
        .args(["run", "--dataset", "qa.jsonl", "--prompt", "Answer briefly: {q}", "--name", "smoke"])
        .assert()
        .success()
        .stdout(contains("iteration 1: test"))
        .stdout(contains("completed (max_iterations) after 2 iterations"))
        .stdout(contains("Answer briefly: {q}"));

    assert!(dir.path().join(".refiner/refiner.db").exists());

    refiner(dir.path())
        .args(["runs", "list"])
        .assert()
        .success()
        .stdout(contains("smoke"))
        .stdout(contains("completed"));

    refiner(dir.path())
        .args(["runs", "show", "1"])
        .assert()
        .success()
        .stdout(contains("Run #1 'smoke' [completed]"))
        .stdout(contains("0.500"));

    refiner(dir.path())
        .args(["runs", "show", "1", "--iteration", "2"])
        .assert()
        .success()
        .stdout(contains("[2] score 0.500"));

    refiner(dir.path())
        .args(["runs", "logs", "1", "--stage", "system"])
        .assert()
        .success()
        .stdout(contains("run completed"));

    refiner(dir.path())
        .args(["runs", "delete", "1"])
        .assert()
        .success();
    refiner(dir.path())
        .args(["runs", "show", "1"])
        .assert()
        .code(1);
}

#[test]
fn test_json_events() {
    let dir = workspace();
    refiner(dir.path())
        .args(["run", "--dataset", "qa.jsonl", "--prompt", "{q}", "--format", "json", "--db", "custom.db"])
        .assert()
        .success()
        .stdout(contains(r#"{"event":"stage_start","data":{"iteration":1,"stage":"test"}}"#))
        .stdout(contains(r#""event":"completed""#));
    assert!(dir.path().join("custom.db").exists());
}

#[test]
fn test_unknown_placeholder_is_a_config_error() {
    let dir = workspace();
    refiner(dir.path())
        .args(["run", "--dataset", "qa.jsonl", "--prompt", "Answer {question}"])
        .assert()
        .code(2)
        .stderr(contains("question"));
}

#[test]
fn test_strict_config_rejects_unknown_keys() {
    let dir = workspace();
    fs::write(
        dir.path().join("refiner.yaml"),
        format!("{}\nsurprise: true\n", DRY_CONFIG),
    )
    .unwrap();
    refiner(dir.path())
        .args(["run", "--strict", "--dataset", "qa.jsonl", "--prompt", "{q}"])
        .assert()
        .code(2)
        .stderr(contains("unknown fields"));
}

#[test]
fn test_invalid_overrides_are_rejected() {
    let dir = workspace();
    refiner(dir.path())
        .args(["run", "--dataset", "qa.jsonl", "--prompt", "{q}", "--target-score", "1.5"])
        .assert()
        .code(2)
        .stderr(contains("target_score"));
}
