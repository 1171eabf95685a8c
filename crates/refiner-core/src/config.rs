use crate::errors::ConfigError;
use crate::model::RunConfig;
use crate::providers::llm::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SUPPORTED_CONFIG_VERSION: u32 = 1;
pub const DEFAULT_CONFIG_PATH: &str = "refiner.yaml";
pub const DEFAULT_DB_PATH: &str = ".refiner/refiner.db";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinerConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_db")]
    pub database: PathBuf,
    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderSettings>,
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub retry: RetrySettings,
}

fn default_version() -> u32 {
    SUPPORTED_CONFIG_VERSION
}

fn default_db() -> PathBuf {
    PathBuf::from(DEFAULT_DB_PATH)
}

fn default_providers() -> Vec<ProviderSettings> {
    vec![
        ProviderSettings {
            id: "openai".into(),
            kind: ProviderKind::OpenaiCompatible,
            base_url: None,
            api_key_env: Some("OPENAI_API_KEY".into()),
            response: None,
        },
        ProviderSettings {
            id: "anthropic".into(),
            kind: ProviderKind::Anthropic,
            base_url: None,
            api_key_env: Some("ANTHROPIC_API_KEY".into()),
            response: None,
        },
    ]
}

impl Default for RefinerConfig {
    fn default() -> Self {
        Self {
            version: SUPPORTED_CONFIG_VERSION,
            database: default_db(),
            providers: default_providers(),
            defaults: Defaults::default(),
            retry: RetrySettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenaiCompatible,
    Anthropic,
    /// Answers every call with `response`; no network.
    Fake,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub id: String,
    pub kind: ProviderKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Canned completion for `kind: fake`.
    #[serde(default)]
    pub response: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    pub provider: Option<String>,
    pub model: String,
    pub judge_provider: Option<String>,
    pub judge_model: String,
    pub improver_provider: Option<String>,
    pub improver_model: String,
    pub max_iterations: u32,
    pub target_score: f64,
    pub temperature: f32,
    pub concurrency: usize,
    pub convergence_threshold: f64,
    pub convergence_patience: u32,
    pub summary_language: String,
    pub human_feedback: bool,
    pub feedback_timeout_secs: u64,
    pub enforce_placeholders: bool,
}

impl Default for Defaults {
    fn default() -> Self {
        let rc = RunConfig::default();
        Self {
            provider: Some("openai".into()),
            model: rc.model,
            judge_provider: None,
            judge_model: rc.judge_model,
            improver_provider: None,
            improver_model: rc.improver_model,
            max_iterations: rc.max_iterations,
            target_score: rc.target_score,
            temperature: rc.temperature,
            concurrency: rc.concurrency,
            convergence_threshold: rc.convergence_threshold,
            convergence_patience: rc.convergence_patience,
            summary_language: rc.summary_language,
            human_feedback: rc.human_feedback_enabled,
            feedback_timeout_secs: 1800,
            enforce_placeholders: rc.enforce_placeholders,
        }
    }
}

impl Defaults {
    /// Fully resolved per-run settings; stage providers fall back to
    /// `provider`.
    pub fn run_config(&self) -> RunConfig {
        let pick = |stage: &Option<String>| stage.clone().or_else(|| self.provider.clone());
        RunConfig {
            model: self.model.clone(),
            model_provider: self.provider.clone(),
            judge_model: self.judge_model.clone(),
            judge_provider: pick(&self.judge_provider),
            improver_model: self.improver_model.clone(),
            improver_provider: pick(&self.improver_provider),
            max_iterations: self.max_iterations,
            target_score: self.target_score,
            temperature: self.temperature,
            concurrency: self.concurrency,
            judge_prompt: None,
            convergence_threshold: self.convergence_threshold,
            convergence_patience: self.convergence_patience,
            human_feedback_enabled: self.human_feedback,
            summary_language: self.summary_language.clone(),
            enforce_placeholders: self.enforce_placeholders,
        }
    }

    pub fn feedback_timeout(&self) -> Duration {
        Duration::from_secs(self.feedback_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 2000,
            request_timeout_secs: 120,
        }
    }
}

impl RetrySettings {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

pub fn load_config(path: &Path, strict: bool) -> Result<RefinerConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError(format!("failed to read config {}: {}", path.display(), e)))?;
    let mut cfg = parse_config(&raw, strict)
        .map_err(|e| ConfigError(format!("{} (file: {})", e.0, path.display())))?;
    apply_env_overrides(&mut cfg, |k| std::env::var(k).ok())?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Missing file means built-in defaults (still subject to env overrides).
pub fn load_or_default(path: &Path, strict: bool) -> Result<RefinerConfig, ConfigError> {
    if path.exists() {
        return load_config(path, strict);
    }
    let mut cfg = RefinerConfig::default();
    apply_env_overrides(&mut cfg, |k| std::env::var(k).ok())?;
    validate(&cfg)?;
    Ok(cfg)
}

pub fn parse_config(raw: &str, strict: bool) -> Result<RefinerConfig, ConfigError> {
    let mut ignored_keys = std::collections::BTreeSet::new();
    let deserializer = serde_yaml::Deserializer::from_str(raw);

    let cfg: RefinerConfig = serde_ignored::deserialize(deserializer, |path| {
        ignored_keys.insert(path.to_string());
    })
    .map_err(|e| ConfigError(format!("failed to parse YAML: {}", e)))?;

    // `x-` keys are free for YAML anchors.
    let unknown: Vec<_> = ignored_keys
        .iter()
        .filter(|k| !k.starts_with("x-") && !k.starts_with('_'))
        .collect();
    if !unknown.is_empty() {
        if strict {
            return Err(ConfigError(format!(
                "unknown fields detected in strict mode: {:?}",
                unknown
            )));
        }
        tracing::warn!(event = "config_unknown_fields", fields = ?unknown, "ignored unknown config fields");
    }

    if cfg.version != SUPPORTED_CONFIG_VERSION {
        return Err(ConfigError(format!(
            "unsupported config version {} (supported: {})",
            cfg.version, SUPPORTED_CONFIG_VERSION
        )));
    }
    Ok(cfg)
}

pub fn apply_env_overrides<F>(cfg: &mut RefinerConfig, get: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(db) = get("REFINER_DB").filter(|v| !v.trim().is_empty()) {
        cfg.database = PathBuf::from(db);
    }
    if let Some(secs) = get("REFINER_FEEDBACK_TIMEOUT_SECS") {
        cfg.defaults.feedback_timeout_secs = secs.trim().parse().map_err(|_| {
            ConfigError(format!(
                "REFINER_FEEDBACK_TIMEOUT_SECS must be a whole number of seconds, got '{}'",
                secs
            ))
        })?;
    }
    Ok(())
}

pub fn validate(cfg: &RefinerConfig) -> Result<(), ConfigError> {
    let mut seen = std::collections::HashSet::new();
    for p in &cfg.providers {
        if p.id.trim().is_empty() {
            return Err(ConfigError("provider id must not be empty".into()));
        }
        if !seen.insert(p.id.as_str()) {
            return Err(ConfigError(format!("duplicate provider id '{}'", p.id)));
        }
    }
    let d = &cfg.defaults;
    for (label, id) in [
        ("defaults.provider", &d.provider),
        ("defaults.judge_provider", &d.judge_provider),
        ("defaults.improver_provider", &d.improver_provider),
    ] {
        if let Some(id) = id {
            if !seen.contains(id.as_str()) {
                return Err(ConfigError(format!(
                    "{} refers to unknown provider '{}'",
                    label, id
                )));
            }
        }
    }
    d.run_config().validate()
}

pub fn write_sample_config(path: &Path) -> Result<(), ConfigError> {
    std::fs::write(
        path,
        r#"version: 1
database: .refiner/refiner.db

providers:
  - id: openai
    kind: openai_compatible
    base_url: https://api.openai.com/v1
    api_key_env: OPENAI_API_KEY
  - id: anthropic
    kind: anthropic
    api_key_env: ANTHROPIC_API_KEY
  # Offline provider answering every call with a fixed completion.
  - id: dry
    kind: fake
    response: '{"score": 0.5, "reason": "dry run", "summary": "dry run", "reasoning": "dry run", "improved_prompt": ""}'

defaults:
  provider: openai
  model: gpt-4o-mini
  judge_model: gpt-4o-mini
  improver_model: gpt-4o
  max_iterations: 10
  target_score: 0.9
  temperature: 0.7
  concurrency: 5
  convergence_threshold: 0.02
  convergence_patience: 2
  summary_language: English
  human_feedback: false
  feedback_timeout_secs: 1800
  enforce_placeholders: true

retry:
  max_attempts: 5
  base_delay_ms: 2000
  request_timeout_secs: 120
"#,
    )
    .map_err(|e| ConfigError(format!("failed to write sample config: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let cfg = parse_config("version: 1\n", true).unwrap();
        assert_eq!(cfg.database, PathBuf::from(DEFAULT_DB_PATH));
        assert_eq!(cfg.providers.len(), 2);
        assert_eq!(cfg.defaults.concurrency, 5);
        assert_eq!(cfg.defaults.feedback_timeout_secs, 1800);
        assert_eq!(cfg.retry.retry_config(), RetryConfig::default());
    }

    #[test]
    fn test_unknown_fields_strict_vs_lenient() {
        let raw = "version: 1\ndefaults:\n  modle: gpt-4o\n";
        let err = parse_config(raw, true).unwrap_err();
        assert!(err.0.contains("defaults.modle"), "{}", err);
        assert!(parse_config(raw, false).is_ok());
    }

    #[test]
    fn test_unsupported_version() {
        let err = parse_config("version: 2\n", false).unwrap_err();
        assert!(err.0.contains("unsupported config version 2"));
    }

    #[test]
    fn test_env_overrides() {
        let mut cfg = RefinerConfig::default();
        apply_env_overrides(&mut cfg, |k| match k {
            "REFINER_DB" => Some("/tmp/other.db".into()),
            "REFINER_FEEDBACK_TIMEOUT_SECS" => Some("5".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(cfg.database, PathBuf::from("/tmp/other.db"));
        assert_eq!(cfg.defaults.feedback_timeout(), Duration::from_secs(5));

        let mut cfg = RefinerConfig::default();
        let err = apply_env_overrides(&mut cfg, |k| {
            (k == "REFINER_FEEDBACK_TIMEOUT_SECS").then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(err.0.contains("REFINER_FEEDBACK_TIMEOUT_SECS"));
    }

    #[test]
    fn test_stage_providers_fall_back_to_default() {
        let mut d = Defaults::default();
        d.improver_provider = Some("anthropic".into());
        let rc = d.run_config();
        assert_eq!(rc.model_provider.as_deref(), Some("openai"));
        assert_eq!(rc.judge_provider.as_deref(), Some("openai"));
        assert_eq!(rc.improver_provider.as_deref(), Some("anthropic"));
    }

    #[test]
    fn test_unknown_default_provider_rejected() {
        let mut cfg = RefinerConfig::default();
        cfg.defaults.judge_provider = Some("mistral".into());
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn test_sample_config_parses_strictly() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("refiner.yaml");
        write_sample_config(&path)?;
        let raw = std::fs::read_to_string(&path)?;
        let cfg = parse_config(&raw, true)?;
        validate(&cfg)?;
        assert!(cfg.providers.iter().any(|p| p.kind == ProviderKind::Fake));
        Ok(())
    }
}
