use crate::config::{ProviderKind, ProviderSettings, RefinerConfig};
use crate::errors::ProviderError;
use crate::providers::llm::anthropic::AnthropicClient;
use crate::providers::llm::fake::FakeClient;
use crate::providers::llm::openai::OpenAiClient;
use crate::providers::llm::{Gateway, LlmClient, RetryConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const DRY_RUN_RESPONSE: &str = r#"{"score": 0.5, "reason": "dry run", "summary": "dry run", "reasoning": "dry run", "improved_prompt": ""}"#;

/// Provider ids resolved to clients. Providers whose credentials are missing
/// stay listed so a run selecting them fails with a useful message.
pub struct ProviderRegistry {
    clients: HashMap<String, Arc<dyn LlmClient>>,
    unavailable: HashMap<String, String>,
    default_provider: Option<String>,
    retry: RetryConfig,
}

impl ProviderRegistry {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            clients: HashMap::new(),
            unavailable: HashMap::new(),
            default_provider: None,
            retry,
        }
    }

    pub fn from_config(cfg: &RefinerConfig) -> Self {
        Self::from_config_with_env(cfg, |k| std::env::var(k).ok())
    }

    pub fn from_config_with_env<F>(cfg: &RefinerConfig, env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut reg = Self::new(cfg.retry.retry_config());
        reg.default_provider = cfg.defaults.provider.clone();
        let timeout = cfg.retry.request_timeout();
        for p in &cfg.providers {
            match build_client(p, timeout, &env) {
                Ok(client) => {
                    reg.clients.insert(p.id.clone(), client);
                }
                Err(reason) => {
                    tracing::debug!(provider = %p.id, %reason, "provider unavailable");
                    reg.unavailable.insert(p.id.clone(), reason);
                }
            }
        }
        reg
    }

    pub fn register(mut self, id: impl Into<String>, client: Arc<dyn LlmClient>) -> Self {
        let id = id.into();
        self.unavailable.remove(&id);
        self.clients.insert(id, client);
        self
    }

    pub fn with_default(mut self, id: impl Into<String>) -> Self {
        self.default_provider = Some(id.into());
        self
    }

    /// Gateway for `provider`, or the default provider when `None`.
    pub fn gateway(&self, provider: Option<&str>) -> Result<Gateway, ProviderError> {
        let id = provider
            .or(self.default_provider.as_deref())
            .ok_or_else(|| ProviderError::NotConfigured("no provider selected".into()))?;
        if let Some(client) = self.clients.get(id) {
            return Ok(Gateway::new(client.clone(), self.retry.clone()));
        }
        match self.unavailable.get(id) {
            Some(reason) => Err(ProviderError::NotConfigured(format!(
                "provider '{}': {}",
                id, reason
            ))),
            None => Err(ProviderError::NotConfigured(format!(
                "unknown provider '{}'",
                id
            ))),
        }
    }
}

fn build_client<F>(
    p: &ProviderSettings,
    timeout: Duration,
    env: &F,
) -> Result<Arc<dyn LlmClient>, String>
where
    F: Fn(&str) -> Option<String>,
{
    let client: Arc<dyn LlmClient> = match p.kind {
        ProviderKind::Fake => Arc::new(FakeClient::fixed(
            p.response
                .clone()
                .unwrap_or_else(|| DRY_RUN_RESPONSE.to_string()),
        )),
        ProviderKind::OpenaiCompatible => Arc::new(
            OpenAiClient::new(p.base_url.clone(), api_key(p, env)?, timeout)
                .map_err(|e| e.to_string())?,
        ),
        ProviderKind::Anthropic => Arc::new(
            AnthropicClient::new(p.base_url.clone(), api_key(p, env)?, timeout)
                .map_err(|e| e.to_string())?,
        ),
    };
    Ok(client)
}

fn api_key<F>(p: &ProviderSettings, env: &F) -> Result<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    let key_env = p
        .api_key_env
        .as_deref()
        .ok_or_else(|| "api_key_env is not set".to_string())?;
    env(key_env)
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| format!("set {} env var", key_env))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_reports_env_var() {
        let cfg = RefinerConfig::default();
        let reg = ProviderRegistry::from_config_with_env(&cfg, |_| None);
        let err = reg.gateway(Some("openai")).err().unwrap();
        assert!(err.to_string().contains("OPENAI_API_KEY"), "{}", err);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_default_and_unknown_provider() {
        let cfg = RefinerConfig::default();
        let reg = ProviderRegistry::from_config_with_env(&cfg, |k| {
            (k == "OPENAI_API_KEY").then(|| "sk-test".to_string())
        });
        let gw = reg.gateway(None).unwrap();
        assert_eq!(gw.provider_name(), "openai_compatible");
        let err = reg.gateway(Some("mistral")).err().unwrap();
        assert!(err.to_string().contains("unknown provider"));
    }

    #[tokio::test]
    async fn test_fake_kind_needs_no_key() {
        let mut cfg = RefinerConfig::default();
        cfg.providers.push(ProviderSettings {
            id: "dry".into(),
            kind: ProviderKind::Fake,
            base_url: None,
            api_key_env: None,
            response: None,
        });
        let reg = ProviderRegistry::from_config_with_env(&cfg, |_| None);
        let out = reg.gateway(Some("dry")).unwrap().complete("hi", "m", 0.0).await.unwrap();
        assert!(out.contains("dry run"));
    }
}
