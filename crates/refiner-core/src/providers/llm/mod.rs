use crate::errors::{GatewayError, ProviderError};
use async_trait::async_trait;
use std::sync::Arc;

pub mod anthropic;
pub mod fake;
pub mod openai;
pub mod retry;
pub mod structured;

pub use retry::RetryConfig;

/// One provider family. Implementations make a single attempt; retries are
/// the gateway's job.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        prompt: &str,
        model: &str,
        temperature: f32,
    ) -> Result<String, ProviderError>;
    fn provider_name(&self) -> &'static str;
}

/// Retrying front door to an [`LlmClient`]. Stateless between calls; cheap to
/// clone into spawned tasks.
#[derive(Clone)]
pub struct Gateway {
    client: Arc<dyn LlmClient>,
    retry: RetryConfig,
}

impl Gateway {
    pub fn new(client: Arc<dyn LlmClient>, retry: RetryConfig) -> Self {
        Self { client, retry }
    }

    pub fn provider_name(&self) -> &'static str {
        self.client.provider_name()
    }

    pub async fn complete(
        &self,
        prompt: &str,
        model: &str,
        temperature: f32,
    ) -> Result<String, ProviderError> {
        if prompt.trim().is_empty() {
            return Err(ProviderError::InvalidRequest("empty prompt".into()));
        }
        if !(0.0..=2.0).contains(&temperature) {
            return Err(ProviderError::InvalidRequest(format!(
                "temperature {} outside [0, 2]",
                temperature
            )));
        }
        retry::with_backoff(&self.retry, self.client.provider_name(), || {
            self.client.complete(prompt, model, temperature)
        })
        .await
    }

    /// Completion parsed into a JSON object that satisfies `schema`.
    pub async fn complete_structured(
        &self,
        prompt: &str,
        model: &str,
        temperature: f32,
        schema: &serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError> {
        let raw = self.complete(prompt, model, temperature).await?;
        Ok(structured::parse_structured(&raw, Some(schema))?)
    }
}

/// Shared error mapping for HTTP providers: non-2xx becomes a typed error,
/// honoring `Retry-After` on 429.
pub(crate) async fn check_status(
    resp: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let retry_after_ms = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .map(|secs| (secs * 1000.0).max(0.0) as u64);
    let body = resp.text().await.unwrap_or_default();
    Err(ProviderError::from_status(
        status.as_u16(),
        body,
        retry_after_ms,
    ))
}

pub(crate) fn http_client(timeout: std::time::Duration) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ProviderError::NotConfigured(format!("http client: {}", e)))
}
