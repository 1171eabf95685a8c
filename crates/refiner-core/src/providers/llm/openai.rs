use super::{check_status, http_client, LlmClient};
use crate::errors::ProviderError;
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Any endpoint speaking the OpenAI chat completions format.
pub struct OpenAiClient {
    pub base_url: String,
    pub api_key: String,
    pub client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(base_url: Option<String>, api_key: String, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
            client: http_client(timeout)?,
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(
        &self,
        prompt: &str,
        model: &str,
        temperature: f32,
    ) -> Result<String, ProviderError> {
        let body = json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": temperature,
        });

        debug!(model, url = %self.completions_url(), "sending chat completion request");

        let resp = self
            .client
            .post(self.completions_url())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;
        let resp = check_status(resp).await?;

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("failed to parse response: {}", e)))?;

        if json.pointer("/choices/0").is_none() {
            return Err(ProviderError::InvalidResponse(
                "response has no choices".into(),
            ));
        }
        // A null content (e.g. refusal) is an empty completion, not an error.
        Ok(json
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string())
    }

    fn provider_name(&self) -> &'static str {
        "openai_compatible"
    }
}
