use super::{check_status, http_client, LlmClient};
use crate::errors::ProviderError;
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

pub struct AnthropicClient {
    pub base_url: String,
    pub api_key: String,
    pub client: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(base_url: Option<String>, api_key: String, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
            client: http_client(timeout)?,
        })
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(
        &self,
        prompt: &str,
        model: &str,
        temperature: f32,
    ) -> Result<String, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        // The messages API caps temperature at 1.0.
        let body = json!({
            "model": model,
            "max_tokens": MAX_TOKENS,
            "temperature": temperature.min(1.0),
            "messages": [{"role": "user", "content": prompt}],
        });

        debug!(model, %url, "sending messages request");

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;
        let resp = check_status(resp).await?;

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("failed to parse response: {}", e)))?;

        text_blocks(&json)
    }

    fn provider_name(&self) -> &'static str {
        "anthropic"
    }
}

/// Concatenate the `text` blocks of a messages response.
fn text_blocks(json: &serde_json::Value) -> Result<String, ProviderError> {
    let blocks = json
        .get("content")
        .and_then(|c| c.as_array())
        .ok_or_else(|| ProviderError::InvalidResponse("response missing content".into()))?;
    Ok(blocks
        .iter()
        .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
        .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>()
        .join(""))
}
