//! Scripted in-process client for tests and offline dry runs.

use super::LlmClient;
use crate::errors::ProviderError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct FakeRequest {
    pub prompt: String,
    pub model: String,
    pub temperature: f32,
}

type Handler = Box<dyn Fn(&FakeRequest) -> Result<String, ProviderError> + Send + Sync>;

pub struct FakeClient {
    handler: Handler,
    latency: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    requests: Mutex<Vec<FakeRequest>>,
}

impl FakeClient {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&FakeRequest) -> Result<String, ProviderError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Always answers `text`.
    pub fn fixed(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(move |_| Ok(text.clone()))
    }

    /// Each call sleeps this long (tokio time) before answering, so concurrent
    /// calls overlap.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously running calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<FakeRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for FakeClient {
    async fn complete(
        &self,
        prompt: &str,
        model: &str,
        temperature: f32,
    ) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let req = FakeRequest {
            prompt: prompt.to_string(),
            model: model.to_string(),
            temperature,
        };
        if let Ok(mut log) = self.requests.lock() {
            log.push(req.clone());
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let out = (self.handler)(&req);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        out
    }

    fn provider_name(&self) -> &'static str {
        "fake"
    }
}
