//! Deterministic offline generation backend.
//!
//! `Extractive` answers by quoting the first tagged source passage found in
//! the prompt, which makes the whole pipeline usable without a model server.
//! `Fixed` always returns the same text. Both can be slowed down or made to
//! fail a number of times, and every request is recorded.

use crate::client::{LlmClient, LlmRequest, LlmResponse, LlmUsage};
use docrag_core::{estimate_tokens, AppError, AppResult};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const QUOTE_CHARS: usize = 240;

#[derive(Debug, Clone)]
pub enum StaticReply {
    Fixed(String),
    Extractive,
}

#[derive(Debug)]
pub struct StaticClient {
    reply: StaticReply,
    delay: Option<Duration>,
    failures_remaining: AtomicU32,
    healthy: bool,
    requests: Mutex<Vec<LlmRequest>>,
}

impl StaticClient {
    pub fn new(reply: StaticReply) -> Self {
        Self {
            reply,
            delay: None,
            failures_remaining: AtomicU32::new(0),
            healthy: true,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn extractive() -> Self {
        Self::new(StaticReply::Extractive)
    }

    pub fn fixed(text: impl Into<String>) -> Self {
        Self::new(StaticReply::Fixed(text.into()))
    }

    /// Sleep this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the next `n` completions with `BackendUnavailable`.
    pub fn with_failures(self, n: u32) -> Self {
        self.failures_remaining.store(n, Ordering::SeqCst);
        self
    }

    /// Fail health checks, as if the backend could not be reached.
    pub fn unhealthy(mut self) -> Self {
        self.healthy = false;
        self
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn answer(&self, prompt: &str) -> String {
        match self.reply {
            StaticReply::Fixed(ref text) => text.clone(),
            StaticReply::Extractive => extract_first_source(prompt).unwrap_or_else(|| {
                "I don't know: no source passages were provided.".to_string()
            }),
        }
    }
}

/// First line shaped like `[S<n>] text`, answered as a quote with its tag.
fn extract_first_source(prompt: &str) -> Option<String> {
    prompt.lines().find_map(|line| {
        let line = line.trim_start();
        let rest = line.strip_prefix("[S")?;
        let close = rest.find(']')?;
        let number = &rest[..close];
        if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let quote: String = rest[close + 1..].trim().chars().take(QUOTE_CHARS).collect();
        Some(format!("[S{}] {}", number, quote))
    })
}

#[async_trait::async_trait]
impl LlmClient for StaticClient {
    fn provider_name(&self) -> &str {
        "static"
    }

    async fn health_check(&self) -> AppResult<()> {
        if self.healthy {
            Ok(())
        } else {
            Err(AppError::BackendUnavailable(
                "static backend marked unhealthy".to_string(),
            ))
        }
    }

    async fn complete(&self, request: &LlmRequest) -> AppResult<LlmResponse> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let failed = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(AppError::BackendUnavailable(
                "static backend injected failure".to_string(),
            ));
        }

        let content = self.answer(&request.prompt);
        let usage = LlmUsage::new(
            estimate_tokens(&request.prompt) as u32,
            estimate_tokens(&content) as u32,
        );

        Ok(LlmResponse {
            content,
            model: request.model.clone(),
            usage,
            done: true,
        })
    }
}
