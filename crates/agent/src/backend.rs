//! Generation backend connections for deploying agents.

use async_trait::async_trait;
use docrag_core::retry::{with_retries, RetryPolicy};
use docrag_core::AppResult;
use docrag_llm::{create_client, LlmClient};
use std::sync::Arc;

/// Connects a fresh generation backend for one agent.
///
/// Every deploy gets its own client; agents never share a backend instance.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    /// Connect and health-check a backend serving `model_ref`.
    ///
    /// # Errors
    /// `AppError::BackendUnavailable` when the backend cannot be reached.
    async fn connect(&self, model_ref: &str) -> AppResult<Arc<dyn LlmClient>>;
}

/// Backends built from the configured provider.
#[derive(Debug, Clone)]
pub struct ProviderFactory {
    provider: String,
    endpoint: Option<String>,
    api_key: Option<String>,
    retry: RetryPolicy,
}

impl ProviderFactory {
    pub fn new(
        provider: impl Into<String>,
        endpoint: Option<String>,
        api_key: Option<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            provider: provider.into(),
            endpoint,
            api_key,
            retry,
        }
    }
}

#[async_trait]
impl BackendFactory for ProviderFactory {
    #[tracing::instrument(skip(self), fields(provider = %self.provider))]
    async fn connect(&self, model_ref: &str) -> AppResult<Arc<dyn LlmClient>> {
        let client = create_client(
            &self.provider,
            self.endpoint.as_deref(),
            self.api_key.as_deref(),
        )?;

        let probe = client.clone();
        with_retries(&self.retry, "backend health check", move || {
            let probe = probe.clone();
            async move { probe.health_check().await }
        })
        .await?;

        tracing::debug!("Connected {} backend for model {}", client.provider_name(), model_ref);
        Ok(client)
    }
}
