//! Generation client factory.
//!
//! Resolves a provider name from configuration into a client instance.
//! Each call returns a fresh client so agents never share one.

use crate::client::LlmClient;
use crate::providers::{OllamaClient, StaticClient};
use crate::types::ProviderType;
use docrag_core::{AppError, AppResult};
use std::sync::Arc;

/// Create a generation client for `provider`.
///
/// # Arguments
/// * `provider` - Provider identifier ("ollama", "static")
/// * `endpoint` - Optional custom endpoint URL
/// * `api_key` - Optional API key, forwarded as a bearer token
///
/// # Errors
/// Returns `AppError::Config` if the provider is unknown.
pub fn create_client(
    provider: &str,
    endpoint: Option<&str>,
    api_key: Option<&str>,
) -> AppResult<Arc<dyn LlmClient>> {
    match ProviderType::parse(provider) {
        Some(ProviderType::Ollama) => {
            let base_url = endpoint.unwrap_or(crate::providers::ollama::DEFAULT_BASE_URL);
            let mut client = OllamaClient::with_base_url(base_url);
            if let Some(key) = api_key {
                client = client.with_api_key(key);
            }
            Ok(Arc::new(client))
        }
        Some(ProviderType::Static) => Ok(Arc::new(StaticClient::extractive())),
        None => Err(AppError::Config(format!(
            "Unknown provider: {}. Supported: ollama, static",
            provider
        ))),
    }
}
