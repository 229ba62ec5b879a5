//! Embedding provider trait and factory.

use docrag_core::config::EmbeddingSettings;
use docrag_core::{AppError, AppResult};
use std::sync::Arc;

use super::providers::{HashingProvider, OllamaProvider};

/// Trait for embedding providers.
///
/// Providers return raw vectors; normalization, batching, truncation and
/// retries are handled by [`super::Embedder`]. An unreachable backend must be
/// reported as `AppError::BackendUnavailable`.
#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync + std::fmt::Debug {
    /// Get provider name (e.g., "hashing", "ollama")
    fn provider_name(&self) -> &str;

    /// Get model identifier
    fn model_name(&self) -> &str;

    /// Get embedding dimensions
    fn dimensions(&self) -> usize;

    /// Generate embeddings for multiple texts in a batch.
    async fn embed_batch(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>>;
}

/// Create an embedding provider from configuration.
pub fn create_provider(settings: &EmbeddingSettings) -> AppResult<Arc<dyn EmbeddingProvider>> {
    match settings.provider.as_str() {
        "hashing" | "trigram" => Ok(Arc::new(HashingProvider::new(
            settings.model.clone(),
            settings.dimensions,
        ))),
        "ollama" => Ok(Arc::new(OllamaProvider::new(settings)?)),
        _ => Err(AppError::Config(format!(
            "Unknown embedding provider: '{}'. Supported providers: hashing, ollama",
            settings.provider
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_hashing_provider() {
        let settings = EmbeddingSettings::default();
        let provider = create_provider(&settings).unwrap();
        assert_eq!(provider.provider_name(), "hashing");
        assert_eq!(provider.model_name(), "trigram-v1");
        assert_eq!(provider.dimensions(), 384);
    }

    #[test]
    fn test_create_unknown_provider() {
        let settings = EmbeddingSettings {
            provider: "unknown".to_string(),
            ..Default::default()
        };

        let result = create_provider(&settings);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Unknown embedding provider"));
    }
}
