//! Ollama Embedding Provider
//!
//! Semantic embeddings from a local Ollama server (e.g. `nomic-embed-text`,
//! `all-minilm`). Nothing leaves the machine.
//!
//! # Example
//! ```no_run
//! use docrag_core::config::EmbeddingSettings;
//! use docrag_knowledge::embeddings::{EmbeddingProvider, providers::OllamaProvider};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = EmbeddingSettings {
//!     provider: "ollama".to_string(),
//!     model: "nomic-embed-text".to_string(),
//!     dimensions: 768,
//!     ..Default::default()
//! };
//!
//! let provider = OllamaProvider::new(&settings)?;
//! provider.verify_connection().await?;
//! let embeddings = provider.embed_batch(&["Hello world".to_string()]).await?;
//! assert_eq!(embeddings[0].len(), 768);
//! # Ok(())
//! # }
//! ```

use crate::embeddings::EmbeddingProvider;
use async_trait::async_trait;
use docrag_core::config::EmbeddingSettings;
use docrag_core::{AppError, AppResult};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Ollama API endpoint for embeddings
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const EMBEDDING_ENDPOINT: &str = "/api/embeddings";

/// Request timeout in seconds
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Ollama embedding provider using local API
#[derive(Debug, Clone)]
pub struct OllamaProvider {
    client: Client,
    base_url: String,
    model: String,
    dimensions: usize,
}

/// Request payload for Ollama embeddings API
#[derive(Debug, Clone, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

/// Response from Ollama embeddings API
#[derive(Debug, Clone, Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

/// Error response from Ollama API
#[derive(Debug, Clone, Deserialize)]
struct ErrorResponse {
    error: String,
}

impl OllamaProvider {
    /// Create a provider. The endpoint comes from settings, then `OLLAMA_URL`,
    /// then the local default.
    pub fn new(settings: &EmbeddingSettings) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| {
                AppError::Config(format!("Failed to create HTTP client for Ollama: {}", e))
            })?;

        let base_url = settings
            .endpoint
            .clone()
            .or_else(|| std::env::var("OLLAMA_URL").ok())
            .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            dimensions: settings.dimensions,
        })
    }

    /// Verify Ollama is reachable and the model returns the configured
    /// dimension.
    #[instrument(skip(self), fields(model = %self.model))]
    pub async fn verify_connection(&self) -> AppResult<()> {
        debug!("Verifying Ollama connection at {}", self.base_url);
        let embedding = self.embed_single("test connection").await?;
        if embedding.len() != self.dimensions {
            return Err(AppError::Config(format!(
                "Ollama model '{}' returned {} dimensions, expected {}",
                self.model,
                embedding.len(),
                self.dimensions
            )));
        }
        Ok(())
    }

    /// Embed single text (no retries)
    #[instrument(skip(self, text), fields(text_len = text.len()))]
    async fn embed_single(&self, text: &str) -> AppResult<Vec<f32>> {
        let url = format!("{}{}", self.base_url, EMBEDDING_ENDPOINT);
        let request = EmbeddingRequest {
            model: &self.model,
            prompt: text,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    AppError::BackendUnavailable(format!(
                        "Ollama not reachable at {}: {}",
                        self.base_url, e
                    ))
                } else {
                    AppError::EmbeddingFailed(format!("Failed to send request to Ollama: {}", e))
                }
            })?;

        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            let message = serde_json::from_str::<ErrorResponse>(&error_text)
                .map(|r| r.error)
                .unwrap_or(error_text);

            if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                return Err(AppError::BackendUnavailable(format!(
                    "Ollama API error ({}): {}",
                    status, message
                )));
            }
            return Err(AppError::EmbeddingFailed(format!(
                "Ollama API error ({}): {}. Is model '{}' installed? Run: ollama pull {}",
                status, message, self.model, self.model
            )));
        }

        let body: EmbeddingResponse = response.json().await.map_err(|e| {
            AppError::EmbeddingFailed(format!("Failed to parse Ollama response: {}", e))
        })?;

        Ok(body.embedding)
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn provider_name(&self) -> &str {
        "ollama"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    #[instrument(skip(self, texts), fields(batch_size = texts.len(), model = %self.model))]
    async fn embed_batch(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        // The embeddings endpoint takes one prompt per request
        let mut embeddings = Vec::with_capacity(texts.len());

        for (i, text) in texts.iter().enumerate() {
            if text.trim().is_empty() {
                warn!("Empty text at index {}, using zero vector", i);
                embeddings.push(vec![0.0; self.dimensions]);
                continue;
            }
            embeddings.push(self.embed_single(text).await?);
        }

        Ok(embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(endpoint: Option<&str>) -> EmbeddingSettings {
        EmbeddingSettings {
            provider: "ollama".to_string(),
            model: "nomic-embed-text".to_string(),
            dimensions: 768,
            endpoint: endpoint.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_endpoint_from_settings() {
        let provider = OllamaProvider::new(&settings(Some("http://10.0.0.2:11434/"))).unwrap();
        assert_eq!(provider.base_url, "http://10.0.0.2:11434");
        assert_eq!(provider.provider_name(), "ollama");
        assert_eq!(provider.model_name(), "nomic-embed-text");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let provider = OllamaProvider::new(&settings(Some("http://127.0.0.1:9"))).unwrap();
        let err = provider
            .embed_batch(&["hello".to_string()])
            .await
            .unwrap_err();
        assert!(err.is_transient(), "unexpected error: {}", err);
    }

    #[tokio::test]
    async fn test_empty_texts_skip_the_server() {
        let provider = OllamaProvider::new(&settings(Some("http://127.0.0.1:9"))).unwrap();
        let embeddings = provider.embed_batch(&["  ".to_string()]).await.unwrap();
        assert_eq!(embeddings[0].len(), 768);
    }

    #[tokio::test]
    async fn test_live_embedding() {
        // Requires a local Ollama with nomic-embed-text pulled
        let provider = OllamaProvider::new(&settings(None)).unwrap();
        if provider.verify_connection().await.is_err() {
            println!("Skipping test: Ollama not running");
            return;
        }

        let embeddings = provider
            .embed_batch(&["First text".to_string(), "Second text".to_string()])
            .await
            .unwrap();
        assert_eq!(embeddings.len(), 2);
        assert!(embeddings[0].iter().any(|&x| x != 0.0));
    }
}
