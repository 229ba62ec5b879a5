//! Embedding generation.
//!
//! [`Embedder`] wraps a provider with the guarantees the index relies on:
//! one unit-length vector per input in input order, fixed dimension,
//! batch-size independence, deterministic truncation of oversize inputs and
//! bounded retries on transient backend failures.

pub mod provider;
pub mod providers;

pub use provider::{create_provider, EmbeddingProvider};

use crate::chunk::Chunk;
use docrag_core::config::EmbeddingSettings;
use docrag_core::retry::{with_retries, RetryPolicy};
use docrag_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A chunk's vector together with the model that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub model_id: String,
}

/// Batching, validating front end over an [`EmbeddingProvider`].
#[derive(Debug, Clone)]
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    max_input_chars: usize,
    retry: RetryPolicy,
}

impl Embedder {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        batch_size: usize,
        max_input_chars: usize,
        retry: RetryPolicy,
    ) -> AppResult<Self> {
        if batch_size == 0 || max_input_chars == 0 {
            return Err(AppError::Validation(
                "batch_size and max_input_chars must be greater than zero".to_string(),
            ));
        }
        if provider.dimensions() == 0 {
            return Err(AppError::Validation(format!(
                "Provider '{}' reports zero dimensions",
                provider.provider_name()
            )));
        }
        Ok(Self {
            provider,
            batch_size,
            max_input_chars,
            retry,
        })
    }

    /// Build the configured provider and wrap it.
    pub fn from_settings(settings: &EmbeddingSettings, retry: RetryPolicy) -> AppResult<Self> {
        let provider = create_provider(settings)?;
        Self::new(provider, settings.batch_size, settings.max_input_chars, retry)
    }

    /// `<provider>:<model>`; indexes are bound to this identifier.
    pub fn model_id(&self) -> String {
        format!(
            "{}:{}",
            self.provider.provider_name(),
            self.provider.model_name()
        )
    }

    pub fn dimensions(&self) -> usize {
        self.provider.dimensions()
    }

    /// Embed `texts`, returning one normalized vector per input in order.
    ///
    /// # Errors
    /// * `AppError::EmbeddingFailed` when the backend stays unavailable
    /// * `AppError::Validation` when the provider returns the wrong number of
    ///   vectors or a vector of the wrong dimension
    pub async fn embed(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        let dims = self.dimensions();

        for (batch_no, batch) in texts.chunks(self.batch_size).enumerate() {
            let inputs: Vec<String> = batch
                .iter()
                .map(|text| truncate_chars(text, self.max_input_chars))
                .collect();

            let provider = &self.provider;
            let inputs_ref = &inputs;
            let raw = with_retries(&self.retry, "embedding batch", move || {
                provider.embed_batch(inputs_ref)
            })
            .await
            .map_err(|e| match e {
                AppError::BackendUnavailable(msg) => AppError::EmbeddingFailed(format!(
                    "{} unavailable after {} attempts: {}",
                    self.model_id(),
                    self.retry.max_attempts.max(1),
                    msg
                )),
                other => other,
            })?;

            if raw.len() != inputs.len() {
                return Err(AppError::Validation(format!(
                    "Embedding batch {} returned {} vectors for {} inputs",
                    batch_no,
                    raw.len(),
                    inputs.len()
                )));
            }

            for mut vector in raw {
                if vector.len() != dims {
                    return Err(AppError::Validation(format!(
                        "Embedding has {} dimensions, expected {}",
                        vector.len(),
                        dims
                    )));
                }
                normalize(&mut vector);
                vectors.push(vector);
            }
        }

        tracing::debug!(
            count = vectors.len(),
            dims,
            model = %self.model_id(),
            "Generated embeddings"
        );

        Ok(vectors)
    }

    /// Embed a single query string.
    pub async fn embed_query(&self, text: &str) -> AppResult<Vec<f32>> {
        self.embed(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| AppError::EmbeddingFailed("No embedding returned".to_string()))
    }

    /// Embed chunk texts and pair each vector with its chunk id.
    pub async fn embed_chunks(&self, chunks: &[Chunk]) -> AppResult<Vec<Embedding>> {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embed(&texts).await?;
        let model_id = self.model_id();

        Ok(chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| Embedding {
                chunk_id: chunk.id.clone(),
                vector,
                model_id: model_id.clone(),
            })
            .collect())
    }
}

/// Keep at most `max` characters.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((byte, _)) => {
            tracing::debug!(chars = max, "Truncated oversize embedding input");
            text[..byte].to_string()
        }
        None => text.to_string(),
    }
}

/// Scale to unit length; zero vectors stay zero.
pub fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 && norm.is_finite() {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::providers::HashingProvider;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Provider that fails a number of times, then echoes input lengths.
    #[derive(Debug)]
    struct FlakyProvider {
        failures: AtomicU32,
        dims: usize,
        seen: Mutex<Vec<String>>,
        drop_last: bool,
    }

    impl FlakyProvider {
        fn new(failures: u32) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                dims: 4,
                seen: Mutex::new(Vec::new()),
                drop_last: false,
            }
        }
    }

    #[async_trait::async_trait]
    impl EmbeddingProvider for FlakyProvider {
        fn provider_name(&self) -> &str {
            "flaky"
        }
        fn model_name(&self) -> &str {
            "v0"
        }
        fn dimensions(&self) -> usize {
            self.dims
        }
        async fn embed_batch(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(AppError::BackendUnavailable("warming up".into()));
            }
            self.seen.lock().unwrap().extend(texts.iter().cloned());
            let mut out: Vec<Vec<f32>> = texts
                .iter()
                .map(|t| vec![t.chars().count() as f32, 1.0, 0.0, 0.0])
                .collect();
            if self.drop_last {
                out.pop();
            }
            Ok(out)
        }
    }

    fn hashing_embedder(batch_size: usize) -> Embedder {
        Embedder::new(
            Arc::new(HashingProvider::new("trigram-v1", 64)),
            batch_size,
            8192,
            RetryPolicy::none(),
        )
        .unwrap()
    }

    fn sample_texts() -> Vec<String> {
        (0..7)
            .map(|i| format!("document number {} talks about topic {}", i, i * 3))
            .collect()
    }

    #[tokio::test]
    async fn test_one_unit_vector_per_input_in_order() {
        let embedder = hashing_embedder(3);
        let texts = sample_texts();
        let vectors = embedder.embed(&texts).await.unwrap();

        assert_eq!(vectors.len(), texts.len());
        for (text, vector) in texts.iter().zip(&vectors) {
            assert_eq!(vector.len(), 64);
            let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5);
            let single = embedder.embed_query(text).await.unwrap();
            assert_eq!(&single, vector);
        }
    }

    #[tokio::test]
    async fn test_batch_size_does_not_change_output() {
        let texts = sample_texts();
        let a = hashing_embedder(1).embed(&texts).await.unwrap();
        let b = hashing_embedder(4).embed(&texts).await.unwrap();
        let c = hashing_embedder(100).embed(&texts).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[tokio::test]
    async fn test_oversize_inputs_are_truncated() {
        let provider = Arc::new(FlakyProvider::new(0));
        let embedder = Embedder::new(provider.clone(), 8, 5, RetryPolicy::none()).unwrap();
        embedder
            .embed(&["abcdefghij".to_string(), "ab".to_string()])
            .await
            .unwrap();
        assert_eq!(*provider.seen.lock().unwrap(), vec!["abcde", "ab"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let provider = Arc::new(FlakyProvider::new(2));
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        };
        let embedder = Embedder::new(provider, 8, 100, policy).unwrap();
        let vectors = embedder.embed(&["hello".to_string()]).await.unwrap();
        assert_eq!(vectors.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_become_embedding_failed() {
        let provider = Arc::new(FlakyProvider::new(10));
        let embedder = Embedder::new(provider, 8, 100, RetryPolicy::default()).unwrap();
        let err = embedder.embed(&["hello".to_string()]).await.unwrap_err();
        assert!(matches!(err, AppError::EmbeddingFailed(_)));
    }

    #[tokio::test]
    async fn test_wrong_vector_count_is_rejected() {
        let mut flaky = FlakyProvider::new(0);
        flaky.drop_last = true;
        let embedder = Embedder::new(Arc::new(flaky), 8, 100, RetryPolicy::none()).unwrap();
        let err = embedder
            .embed(&["a".to_string(), "b".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_empty_input_list() {
        let embedder = hashing_embedder(4);
        assert!(embedder.embed(&[]).await.unwrap().is_empty());
        assert_eq!(embedder.model_id(), "hashing:trigram-v1");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("مرحبا بالعالم", 5), "مرحبا");
        assert_eq!(truncate_chars("short", 10), "short");
    }
}
