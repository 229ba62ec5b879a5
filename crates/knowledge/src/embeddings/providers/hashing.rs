//! Local hashing embedding provider.

use crate::embeddings::provider::EmbeddingProvider;
use docrag_core::AppResult;
use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;
use unicode_segmentation::UnicodeSegmentation;

/// Deterministic, offline embeddings from word and character-trigram hashes.
///
/// Words come from Unicode word segmentation, so Arabic and CJK text hash
/// as well as Latin text does. Vectors are not semantically meaningful like a
/// neural model's, but equal text always maps to equal vectors and shared
/// vocabulary raises cosine similarity, which is what retrieval needs offline.
#[derive(Debug)]
pub struct HashingProvider {
    model: String,
    dimensions: usize,
}

fn stop_words() -> &'static HashSet<&'static str> {
    static STOP_WORDS: OnceLock<HashSet<&'static str>> = OnceLock::new();
    STOP_WORDS.get_or_init(|| {
        [
            "the", "is", "at", "which", "on", "a", "an", "as", "are", "was", "were", "for", "to",
            "of", "in", "and", "or", "but", "with", "by", "from", "this", "that", "be", "have",
            "has", "had", "it", "its", "their", "they", "them", "what", "how", "does", "do",
        ]
        .into_iter()
        .collect()
    })
}

fn bucket(bytes: &[u8], multiplier: u64, dimensions: usize) -> usize {
    let hash = bytes
        .iter()
        .fold(0u64, |acc, &b| acc.wrapping_mul(multiplier).wrapping_add(b as u64));
    (hash % dimensions as u64) as usize
}

impl HashingProvider {
    pub fn new(model: impl Into<String>, dimensions: usize) -> Self {
        Self {
            model: model.into(),
            dimensions: dimensions.max(1),
        }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0; self.dimensions];
        let lower = text.to_lowercase();

        // Ordered so colliding buckets are always summed in the same order.
        let mut word_freq: BTreeMap<&str, u32> = BTreeMap::new();
        for word in lower.unicode_words() {
            let short_ascii = word.is_ascii() && word.len() <= 2;
            if short_ascii || stop_words().contains(word) {
                continue;
            }
            *word_freq.entry(word).or_insert(0) += 1;
        }

        for (word, freq) in &word_freq {
            let chars: Vec<char> = word.chars().collect();
            for window in chars.windows(3) {
                let trigram: String = window.iter().collect();
                let idx = bucket(trigram.as_bytes(), 37, self.dimensions);
                embedding[idx] += (*freq as f32).sqrt();
            }

            let idx = bucket(word.as_bytes(), 31, self.dimensions);
            embedding[idx] += *freq as f32;
        }

        embedding
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for HashingProvider {
    fn provider_name(&self) -> &str {
        "hashing"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| self.embed_text(text)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        dot / (na * nb)
    }

    #[tokio::test]
    async fn test_hashing_provider_dimensions() {
        let provider = HashingProvider::new("trigram-v1", 384);
        assert_eq!(provider.dimensions(), 384);
        assert_eq!(provider.provider_name(), "hashing");
        assert_eq!(provider.model_name(), "trigram-v1");
    }

    #[tokio::test]
    async fn test_hashing_provider_deterministic() {
        let provider = HashingProvider::new("trigram-v1", 64);
        let texts = vec!["deterministic test".to_string(), "deterministic test".to_string()];
        let embeddings = provider.embed_batch(&texts).await.unwrap();
        assert_eq!(embeddings[0], embeddings[1]);
    }

    #[tokio::test]
    async fn test_repeated_vocabulary_is_bitwise_stable() {
        let provider = HashingProvider::new("trigram-v1", 384);
        let text = "The supplier shall indemnify the purchaser against claims. \
                    Termination requires written notice; notice periods, claims and \
                    indemnity survive termination of the supplier agreement. "
            .repeat(3);
        let first = provider.embed_text(&text);
        for _ in 0..200 {
            let again = provider.embed_text(&text);
            let same = first
                .iter()
                .zip(&again)
                .all(|(a, b)| a.to_bits() == b.to_bits());
            assert!(same);
        }
    }

    #[tokio::test]
    async fn test_shared_vocabulary_scores_higher() {
        let provider = HashingProvider::new("trigram-v1", 384);
        let texts = vec![
            "warranty coverage for laptops".to_string(),
            "how long is the laptop warranty".to_string(),
            "quarterly revenue grew strongly".to_string(),
        ];
        let e = provider.embed_batch(&texts).await.unwrap();
        assert!(cosine(&e[0], &e[1]) > cosine(&e[0], &e[2]));
    }

    #[tokio::test]
    async fn test_empty_text_is_zero_vector() {
        let provider = HashingProvider::new("trigram-v1", 32);
        let embeddings = provider.embed_batch(&["".to_string()]).await.unwrap();
        assert!(embeddings[0].iter().all(|&x| x == 0.0));
    }

    #[tokio::test]
    async fn test_arabic_text_is_embedded() {
        let provider = HashingProvider::new("trigram-v1", 128);
        let embeddings = provider
            .embed_batch(&["سياسة الاسترجاع للمنتجات".to_string()])
            .await
            .unwrap();
        assert!(embeddings[0].iter().any(|&x| x != 0.0));
    }
}
