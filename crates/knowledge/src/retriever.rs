//! Query-time retrieval: embed the query, search the index.

use crate::embeddings::Embedder;
use crate::vector_index::{IndexScope, ScoredEntry, VectorIndex};
use docrag_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One search hit with the metadata needed to cite it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub owner: String,
    pub sequence: u32,
    pub text: String,
    pub language: String,
    pub score: f32,
}

impl From<ScoredEntry> for RetrievedChunk {
    fn from(hit: ScoredEntry) -> Self {
        let entry = hit.entry;
        Self {
            chunk_id: entry.chunk_id,
            document_id: entry.document_id,
            owner: entry.owner,
            sequence: entry.sequence,
            text: entry.text,
            language: entry.language,
            score: hit.score,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Retriever {
    embedder: Arc<Embedder>,
    index: Arc<VectorIndex>,
}

impl Retriever {
    pub fn new(embedder: Arc<Embedder>, index: Arc<VectorIndex>) -> Self {
        Self { embedder, index }
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    /// Top `k` chunks in `scope` scoring at least `min_score`, best first.
    ///
    /// An empty result is not an error.
    #[tracing::instrument(skip(self, query, scope), fields(query_len = query.len()))]
    pub async fn retrieve(
        &self,
        query: &str,
        scope: &IndexScope,
        k: usize,
        min_score: f32,
    ) -> AppResult<Vec<RetrievedChunk>> {
        if query.trim().is_empty() {
            return Err(AppError::Validation("Query must not be empty".to_string()));
        }

        let embedder_model = self.embedder.model_id();
        if embedder_model != self.index.model_id() {
            return Err(AppError::ModelMismatch {
                index: self.index.model_id().to_string(),
                embedder: embedder_model,
            });
        }

        let vector = self.embedder.embed_query(query).await?;
        let hits = self.index.search(&vector, k, min_score, scope)?;

        tracing::debug!(
            hits = hits.len(),
            top_score = hits.first().map(|h| h.score),
            "Retrieved chunks"
        );

        Ok(hits.into_iter().map(RetrievedChunk::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::providers::HashingProvider;
    use crate::vector_index::IndexEntry;
    use docrag_core::RetryPolicy;

    async fn setup(index_model: &str) -> Retriever {
        let embedder = Arc::new(
            Embedder::new(
                Arc::new(HashingProvider::new("trigram-v1", 256)),
                8,
                8192,
                RetryPolicy::none(),
            )
            .unwrap(),
        );
        let index = Arc::new(VectorIndex::new(index_model, 256));

        let docs = [
            ("returns", "acme", "Refund policy: customers may return products within thirty days."),
            ("payroll", "acme", "Salaries are paid on the last business day of each month."),
            ("other", "globex", "Globex refund policy allows returns within ninety days."),
        ];
        let texts: Vec<String> = docs.iter().map(|d| d.2.to_string()).collect();
        let vectors = embedder.embed(&texts).await.unwrap();

        let entries = docs
            .iter()
            .zip(vectors)
            .map(|((id, owner, text), vector)| IndexEntry {
                chunk_id: format!("{}-0", id),
                document_id: id.to_string(),
                owner: owner.to_string(),
                sequence: 0,
                start: 0,
                end: text.chars().count(),
                text: text.to_string(),
                language: "en".to_string(),
                vector,
            })
            .collect();
        index.upsert(entries).unwrap();

        Retriever::new(embedder, index)
    }

    #[tokio::test]
    async fn test_retrieve_ranks_relevant_chunk_first() {
        let retriever = setup("hashing:trigram-v1").await;
        let hits = retriever
            .retrieve("refund policy return products", &IndexScope::All, 3, 0.0)
            .await
            .unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].document_id, "returns");
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn test_owner_scope_filters() {
        let retriever = setup("hashing:trigram-v1").await;
        let hits = retriever
            .retrieve("refund policy", &IndexScope::Owner("globex".into()), 5, 0.0)
            .await
            .unwrap();
        assert!(hits.iter().all(|h| h.owner == "globex"));
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_high_threshold_gives_empty_result() {
        let retriever = setup("hashing:trigram-v1").await;
        let hits = retriever
            .retrieve("quantum chromodynamics", &IndexScope::All, 5, 0.99)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let retriever = setup("hashing:trigram-v1").await;
        let err = retriever
            .retrieve("   ", &IndexScope::All, 5, 0.0)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_model_mismatch() {
        let retriever = setup("ollama:nomic-embed-text").await;
        let err = retriever
            .retrieve("refund", &IndexScope::All, 5, 0.0)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ModelMismatch { .. }));
    }
}
