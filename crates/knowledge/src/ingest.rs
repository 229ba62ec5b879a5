//! Build-time pipeline: document → chunks → embeddings → store + index.

use crate::chunk::Chunker;
use crate::embeddings::Embedder;
use crate::source::DocumentSource;
use crate::store::DocumentStore;
use crate::types::{Document, DocumentStatus, IngestReport, IngestStats};
use crate::vector_index::{IndexEntry, VectorIndex};
use docrag_core::{AppError, AppResult};
use std::sync::Arc;
use std::time::Instant;

/// Moves documents through chunking and embedding into the SQLite store and
/// the in-memory index.
///
/// The store is written before the index, so a failure part way leaves the
/// previous index entries searchable and the document marked `error`.
#[derive(Clone)]
pub struct Ingestor {
    chunker: Chunker,
    embedder: Arc<Embedder>,
    index: Arc<VectorIndex>,
    store: Arc<DocumentStore>,
}

impl Ingestor {
    pub fn new(
        chunker: Chunker,
        embedder: Arc<Embedder>,
        index: Arc<VectorIndex>,
        store: Arc<DocumentStore>,
    ) -> AppResult<Self> {
        if embedder.model_id() != index.model_id() {
            return Err(AppError::ModelMismatch {
                index: index.model_id().to_string(),
                embedder: embedder.model_id(),
            });
        }
        Ok(Self {
            chunker,
            embedder,
            index,
            store,
        })
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    /// Process (or reprocess) one document.
    #[tracing::instrument(skip(self, document), fields(document_id = %document.id))]
    pub async fn ingest(&self, mut document: Document) -> AppResult<IngestReport> {
        if document.id.trim().is_empty() {
            return Err(AppError::Validation("Document id must not be empty".to_string()));
        }

        document.status = DocumentStatus::Processing;
        self.store.upsert_document(&document)?;

        match self.process(&document).await {
            Ok(report) => {
                self.store
                    .set_status(&document.id, DocumentStatus::Processed)?;
                tracing::info!(
                    chunks = report.chunks,
                    chars = report.chars,
                    "Processed document {}",
                    document.id
                );
                Ok(report)
            }
            Err(e) => {
                tracing::warn!("Failed to process document {}: {}", document.id, e);
                self.store.set_status(&document.id, DocumentStatus::Error)?;
                Err(e)
            }
        }
    }

    async fn process(&self, document: &Document) -> AppResult<IngestReport> {
        let chunks = self
            .chunker
            .chunk(&document.id, &document.text, &document.language);
        let embeddings = self.embedder.embed_chunks(&chunks).await?;

        self.store
            .replace_chunks(&document.id, &chunks, &embeddings)?;

        let entries: Vec<IndexEntry> = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| IndexEntry {
                chunk_id: chunk.id.clone(),
                document_id: document.id.clone(),
                owner: document.owner.clone(),
                sequence: chunk.sequence,
                start: chunk.start,
                end: chunk.end,
                text: chunk.text.clone(),
                language: chunk.language.clone(),
                vector: embedding.vector,
            })
            .collect();
        self.index.replace_document(&document.id, entries)?;

        Ok(IngestReport {
            document_id: document.id.clone(),
            chunks: chunks.len() as u32,
            chars: document.text.chars().count() as u64,
        })
    }

    /// Ingest everything a source yields; per-document failures are
    /// collected, not fatal.
    pub async fn ingest_all(&self, source: &dyn DocumentSource) -> IngestStats {
        let start = Instant::now();
        let mut stats = IngestStats::default();

        // Collect first: the source iterator is not Send across awaits.
        let items: Vec<AppResult<Document>> = source.documents().collect();

        for item in items {
            let result = match item {
                Ok(document) => {
                    let id = document.id.clone();
                    self.ingest(document).await.map_err(|e| (id, e))
                }
                Err(e) => Err(("<source>".to_string(), e)),
            };

            match result {
                Ok(report) => {
                    stats.documents += 1;
                    stats.chunks += report.chunks;
                    stats.chars += report.chars;
                }
                Err((id, e)) => stats.failed.push((id, e.to_string())),
            }
        }

        stats.duration_secs = start.elapsed().as_secs_f64();
        tracing::info!(
            "Ingest completed: {} documents, {} chunks, {} failed in {:.2}s",
            stats.documents,
            stats.chunks,
            stats.failed.len(),
            stats.duration_secs
        );
        stats
    }

    /// Remove a document from the store and the index.
    pub fn delete(&self, document_id: &str) -> AppResult<bool> {
        let in_store = self.store.delete_document(document_id)?;
        let in_index = self.index.delete(document_id)?;
        Ok(in_store || in_index)
    }

    /// Drop every document.
    pub fn reset(&self) -> AppResult<()> {
        self.store.reset()?;
        for id in self.index.snapshot().document_ids() {
            self.index.delete(&id)?;
        }
        Ok(())
    }

    /// Load every stored entry for the embedder's model into the index.
    pub fn rebuild_index(&self) -> AppResult<usize> {
        let entries = self.store.load_index_entries(self.index.model_id())?;
        let count = entries.len();
        self.index.upsert(entries)?;
        tracing::debug!(entries = count, "Rebuilt vector index from store");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::providers::HashingProvider;
    use crate::embeddings::EmbeddingProvider;
    use crate::vector_index::IndexScope;
    use docrag_core::RetryPolicy;

    #[derive(Debug)]
    struct DownProvider;

    #[async_trait::async_trait]
    impl EmbeddingProvider for DownProvider {
        fn provider_name(&self) -> &str {
            "hashing"
        }
        fn model_name(&self) -> &str {
            "trigram-v1"
        }
        fn dimensions(&self) -> usize {
            64
        }
        async fn embed_batch(&self, _texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
            Err(AppError::BackendUnavailable("down".into()))
        }
    }

    fn ingestor_with(provider: Arc<dyn EmbeddingProvider>, store: Arc<DocumentStore>) -> Ingestor {
        let embedder = Arc::new(Embedder::new(provider, 8, 8192, RetryPolicy::none()).unwrap());
        let index = Arc::new(VectorIndex::new(embedder.model_id(), 64));
        Ingestor::new(Chunker::new(60, 0.2).unwrap(), embedder, index, store).unwrap()
    }

    fn ingestor() -> Ingestor {
        ingestor_with(
            Arc::new(HashingProvider::new("trigram-v1", 64)),
            Arc::new(DocumentStore::open_in_memory().unwrap()),
        )
    }

    const LONG: &str = "Employees accrue twenty days of paid leave each year. \
        Unused leave carries over for one year. Requests go to the line manager \
        at least two weeks ahead.";

    #[tokio::test]
    async fn test_ingest_writes_store_and_index() {
        let ingestor = ingestor();
        let report = ingestor
            .ingest(Document::new("leave", "acme", "en", LONG))
            .await
            .unwrap();

        assert!(report.chunks > 1);
        assert_eq!(ingestor.index().len(), report.chunks as usize);

        let summary = ingestor.store().get_document("leave").unwrap().unwrap();
        assert_eq!(summary.status, DocumentStatus::Processed);
        assert_eq!(summary.chunk_count, report.chunks);
    }

    #[tokio::test]
    async fn test_reprocessing_replaces_chunks() {
        let ingestor = ingestor();
        ingestor
            .ingest(Document::new("leave", "acme", "en", LONG))
            .await
            .unwrap();
        ingestor
            .ingest(Document::new("leave", "acme", "en", "Leave is now unlimited."))
            .await
            .unwrap();

        assert_eq!(ingestor.index().len(), 1);
        assert_eq!(ingestor.store().stats().unwrap().chunks, 1);
    }

    #[tokio::test]
    async fn test_failed_embedding_marks_error_and_keeps_old_entries() {
        let store = Arc::new(DocumentStore::open_in_memory().unwrap());
        let good = ingestor_with(Arc::new(HashingProvider::new("trigram-v1", 64)), store.clone());
        good.ingest(Document::new("leave", "acme", "en", LONG))
            .await
            .unwrap();

        let bad = Ingestor::new(
            Chunker::new(60, 0.2).unwrap(),
            Arc::new(Embedder::new(Arc::new(DownProvider), 8, 8192, RetryPolicy::none()).unwrap()),
            good.index().clone(),
            store.clone(),
        )
        .unwrap();

        let before = good.index().len();
        let err = bad
            .ingest(Document::new("leave", "acme", "en", "Changed."))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::EmbeddingFailed(_)));
        assert_eq!(good.index().len(), before);
        assert_eq!(
            store.get_document("leave").unwrap().unwrap().status,
            DocumentStatus::Error
        );
    }

    #[tokio::test]
    async fn test_ingest_all_collects_failures() {
        let ingestor = ingestor();
        let docs = vec![
            Document::new("a", "acme", "en", "Alpha text about invoices."),
            Document::new("", "acme", "en", "No id."),
            Document::new("b", "acme", "en", "   "),
        ];
        let stats = ingestor.ingest_all(&docs).await;
        assert_eq!(stats.documents, 2);
        assert_eq!(stats.failed.len(), 1);
        assert_eq!(ingestor.index().document_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_and_rebuild() {
        let store = Arc::new(DocumentStore::open_in_memory().unwrap());
        let first = ingestor_with(Arc::new(HashingProvider::new("trigram-v1", 64)), store.clone());
        first
            .ingest(Document::new("a", "acme", "en", LONG))
            .await
            .unwrap();
        first
            .ingest(Document::new("b", "acme", "en", "Invoices are due in 30 days."))
            .await
            .unwrap();

        assert!(first.delete("a").unwrap());
        assert!(!first.delete("a").unwrap());

        let restarted = ingestor_with(Arc::new(HashingProvider::new("trigram-v1", 64)), store);
        assert_eq!(restarted.rebuild_index().unwrap(), 1);
        assert!(restarted.index().snapshot().contains_document("b"));

        let hits = restarted
            .index()
            .search(&vec![1.0; 64], 5, -1.0, &IndexScope::All)
            .unwrap();
        assert!(hits.iter().all(|h| h.entry.document_id == "b"));
    }

    #[tokio::test]
    async fn test_mismatched_index_is_refused() {
        let embedder = Arc::new(
            Embedder::new(
                Arc::new(HashingProvider::new("trigram-v1", 64)),
                8,
                8192,
                RetryPolicy::none(),
            )
            .unwrap(),
        );
        let index = Arc::new(VectorIndex::new("ollama:nomic-embed-text", 64));
        let store = Arc::new(DocumentStore::open_in_memory().unwrap());
        let result = Ingestor::new(Chunker::new(60, 0.2).unwrap(), embedder, index, store);
        assert!(matches!(result, Err(AppError::ModelMismatch { .. })));
    }
}
