//! Document knowledge base.
//!
//! Build time: a [`DocumentSource`] yields documents, the [`Ingestor`] chunks
//! and embeds them, then writes the [`DocumentStore`] and the
//! [`VectorIndex`]. Query time: the [`Retriever`] embeds the question and
//! searches the index.

pub mod chunk;
pub mod embeddings;
pub mod ingest;
pub mod retriever;
pub mod source;
pub mod store;
pub mod types;
pub mod vector_index;

pub use chunk::{Chunk, Chunker};
pub use embeddings::{create_provider, Embedder, Embedding, EmbeddingProvider};
pub use ingest::Ingestor;
pub use retriever::{RetrievedChunk, Retriever};
pub use source::{DirectorySource, DocumentSource};
pub use store::DocumentStore;
pub use types::{
    Document, DocumentStatus, DocumentSummary, IngestReport, IngestStats, StoreStats,
};
pub use vector_index::{IndexEntry, IndexScope, IndexSnapshot, ScoredEntry, VectorIndex};
