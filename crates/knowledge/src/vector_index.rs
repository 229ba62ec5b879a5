//! In-memory vector index with snapshot reads.
//!
//! Readers take an `Arc` of the current immutable snapshot and search it
//! without holding any lock. Writers are serialized, build the next snapshot
//! by sharing every untouched document's entry set, and publish it with a
//! single pointer swap. A search therefore sees each document either wholly
//! before or wholly after any upsert, replace or delete.

use docrag_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::embeddings::normalize;

/// A searchable vector plus the chunk metadata needed to answer without a
/// second lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub chunk_id: String,
    pub document_id: String,
    pub owner: String,
    pub sequence: u32,
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub language: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredEntry {
    pub entry: IndexEntry,
    pub score: f32,
}

/// Which documents a search may return.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum IndexScope {
    #[default]
    All,
    Owner(String),
    Documents(BTreeSet<String>),
}

impl IndexScope {
    pub fn documents<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Documents(ids.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug)]
struct StoredEntry {
    entry: IndexEntry,
    /// Insertion order, breaks score ties
    seq: u64,
}

#[derive(Debug, Default)]
struct DocumentEntries {
    owner: String,
    entries: Vec<StoredEntry>,
}

/// Immutable view of the index at one generation.
#[derive(Debug, Default)]
pub struct IndexSnapshot {
    generation: u64,
    documents: HashMap<String, Arc<DocumentEntries>>,
}

impl IndexSnapshot {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.documents.values().map(|d| d.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    pub fn contains_document(&self, document_id: &str) -> bool {
        self.documents.contains_key(document_id)
    }

    /// Ids of the indexed documents, sorted.
    pub fn document_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.documents.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn in_scope<'a>(
        &'a self,
        scope: &'a IndexScope,
    ) -> Box<dyn Iterator<Item = &'a DocumentEntries> + 'a> {
        match scope {
            IndexScope::All => Box::new(self.documents.values().map(|d| d.as_ref())),
            IndexScope::Owner(owner) => Box::new(
                self.documents
                    .values()
                    .filter(move |d| &d.owner == owner)
                    .map(|d| d.as_ref()),
            ),
            IndexScope::Documents(ids) => Box::new(
                ids.iter()
                    .filter_map(|id| self.documents.get(id))
                    .map(|d| d.as_ref()),
            ),
        }
    }

    fn search(&self, query: &[f32], k: usize, min_score: f32, scope: &IndexScope) -> Vec<ScoredEntry> {
        if k == 0 {
            return Vec::new();
        }

        let mut hits: Vec<(f32, u64, &IndexEntry)> = self
            .in_scope(scope)
            .flat_map(|doc| doc.entries.iter())
            .map(|stored| (dot(query, &stored.entry.vector), stored.seq, &stored.entry))
            .filter(|(score, _, _)| *score >= min_score)
            .collect();

        hits.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        hits.truncate(k);

        hits.into_iter()
            .map(|(score, _, entry)| ScoredEntry {
                entry: entry.clone(),
                score,
            })
            .collect()
    }
}

struct WriterState {
    next_seq: u64,
}

/// Cosine-similarity index bound to one embedding model and dimension.
pub struct VectorIndex {
    model_id: String,
    dimensions: usize,
    current: RwLock<Arc<IndexSnapshot>>,
    writer: Mutex<WriterState>,
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("VectorIndex")
            .field("model_id", &self.model_id)
            .field("dimensions", &self.dimensions)
            .field("generation", &snapshot.generation)
            .field("entries", &snapshot.len())
            .finish()
    }
}

impl VectorIndex {
    pub fn new(model_id: impl Into<String>, dimensions: usize) -> Self {
        Self {
            model_id: model_id.into(),
            dimensions,
            current: RwLock::new(Arc::new(IndexSnapshot::default())),
            writer: Mutex::new(WriterState { next_seq: 0 }),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Current snapshot. Cheap; holds no lock after returning.
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn generation(&self) -> u64 {
        self.snapshot().generation
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn document_count(&self) -> usize {
        self.snapshot().document_count()
    }

    fn check_vector(&self, vector: &[f32], what: &str) -> AppResult<()> {
        if vector.len() != self.dimensions {
            return Err(AppError::Validation(format!(
                "{} has {} dimensions, index expects {}",
                what,
                vector.len(),
                self.dimensions
            )));
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(AppError::Validation(format!(
                "{} contains non-finite values",
                what
            )));
        }
        Ok(())
    }

    /// Apply `edit` to a copy of the document map and publish the result.
    fn publish<F>(&self, edit: F) -> AppResult<()>
    where
        F: FnOnce(&mut HashMap<String, Arc<DocumentEntries>>, &mut WriterState),
    {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let base = self.snapshot();

        let mut documents = base.documents.clone();
        edit(&mut documents, &mut writer);

        let next = Arc::new(IndexSnapshot {
            generation: base.generation + 1,
            documents,
        });
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next;
        Ok(())
    }

    fn prepare(&self, entries: Vec<IndexEntry>) -> AppResult<Vec<IndexEntry>> {
        entries
            .into_iter()
            .map(|mut entry| {
                self.check_vector(&entry.vector, &format!("Entry {}", entry.chunk_id))?;
                normalize(&mut entry.vector);
                Ok(entry)
            })
            .collect()
    }

    /// Insert or replace entries by chunk id. All touched documents change
    /// in one swap.
    pub fn upsert(&self, entries: Vec<IndexEntry>) -> AppResult<()> {
        let entries = self.prepare(entries)?;
        if entries.is_empty() {
            return Ok(());
        }

        let mut by_document: HashMap<String, Vec<IndexEntry>> = HashMap::new();
        for entry in entries {
            by_document
                .entry(entry.document_id.clone())
                .or_default()
                .push(entry);
        }

        self.publish(|documents, writer| {
            for (document_id, incoming) in by_document {
                let mut merged: Vec<StoredEntry> = Vec::new();
                let mut owner = String::new();
                if let Some(existing) = documents.get(&document_id) {
                    owner = existing.owner.clone();
                    merged.extend(
                        existing
                            .entries
                            .iter()
                            .filter(|s| !incoming.iter().any(|e| e.chunk_id == s.entry.chunk_id))
                            .map(|s| StoredEntry {
                                entry: s.entry.clone(),
                                seq: s.seq,
                            }),
                    );
                }
                for entry in incoming {
                    owner = entry.owner.clone();
                    merged.push(StoredEntry {
                        entry,
                        seq: writer.next_seq,
                    });
                    writer.next_seq += 1;
                }
                documents.insert(
                    document_id,
                    Arc::new(DocumentEntries {
                        owner,
                        entries: merged,
                    }),
                );
            }
        })?;

        tracing::debug!(generation = self.generation(), "Index upsert published");
        Ok(())
    }

    /// Swap a document's whole entry set. Empty `entries` removes it.
    pub fn replace_document(&self, document_id: &str, entries: Vec<IndexEntry>) -> AppResult<()> {
        if let Some(stray) = entries.iter().find(|e| e.document_id != document_id) {
            return Err(AppError::Validation(format!(
                "Entry {} belongs to {}, not {}",
                stray.chunk_id, stray.document_id, document_id
            )));
        }
        let entries = self.prepare(entries)?;

        self.publish(|documents, writer| {
            if entries.is_empty() {
                documents.remove(document_id);
                return;
            }
            let owner = entries[0].owner.clone();
            let stored = entries
                .into_iter()
                .map(|entry| {
                    let seq = writer.next_seq;
                    writer.next_seq += 1;
                    StoredEntry { entry, seq }
                })
                .collect();
            documents.insert(
                document_id.to_string(),
                Arc::new(DocumentEntries {
                    owner,
                    entries: stored,
                }),
            );
        })
    }

    /// Remove every entry of a document. Returns whether it was indexed.
    pub fn delete(&self, document_id: &str) -> AppResult<bool> {
        let mut existed = false;
        self.publish(|documents, _| {
            existed = documents.remove(document_id).is_some();
        })?;
        if existed {
            tracing::debug!(document_id, "Removed document from index");
        }
        Ok(existed)
    }

    /// Top `k` entries by cosine similarity, descending, ties in insertion
    /// order, all scoring at least `min_score`.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        min_score: f32,
        scope: &IndexScope,
    ) -> AppResult<Vec<ScoredEntry>> {
        self.check_vector(query, "Query vector")?;
        let mut query = query.to_vec();
        normalize(&mut query);

        Ok(self.snapshot().search(&query, k, min_score, scope))
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(doc: &str, owner: &str, seq: u32, vector: Vec<f32>) -> IndexEntry {
        IndexEntry {
            chunk_id: format!("{}-{}", doc, seq),
            document_id: doc.to_string(),
            owner: owner.to_string(),
            sequence: seq,
            start: 0,
            end: 1,
            text: format!("{} chunk {}", doc, seq),
            language: "en".to_string(),
            vector,
        }
    }

    #[test]
    fn test_search_orders_and_filters() {
        let index = VectorIndex::new("hashing:test", 3);
        index
            .upsert(vec![
                entry("a", "acme", 0, vec![1.0, 0.0, 0.0]),
                entry("a", "acme", 1, vec![0.7, 0.7, 0.0]),
                entry("b", "acme", 0, vec![0.0, 1.0, 0.0]),
                entry("c", "acme", 0, vec![-1.0, 0.0, 0.0]),
            ])
            .unwrap();

        let results = index.search(&[2.0, 0.0, 0.0], 10, 0.5, &IndexScope::All).unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.entry.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a-0", "a-1"]);
        assert!((results[0].score - 1.0).abs() < 1e-5);

        let top1 = index.search(&[1.0, 0.0, 0.0], 1, -1.0, &IndexScope::All).unwrap();
        assert_eq!(top1.len(), 1);
    }

    #[test]
    fn test_ties_break_by_insertion_order() {
        let index = VectorIndex::new("m", 2);
        index.upsert(vec![entry("z", "o", 0, vec![1.0, 0.0])]).unwrap();
        index.upsert(vec![entry("a", "o", 0, vec![1.0, 0.0])]).unwrap();
        index.upsert(vec![entry("m", "o", 0, vec![1.0, 0.0])]).unwrap();

        let results = index.search(&[1.0, 0.0], 3, 0.0, &IndexScope::All).unwrap();
        let docs: Vec<&str> = results.iter().map(|r| r.entry.document_id.as_str()).collect();
        assert_eq!(docs, vec!["z", "a", "m"]);
    }

    #[test]
    fn test_scopes_limit_results() {
        let index = VectorIndex::new("m", 2);
        index
            .upsert(vec![
                entry("d1", "alice", 0, vec![1.0, 0.0]),
                entry("d2", "alice", 0, vec![1.0, 0.1]),
                entry("d3", "bob", 0, vec![1.0, 0.2]),
            ])
            .unwrap();

        let q = [1.0, 0.0];
        let scoped = index
            .search(&q, 10, 0.0, &IndexScope::documents(["d1", "d2"]))
            .unwrap();
        assert_eq!(scoped.len(), 2);
        assert!(scoped.iter().all(|r| r.entry.document_id != "d3"));

        let bobs = index
            .search(&q, 10, 0.0, &IndexScope::Owner("bob".into()))
            .unwrap();
        assert_eq!(bobs.len(), 1);
        assert_eq!(bobs[0].entry.document_id, "d3");

        assert_eq!(index.search(&q, 10, 0.0, &IndexScope::All).unwrap().len(), 3);
    }

    #[test]
    fn test_upsert_replaces_by_chunk_id() {
        let index = VectorIndex::new("m", 2);
        index.upsert(vec![entry("d", "o", 0, vec![1.0, 0.0])]).unwrap();
        let mut updated = entry("d", "o", 0, vec![0.0, 1.0]);
        updated.text = "new text".to_string();
        index.upsert(vec![updated]).unwrap();

        assert_eq!(index.len(), 1);
        let hits = index.search(&[0.0, 1.0], 5, 0.5, &IndexScope::All).unwrap();
        assert_eq!(hits[0].entry.text, "new text");
    }

    #[test]
    fn test_replace_and_delete_document() {
        let index = VectorIndex::new("m", 2);
        index
            .replace_document(
                "d",
                vec![entry("d", "o", 0, vec![1.0, 0.0]), entry("d", "o", 1, vec![0.0, 1.0])],
            )
            .unwrap();
        assert_eq!(index.len(), 2);

        index
            .replace_document("d", vec![entry("d", "o", 5, vec![1.0, 1.0])])
            .unwrap();
        assert_eq!(index.len(), 1);

        let before = index.generation();
        assert!(index.delete("d").unwrap());
        assert!(index.generation() > before);
        assert!(index.is_empty());
        assert!(!index.delete("d").unwrap());

        let stray = index.replace_document("x", vec![entry("y", "o", 0, vec![1.0, 0.0])]);
        assert!(matches!(stray, Err(AppError::Validation(_))));
    }

    #[test]
    fn test_dimension_and_nan_validation() {
        let index = VectorIndex::new("m", 3);
        assert!(matches!(
            index.upsert(vec![entry("d", "o", 0, vec![1.0, 0.0])]),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            index.upsert(vec![entry("d", "o", 0, vec![f32::NAN, 0.0, 0.0])]),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            index.search(&[1.0, 0.0], 3, 0.0, &IndexScope::All),
            Err(AppError::Validation(_))
        ));
        assert!(index.is_empty());
    }

    #[test]
    fn test_zero_vector_scores_zero() {
        let index = VectorIndex::new("m", 2);
        index.upsert(vec![entry("d", "o", 0, vec![0.0, 0.0])]).unwrap();
        let hits = index.search(&[1.0, 0.0], 5, -1.0, &IndexScope::All).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].score, 0.0);
    }

    #[test]
    fn test_delete_is_atomic_for_concurrent_readers() {
        let index = Arc::new(VectorIndex::new("m", 2));
        let doomed: Vec<IndexEntry> = (0..25).map(|i| entry("doomed", "o", i, vec![1.0, 0.0])).collect();
        index.upsert(doomed).unwrap();
        index.upsert(vec![entry("keep", "o", 0, vec![1.0, 0.0])]).unwrap();

        std::thread::scope(|s| {
            for _ in 0..4 {
                let index = Arc::clone(&index);
                s.spawn(move || {
                    for _ in 0..500 {
                        let hits = index.search(&[1.0, 0.0], 100, 0.0, &IndexScope::All).unwrap();
                        let doomed = hits.iter().filter(|h| h.entry.document_id == "doomed").count();
                        assert!(doomed == 0 || doomed == 25, "partial delete observed: {}", doomed);
                    }
                });
            }
            s.spawn(|| {
                index.delete("doomed").unwrap();
            });
        });

        assert_eq!(index.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_search_is_bounded_sorted_and_thresholded(
            vectors in proptest::collection::vec(proptest::collection::vec(-1.0f32..1.0, 4), 0..40),
            query in proptest::collection::vec(-1.0f32..1.0, 4),
            k in 0usize..15,
            min_score in -1.0f32..1.0,
        ) {
            let index = VectorIndex::new("m", 4);
            let entries: Vec<IndexEntry> = vectors
                .into_iter()
                .enumerate()
                .map(|(i, v)| entry(&format!("d{}", i % 5), "o", i as u32, v))
                .collect();
            index.upsert(entries).unwrap();

            let hits = index.search(&query, k, min_score, &IndexScope::All).unwrap();
            prop_assert!(hits.len() <= k);
            for pair in hits.windows(2) {
                prop_assert!(pair[0].score >= pair[1].score);
            }
            for hit in &hits {
                prop_assert!(hit.score >= min_score);
            }
        }
    }
}
