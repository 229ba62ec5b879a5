//! SQLite persistence for documents, chunks and embeddings.
//!
//! Deleting a document cascades to its chunks and their embeddings. The
//! in-memory [`crate::VectorIndex`] is rebuilt from this store on startup.

use crate::chunk::Chunk;
use crate::embeddings::Embedding;
use crate::types::{Document, DocumentStatus, DocumentSummary, StoreStats};
use crate::vector_index::IndexEntry;
use chrono::{DateTime, Utc};
use docrag_core::{AppError, AppResult};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

const SCHEMA: &str = r#"
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        owner TEXT NOT NULL,
        language TEXT NOT NULL,
        status TEXT NOT NULL,
        char_count INTEGER NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS chunks (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
        sequence INTEGER NOT NULL,
        start_char INTEGER NOT NULL,
        end_char INTEGER NOT NULL,
        overlap_chars INTEGER NOT NULL,
        text TEXT NOT NULL,
        language TEXT NOT NULL,
        hash TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id, sequence);

    CREATE TABLE IF NOT EXISTS embeddings (
        chunk_id TEXT PRIMARY KEY REFERENCES chunks(id) ON DELETE CASCADE,
        model_id TEXT NOT NULL,
        dimensions INTEGER NOT NULL,
        vector BLOB NOT NULL
    );
"#;

fn storage_err(context: &str) -> impl Fn(rusqlite::Error) -> AppError + '_ {
    move |e| AppError::Storage(format!("{}: {}", context, e))
}

/// Document, chunk and embedding tables behind one connection.
pub struct DocumentStore {
    conn: Mutex<Connection>,
}

impl DocumentStore {
    /// Open (or create) the store at `db_path`.
    pub fn open(db_path: &Path) -> AppResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path).map_err(storage_err("Failed to open database"))?;
        let store = Self::init(conn)?;
        tracing::debug!("Opened document store at {:?}", db_path);
        Ok(store)
    }

    pub fn open_in_memory() -> AppResult<Self> {
        let conn =
            Connection::open_in_memory().map_err(storage_err("Failed to open database"))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> AppResult<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(storage_err("Failed to create tables"))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or update a document row.
    pub fn upsert_document(&self, doc: &Document) -> AppResult<()> {
        self.conn()
            .execute(
                "INSERT INTO documents (id, owner, language, status, char_count, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    owner = excluded.owner,
                    language = excluded.language,
                    status = excluded.status,
                    char_count = excluded.char_count,
                    updated_at = excluded.updated_at",
                params![
                    doc.id,
                    doc.owner,
                    doc.language,
                    doc.status.as_str(),
                    doc.text.chars().count() as i64,
                    doc.updated_at.to_rfc3339(),
                ],
            )
            .map_err(storage_err("Failed to upsert document"))?;
        Ok(())
    }

    pub fn set_status(&self, document_id: &str, status: DocumentStatus) -> AppResult<()> {
        let updated = self
            .conn()
            .execute(
                "UPDATE documents SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![document_id, status.as_str(), Utc::now().to_rfc3339()],
            )
            .map_err(storage_err("Failed to update document status"))?;
        if updated == 0 {
            return Err(AppError::NotFound(format!("document {}", document_id)));
        }
        Ok(())
    }

    /// Replace all chunks and embeddings of a document in one transaction.
    pub fn replace_chunks(
        &self,
        document_id: &str,
        chunks: &[Chunk],
        embeddings: &[Embedding],
    ) -> AppResult<()> {
        let vectors: HashMap<&str, &Embedding> = embeddings
            .iter()
            .map(|e| (e.chunk_id.as_str(), e))
            .collect();

        let mut conn = self.conn();
        let tx = conn
            .transaction()
            .map_err(storage_err("Failed to begin transaction"))?;

        tx.execute("DELETE FROM chunks WHERE document_id = ?1", params![document_id])
            .map_err(storage_err("Failed to delete old chunks"))?;

        for chunk in chunks {
            tx.execute(
                "INSERT INTO chunks (id, document_id, sequence, start_char, end_char, overlap_chars, text, language, hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    chunk.id,
                    document_id,
                    chunk.sequence as i64,
                    chunk.start as i64,
                    chunk.end as i64,
                    chunk.overlap as i64,
                    chunk.text,
                    chunk.language,
                    chunk.hash,
                ],
            )
            .map_err(storage_err("Failed to insert chunk"))?;

            let embedding = vectors.get(chunk.id.as_str()).ok_or_else(|| {
                AppError::Validation(format!("Chunk {} has no embedding", chunk.id))
            })?;
            tx.execute(
                "INSERT INTO embeddings (chunk_id, model_id, dimensions, vector) VALUES (?1, ?2, ?3, ?4)",
                params![
                    chunk.id,
                    embedding.model_id,
                    embedding.vector.len() as i64,
                    embedding_to_bytes(&embedding.vector),
                ],
            )
            .map_err(storage_err("Failed to insert embedding"))?;
        }

        tx.commit().map_err(storage_err("Failed to commit chunks"))?;
        Ok(())
    }

    /// Delete a document with its chunks and embeddings.
    pub fn delete_document(&self, document_id: &str) -> AppResult<bool> {
        let deleted = self
            .conn()
            .execute("DELETE FROM documents WHERE id = ?1", params![document_id])
            .map_err(storage_err("Failed to delete document"))?;
        Ok(deleted > 0)
    }

    pub fn get_document(&self, document_id: &str) -> AppResult<Option<DocumentSummary>> {
        self.conn()
            .query_row(
                "SELECT d.id, d.owner, d.language, d.status, d.char_count, d.updated_at,
                        (SELECT COUNT(*) FROM chunks c WHERE c.document_id = d.id)
                 FROM documents d WHERE d.id = ?1",
                params![document_id],
                summary_from_row,
            )
            .optional()
            .map_err(storage_err("Failed to load document"))?
            .transpose()
    }

    pub fn list_documents(&self) -> AppResult<Vec<DocumentSummary>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT d.id, d.owner, d.language, d.status, d.char_count, d.updated_at,
                        (SELECT COUNT(*) FROM chunks c WHERE c.document_id = d.id)
                 FROM documents d ORDER BY d.id",
            )
            .map_err(storage_err("Failed to prepare query"))?;

        let rows = stmt
            .query_map([], summary_from_row)
            .map_err(storage_err("Failed to list documents"))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(storage_err("Failed to read document row"))??);
        }
        Ok(out)
    }

    /// Chunks of one document in sequence order.
    pub fn chunks_for(&self, document_id: &str) -> AppResult<Vec<Chunk>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, document_id, sequence, start_char, end_char, overlap_chars, text, language, hash
                 FROM chunks WHERE document_id = ?1 ORDER BY sequence",
            )
            .map_err(storage_err("Failed to prepare query"))?;

        let rows = stmt
            .query_map(params![document_id], |row| {
                Ok(Chunk {
                    id: row.get(0)?,
                    document_id: row.get(1)?,
                    sequence: row.get::<_, i64>(2)? as u32,
                    start: row.get::<_, i64>(3)? as usize,
                    end: row.get::<_, i64>(4)? as usize,
                    overlap: row.get::<_, i64>(5)? as usize,
                    text: row.get(6)?,
                    language: row.get(7)?,
                    hash: row.get(8)?,
                })
            })
            .map_err(storage_err("Failed to query chunks"))?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(storage_err("Failed to read chunk row"))
    }

    /// Distinct embedding model ids present in the store.
    pub fn embedding_models(&self) -> AppResult<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT DISTINCT model_id FROM embeddings ORDER BY model_id")
            .map_err(storage_err("Failed to prepare query"))?;
        let rows = stmt
            .query_map([], |row| row.get(0))
            .map_err(storage_err("Failed to query models"))?;
        rows.collect::<Result<Vec<String>, _>>()
            .map_err(storage_err("Failed to read model row"))
    }

    /// All index entries for `model_id`, in document and sequence order.
    ///
    /// # Errors
    /// `AppError::ModelMismatch` if the store holds embeddings of any other
    /// model; those documents must be re-ingested first.
    pub fn load_index_entries(&self, model_id: &str) -> AppResult<Vec<IndexEntry>> {
        if let Some(other) = self
            .embedding_models()?
            .into_iter()
            .find(|m| m != model_id)
        {
            return Err(AppError::ModelMismatch {
                index: other,
                embedder: model_id.to_string(),
            });
        }

        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT c.id, c.document_id, d.owner, c.sequence, c.start_char, c.end_char,
                        c.text, c.language, e.vector
                 FROM chunks c
                 JOIN documents d ON d.id = c.document_id
                 JOIN embeddings e ON e.chunk_id = c.id
                 WHERE e.model_id = ?1
                 ORDER BY c.document_id, c.sequence",
            )
            .map_err(storage_err("Failed to prepare query"))?;

        let rows = stmt
            .query_map(params![model_id], |row| {
                let bytes: Vec<u8> = row.get(8)?;
                Ok((
                    IndexEntry {
                        chunk_id: row.get(0)?,
                        document_id: row.get(1)?,
                        owner: row.get(2)?,
                        sequence: row.get::<_, i64>(3)? as u32,
                        start: row.get::<_, i64>(4)? as usize,
                        end: row.get::<_, i64>(5)? as usize,
                        text: row.get(6)?,
                        language: row.get(7)?,
                        vector: Vec::new(),
                    },
                    bytes,
                ))
            })
            .map_err(storage_err("Failed to query index entries"))?;

        let mut entries = Vec::new();
        for row in rows {
            let (mut entry, bytes) = row.map_err(storage_err("Failed to read index row"))?;
            entry.vector = bytes_to_embedding(&bytes)?;
            entries.push(entry);
        }
        Ok(entries)
    }

    pub fn stats(&self) -> AppResult<StoreStats> {
        let count = |sql: &str| -> AppResult<u32> {
            self.conn()
                .query_row(sql, [], |row| row.get::<_, i64>(0))
                .map(|v| v as u32)
                .map_err(storage_err("Failed to count rows"))
        };

        Ok(StoreStats {
            documents: count("SELECT COUNT(*) FROM documents")?,
            chunks: count("SELECT COUNT(*) FROM chunks")?,
            embeddings: count("SELECT COUNT(*) FROM embeddings")?,
            embedding_models: self.embedding_models()?,
        })
    }

    /// Delete every document (and by cascade everything else).
    pub fn reset(&self) -> AppResult<()> {
        self.conn()
            .execute("DELETE FROM documents", [])
            .map_err(storage_err("Failed to reset store"))?;
        tracing::info!("Reset document store");
        Ok(())
    }
}

fn summary_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AppResult<DocumentSummary>> {
    let status: String = row.get(3)?;
    let updated_at: String = row.get(5)?;

    let parsed = status.parse::<DocumentStatus>().and_then(|status| {
        let updated_at = DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| AppError::Storage(format!("Bad timestamp {}: {}", updated_at, e)))?
            .with_timezone(&Utc);
        Ok((status, updated_at))
    });

    let id: String = row.get(0)?;
    let owner: String = row.get(1)?;
    let language: String = row.get(2)?;
    let char_count = row.get::<_, i64>(4)? as u64;
    let chunk_count = row.get::<_, i64>(6)? as u32;

    Ok(parsed.map(|(status, updated_at)| DocumentSummary {
        id,
        owner,
        language,
        status,
        chunk_count,
        char_count,
        updated_at,
    }))
}

/// Convert embedding vector to little-endian bytes for storage.
fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Convert stored bytes back to an embedding vector.
fn bytes_to_embedding(bytes: &[u8]) -> AppResult<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(AppError::Storage(
            "Invalid embedding bytes length".to_string(),
        ));
    }

    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}
