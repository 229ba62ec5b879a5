//! Document types shared by ingestion and storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use docrag_core::AppError;

use crate::chunk::normalize_language;

/// Processing state of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Uploaded,
    Processing,
    Processed,
    Error,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploaded" => Ok(Self::Uploaded),
            "processing" => Ok(Self::Processing),
            "processed" => Ok(Self::Processed),
            "error" => Ok(Self::Error),
            other => Err(AppError::Storage(format!("Unknown document status: {}", other))),
        }
    }
}

/// A cleaned document as delivered by a document source.
///
/// Processing a document again replaces every chunk it produced before.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub owner: String,
    /// BCP 47 style tag, lowercased; `und` when unknown
    pub language: String,
    pub text: String,
    pub status: DocumentStatus,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn new(
        id: impl Into<String>,
        owner: impl Into<String>,
        language: &str,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            owner: owner.into(),
            language: normalize_language(language),
            text: text.into(),
            status: DocumentStatus::Uploaded,
            updated_at: Utc::now(),
        }
    }
}

/// Listing row for a stored document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub id: String,
    pub owner: String,
    pub language: String,
    pub status: DocumentStatus,
    pub chunk_count: u32,
    pub char_count: u64,
    pub updated_at: DateTime<Utc>,
}

/// Totals across the document store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub documents: u32,
    pub chunks: u32,
    pub embeddings: u32,
    pub embedding_models: Vec<String>,
}

/// Result of ingesting one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestReport {
    pub document_id: String,
    pub chunks: u32,
    pub chars: u64,
}

/// Totals of a batch ingestion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestStats {
    pub documents: u32,
    pub chunks: u32,
    pub chars: u64,
    /// Documents that failed, with the error message
    pub failed: Vec<(String, String)>,
    pub duration_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            DocumentStatus::Uploaded,
            DocumentStatus::Processing,
            DocumentStatus::Processed,
            DocumentStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<DocumentStatus>().unwrap(), status);
        }
        assert!("archived".parse::<DocumentStatus>().is_err());
    }

    #[test]
    fn test_new_document_normalizes_language() {
        let doc = Document::new("d1", "acme", " AR ", "نص");
        assert_eq!(doc.language, "ar");
        assert_eq!(doc.status, DocumentStatus::Uploaded);
    }
}
