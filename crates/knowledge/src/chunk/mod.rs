//! Boundary-aware chunking with overlap.
//!
//! A document is cut into chunks of at most `max_chars` characters. Each cut
//! lands on the best boundary in the back half of the window: a paragraph
//! break, else a sentence boundary, else a word boundary, else a hard cut.
//! Consecutive chunks share up to `floor(overlap_ratio * max_chars)`
//! characters; the shared prefix of each chunk is recorded in `overlap` so
//! the original text can be rebuilt exactly with [`reconstruct`].

mod boundaries;
mod metadata;

pub use metadata::{calculate_hash, normalize_language};

use boundaries::Boundaries;
use docrag_core::config::ChunkingSettings;
use docrag_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};

/// Largest accepted overlap ratio.
pub const MAX_OVERLAP_RATIO: f32 = 0.9;

/// A contiguous span of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Unique identifier (UUID v4)
    pub id: String,
    pub document_id: String,
    /// Position in the document, 0-indexed
    pub sequence: u32,
    /// Start offset in characters, inclusive
    pub start: usize,
    /// End offset in characters, exclusive
    pub end: usize,
    /// Characters shared with the previous chunk
    pub overlap: usize,
    pub text: String,
    pub language: String,
    /// SHA-256 of `text`
    pub hash: String,
}

impl Chunk {
    pub fn char_len(&self) -> usize {
        self.end - self.start
    }
}

/// Splits document text into overlapping chunks.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    max_chars: usize,
    overlap_chars: usize,
}

impl Chunker {
    /// # Errors
    /// `AppError::Validation` if `max_chars` is zero or `overlap_ratio` is
    /// outside `[0, 0.9]`.
    pub fn new(max_chars: usize, overlap_ratio: f32) -> AppResult<Self> {
        if max_chars == 0 {
            return Err(AppError::Validation(
                "max_chars must be greater than zero".to_string(),
            ));
        }
        if !(0.0..=MAX_OVERLAP_RATIO).contains(&overlap_ratio) {
            return Err(AppError::Validation(format!(
                "overlap_ratio must be within [0, {}], got {}",
                MAX_OVERLAP_RATIO, overlap_ratio
            )));
        }

        let overlap_chars = ((overlap_ratio * max_chars as f32).floor() as usize)
            .min(max_chars.saturating_sub(1));

        Ok(Self {
            max_chars,
            overlap_chars,
        })
    }

    pub fn from_settings(settings: &ChunkingSettings) -> AppResult<Self> {
        Self::new(settings.max_chars, settings.overlap_ratio)
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    pub fn overlap_chars(&self) -> usize {
        self.overlap_chars
    }

    /// Chunk `text`. Empty or whitespace-only text yields no chunks.
    pub fn chunk(&self, document_id: &str, text: &str, language: &str) -> Vec<Chunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let language = normalize_language(language);
        let chars: Vec<char> = text.chars().collect();
        let total = chars.len();

        let make = |sequence: u32, start: usize, end: usize, overlap: usize| {
            let body: String = chars[start..end].iter().collect();
            Chunk {
                id: uuid::Uuid::new_v4().to_string(),
                document_id: document_id.to_string(),
                sequence,
                start,
                end,
                overlap,
                hash: calculate_hash(&body),
                text: body,
                language: language.clone(),
            }
        };

        if total <= self.max_chars {
            return vec![make(0, 0, total, 0)];
        }

        let boundaries = Boundaries::scan(text);
        let min_len = (self.overlap_chars + 1).max(self.max_chars / 2);

        let mut chunks = Vec::new();
        let mut start = 0;
        let mut overlap = 0;

        loop {
            let end = if total - start <= self.max_chars {
                total
            } else {
                let hi = start + self.max_chars;
                boundaries.best_cut(start + min_len, hi)
            };

            chunks.push(make(chunks.len() as u32, start, end, overlap));

            if end == total {
                break;
            }

            let mut next = end - self.overlap_chars;
            if self.overlap_chars > 0 {
                if let Some(cut) = boundaries
                    .first_word_start(next, end)
                    .or_else(|| boundaries.first_grapheme_start(next, end))
                {
                    next = cut;
                }
            }
            overlap = end - next;
            start = next;
        }

        tracing::debug!(
            document_id,
            chunks = chunks.len(),
            max_chars = self.max_chars,
            overlap = self.overlap_chars,
            "Chunked document"
        );

        chunks
    }
}

/// Rebuild the original text from a document's chunks in sequence order.
pub fn reconstruct(chunks: &[Chunk]) -> String {
    let mut ordered: Vec<&Chunk> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.sequence);

    ordered
        .into_iter()
        .flat_map(|c| c.text.chars().skip(c.overlap))
        .collect()
}
