//! Metadata enrichment utilities.

use sha2::{Digest, Sha256};

/// Calculate SHA-256 hash of text.
pub fn calculate_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Lowercase and trim a language tag; empty tags become `und`.
pub fn normalize_language(tag: &str) -> String {
    let tag = tag.trim();
    if tag.is_empty() {
        "und".to_string()
    } else {
        tag.to_lowercase().replace('_', "-")
    }
}
