//! Error types for docrag.
//!
//! A single enum covers the pipeline's failure kinds (validation, capacity,
//! backend availability, timeouts, lifecycle state) together with the ambient
//! configuration, storage and serialization errors.

use thiserror::Error;

/// Unified error type for docrag.
///
/// All fallible functions return `Result<T, AppError>`. Errors that concern an
/// agent carry its id, and the conversation id when one is known.
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed input: bad chunking parameters, dimension mismatch,
    /// empty query, query larger than the context budget.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Deploying would exceed the configured agent limit.
    #[error("Capacity exceeded: {running} of {limit} agent slots in use")]
    Capacity { limit: usize, running: usize },

    /// Embedding or generation backend is unreachable. Transient.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Embedding failed after retries were exhausted.
    #[error("Embedding failed: {0}")]
    EmbeddingFailed(String),

    /// Generation failed after retries were exhausted.
    #[error("Generation failed for agent {agent_id} (conversation {conversation_id}): {message}")]
    GenerationFailed {
        agent_id: String,
        conversation_id: String,
        message: String,
    },

    /// A query failed after its conversation was resolved. `source` keeps
    /// the underlying failure kind.
    #[error("Query failed for agent {agent_id} (conversation {conversation_id}): {source}")]
    QueryFailed {
        agent_id: String,
        conversation_id: String,
        #[source]
        source: Box<AppError>,
    },

    /// Generation exceeded its time budget; the turn was discarded.
    #[error("Generation timed out for agent {agent_id} (conversation {conversation_id})")]
    Timeout {
        agent_id: String,
        conversation_id: String,
    },

    /// Operation not permitted in the agent's current lifecycle state.
    #[error("Agent {agent_id} is {state}; cannot {operation}")]
    InvalidState {
        agent_id: String,
        state: String,
        operation: String,
    },

    /// Query embeddings come from a different model than the index.
    #[error("Embedding model mismatch: index uses {index}, embedder uses {embedder}")]
    ModelMismatch { index: String, embedder: String },

    /// Unknown agent, conversation or document.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Persistent storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O and filesystem errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// LLM provider errors that are not transient
    #[error("LLM error: {0}")]
    Llm(String),

    /// Prompt rendering errors
    #[error("Prompt error: {0}")]
    Prompt(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl AppError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::BackendUnavailable(_))
    }

    /// The innermost error, looking through `QueryFailed` wrappers.
    pub fn root(&self) -> &AppError {
        match self {
            AppError::QueryFailed { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(err: serde_yaml::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;
