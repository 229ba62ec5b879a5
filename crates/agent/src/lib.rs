//! Agent lifecycle and query orchestration for docrag.
//!
//! An [`AgentRegistry`] owns every agent in the process. RAG agents answer
//! from retrieved passages with citations; fine-tuned agents answer from the
//! model alone. Both keep conversation history through a
//! [`ConversationManager`].

pub mod backend;
pub mod conversation;
pub mod registry;
pub mod types;

pub use backend::{BackendFactory, ProviderFactory};
pub use conversation::{
    Conversation, ConversationManager, ConversationStore, HistoryBudget, MemoryConversationStore,
    Message, SqliteConversationStore,
};
pub use registry::{AgentRegistry, RegistrySettings};
pub use types::{
    AgentInfo, AgentKind, AgentState, Citation, DeployRequest, DeployResponse, GenerationParams,
    QueryRequest, QueryResponse,
};
