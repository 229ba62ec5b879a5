//! Generation backend implementations.

pub mod ollama;
pub mod static_client;

pub use ollama::OllamaClient;
pub use static_client::{StaticClient, StaticReply};
