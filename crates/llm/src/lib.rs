//! Generation backend crate for docrag.
//!
//! Provides a provider-agnostic abstraction over text generation backends.
//! Agents own one client each while they are running.
//!
//! # Providers
//! - **Ollama**: Local LLM runtime (default)
//! - **Static**: Deterministic offline backend (extractive or canned replies)
//!
//! # Example
//! ```no_run
//! use docrag_llm::{LlmClient, LlmRequest, providers::OllamaClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = OllamaClient::new();
//! let request = LlmRequest::new("Hello, world!", "llama3.2");
//! let response = client.complete(&request).await?;
//! println!("{}", response.content);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod factory;
pub mod providers;
pub mod types;

// Re-export main types
pub use client::{LlmClient, LlmRequest, LlmResponse, LlmUsage};
pub use factory::create_client;
pub use providers::{OllamaClient, StaticClient, StaticReply};
pub use types::ProviderType;
