//! Command handlers for the docrag CLI.

pub mod ask;
pub mod conversations;
pub mod documents;
pub mod ingest;
pub mod services;
pub mod stats;

pub use ask::{AskCommand, ChatCommand};
pub use conversations::ConversationsCommand;
pub use documents::DocumentsCommand;
pub use ingest::IngestCommand;
pub use stats::StatsCommand;
