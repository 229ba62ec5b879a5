//! Prompt assembly for grounded question answering.
//!
//! [`ContextAssembler`] renders a Handlebars template with the query, tagged
//! source passages and recent conversation history, keeping the estimated
//! size within a token budget.

pub mod assembler;
pub mod types;

pub use assembler::{ContextAssembler, DEFAULT_TEMPLATE};
pub use types::{AssembledPrompt, HistoryTurn, Passage, PassageRef, Role};
