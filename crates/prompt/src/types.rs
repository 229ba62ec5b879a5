//! Prompt types shared with the agent layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use docrag_core::AppError;

/// A retrieved passage offered to the assembler, best first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    pub score: f32,
}

/// Speaker of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(AppError::Storage(format!("Unknown message role: {}", other))),
        }
    }
}

/// One prior message, oldest first when passed to the assembler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: Role,
    pub text: String,
}

impl HistoryTurn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }
}

/// A passage that made it into the prompt, with its tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassageRef {
    /// `S1`, `S2`, ... in rank order
    pub tag: String,
    pub chunk_id: String,
    pub document_id: String,
    pub score: f32,
}

/// A rendered prompt within the token budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssembledPrompt {
    pub system: String,
    pub user: String,
    /// Included passages in rank order
    pub references: Vec<PassageRef>,
    /// Passages offered but dropped for budget
    pub passages_dropped: usize,
    /// Number of most recent history turns included
    pub history_included: usize,
    pub estimated_tokens: usize,
}

impl AssembledPrompt {
    /// Passages whose tag appears in `answer`, in rank order.
    ///
    /// An answer citing nothing is attributed to every included passage.
    pub fn citations_for(&self, answer: &str) -> Vec<PassageRef> {
        let cited: Vec<PassageRef> = self
            .references
            .iter()
            .filter(|r| answer.contains(&format!("[{}]", r.tag)))
            .cloned()
            .collect();

        if cited.is_empty() {
            self.references.clone()
        } else {
            cited
        }
    }
}
