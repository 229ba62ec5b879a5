//! Conversation history with single-writer ordering.
//!
//! Each conversation has its own async mutex. A query holds it for the whole
//! turn (history read, generation, both appends), so messages land in the
//! order queries arrived, while different conversations proceed in parallel.

mod memory;
mod sqlite;

pub use memory::MemoryConversationStore;
pub use sqlite::SqliteConversationStore;

use crate::types::Citation;
use chrono::{DateTime, Utc};
use docrag_core::{estimate_tokens, AppError, AppResult};
use docrag_prompt::{HistoryTurn, Role};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub agent_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    /// Zero-based position within the conversation
    pub position: u32,
    pub role: Role,
    pub text: String,
    pub citations: Vec<Citation>,
    pub created_at: DateTime<Utc>,
}

/// Persistence for conversations. Appends within one conversation are
/// already serialized by [`ConversationManager`].
pub trait ConversationStore: Send + Sync {
    fn create(&self, conversation: &Conversation) -> AppResult<()>;

    fn get(&self, conversation_id: &str) -> AppResult<Option<Conversation>>;

    /// Store `role`/`text` as the next message and return it.
    ///
    /// # Errors
    /// `AppError::NotFound` if the conversation does not exist.
    fn append(
        &self,
        conversation_id: &str,
        role: Role,
        text: &str,
        citations: &[Citation],
    ) -> AppResult<Message>;

    /// Messages in position order.
    fn messages(&self, conversation_id: &str) -> AppResult<Vec<Message>>;

    fn delete(&self, conversation_id: &str) -> AppResult<bool>;

    /// Conversations of an agent, oldest first.
    fn list(&self, agent_id: &str) -> AppResult<Vec<Conversation>>;
}

/// How much history a turn may carry. `None` means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryBudget {
    /// Maximum number of messages
    pub max_turns: Option<usize>,
    pub max_tokens: Option<usize>,
}

impl HistoryBudget {
    pub fn turns(max_turns: usize) -> Self {
        Self {
            max_turns: Some(max_turns),
            max_tokens: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Most recent messages that fit `budget`, oldest first.
fn truncate_history(messages: &[Message], budget: HistoryBudget) -> Vec<HistoryTurn> {
    let max_turns = budget.max_turns.unwrap_or(usize::MAX);
    let max_tokens = budget.max_tokens.unwrap_or(usize::MAX);

    let mut used = 0usize;
    let mut kept: Vec<HistoryTurn> = Vec::new();
    for message in messages.iter().rev() {
        if kept.len() >= max_turns {
            break;
        }
        let cost = estimate_tokens(&message.text);
        if used + cost > max_tokens {
            break;
        }
        used += cost;
        kept.push(HistoryTurn::new(message.role, message.text.clone()));
    }
    kept.reverse();
    kept
}

type LockMap = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

/// Exclusive access to one conversation for the duration of a turn.
pub struct TurnGuard {
    conversation_id: String,
    store: Arc<dyn ConversationStore>,
    locks: LockMap,
    lock: Option<OwnedMutexGuard<()>>,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        drop(self.lock.take());
        // Only the map still references the mutex: nobody is waiting.
        let unused = locks
            .get(&self.conversation_id)
            .is_some_and(|m| Arc::strong_count(m) == 1);
        if unused {
            locks.remove(&self.conversation_id);
        }
    }
}

impl TurnGuard {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn append(&self, role: Role, text: &str, citations: &[Citation]) -> AppResult<Message> {
        self.store
            .append(&self.conversation_id, role, text, citations)
    }

    pub fn history(&self, budget: HistoryBudget) -> AppResult<Vec<HistoryTurn>> {
        let messages = self.store.messages(&self.conversation_id)?;
        Ok(truncate_history(&messages, budget))
    }
}

pub struct ConversationManager {
    store: Arc<dyn ConversationStore>,
    locks: LockMap,
}

impl ConversationManager {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self {
            store,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryConversationStore::default()))
    }

    fn lock_for(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(conversation_id.to_string())
            .or_default()
            .clone()
    }

    pub fn create(&self, agent_id: &str) -> AppResult<Conversation> {
        let conversation = Conversation {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            created_at: Utc::now(),
        };
        self.store.create(&conversation)?;
        tracing::debug!(
            "Created conversation {} for agent {}",
            conversation.id,
            agent_id
        );
        Ok(conversation)
    }

    pub fn get(&self, conversation_id: &str) -> AppResult<Conversation> {
        self.store
            .get(conversation_id)?
            .ok_or_else(|| AppError::NotFound(format!("conversation {}", conversation_id)))
    }

    /// Wait for exclusive access to a conversation.
    pub async fn begin_turn(&self, conversation_id: &str) -> AppResult<TurnGuard> {
        let lock = self.lock_for(conversation_id).lock_owned().await;
        let guard = TurnGuard {
            conversation_id: conversation_id.to_string(),
            store: self.store.clone(),
            locks: self.locks.clone(),
            lock: Some(lock),
        };
        // It may have been deleted while we waited
        self.get(conversation_id)?;
        Ok(guard)
    }

    pub async fn append(
        &self,
        conversation_id: &str,
        role: Role,
        text: &str,
        citations: &[Citation],
    ) -> AppResult<Message> {
        self.begin_turn(conversation_id)
            .await?
            .append(role, text, citations)
    }

    /// Most recent messages within `budget`, oldest first.
    ///
    /// The same budget over the same messages always gives the same result.
    pub fn history(&self, conversation_id: &str, budget: HistoryBudget) -> AppResult<Vec<HistoryTurn>> {
        self.get(conversation_id)?;
        let messages = self.store.messages(conversation_id)?;
        Ok(truncate_history(&messages, budget))
    }

    pub fn messages(&self, conversation_id: &str) -> AppResult<Vec<Message>> {
        self.get(conversation_id)?;
        self.store.messages(conversation_id)
    }

    /// Delete a conversation once any turn in progress has finished.
    pub async fn delete(&self, conversation_id: &str) -> AppResult<bool> {
        let lock = self.lock_for(conversation_id);
        let _guard = lock.lock().await;
        let deleted = self.store.delete(conversation_id)?;
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(conversation_id);
        if deleted {
            tracing::info!("Deleted conversation {}", conversation_id);
        }
        Ok(deleted)
    }

    pub fn list(&self, agent_id: &str) -> AppResult<Vec<Conversation>> {
        self.store.list(agent_id)
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
