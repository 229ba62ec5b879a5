use super::{Conversation, ConversationStore, Message};
use crate::types::Citation;
use chrono::Utc;
use docrag_core::{AppError, AppResult};
use docrag_prompt::Role;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct Inner {
    conversations: HashMap<String, (Conversation, Vec<Message>)>,
}

/// Process-local store; everything is lost on exit.
#[derive(Default)]
pub struct MemoryConversationStore {
    inner: Mutex<Inner>,
}

impl MemoryConversationStore {
    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ConversationStore for MemoryConversationStore {
    fn create(&self, conversation: &Conversation) -> AppResult<()> {
        let mut inner = self.inner();
        if inner.conversations.contains_key(&conversation.id) {
            return Err(AppError::Validation(format!(
                "Conversation {} already exists",
                conversation.id
            )));
        }
        inner
            .conversations
            .insert(conversation.id.clone(), (conversation.clone(), Vec::new()));
        Ok(())
    }

    fn get(&self, conversation_id: &str) -> AppResult<Option<Conversation>> {
        Ok(self
            .inner()
            .conversations
            .get(conversation_id)
            .map(|(c, _)| c.clone()))
    }

    fn append(
        &self,
        conversation_id: &str,
        role: Role,
        text: &str,
        citations: &[Citation],
    ) -> AppResult<Message> {
        let mut inner = self.inner();
        let (_, messages) = inner
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| AppError::NotFound(format!("conversation {}", conversation_id)))?;

        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            position: messages.len() as u32,
            role,
            text: text.to_string(),
            citations: citations.to_vec(),
            created_at: Utc::now(),
        };
        messages.push(message.clone());
        Ok(message)
    }

    fn messages(&self, conversation_id: &str) -> AppResult<Vec<Message>> {
        Ok(self
            .inner()
            .conversations
            .get(conversation_id)
            .map(|(_, m)| m.clone())
            .unwrap_or_default())
    }

    fn delete(&self, conversation_id: &str) -> AppResult<bool> {
        Ok(self.inner().conversations.remove(conversation_id).is_some())
    }

    fn list(&self, agent_id: &str) -> AppResult<Vec<Conversation>> {
        let mut list: Vec<Conversation> = self
            .inner()
            .conversations
            .values()
            .filter(|(c, _)| c.agent_id == agent_id)
            .map(|(c, _)| c.clone())
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(list)
    }
}
