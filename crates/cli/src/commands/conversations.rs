//! Conversations command handler.

use super::services::Services;
use clap::{Args, Subcommand};
use docrag_core::{config::AppConfig, AppError, AppResult};

/// Show or delete stored conversations
#[derive(Args, Debug)]
pub struct ConversationsCommand {
    #[command(subcommand)]
    pub action: ConversationsAction,
}

#[derive(Subcommand, Debug)]
pub enum ConversationsAction {
    /// Print every message of a conversation with its citations
    Show {
        id: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a conversation and its messages
    Delete { id: String },
}

impl ConversationsCommand {
    pub async fn execute(&self, config: &AppConfig) -> AppResult<()> {
        let services = Services::open(config)?;
        let conversations = services.registry.conversations();

        match &self.action {
            ConversationsAction::Show { id, json } => {
                let conversation = conversations.get(id)?;
                let messages = conversations.messages(id)?;

                if *json {
                    let output = serde_json::json!({
                        "conversation": conversation,
                        "messages": messages,
                    });
                    let rendered = serde_json::to_string_pretty(&output)
                        .map_err(|e| AppError::Serialization(e.to_string()))?;
                    println!("{}", rendered);
                    return Ok(());
                }

                println!(
                    "Conversation {} (agent {}, started {})",
                    conversation.id, conversation.agent_id, conversation.created_at
                );
                for message in &messages {
                    println!();
                    println!("{}: {}", message.role, message.text);
                    for citation in &message.citations {
                        println!("    [{}] {} ({:.3})", citation.tag, citation.document_id, citation.score);
                    }
                }
            }
            ConversationsAction::Delete { id } => {
                if !conversations.delete(id).await? {
                    return Err(AppError::NotFound(format!("conversation {}", id)));
                }
                println!("Deleted conversation {}", id);
            }
        }

        Ok(())
    }
}
