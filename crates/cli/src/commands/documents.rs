//! Documents command handler.

use super::services::Services;
use clap::{Args, Subcommand};
use docrag_core::{config::AppConfig, AppError, AppResult};

/// Inspect or remove ingested documents
#[derive(Args, Debug)]
pub struct DocumentsCommand {
    #[command(subcommand)]
    pub action: DocumentsAction,
}

#[derive(Subcommand, Debug)]
pub enum DocumentsAction {
    /// List stored documents
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a document and its chunks
    Delete {
        /// Document id as shown by `documents list`
        id: String,
    },
}

impl DocumentsCommand {
    pub async fn execute(&self, config: &AppConfig) -> AppResult<()> {
        let services = Services::open(config)?;
        let store = services.ingestor.store();

        match &self.action {
            DocumentsAction::List { json } => {
                let documents = store.list_documents()?;
                if *json {
                    let output = serde_json::to_string_pretty(&documents)
                        .map_err(|e| AppError::Serialization(e.to_string()))?;
                    println!("{}", output);
                    return Ok(());
                }

                if documents.is_empty() {
                    println!("No documents ingested");
                }
                for doc in &documents {
                    println!(
                        "{}  owner={} lang={} status={} chunks={} chars={}",
                        doc.id,
                        doc.owner,
                        doc.language,
                        doc.status.as_str(),
                        doc.chunk_count,
                        doc.char_count
                    );
                }
            }
            DocumentsAction::Delete { id } => {
                if !services.ingestor.delete(id)? {
                    return Err(AppError::NotFound(format!("document {}", id)));
                }
                println!("Deleted document {}", id);
            }
        }

        Ok(())
    }
}
