//! Stats command handler.

use super::services::Services;
use clap::Args;
use docrag_core::{config::AppConfig, AppError, AppResult};

/// Show document store and index statistics
#[derive(Args, Debug)]
pub struct StatsCommand {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

impl StatsCommand {
    pub async fn execute(&self, config: &AppConfig) -> AppResult<()> {
        tracing::info!("Executing stats command");

        let services = Services::open(config)?;
        let stats = services.ingestor.store().stats()?;
        let index = services.ingestor.index();

        if self.json {
            let output = serde_json::json!({
                "documents": stats.documents,
                "chunks": stats.chunks,
                "embeddings": stats.embeddings,
                "embeddingModels": stats.embedding_models,
                "indexModel": index.model_id(),
                "indexEntries": index.len(),
                "indexDocuments": index.document_count(),
                "maxDeployedAgents": config.agents.max_deployed_agents,
            });
            let rendered = serde_json::to_string_pretty(&output)
                .map_err(|e| AppError::Serialization(e.to_string()))?;
            println!("{}", rendered);
        } else {
            println!("Workspace: {}", config.workspace.display());
            println!("  Documents: {}", stats.documents);
            println!("  Chunks: {}", stats.chunks);
            println!("  Embeddings: {}", stats.embeddings);
            println!("  Embedding models: {}", stats.embedding_models.join(", "));
            println!(
                "  Index: {} ({} entries across {} documents)",
                index.model_id(),
                index.len(),
                index.document_count()
            );
            println!("  Agent slots: {}", config.agents.max_deployed_agents);
        }

        Ok(())
    }
}
