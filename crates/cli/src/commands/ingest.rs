//! Ingest command handler.

use super::services::Services;
use clap::Args;
use docrag_core::{config::AppConfig, AppError, AppResult};
use docrag_knowledge::DirectorySource;
use std::path::PathBuf;

/// Chunk, embed and index files or directories
#[derive(Args, Debug)]
pub struct IngestCommand {
    /// Files or directories to ingest
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Owner the documents belong to
    #[arg(long, default_value = "default")]
    pub owner: String,

    /// Language tag of the documents (e.g. en, ar)
    #[arg(long, default_value = "und")]
    pub language: String,

    /// Only ingest paths containing one of these patterns
    #[arg(long)]
    pub include: Vec<String>,

    /// Skip paths containing one of these patterns
    #[arg(long)]
    pub exclude: Vec<String>,

    /// Drop every stored document first
    #[arg(long)]
    pub reset: bool,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

impl IngestCommand {
    pub async fn execute(&self, config: &AppConfig) -> AppResult<()> {
        tracing::info!("Executing ingest command for {} paths", self.paths.len());

        for path in &self.paths {
            if !path.exists() {
                return Err(AppError::NotFound(format!("path {}", path.display())));
            }
        }

        let services = Services::open(config)?;
        if self.reset {
            services.ingestor.reset()?;
            tracing::info!("Document store reset");
        }

        let source = DirectorySource::new(self.paths.clone(), self.owner.clone())
            .with_language(self.language.clone())
            .with_include(self.include.clone())
            .with_exclude(self.exclude.clone());
        let stats = services.ingestor.ingest_all(&source).await;

        if self.json {
            let output = serde_json::to_string_pretty(&stats)
                .map_err(|e| AppError::Serialization(e.to_string()))?;
            println!("{}", output);
        } else {
            println!(
                "Ingested {} documents ({} chunks, {} chars) in {:.2}s",
                stats.documents, stats.chunks, stats.chars, stats.duration_secs
            );
            for (id, error) in &stats.failed {
                println!("  failed {}: {}", id, error);
            }
        }

        Ok(())
    }
}
