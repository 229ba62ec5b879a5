//! Wiring of the document store, index and agent registry for one command.

use docrag_agent::{
    AgentKind, AgentRegistry, ConversationManager, DeployRequest, GenerationParams,
    ProviderFactory, RegistrySettings, SqliteConversationStore,
};
use docrag_core::{config::AppConfig, AppError, AppResult};
use docrag_knowledge::{
    Chunker, DocumentStore, Embedder, IndexScope, Ingestor, Retriever, VectorIndex,
};
use docrag_prompt::ContextAssembler;
use std::sync::Arc;

/// Everything a command needs, opened against the workspace database.
pub struct Services {
    pub ingestor: Ingestor,
    pub registry: AgentRegistry,
}

impl Services {
    /// Open the workspace and load the stored embeddings into memory.
    pub fn open(config: &AppConfig) -> AppResult<Self> {
        config.ensure_docrag_dir()?;
        let db_path = config.database_path();

        let store = Arc::new(DocumentStore::open(&db_path)?);
        let embedder = Arc::new(Embedder::from_settings(
            &config.embedding,
            config.retry.policy(),
        )?);
        let index = Arc::new(VectorIndex::new(embedder.model_id(), embedder.dimensions()));
        let ingestor = Ingestor::new(
            Chunker::from_settings(&config.chunking)?,
            embedder.clone(),
            index.clone(),
            store,
        )?;
        let loaded = ingestor.rebuild_index()?;
        tracing::debug!("Loaded {} chunks from {:?}", loaded, db_path);

        let conversations = ConversationManager::new(Arc::new(SqliteConversationStore::open(
            &db_path,
        )?));
        let factory = ProviderFactory::new(
            config.provider.clone(),
            config.endpoint.clone(),
            config.api_key.clone(),
            config.retry.policy(),
        );
        let registry = AgentRegistry::new(
            Arc::new(factory),
            Some(Arc::new(Retriever::new(embedder, index))),
            Arc::new(ContextAssembler::new(config.context.template.as_deref())?),
            Arc::new(conversations),
            RegistrySettings::from_config(config),
        );

        Ok(Self { ingestor, registry })
    }

    /// Deploy an agent and fail unless it reaches `running`.
    ///
    /// When continuing `conversation`, the agent is deployed under the id of
    /// the agent that owns it, so the conversation can be queried again from
    /// a new process.
    pub async fn deploy(
        &self,
        request: DeployRequest,
        conversation: Option<&str>,
    ) -> AppResult<String> {
        let response = match conversation {
            Some(id) => {
                let owner = self.registry.conversations().get(id)?.agent_id;
                tracing::debug!("Resuming conversation {} with agent {}", id, owner);
                self.registry.deploy_new_as(owner, request).await?
            }
            None => self.registry.deploy_new(request).await?,
        };
        match response.error {
            None => Ok(response.agent_id),
            Some(error) => Err(AppError::BackendUnavailable(format!(
                "Agent {} could not be deployed: {}",
                response.agent_id, error
            ))),
        }
    }
}

/// Agent options shared by `ask` and `chat`.
#[derive(clap::Args, Debug, Clone)]
pub struct AgentArgs {
    /// Agent kind: rag or fine-tuned
    #[arg(long, default_value = "rag", value_parser = ["rag", "fine-tuned"])]
    pub kind: String,

    /// Restrict retrieval to one owner's documents
    #[arg(long, conflicts_with = "document")]
    pub owner: Option<String>,

    /// Restrict retrieval to these documents
    #[arg(long)]
    pub document: Vec<String>,

    /// Sampling temperature (0.0-2.0)
    #[arg(long)]
    pub temperature: Option<f32>,

    /// Maximum tokens in the answer
    #[arg(long)]
    pub max_tokens: Option<u32>,
}

impl AgentArgs {
    pub fn deploy_request(&self, config: &AppConfig) -> DeployRequest {
        let kind = if self.kind == "fine-tuned" {
            AgentKind::FineTuned
        } else {
            let scope = match (&self.owner, self.document.is_empty()) {
                (Some(owner), _) => IndexScope::Owner(owner.clone()),
                (None, false) => IndexScope::documents(self.document.iter().cloned()),
                (None, true) => IndexScope::All,
            };
            AgentKind::Rag { scope }
        };

        let mut params = GenerationParams::from(&config.generation);
        if let Some(temperature) = self.temperature {
            params.temperature = temperature;
        }
        if let Some(max_tokens) = self.max_tokens {
            params.max_tokens = max_tokens;
        }

        DeployRequest {
            owner: self.owner.clone().unwrap_or_else(|| "default".to_string()),
            model_ref: config.model.clone(),
            kind,
            params,
        }
    }
}
