//! Configuration management for docrag.
//!
//! Configuration is merged from, in increasing precedence:
//! - Built-in defaults
//! - The workspace config file (`.docrag/config.yaml`)
//! - Environment variables
//! - Command-line flags
//!
//! The configuration is workspace-centric, with all state stored in `.docrag/`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::retry::RetryPolicy;

/// Generation backends understood by the agent factory.
pub const KNOWN_PROVIDERS: [&str; 2] = ["ollama", "static"];

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Path to the workspace root (contains .docrag/)
    pub workspace: PathBuf,

    /// Optional config file path
    pub config_file: Option<PathBuf>,

    /// Generation provider ("ollama" or "static")
    pub provider: String,

    /// Generation model identifier
    pub model: String,

    /// Provider endpoint; `None` uses the provider default
    pub endpoint: Option<String>,

    /// API key for the provider, if it needs one
    pub api_key: Option<String>,

    /// Log level override
    pub log_level: Option<String>,

    /// Verbose mode (enables debug logging)
    pub verbose: bool,

    /// Disable colored output
    pub no_color: bool,

    pub chunking: ChunkingSettings,
    pub embedding: EmbeddingSettings,
    pub retrieval: RetrievalSettings,
    pub context: ContextSettings,
    pub agents: AgentSettings,
    pub generation: GenerationSettings,
    pub retry: RetrySettings,
}

/// How documents are split into chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingSettings {
    /// Maximum chunk length in characters
    pub max_chars: usize,
    /// Fraction of `max_chars` shared by consecutive chunks
    pub overlap_ratio: f32,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            max_chars: 1000,
            overlap_ratio: 0.2,
        }
    }
}

/// Embedding provider selection and batching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    /// "hashing" (local, deterministic) or "ollama"
    pub provider: String,
    pub model: String,
    pub dimensions: usize,
    pub batch_size: usize,
    /// Inputs longer than this are truncated before embedding
    pub max_input_chars: usize,
    /// Ollama endpoint for the "ollama" provider
    pub endpoint: Option<String>,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: "hashing".to_string(),
            model: "trigram-v1".to_string(),
            dimensions: 384,
            batch_size: 32,
            max_input_chars: 8192,
            endpoint: None,
        }
    }
}

/// What a RAG agent does when retrieval finds nothing above the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyRetrievalPolicy {
    /// Generate from history and query alone.
    Ungrounded,
    /// Skip generation and answer with the configured message.
    NoContextMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    pub top_k: usize,
    pub min_score: f32,
    pub empty_policy: EmptyRetrievalPolicy,
    pub no_context_message: String,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_score: 0.3,
            empty_policy: EmptyRetrievalPolicy::NoContextMessage,
            no_context_message:
                "I could not find anything in the indexed documents that answers this question."
                    .to_string(),
        }
    }
}

/// Prompt budgeting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSettings {
    pub max_context_tokens: usize,
    pub max_history_turns: usize,
    /// Optional Handlebars template replacing the built-in prompt layout
    pub template: Option<String>,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            max_context_tokens: 2048,
            max_history_turns: 10,
            template: None,
        }
    }
}

/// Agent lifecycle limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub max_deployed_agents: usize,
    /// Running agents idle longer than this are stopped
    pub agent_timeout_seconds: u64,
    pub generation_timeout_seconds: u64,
    pub eviction_interval_seconds: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_deployed_agents: 5,
            agent_timeout_seconds: 30,
            generation_timeout_seconds: 60,
            eviction_interval_seconds: 10,
        }
    }
}

impl AgentSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_seconds)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_seconds)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_seconds)
    }
}

/// Default sampling parameters for new agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub max_tokens: u32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_k: 50,
            top_p: 0.95,
            max_tokens: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 2000,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

/// Full configuration file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ConfigFile {
    workspace: Option<WorkspaceConfig>,
    logging: Option<LoggingConfig>,
    llm: Option<LlmConfig>,
    chunking: Option<ChunkingSettings>,
    embedding: Option<EmbeddingSettings>,
    retrieval: Option<RetrievalSettings>,
    context: Option<ContextSettings>,
    agents: Option<AgentSettings>,
    generation: Option<GenerationSettings>,
    retry: Option<RetrySettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WorkspaceConfig {
    path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LoggingConfig {
    level: Option<String>,
    color: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LlmConfig {
    provider: Option<String>,
    model: Option<String>,
    endpoint: Option<String>,
    #[serde(rename = "apiKeyEnv")]
    api_key_env: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workspace: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            config_file: None,
            provider: "ollama".to_string(), // Local-first default
            model: "llama3.2".to_string(),
            endpoint: None,
            api_key: None,
            log_level: None,
            verbose: false,
            no_color: false,
            chunking: ChunkingSettings::default(),
            embedding: EmbeddingSettings::default(),
            retrieval: RetrievalSettings::default(),
            context: ContextSettings::default(),
            agents: AgentSettings::default(),
            generation: GenerationSettings::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the process environment and defaults.
    ///
    /// Environment variables:
    /// - `DOCRAG_WORKSPACE`, `DOCRAG_CONFIG`: workspace root and config file
    /// - `DOCRAG_PROVIDER`, `DOCRAG_MODEL`, `DOCRAG_ENDPOINT`, `DOCRAG_API_KEY`
    /// - `MAX_DEPLOYED_AGENTS`, `AGENT_TIMEOUT_SECONDS`
    /// - `DEFAULT_TEMPERATURE`, `DEFAULT_TOP_K`, `DEFAULT_TOP_P`
    /// - `RUST_LOG`, `NO_COLOR`
    ///
    /// # Example
    /// ```no_run
    /// use docrag_core::config::AppConfig;
    ///
    /// let config = AppConfig::load().expect("Failed to load config");
    /// println!("Workspace: {:?}", config.workspace);
    /// ```
    pub fn load() -> AppResult<Self> {
        Self::load_with_env(|key| std::env::var(key).ok())
    }

    /// Load configuration using `env` to look up variables.
    pub fn load_with_env<F>(env: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(workspace) = env("DOCRAG_WORKSPACE") {
            config.workspace = PathBuf::from(workspace);
        }

        if let Some(config_file) = env("DOCRAG_CONFIG") {
            config.config_file = Some(PathBuf::from(config_file));
        }

        if !config.workspace.exists() {
            return Err(AppError::Config(format!(
                "Workspace directory does not exist: {:?}",
                config.workspace
            )));
        }

        let config_path = match config.config_file {
            Some(ref cf) => cf.clone(),
            None => config.workspace.join(".docrag/config.yaml"),
        };

        if config_path.exists() {
            config = config.merge_yaml(&config_path, &env)?;
        }

        // Environment variables override YAML config
        if let Some(provider) = env("DOCRAG_PROVIDER") {
            config.provider = provider;
        }
        if let Some(model) = env("DOCRAG_MODEL") {
            config.model = model;
        }
        if let Some(endpoint) = env("DOCRAG_ENDPOINT") {
            config.endpoint = Some(endpoint);
        }
        if let Some(key) = env("DOCRAG_API_KEY") {
            config.api_key = Some(key);
        }
        if let Some(limit) = parse_env(&env, "MAX_DEPLOYED_AGENTS")? {
            config.agents.max_deployed_agents = limit;
        }
        if let Some(secs) = parse_env(&env, "AGENT_TIMEOUT_SECONDS")? {
            config.agents.agent_timeout_seconds = secs;
        }
        if let Some(t) = parse_env(&env, "DEFAULT_TEMPERATURE")? {
            config.generation.temperature = t;
        }
        if let Some(k) = parse_env(&env, "DEFAULT_TOP_K")? {
            config.generation.top_k = k;
        }
        if let Some(p) = parse_env(&env, "DEFAULT_TOP_P")? {
            config.generation.top_p = p;
        }
        if let Some(level) = env("RUST_LOG") {
            config.log_level = Some(level);
        }
        if env("NO_COLOR").is_some() {
            config.no_color = true;
        }

        Ok(config)
    }

    /// Merge a YAML configuration file into this config.
    fn merge_yaml<F>(&self, path: &Path, env: &F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let file: ConfigFile = serde_yaml::from_str(&contents).map_err(|e| {
            AppError::Config(format!("Failed to parse config file {:?}: {}", path, e))
        })?;

        let mut result = self.clone();

        if let Some(path) = file.workspace.and_then(|ws| ws.path) {
            result.workspace = PathBuf::from(path);
        }

        if let Some(logging) = file.logging {
            if let Some(level) = logging.level {
                result.log_level = Some(level);
            }
            if let Some(color) = logging.color {
                result.no_color = !color;
            }
        }

        if let Some(llm) = file.llm {
            if let Some(provider) = llm.provider {
                result.provider = provider;
            }
            if let Some(model) = llm.model {
                result.model = model;
            }
            if let Some(endpoint) = llm.endpoint {
                result.endpoint = Some(endpoint);
            }
            if let Some(var) = llm.api_key_env {
                result.api_key = env(&var);
            }
        }

        if let Some(chunking) = file.chunking {
            result.chunking = chunking;
        }
        if let Some(embedding) = file.embedding {
            result.embedding = embedding;
        }
        if let Some(retrieval) = file.retrieval {
            result.retrieval = retrieval;
        }
        if let Some(context) = file.context {
            result.context = context;
        }
        if let Some(agents) = file.agents {
            result.agents = agents;
        }
        if let Some(generation) = file.generation {
            result.generation = generation;
        }
        if let Some(retry) = file.retry {
            result.retry = retry;
        }

        Ok(result)
    }

    /// Apply CLI overrides to the configuration.
    ///
    /// CLI flags take precedence over environment variables and the config file.
    #[allow(clippy::too_many_arguments)]
    pub fn with_overrides(
        mut self,
        workspace: Option<PathBuf>,
        config_file: Option<PathBuf>,
        provider: Option<String>,
        model: Option<String>,
        log_level: Option<String>,
        verbose: bool,
        no_color: bool,
    ) -> Self {
        if let Some(workspace) = workspace {
            self.workspace = workspace;
        }

        if let Some(config_file) = config_file {
            self.config_file = Some(config_file);
        }

        if let Some(provider) = provider {
            self.provider = provider;
        }

        if let Some(model) = model {
            self.model = model;
        }

        if let Some(log_level) = log_level {
            self.log_level = Some(log_level);
        }

        if verbose {
            self.verbose = true;
            // Verbose mode implies debug logging
            if self.log_level.is_none() {
                self.log_level = Some("debug".to_string());
            }
        }

        if no_color {
            self.no_color = true;
        }

        self
    }

    /// Get the path to the .docrag directory.
    pub fn docrag_dir(&self) -> PathBuf {
        self.workspace.join(".docrag")
    }

    /// SQLite database holding documents, chunks, embeddings and conversations.
    pub fn database_path(&self) -> PathBuf {
        self.docrag_dir().join("docrag.sqlite")
    }

    /// Ensure the .docrag directory exists.
    pub fn ensure_docrag_dir(&self) -> AppResult<()> {
        let dir = self.docrag_dir();
        if !dir.exists() {
            std::fs::create_dir_all(&dir).map_err(|e| {
                AppError::Config(format!("Failed to create .docrag directory: {}", e))
            })?;
        }
        Ok(())
    }

    /// Validate provider and numeric ranges.
    pub fn validate(&self) -> AppResult<()> {
        if !KNOWN_PROVIDERS.contains(&self.provider.as_str()) {
            return Err(AppError::Config(format!(
                "Unknown provider: {}. Supported: {}",
                self.provider,
                KNOWN_PROVIDERS.join(", ")
            )));
        }

        if self.chunking.max_chars == 0 {
            return Err(AppError::Config("chunking.max_chars must be positive".into()));
        }
        if !(0.0..=0.9).contains(&self.chunking.overlap_ratio) {
            return Err(AppError::Config(format!(
                "chunking.overlap_ratio must be within [0, 0.9], got {}",
                self.chunking.overlap_ratio
            )));
        }
        if self.embedding.dimensions == 0 || self.embedding.batch_size == 0 {
            return Err(AppError::Config(
                "embedding.dimensions and embedding.batch_size must be positive".into(),
            ));
        }
        if self.retrieval.top_k == 0 {
            return Err(AppError::Config("retrieval.top_k must be positive".into()));
        }
        if !(-1.0..=1.0).contains(&self.retrieval.min_score) {
            return Err(AppError::Config(format!(
                "retrieval.min_score must be within [-1, 1], got {}",
                self.retrieval.min_score
            )));
        }
        if self.context.max_context_tokens == 0 {
            return Err(AppError::Config(
                "context.max_context_tokens must be positive".into(),
            ));
        }
        if self.agents.max_deployed_agents == 0 {
            return Err(AppError::Config(
                "agents.max_deployed_agents must be positive".into(),
            ));
        }
        if !(0.0..=2.0).contains(&self.generation.temperature) {
            return Err(AppError::Config(format!(
                "generation.temperature must be within [0, 2], got {}",
                self.generation.temperature
            )));
        }
        if !(self.generation.top_p > 0.0 && self.generation.top_p <= 1.0) {
            return Err(AppError::Config(format!(
                "generation.top_p must be within (0, 1], got {}",
                self.generation.top_p
            )));
        }

        Ok(())
    }
}

fn parse_env<T, F>(env: &F, key: &str) -> AppResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match env(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| AppError::Config(format!("Invalid value for {}: {} ({})", key, raw, e))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.provider, "ollama");
        assert_eq!(config.agents.max_deployed_agents, 5);
        assert_eq!(config.agents.agent_timeout_seconds, 30);
        assert_eq!(config.generation.top_k, 50);
        assert_eq!(config.retrieval.top_k, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_docrag_paths() {
        let config = AppConfig::default();
        assert!(config.docrag_dir().ends_with(".docrag"));
        assert!(config.database_path().ends_with(".docrag/docrag.sqlite"));
    }

    #[test]
    fn test_env_overrides() {
        let temp = TempDir::new().unwrap();
        let workspace = temp.path().to_string_lossy().to_string();
        let env = env_from(&[
            ("DOCRAG_WORKSPACE", workspace.as_str()),
            ("MAX_DEPLOYED_AGENTS", "2"),
            ("AGENT_TIMEOUT_SECONDS", "7"),
            ("DEFAULT_TEMPERATURE", "0.1"),
            ("DOCRAG_PROVIDER", "static"),
        ]);

        let config = AppConfig::load_with_env(env).unwrap();
        assert_eq!(config.agents.max_deployed_agents, 2);
        assert_eq!(config.agents.agent_timeout_seconds, 7);
        assert!((config.generation.temperature - 0.1).abs() < f32::EPSILON);
        assert_eq!(config.provider, "static");
    }

    #[test]
    fn test_invalid_env_value_is_config_error() {
        let temp = TempDir::new().unwrap();
        let workspace = temp.path().to_string_lossy().to_string();
        let env = env_from(&[
            ("DOCRAG_WORKSPACE", workspace.as_str()),
            ("MAX_DEPLOYED_AGENTS", "many"),
        ]);

        let result = AppConfig::load_with_env(env);
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn test_yaml_sections_merge_and_env_wins() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join(".docrag")).unwrap();
        std::fs::write(
            temp.path().join(".docrag/config.yaml"),
            r#"
llm:
  provider: static
  model: canned
chunking:
  max_chars: 400
retrieval:
  empty_policy: ungrounded
agents:
  max_deployed_agents: 3
"#,
        )
        .unwrap();

        let workspace = temp.path().to_string_lossy().to_string();
        let env = env_from(&[
            ("DOCRAG_WORKSPACE", workspace.as_str()),
            ("MAX_DEPLOYED_AGENTS", "4"),
        ]);
        let config = AppConfig::load_with_env(env).unwrap();

        assert_eq!(config.provider, "static");
        assert_eq!(config.model, "canned");
        assert_eq!(config.chunking.max_chars, 400);
        // unspecified fields of a partial section keep their defaults
        assert!((config.chunking.overlap_ratio - 0.2).abs() < f32::EPSILON);
        assert_eq!(
            config.retrieval.empty_policy,
            EmptyRetrievalPolicy::Ungrounded
        );
        assert_eq!(config.agents.max_deployed_agents, 4);
        assert_eq!(config.agents.agent_timeout_seconds, 30);
    }

    #[test]
    fn test_missing_workspace_is_rejected() {
        let env = env_from(&[("DOCRAG_WORKSPACE", "/definitely/not/here")]);
        assert!(AppConfig::load_with_env(env).is_err());
    }

    #[test]
    fn test_with_overrides() {
        let config = AppConfig::default();
        let overridden = config.with_overrides(
            None,
            None,
            Some("static".to_string()),
            Some("canned".to_string()),
            None,
            true,
            false,
        );

        assert_eq!(overridden.provider, "static");
        assert_eq!(overridden.model, "canned");
        assert!(overridden.verbose);
        assert_eq!(overridden.log_level, Some("debug".to_string()));
    }

    #[test]
    fn test_validate_rejects_bad_ranges() {
        let mut config = AppConfig::default();
        config.provider = "unknown".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.chunking.overlap_ratio = 0.95;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.agents.max_deployed_agents = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.generation.top_p = 0.0;
        assert!(config.validate().is_err());
    }
}
