//! docrag CLI
//!
//! Ingest private documents and ask grounded questions about them, fully
//! offline with the default hashing embedder and a local Ollama.

mod commands;

use anyhow::Context;
use clap::{Parser, Subcommand};
use commands::{
    AskCommand, ChatCommand, ConversationsCommand, DocumentsCommand, IngestCommand, StatsCommand,
};
use docrag_core::{config::AppConfig, logging};
use std::path::PathBuf;

/// docrag - question answering over your own documents
#[derive(Parser, Debug)]
#[command(name = "docrag")]
#[command(about = "Question answering over private documents with cited sources", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to workspace directory (default: current directory)
    #[arg(short, long, global = true, env = "DOCRAG_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Path to config file
    #[arg(short, long, global = true, env = "DOCRAG_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, env = "RUST_LOG")]
    log_level: Option<String>,

    /// Enable verbose output (sets log level to debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(
        long,
        global = true,
        env = "NO_COLOR",
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    no_color: bool,

    /// Generation provider (ollama, static)
    #[arg(short, long, global = true, env = "DOCRAG_PROVIDER")]
    provider: Option<String>,

    /// Model the agents are deployed on
    #[arg(short, long, global = true, env = "DOCRAG_MODEL")]
    model: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ingest files or directories
    Ingest(IngestCommand),

    /// List or delete ingested documents
    Documents(DocumentsCommand),

    /// Ask a single question
    Ask(AskCommand),

    /// Interactive question session
    Chat(ChatCommand),

    /// Show or delete conversations
    Conversations(ConversationsCommand),

    /// Show store and index statistics
    Stats(StatsCommand),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Workspace and config file decide which YAML is read, so they apply
    // before loading rather than as overrides.
    let workspace = cli.workspace.clone();
    let config_file = cli.config.clone();
    let config = AppConfig::load_with_env(|key| match key {
        "DOCRAG_WORKSPACE" => workspace.as_ref().map(|p| p.to_string_lossy().into_owned()),
        "DOCRAG_CONFIG" => config_file.as_ref().map(|p| p.to_string_lossy().into_owned()),
        _ => std::env::var(key).ok(),
    })
    .context("Failed to load configuration")?
        .with_overrides(
            cli.workspace,
            cli.config,
            cli.provider,
            cli.model,
            cli.log_level,
            cli.verbose,
            cli.no_color,
        );

    logging::init_logging(config.log_level.as_deref(), config.no_color)?;
    config.validate().context("Invalid configuration")?;

    tracing::info!("docrag starting");
    tracing::debug!("Workspace: {:?}", config.workspace);
    tracing::debug!("Provider: {}", config.provider);
    tracing::debug!("Model: {}", config.model);

    let command_name = match &cli.command {
        Commands::Ingest(_) => "ingest",
        Commands::Documents(_) => "documents",
        Commands::Ask(_) => "ask",
        Commands::Chat(_) => "chat",
        Commands::Conversations(_) => "conversations",
        Commands::Stats(_) => "stats",
    };
    let _span = tracing::info_span!("command", name = command_name).entered();

    let result = match cli.command {
        Commands::Ingest(cmd) => cmd.execute(&config).await,
        Commands::Documents(cmd) => cmd.execute(&config).await,
        Commands::Ask(cmd) => cmd.execute(&config).await,
        Commands::Chat(cmd) => cmd.execute(&config).await,
        Commands::Conversations(cmd) => cmd.execute(&config).await,
        Commands::Stats(cmd) => cmd.execute(&config).await,
    };

    match &result {
        Ok(_) => tracing::info!("Command completed successfully"),
        Err(e) => tracing::error!("Command failed: {}", e),
    }

    result.with_context(|| format!("docrag {} failed", command_name))
}
