//! Ask and chat command handlers.
//!
//! Both deploy one agent for the lifetime of the command and stop it on the
//! way out.

use super::services::{AgentArgs, Services};
use clap::Args;
use docrag_agent::{QueryRequest, QueryResponse};
use docrag_core::{config::AppConfig, AppError, AppResult};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Ask one question
#[derive(Args, Debug)]
pub struct AskCommand {
    /// The question to ask
    pub question: String,

    #[command(flatten)]
    pub agent: AgentArgs,

    /// Continue an existing conversation
    #[arg(long)]
    pub conversation: Option<String>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

impl AskCommand {
    pub async fn execute(&self, config: &AppConfig) -> AppResult<()> {
        tracing::info!("Executing ask command");
        tracing::debug!("Ask command options: {:?}", self);

        let services = Services::open(config)?;
        let agent_id = services
            .deploy(self.agent.deploy_request(config), self.conversation.as_deref())
            .await?;

        let mut request = QueryRequest::new(&agent_id, self.question.clone());
        if let Some(conversation) = &self.conversation {
            request = request.in_conversation(conversation.clone());
        }
        let result = services.registry.query(request).await;
        services.registry.shutdown().await;
        let response = result?;

        if self.json {
            let output = serde_json::to_string_pretty(&response)
                .map_err(|e| AppError::Serialization(e.to_string()))?;
            println!("{}", output);
        } else {
            print_answer(&response);
            println!();
            println!("Conversation: {}", response.conversation_id);
        }

        Ok(())
    }
}

/// Interactive session; one conversation, idle agents are evicted
#[derive(Args, Debug)]
pub struct ChatCommand {
    #[command(flatten)]
    pub agent: AgentArgs,

    /// Continue an existing conversation
    #[arg(long)]
    pub conversation: Option<String>,
}

impl ChatCommand {
    pub async fn execute(&self, config: &AppConfig) -> AppResult<()> {
        tracing::info!("Executing chat command");

        let services = Services::open(config)?;
        let registry = &services.registry;
        let agent_id = services
            .deploy(self.agent.deploy_request(config), self.conversation.as_deref())
            .await?;
        let eviction = registry.spawn_eviction_task(config.agents.eviction_interval());

        println!("Chatting with agent {} (empty line or Ctrl-D to quit)", agent_id);

        let mut conversation = self.conversation.clone();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            print!("> ");
            std::io::stdout().flush()?;

            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = tokio::signal::ctrl_c() => None,
            };
            let Some(line) = line else { break };
            let question = line.trim();
            if question.is_empty() {
                break;
            }

            let mut request = QueryRequest::new(&agent_id, question);
            if let Some(id) = &conversation {
                request = request.in_conversation(id.clone());
            }

            let result = match registry.query(request.clone()).await {
                Err(AppError::InvalidState { .. }) => {
                    tracing::info!("Agent {} was stopped, redeploying", agent_id);
                    let redeployed = registry.deploy(&agent_id).await?;
                    if let Some(error) = redeployed.error {
                        eprintln!("Agent could not be redeployed: {}", error);
                        break;
                    }
                    registry.query(request).await
                }
                other => other,
            };

            match result {
                Ok(response) => {
                    print_answer(&response);
                    conversation = Some(response.conversation_id);
                }
                Err(e) => eprintln!("Error: {}", e),
            }
        }

        registry.shutdown().await;
        eviction.abort();
        if let Some(id) = conversation {
            println!("Conversation: {}", id);
        }
        Ok(())
    }
}

fn print_answer(response: &QueryResponse) {
    println!("{}", response.answer_text);
    if response.citations.is_empty() {
        if !response.grounded {
            println!("(not grounded in any document)");
        }
        return;
    }

    println!();
    println!("Sources:");
    for citation in &response.citations {
        println!(
            "  [{}] {} (chunk {}, score {:.3})",
            citation.tag, citation.document_id, citation.chunk_id, citation.score
        );
    }
}
