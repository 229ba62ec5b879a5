//! Agent model and request/response shapes.

use chrono::{DateTime, Utc};
use docrag_core::config::GenerationSettings;
use docrag_core::{AppError, AppResult};
use docrag_knowledge::IndexScope;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What an agent answers from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentKind {
    /// The model answers from its own weights; no retrieval.
    FineTuned,
    /// Answers are grounded in passages retrieved from `scope`.
    Rag {
        #[serde(default)]
        scope: IndexScope,
    },
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FineTuned => "fine-tuned",
            Self::Rag { .. } => "rag",
        }
    }
}

/// Sampling parameters sent with every generation request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub max_tokens: u32,
}

impl From<&GenerationSettings> for GenerationParams {
    fn from(settings: &GenerationSettings) -> Self {
        Self {
            temperature: settings.temperature,
            top_k: settings.top_k,
            top_p: settings.top_p,
            max_tokens: settings.max_tokens,
        }
    }
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self::from(&GenerationSettings::default())
    }
}

impl GenerationParams {
    pub fn validate(&self) -> AppResult<()> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(AppError::Validation(format!(
                "temperature must be within 0.0..=2.0, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(AppError::Validation(format!(
                "top_p must be within (0.0, 1.0], got {}",
                self.top_p
            )));
        }
        if self.top_k == 0 || self.max_tokens == 0 {
            return Err(AppError::Validation(
                "top_k and max_tokens must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Created,
    Deploying,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Deploying => "deploying",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    /// States that hold a deployment slot.
    pub fn holds_slot(&self) -> bool {
        matches!(self, Self::Deploying | Self::Running | Self::Stopping)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub owner: String,
    pub kind: AgentKind,
    pub model_ref: String,
    pub params: GenerationParams,
    pub state: AgentState,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    pub owner: String,
    pub model_ref: String,
    pub kind: AgentKind,
    #[serde(default)]
    pub params: GenerationParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployResponse {
    pub agent_id: String,
    pub state: AgentState,
    /// Why the backend could not be connected, when `state` is failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub agent_id: String,
    pub query_text: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

impl QueryRequest {
    pub fn new(agent_id: impl Into<String>, query_text: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            query_text: query_text.into(),
            conversation_id: None,
        }
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }
}

/// A retrieved chunk an answer is attributed to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub chunk_id: String,
    pub document_id: String,
    pub score: f32,
    /// Tag the passage carried in the prompt, e.g. `S1`
    pub tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub answer_text: String,
    pub citations: Vec<Citation>,
    pub conversation_id: String,
    /// False when no passage backed the answer
    pub grounded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serde_shape() {
        let kind = AgentKind::Rag {
            scope: IndexScope::Owner("acme".into()),
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "rag");
        let back: AgentKind = serde_json::from_value(json).unwrap();
        assert_eq!(back, kind);

        let plain: AgentKind = serde_json::from_str(r#"{"type":"rag"}"#).unwrap();
        assert_eq!(plain, AgentKind::Rag { scope: IndexScope::All });
    }

    #[test]
    fn test_params_validation() {
        assert!(GenerationParams::default().validate().is_ok());
        let hot = GenerationParams {
            temperature: 3.0,
            ..Default::default()
        };
        assert!(hot.validate().is_err());
        let no_p = GenerationParams {
            top_p: 0.0,
            ..Default::default()
        };
        assert!(no_p.validate().is_err());
    }

    #[test]
    fn test_slot_holding_states() {
        assert!(AgentState::Running.holds_slot());
        assert!(AgentState::Stopping.holds_slot());
        assert!(!AgentState::Failed.holds_slot());
        assert!(!AgentState::Created.holds_slot());
    }
}
