//! Agent lifecycle, capacity accounting and the query path.
//!
//! All state transitions and the deployment slot count live behind one
//! mutex, so a capacity check and the transition that takes the slot are a
//! single step. The mutex is never held across an await.

use crate::backend::BackendFactory;
use crate::conversation::{ConversationManager, HistoryBudget, TurnGuard};
use crate::types::{
    AgentInfo, AgentKind, AgentState, Citation, DeployRequest, DeployResponse, GenerationParams,
    QueryRequest, QueryResponse,
};
use chrono::Utc;
use docrag_core::config::{AppConfig, EmptyRetrievalPolicy};
use docrag_core::retry::{with_retries, RetryPolicy};
use docrag_core::{AppError, AppResult};
use docrag_knowledge::{RetrievedChunk, Retriever};
use docrag_llm::{LlmClient, LlmRequest};
use docrag_prompt::{ContextAssembler, Passage, Role};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Limits and query-path settings for a registry.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub max_deployed_agents: usize,
    pub idle_timeout: Duration,
    pub generation_timeout: Duration,
    pub retry: RetryPolicy,
    pub top_k: usize,
    pub min_score: f32,
    pub empty_policy: EmptyRetrievalPolicy,
    pub no_context_message: String,
    pub max_context_tokens: usize,
    pub max_history_turns: usize,
}

impl RegistrySettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_deployed_agents: config.agents.max_deployed_agents,
            idle_timeout: config.agents.idle_timeout(),
            generation_timeout: config.agents.generation_timeout(),
            retry: config.retry.policy(),
            top_k: config.retrieval.top_k,
            min_score: config.retrieval.min_score,
            empty_policy: config.retrieval.empty_policy,
            no_context_message: config.retrieval.no_context_message.clone(),
            max_context_tokens: config.context.max_context_tokens,
            max_history_turns: config.context.max_history_turns,
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

struct AgentSlot {
    info: AgentInfo,
    backend: Option<Arc<dyn LlmClient>>,
    last_activity: Instant,
    in_flight: usize,
    drained: Arc<Notify>,
}

impl AgentSlot {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.info.last_activity_at = Utc::now();
    }

    fn invalid(&self, operation: &str) -> AppError {
        AppError::InvalidState {
            agent_id: self.info.id.clone(),
            state: self.info.state.to_string(),
            operation: operation.to_string(),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    agents: HashMap<String, AgentSlot>,
    slots_in_use: usize,
}

impl RegistryState {
    fn agent_mut(&mut self, agent_id: &str) -> AppResult<&mut AgentSlot> {
        self.agents
            .get_mut(agent_id)
            .ok_or_else(|| AppError::NotFound(format!("agent {}", agent_id)))
    }

    fn reserve_slot(&mut self, limit: usize) -> AppResult<()> {
        if self.slots_in_use >= limit {
            return Err(AppError::Capacity {
                limit,
                running: self.slots_in_use,
            });
        }
        self.slots_in_use += 1;
        Ok(())
    }

    /// Move an agent out of a slot-holding state.
    fn release(&mut self, agent_id: &str, to: AgentState) {
        if let Some(slot) = self.agents.get_mut(agent_id) {
            if slot.info.state.holds_slot() {
                self.slots_in_use = self.slots_in_use.saturating_sub(1);
            }
            slot.info.state = to;
            slot.backend = None;
        }
    }
}

struct Inner {
    state: Mutex<RegistryState>,
    factory: Arc<dyn BackendFactory>,
    retriever: Option<Arc<Retriever>>,
    assembler: Arc<ContextAssembler>,
    conversations: Arc<ConversationManager>,
    settings: RegistrySettings,
    closed: AtomicBool,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Marks a query in flight; stopping waits until every guard is dropped.
struct InFlightGuard {
    inner: Arc<Inner>,
    agent_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        if let Some(slot) = state.agents.get_mut(&self.agent_id) {
            slot.in_flight = slot.in_flight.saturating_sub(1);
            slot.touch();
            if slot.in_flight == 0 {
                slot.drained.notify_waiters();
            }
        }
    }
}

/// Owns every agent of one process. Cheap to clone.
#[derive(Clone)]
pub struct AgentRegistry {
    inner: Arc<Inner>,
}

impl AgentRegistry {
    /// `retriever` may be `None` when only fine-tuned agents are served.
    pub fn new(
        factory: Arc<dyn BackendFactory>,
        retriever: Option<Arc<Retriever>>,
        assembler: Arc<ContextAssembler>,
        conversations: Arc<ConversationManager>,
        settings: RegistrySettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(RegistryState::default()),
                factory,
                retriever,
                assembler,
                conversations,
                settings,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn conversations(&self) -> &Arc<ConversationManager> {
        &self.inner.conversations
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.inner.settings
    }

    fn ensure_open(&self) -> AppResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(AppError::Validation(
                "Agent registry has been shut down".to_string(),
            ));
        }
        Ok(())
    }

    fn new_slot(
        &self,
        id: String,
        request: DeployRequest,
        state: AgentState,
    ) -> AppResult<AgentSlot> {
        request.params.validate()?;
        if request.model_ref.trim().is_empty() {
            return Err(AppError::Validation("model_ref must not be empty".to_string()));
        }
        if matches!(request.kind, AgentKind::Rag { .. }) && self.inner.retriever.is_none() {
            return Err(AppError::Validation(
                "RAG agents need a retriever; none is configured".to_string(),
            ));
        }

        let now = Utc::now();
        Ok(AgentSlot {
            info: AgentInfo {
                id,
                owner: request.owner,
                kind: request.kind,
                model_ref: request.model_ref,
                params: request.params,
                state,
                created_at: now,
                last_activity_at: now,
            },
            backend: None,
            last_activity: Instant::now(),
            in_flight: 0,
            drained: Arc::new(Notify::new()),
        })
    }

    /// Register an agent in `created`.
    pub fn create(&self, request: DeployRequest) -> AppResult<AgentInfo> {
        self.ensure_open()?;
        let slot = self.new_slot(uuid::Uuid::new_v4().to_string(), request, AgentState::Created)?;
        let info = slot.info.clone();
        self.inner.lock().agents.insert(info.id.clone(), slot);
        tracing::info!("Created {} agent {}", info.kind.as_str(), info.id);
        Ok(info)
    }

    /// Deploy a created or stopped agent.
    ///
    /// A backend that cannot be connected leaves the agent `failed`; that is
    /// reported in the response, not as an error.
    ///
    /// # Errors
    /// * `AppError::Capacity` when every slot is taken
    /// * `AppError::InvalidState` when the agent is not created, stopped or failed
    pub async fn deploy(&self, agent_id: &str) -> AppResult<DeployResponse> {
        self.ensure_open()?;
        let model_ref = {
            let mut state = self.inner.lock();
            let current = state.agent_mut(agent_id)?;
            if !matches!(
                current.info.state,
                AgentState::Created | AgentState::Stopped | AgentState::Failed
            ) {
                return Err(current.invalid("deploy"));
            }
            let model_ref = current.info.model_ref.clone();
            state.reserve_slot(self.inner.settings.max_deployed_agents)?;
            state.agent_mut(agent_id)?.info.state = AgentState::Deploying;
            model_ref
        };

        self.finish_deploy(agent_id, &model_ref).await
    }

    /// Capacity check, create and deploy as one step; nothing is registered
    /// when capacity is exhausted.
    pub async fn deploy_new(&self, request: DeployRequest) -> AppResult<DeployResponse> {
        self.deploy_new_as(uuid::Uuid::new_v4().to_string(), request)
            .await
    }

    /// Like [`Self::deploy_new`], under a caller-chosen id. Used to bring
    /// back the agent that owns a stored conversation in a new process.
    ///
    /// # Errors
    /// `AppError::Validation` when the id is empty or already registered.
    pub async fn deploy_new_as(
        &self,
        agent_id: impl Into<String>,
        request: DeployRequest,
    ) -> AppResult<DeployResponse> {
        self.ensure_open()?;
        let agent_id = agent_id.into();
        if agent_id.trim().is_empty() {
            return Err(AppError::Validation("agent id must not be empty".to_string()));
        }
        let slot = self.new_slot(agent_id.clone(), request, AgentState::Deploying)?;
        let model_ref = slot.info.model_ref.clone();
        {
            let mut state = self.inner.lock();
            if state.agents.contains_key(&agent_id) {
                return Err(AppError::Validation(format!(
                    "Agent {} is already registered",
                    agent_id
                )));
            }
            state.reserve_slot(self.inner.settings.max_deployed_agents)?;
            state.agents.insert(agent_id.clone(), slot);
        }
        tracing::info!("Created agent {}", agent_id);

        self.finish_deploy(&agent_id, &model_ref).await
    }

    async fn finish_deploy(&self, agent_id: &str, model_ref: &str) -> AppResult<DeployResponse> {
        tracing::info!("Deploying agent {} on model {}", agent_id, model_ref);
        let connected = self.inner.factory.connect(model_ref).await;

        let mut state = self.inner.lock();
        let closed = self.inner.closed.load(Ordering::SeqCst);
        match connected {
            Ok(_) if closed => {
                state.release(agent_id, AgentState::Stopped);
                tracing::info!("Registry shut down while deploying agent {}", agent_id);
                Ok(DeployResponse {
                    agent_id: agent_id.to_string(),
                    state: AgentState::Stopped,
                    error: None,
                })
            }
            Ok(backend) => {
                let slot = state.agent_mut(agent_id)?;
                slot.info.state = AgentState::Running;
                slot.backend = Some(backend);
                slot.touch();
                tracing::info!("Agent {} running", agent_id);
                Ok(DeployResponse {
                    agent_id: agent_id.to_string(),
                    state: AgentState::Running,
                    error: None,
                })
            }
            Err(e) => {
                state.release(agent_id, AgentState::Failed);
                tracing::warn!("Agent {} failed to deploy: {}", agent_id, e);
                Ok(DeployResponse {
                    agent_id: agent_id.to_string(),
                    state: AgentState::Failed,
                    error: Some(e.to_string()),
                })
            }
        }
    }

    /// Stop a running agent once its in-flight queries finish.
    ///
    /// New queries are refused as soon as this is called. Stopping an agent
    /// that holds no slot is a no-op returning its current state.
    pub async fn stop(&self, agent_id: &str) -> AppResult<AgentState> {
        let drained = {
            let mut state = self.inner.lock();
            let slot = state.agent_mut(agent_id)?;
            match slot.info.state {
                AgentState::Running => {
                    slot.info.state = AgentState::Stopping;
                    tracing::info!("Stopping agent {}", agent_id);
                    slot.drained.clone()
                }
                AgentState::Stopping => slot.drained.clone(),
                AgentState::Deploying => return Err(slot.invalid("stop")),
                other => return Ok(other),
            }
        };

        loop {
            let notified = drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight(agent_id) == 0 {
                break;
            }
            notified.await;
        }

        let mut state = self.inner.lock();
        let current = state.agent_mut(agent_id)?.info.state;
        if current == AgentState::Stopping {
            state.release(agent_id, AgentState::Stopped);
            tracing::info!("Agent {} stopped", agent_id);
            return Ok(AgentState::Stopped);
        }
        Ok(current)
    }

    fn in_flight(&self, agent_id: &str) -> usize {
        self.inner
            .lock()
            .agents
            .get(agent_id)
            .map(|s| s.in_flight)
            .unwrap_or(0)
    }

    /// Stop every running agent idle longer than the configured timeout.
    /// Returns the ids that were stopped.
    pub async fn evict_idle(&self) -> Vec<String> {
        let idle_timeout = self.inner.settings.idle_timeout;
        let idle: Vec<String> = {
            let state = self.inner.lock();
            state
                .agents
                .values()
                .filter(|s| {
                    s.info.state == AgentState::Running
                        && s.last_activity.elapsed() > idle_timeout
                })
                .map(|s| s.info.id.clone())
                .collect()
        };

        if idle.is_empty() {
            return idle;
        }

        let results = futures::future::join_all(idle.iter().map(|id| self.stop(id))).await;
        let mut evicted = Vec::new();
        for (id, result) in idle.into_iter().zip(results) {
            match result {
                Ok(AgentState::Stopped) => {
                    tracing::info!("Evicted idle agent {}", id);
                    evicted.push(id);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Failed to evict agent {}: {}", id, e),
            }
        }
        evicted
    }

    /// Run [`Self::evict_idle`] every `interval` until the registry is shut
    /// down or dropped.
    pub fn spawn_eviction_task(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                let registry = AgentRegistry { inner };
                let evicted = registry.evict_idle().await;
                if !evicted.is_empty() {
                    tracing::debug!(count = evicted.len(), "Eviction pass finished");
                }
            }
            tracing::debug!("Eviction task exiting");
        })
    }

    /// Refuse new work and stop every agent.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let active: Vec<String> = self
            .inner
            .lock()
            .agents
            .values()
            .filter(|s| matches!(s.info.state, AgentState::Running | AgentState::Stopping))
            .map(|s| s.info.id.clone())
            .collect();

        for id in &active {
            if let Err(e) = self.stop(id).await {
                tracing::warn!("Failed to stop agent {} during shutdown: {}", id, e);
            }
        }
        tracing::info!("Agent registry shut down ({} agents stopped)", active.len());
    }

    pub fn get(&self, agent_id: &str) -> AppResult<AgentInfo> {
        self.inner
            .lock()
            .agents
            .get(agent_id)
            .map(|s| s.info.clone())
            .ok_or_else(|| AppError::NotFound(format!("agent {}", agent_id)))
    }

    /// All agents, oldest first.
    pub fn list(&self) -> Vec<AgentInfo> {
        let mut agents: Vec<AgentInfo> = self
            .inner
            .lock()
            .agents
            .values()
            .map(|s| s.info.clone())
            .collect();
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        agents
    }

    pub fn running_count(&self) -> usize {
        self.inner
            .lock()
            .agents
            .values()
            .filter(|s| s.info.state == AgentState::Running)
            .count()
    }

    /// Slots held by deploying, running and stopping agents.
    pub fn slots_in_use(&self) -> usize {
        self.inner.lock().slots_in_use
    }

    /// Answer one query on a running agent.
    ///
    /// # Errors
    /// * `AppError::InvalidState` unless the agent is running
    /// * `AppError::Timeout` when generation exceeds its budget; nothing is persisted
    /// * `AppError::GenerationFailed` when the backend fails; if it stayed
    ///   unavailable through every retry the agent is marked failed
    /// * `AppError::QueryFailed` wrapping any other failure after the
    ///   conversation was resolved (retrieval, history, prompt assembly)
    pub async fn query(&self, request: QueryRequest) -> AppResult<QueryResponse> {
        if request.query_text.trim().is_empty() {
            return Err(AppError::Validation("Query must not be empty".to_string()));
        }

        let (backend, kind, params, model_ref, _in_flight) = {
            let mut state = self.inner.lock();
            let slot = state.agent_mut(&request.agent_id)?;
            if slot.info.state != AgentState::Running {
                return Err(slot.invalid("query"));
            }
            let backend = slot.backend.clone().ok_or_else(|| slot.invalid("query"))?;
            slot.in_flight += 1;
            slot.touch();
            (
                backend,
                slot.info.kind.clone(),
                slot.info.params,
                slot.info.model_ref.clone(),
                InFlightGuard {
                    inner: self.inner.clone(),
                    agent_id: request.agent_id.clone(),
                },
            )
        };

        let conversations = &self.inner.conversations;
        let conversation_id = match &request.conversation_id {
            Some(id) => {
                let conversation = conversations.get(id)?;
                if conversation.agent_id != request.agent_id {
                    return Err(AppError::Validation(format!(
                        "Conversation {} belongs to agent {}, not {}",
                        id, conversation.agent_id, request.agent_id
                    )));
                }
                id.clone()
            }
            None => conversations.create(&request.agent_id)?.id,
        };

        let turn = QueryTurn {
            agent_id: &request.agent_id,
            conversation_id: &conversation_id,
            query: &request.query_text,
            kind: &kind,
            model_ref,
            params,
            backend,
        };
        self.answer(turn).await.map_err(|e| match e {
            AppError::Timeout { .. }
            | AppError::GenerationFailed { .. }
            | AppError::QueryFailed { .. } => e,
            other => AppError::QueryFailed {
                agent_id: request.agent_id.clone(),
                conversation_id: conversation_id.clone(),
                source: Box::new(other),
            },
        })
    }

    async fn answer(&self, q: QueryTurn<'_>) -> AppResult<QueryResponse> {
        let turn = self.inner.conversations.begin_turn(q.conversation_id).await?;
        let settings = &self.inner.settings;

        let passages = match q.kind {
            AgentKind::FineTuned => Vec::new(),
            AgentKind::Rag { scope } => {
                let retriever = self.inner.retriever.as_ref().ok_or_else(|| {
                    AppError::Validation("No retriever configured".to_string())
                })?;
                let hits = retriever
                    .retrieve(q.query, scope, settings.top_k, settings.min_score)
                    .await?;
                if hits.is_empty() && settings.empty_policy == EmptyRetrievalPolicy::NoContextMessage {
                    tracing::info!(
                        agent_id = %q.agent_id,
                        "No passages retrieved, answering with the no-context message"
                    );
                    return self.finish_turn(
                        &turn,
                        q.query,
                        settings.no_context_message.clone(),
                        Vec::new(),
                        false,
                    );
                }
                hits.into_iter().map(to_passage).collect()
            }
        };

        let history = turn.history(
            HistoryBudget::turns(settings.max_history_turns)
                .with_max_tokens(settings.max_context_tokens),
        )?;
        let prompt = self.inner.assembler.assemble(
            q.query,
            &passages,
            &history,
            settings.max_context_tokens,
        )?;

        let llm_request = LlmRequest::new(prompt.user.clone(), q.model_ref)
            .with_system(prompt.system.clone())
            .with_temperature(q.params.temperature)
            .with_top_k(q.params.top_k)
            .with_top_p(q.params.top_p)
            .with_max_tokens(q.params.max_tokens);

        let backend = &q.backend;
        let generation = tokio::time::timeout(
            settings.generation_timeout,
            with_retries(&settings.retry, "generation", || backend.complete(&llm_request)),
        )
        .await;

        let response = match generation {
            Err(_) => {
                tracing::warn!(
                    agent_id = %q.agent_id,
                    conversation_id = %q.conversation_id,
                    "Generation timed out after {:?}, turn discarded",
                    settings.generation_timeout
                );
                return Err(AppError::Timeout {
                    agent_id: q.agent_id.to_string(),
                    conversation_id: q.conversation_id.to_string(),
                });
            }
            Ok(Err(e)) => {
                if e.is_transient() {
                    self.mark_failed(q.agent_id, &e);
                }
                return Err(AppError::GenerationFailed {
                    agent_id: q.agent_id.to_string(),
                    conversation_id: q.conversation_id.to_string(),
                    message: e.to_string(),
                });
            }
            Ok(Ok(response)) => response,
        };

        let citations: Vec<Citation> = prompt
            .citations_for(&response.content)
            .into_iter()
            .map(|r| Citation {
                chunk_id: r.chunk_id,
                document_id: r.document_id,
                score: r.score,
                tag: r.tag,
            })
            .collect();
        let grounded = !prompt.references.is_empty();

        tracing::debug!(
            agent_id = %q.agent_id,
            passages = prompt.references.len(),
            citations = citations.len(),
            tokens = prompt.estimated_tokens,
            "Generated answer"
        );

        self.finish_turn(&turn, q.query, response.content, citations, grounded)
    }

    fn finish_turn(
        &self,
        turn: &TurnGuard,
        query: &str,
        answer: String,
        citations: Vec<Citation>,
        grounded: bool,
    ) -> AppResult<QueryResponse> {
        turn.append(Role::User, query, &[])?;
        turn.append(Role::Assistant, &answer, &citations)?;
        Ok(QueryResponse {
            answer_text: answer,
            citations,
            conversation_id: turn.conversation_id().to_string(),
            grounded,
        })
    }

    fn mark_failed(&self, agent_id: &str, error: &AppError) {
        let mut state = self.inner.lock();
        let holds = state
            .agents
            .get(agent_id)
            .is_some_and(|s| s.info.state.holds_slot());
        if holds {
            state.release(agent_id, AgentState::Failed);
            tracing::warn!("Agent {} failed: {}", agent_id, error);
        }
    }
}

/// What one query needs once its agent and conversation are resolved.
struct QueryTurn<'a> {
    agent_id: &'a str,
    conversation_id: &'a str,
    query: &'a str,
    kind: &'a AgentKind,
    model_ref: String,
    params: GenerationParams,
    backend: Arc<dyn LlmClient>,
}

fn to_passage(hit: RetrievedChunk) -> Passage {
    Passage {
        chunk_id: hit.chunk_id,
        document_id: hit.document_id,
        text: hit.text,
        score: hit.score,
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("AgentRegistry")
            .field("agents", &state.agents.len())
            .field("slots_in_use", &state.slots_in_use)
            .finish()
    }
}
