//! Agent manager (spec §4.9): named agents with instructions, an optional
//! bound kernel, and a persistent conversation; the chat pipeline loops the
//! model's tool-calls through the bound kernel's `executeStream` the way the
//! teacher's codex turn loop drives `FunctionCall`/`FunctionCallOutput`
//! pairs through a sandboxed exec tool.

pub mod chat;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use engine_protocol::ChatChunk;
use engine_protocol::Event;
use engine_protocol::KernelMode;
use engine_protocol::Language;
use engine_protocol::ResourceId;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::config::AgentModelSettings;
use crate::error::EngineError;
use crate::error::Result;
use crate::kernel::CreateKernelOptions;
use crate::kernel::KernelManager;
use chat::ChatMessage;
use chat::ChatModel;
use chat::ChatModelEvent;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub namespace: String,
    pub name: String,
    pub instructions: String,
    pub startup_script: Option<String>,
    pub model: AgentModelSettings,
    pub kernel_language: Option<Language>,
    pub auto_attach_kernel: bool,
    pub max_steps: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            name: String::new(),
            instructions: String::new(),
            startup_script: None,
            model: AgentModelSettings::default(),
            kernel_language: None,
            auto_attach_kernel: true,
            max_steps: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub config: AgentConfig,
    pub conversation: Vec<ChatMessage>,
    pub attached_kernel_id: Option<String>,
    pub startup_error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub last_activity: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct PersistedAgent {
    config: AgentConfig,
    conversation: Vec<ChatMessage>,
}

pub struct AgentManagerConfig {
    pub max_agents: usize,
    pub auto_save_conversations: bool,
    pub agent_data_directory: Option<PathBuf>,
    pub max_steps_cap: usize,
}

impl Default for AgentManagerConfig {
    fn default() -> Self {
        Self {
            max_agents: 50,
            auto_save_conversations: false,
            agent_data_directory: None,
            max_steps_cap: 10,
        }
    }
}

pub struct AgentManager {
    config: AgentManagerConfig,
    kernels: Arc<KernelManager>,
    chat_model: Arc<dyn ChatModel>,
    records: Mutex<HashMap<String, Agent>>,
}

/// Finds the oldest-by-`last_activity` agent, the eviction order spec §4.9
/// names for a full namespace cap (evict, not reject — unlike the kernel
/// and vector-index managers, which reject on a full quota).
fn oldest_agent_id(records: &HashMap<String, Agent>) -> Option<String> {
    records
        .values()
        .min_by_key(|agent| agent.last_activity)
        .map(|agent| agent.id.clone())
}

fn terminal_error_message(events: &[Event]) -> Option<String> {
    events.iter().find_map(|event| match event {
        Event::ExecuteError { evalue, .. } | Event::Error { evalue, .. } => Some(evalue.clone()),
        _ => None,
    })
}

impl AgentManager {
    pub fn new(
        config: AgentManagerConfig,
        kernels: Arc<KernelManager>,
        chat_model: Arc<dyn ChatModel>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            kernels,
            chat_model,
            records: Mutex::new(HashMap::new()),
        })
    }

    fn persistence_path(&self, namespace: &str, local_id: &str) -> Option<PathBuf> {
        let directory = self.config.agent_data_directory.as_ref()?;
        Some(directory.join(namespace).join(format!("{local_id}.json")))
    }

    async fn persist(&self, agent: &Agent) -> Result<()> {
        if !self.config.auto_save_conversations {
            return Ok(());
        }
        let resource_id = ResourceId::parse(&agent.id);
        let Some(path) = self.persistence_path(resource_id.namespace(), resource_id.local_id()) else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(&PersistedAgent {
            config: agent.config.clone(),
            conversation: agent.conversation.clone(),
        })?;
        tokio::fs::write(&path, body).await?;
        Ok(())
    }

    pub async fn create_agent(&self, id: Option<String>, config: AgentConfig) -> Result<String> {
        let local_id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let resource_id = ResourceId::new(config.namespace.clone(), local_id);
        let key = resource_id.to_string();

        let mut records = self.records.lock().await;
        if records.contains_key(&key) {
            return Err(EngineError::Conflict(format!("agent {key} already exists")));
        }
        if records.len() >= self.config.max_agents
            && let Some(victim_id) = oldest_agent_id(&records)
        {
            if let Some(victim) = records.remove(&victim_id)
                && let Some(kernel_id) = victim.attached_kernel_id
            {
                let _ = self.kernels.destroy_kernel(&kernel_id).await;
            }
            info!(agent = %victim_id, "evicted oldest agent to satisfy the agent cap");
        }
        drop(records);

        let mut attached_kernel_id = None;
        let mut startup_error = None;
        if let (true, Some(language)) = (config.auto_attach_kernel, config.kernel_language) {
            match self
                .kernels
                .create_kernel(CreateKernelOptions {
                    namespace: config.namespace.clone(),
                    mode: KernelMode::Worker,
                    language,
                    ..Default::default()
                })
                .await
            {
                Ok(kernel_id) => {
                    if let Some(script) = &config.startup_script {
                        match self.kernels.execute_stream(&kernel_id, script.clone()).await {
                            Ok(session) => {
                                startup_error = terminal_error_message(&session.transcript());
                            }
                            Err(e) => startup_error = Some(e.to_string()),
                        }
                    }
                    attached_kernel_id = Some(kernel_id);
                }
                Err(e) => return Err(e),
            }
        }

        let now = Utc::now();
        let agent = Agent {
            id: key.clone(),
            config,
            conversation: Vec::new(),
            attached_kernel_id,
            startup_error,
            created_at: now,
            last_activity: now,
        };
        self.records.lock().await.insert(key.clone(), agent);
        info!(agent = %key, "created agent");
        Ok(key)
    }

    pub async fn destroy(&self, id: &str) -> Result<()> {
        let agent = self
            .records
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| EngineError::NotFound(format!("agent {id} not found")))?;
        if let Some(kernel_id) = agent.attached_kernel_id {
            self.kernels.destroy_kernel(&kernel_id).await?;
        }
        info!(agent = %id, "destroyed agent");
        Ok(())
    }

    pub async fn attach_kernel(&self, id: &str, language: Language) -> Result<String> {
        let mut records = self.records.lock().await;
        let agent = records
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("agent {id} not found")))?;
        if agent.attached_kernel_id.is_some() {
            return Err(EngineError::Conflict(format!("agent {id} already has a kernel attached")));
        }
        let namespace = agent.config.namespace.clone();
        drop(records);

        let kernel_id = self
            .kernels
            .create_kernel(CreateKernelOptions {
                namespace,
                mode: KernelMode::Worker,
                language,
                ..Default::default()
            })
            .await?;

        let mut records = self.records.lock().await;
        if let Some(agent) = records.get_mut(id) {
            agent.attached_kernel_id = Some(kernel_id.clone());
        }
        Ok(kernel_id)
    }

    pub async fn detach_kernel(&self, id: &str) -> Result<()> {
        let mut records = self.records.lock().await;
        let agent = records
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("agent {id} not found")))?;
        let Some(kernel_id) = agent.attached_kernel_id.take() else {
            return Ok(());
        };
        drop(records);
        self.kernels.destroy_kernel(&kernel_id).await
    }

    pub async fn update(&self, id: &str, config: AgentConfig) -> Result<()> {
        let mut records = self.records.lock().await;
        let agent = records
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("agent {id} not found")))?;
        agent.config = config;
        agent.startup_error = None;
        Ok(())
    }

    pub async fn set_conversation(&self, id: &str, conversation: Vec<ChatMessage>) -> Result<()> {
        let mut records = self.records.lock().await;
        let agent = records
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("agent {id} not found")))?;
        agent.conversation = conversation;
        Ok(())
    }

    pub async fn clear_conversation(&self, id: &str) -> Result<()> {
        self.set_conversation(id, Vec::new()).await
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Vec<ChatMessage>> {
        let records = self.records.lock().await;
        let agent = records
            .get(id)
            .ok_or_else(|| EngineError::NotFound(format!("agent {id} not found")))?;
        Ok(agent.conversation.clone())
    }

    /// Stateful chat: mutates and persists the agent's conversation.
    pub async fn chat(self: &Arc<Self>, id: &str, user_message: String) -> Result<mpsc::Receiver<ChatChunk>> {
        let (instructions, kernel_id, mut conversation, max_steps) = {
            let records = self.records.lock().await;
            let agent = records
                .get(id)
                .ok_or_else(|| EngineError::NotFound(format!("agent {id} not found")))?;
            if agent.startup_error.is_some() {
                return Err(EngineError::StartupScriptError(format!(
                    "agent {id} has an unresolved startup error"
                )));
            }
            (
                agent.config.instructions.clone(),
                agent.attached_kernel_id.clone(),
                agent.conversation.clone(),
                agent.config.max_steps.min(self.config.max_steps_cap),
            )
        };
        conversation.push(ChatMessage::new("user", user_message));

        let (tx, rx) = mpsc::channel(64);
        let manager = Arc::clone(self);
        let id = id.to_string();
        let kernels = Arc::clone(&self.kernels);
        let chat_model = Arc::clone(&self.chat_model);

        tokio::spawn(async move {
            let final_conversation =
                run_tool_loop(&tx, chat_model, kernels, kernel_id, instructions, conversation, max_steps).await;
            manager.finish_turn(&id, final_conversation).await;
        });
        Ok(rx)
    }

    /// Stateless chat: runs the same pipeline without mutating the agent's
    /// stored conversation.
    pub async fn stateless_chat(&self, id: &str, messages: Vec<ChatMessage>) -> Result<mpsc::Receiver<ChatChunk>> {
        let (instructions, kernel_id, max_steps) = {
            let records = self.records.lock().await;
            let agent = records
                .get(id)
                .ok_or_else(|| EngineError::NotFound(format!("agent {id} not found")))?;
            (
                agent.config.instructions.clone(),
                agent.attached_kernel_id.clone(),
                agent.config.max_steps.min(self.config.max_steps_cap),
            )
        };

        let (tx, rx) = mpsc::channel(64);
        let kernels = Arc::clone(&self.kernels);
        let chat_model = Arc::clone(&self.chat_model);
        tokio::spawn(async move {
            run_tool_loop(&tx, chat_model, kernels, kernel_id, instructions, messages, max_steps).await;
        });
        Ok(rx)
    }

    /// Called by the tool loop once a turn completes, to persist the final
    /// conversation back onto the agent record (stateful `chat` only).
    async fn finish_turn(&self, id: &str, conversation: Vec<ChatMessage>) {
        let mut records = self.records.lock().await;
        let Some(agent) = records.get_mut(id) else {
            return;
        };
        agent.conversation = conversation;
        agent.last_activity = Utc::now();
        let snapshot = agent.clone();
        drop(records);
        if let Err(e) = self.persist(&snapshot).await {
            warn!(agent = %id, error = %e, "failed to persist agent conversation");
        }
    }
}

/// Drives the model/tool-call loop and returns the conversation including
/// every assistant and tool message produced this turn.
async fn run_tool_loop(
    tx: &mpsc::Sender<ChatChunk>,
    chat_model: Arc<dyn ChatModel>,
    kernels: Arc<KernelManager>,
    kernel_id: Option<String>,
    instructions: String,
    mut conversation: Vec<ChatMessage>,
    max_steps: usize,
) -> Vec<ChatMessage> {
    for _step in 0..max_steps {
        let mut model_rx = match chat_model.stream_chat(&instructions, &conversation).await {
            Ok(rx) => rx,
            Err(e) => {
                let _ = tx.send(ChatChunk::Error { message: e.to_string() }).await;
                return conversation;
            }
        };

        let mut assistant_text = String::new();
        let mut tool_call = None;
        while let Some(event) = model_rx.recv().await {
            match event {
                ChatModelEvent::TextDelta(delta) => {
                    assistant_text.push_str(&delta);
                    if tx.send(ChatChunk::TextChunk { delta }).await.is_err() {
                        return conversation;
                    }
                }
                ChatModelEvent::ToolCall { name, arguments } => {
                    tool_call = Some((name, arguments));
                }
                ChatModelEvent::Complete => break,
                ChatModelEvent::Error(message) => {
                    let _ = tx.send(ChatChunk::Error { message }).await;
                    return conversation;
                }
            }
        }

        if !assistant_text.is_empty() {
            conversation.push(ChatMessage::new("assistant", assistant_text));
        }

        let Some((name, arguments)) = tool_call else {
            let _ = tx.send(ChatChunk::Complete).await;
            return conversation;
        };

        if tx
            .send(ChatChunk::FunctionCall { name: name.clone(), arguments: arguments.clone() })
            .await
            .is_err()
        {
            return conversation;
        }

        let Some(kernel_id) = &kernel_id else {
            let message = format!("tool call {name} requested but the agent has no attached kernel");
            let _ = tx.send(ChatChunk::Error { message: message.clone() }).await;
            return conversation;
        };
        let code = arguments.get("code").and_then(|c| c.as_str()).unwrap_or_default().to_string();
        let output = match kernels.execute_stream(kernel_id, code).await {
            Ok(session) => render_transcript(&session.transcript()),
            Err(e) => format!("error: {e}"),
        };

        if tx
            .send(ChatChunk::FunctionCallOutput { name, content: output.clone() })
            .await
            .is_err()
        {
            return conversation;
        }
        conversation.push(ChatMessage::new("tool", output));
    }

    let _ = tx
        .send(ChatChunk::Error {
            message: "step cap exhausted".to_string(),
        })
        .await;
    conversation
}

fn render_transcript(events: &[Event]) -> String {
    let mut out = String::new();
    for event in events {
        match event {
            Event::Stream { text, .. } => out.push_str(text),
            Event::ExecuteError { evalue, .. } | Event::Error { evalue, .. } => {
                out.push_str(evalue);
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::kernel::KernelManagerConfig;
    use crate::pool::KernelPool;
    use crate::config::PoolConfig;
    use chat::MockChatModel;

    fn manager_without_kernel() -> Arc<AgentManager> {
        let kernels = KernelManager::new(KernelManagerConfig::default(), Arc::new(KernelPool::new(PoolConfig::default())));
        AgentManager::new(AgentManagerConfig::default(), kernels, Arc::new(MockChatModel))
    }

    #[tokio::test]
    async fn create_agent_without_kernel_has_no_startup_error() {
        let manager = manager_without_kernel();
        let id = manager
            .create_agent(
                None,
                AgentConfig {
                    namespace: "tenant".to_string(),
                    name: "a1".to_string(),
                    kernel_language: None,
                    auto_attach_kernel: false,
                    ..Default::default()
                },
            )
            .await
            .expect("create agent");
        assert!(id.starts_with("tenant:"));
    }

    #[tokio::test]
    async fn duplicate_agent_id_is_conflict() {
        let manager = manager_without_kernel();
        let config = AgentConfig {
            namespace: "tenant".to_string(),
            auto_attach_kernel: false,
            ..Default::default()
        };
        manager
            .create_agent(Some("a1".to_string()), config.clone())
            .await
            .expect("create");
        let err = manager
            .create_agent(Some("a1".to_string()), config)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn stateful_chat_without_tool_call_appends_assistant_reply() {
        let manager = manager_without_kernel();
        let id = manager
            .create_agent(
                None,
                AgentConfig {
                    namespace: "tenant".to_string(),
                    auto_attach_kernel: false,
                    ..Default::default()
                },
            )
            .await
            .expect("create agent");

        let mut rx = manager.chat(&id, "hello there".to_string()).await.expect("chat");
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        assert!(chunks.iter().any(|c| matches!(c, ChatChunk::Complete)));

        // Give the detached finish_turn task a chance to persist the conversation.
        tokio::task::yield_now().await;
        let conversation = manager.get_conversation(&id).await.expect("conversation");
        assert!(conversation.iter().any(|m| m.role == "user" && m.content == "hello there"));
    }

    #[tokio::test]
    async fn destroying_unknown_agent_is_not_found() {
        let manager = manager_without_kernel();
        let err = manager.destroy("tenant:missing").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn set_and_clear_conversation_round_trip() {
        let manager = manager_without_kernel();
        let id = manager
            .create_agent(
                None,
                AgentConfig {
                    namespace: "tenant".to_string(),
                    auto_attach_kernel: false,
                    ..Default::default()
                },
            )
            .await
            .expect("create agent");

        manager
            .set_conversation(&id, vec![ChatMessage::new("user", "hi")])
            .await
            .expect("set");
        assert_eq!(manager.get_conversation(&id).await.expect("get").len(), 1);

        manager.clear_conversation(&id).await.expect("clear");
        assert!(manager.get_conversation(&id).await.expect("get").is_empty());
    }
}
