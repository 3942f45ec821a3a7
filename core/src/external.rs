//! Contracts for collaborators the core treats as external: the tool
//! registry, LLM client, progress stream, and persistent state store. None
//! of these have a required implementation inside the core itself —
//! [`external::state_store`] supplies the one concrete `StateStore`
//! implementation carried as ambient persistence support.

pub mod state_store;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::EngineError;

/// A single tool a [`ToolRegistry`] can resolve by name.
#[async_trait]
pub trait Tool: Send + Sync {
    async fn execute(&self, params: Value) -> ToolOutcome;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Resolves a tool by name.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    fn get_tool(&self, name: &str) -> Option<std::sync::Arc<dyn Tool>>;
}

/// The request shape accepted by [`SimplePromptClient::request`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub chat_history: Option<Vec<Value>>,
    pub max_tokens: u32,
    pub extra: HashMap<String, Value>,
}

impl LlmRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens: 1000,
            ..Default::default()
        }
    }
}

/// One of the response shapes the Atomic strategy knows how to unwrap:
/// `{content}`, `{choices:[{message:{content}}]}`, a plain string, or
/// `{text}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LlmResponse {
    Content { content: String },
    Text { text: String },
    Choices { choices: Vec<LlmChoice> },
    Plain(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmChoice {
    pub message: LlmMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub content: String,
}

impl LlmResponse {
    /// Extracts the textual content, or `None` on an unrecognized shape.
    pub fn extract_content(&self) -> Option<&str> {
        match self {
            LlmResponse::Content { content } => Some(content),
            LlmResponse::Text { text } => Some(text),
            LlmResponse::Plain(s) => Some(s),
            LlmResponse::Choices { choices } => choices.first().map(|c| c.message.content.as_str()),
        }
    }
}

/// A minimal prompt-in, text-out LLM client contract.
#[async_trait]
pub trait SimplePromptClient: Send + Sync {
    async fn request(&self, request: LlmRequest) -> Result<LlmResponse, EngineError>;
}

/// The core never requires a concrete progress sink; the `TaskQueue`'s own
/// `broadcast` event stream (`crate::queue::events`) covers its own needs,
/// this trait is for strategies that want to surface progress to an
/// external UI.
pub trait ProgressEmitter: Send + Sync {
    fn custom(&self, event: &str, payload: Value);
    fn started(&self, payload: Value) {
        self.custom("started", payload);
    }
    fn completed(&self, payload: Value) {
        self.custom("completed", payload);
    }
    fn failed(&self, payload: Value) {
        self.custom("failed", payload);
    }
    fn retrying(&self, payload: Value) {
        self.custom("retrying", payload);
    }
    fn progress(&self, payload: Value) {
        self.custom("progress", payload);
    }
}

pub trait ProgressStream: Send + Sync {
    fn create_task_emitter(&self) -> std::sync::Arc<dyn ProgressEmitter>;
}

/// Optional persistent per-project JSON document store.
/// `JsonFileStateStore` (`external::state_store`) is the one concrete
/// implementation this crate carries.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_or_create(&self, project_id: &str) -> Result<ProjectState, EngineError>;
    async fn save(&self, state: &ProjectState) -> Result<(), EngineError>;
    async fn update(&self, project_id: &str, patch: Value) -> Result<ProjectState, EngineError>;
    async fn mark_complete(&self, project_id: &str, result: Value) -> Result<ProjectState, EngineError>;
    async fn rollback(&self, project_id: &str) -> Result<ProjectState, EngineError>;
    async fn get_history(&self, project_id: &str) -> Result<Vec<ProjectState>, EngineError>;
    async fn lock(&self, project_id: &str, timeout: std::time::Duration) -> Result<(), EngineError>;
    async fn unlock(&self, project_id: &str) -> Result<(), EngineError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Planning,
    Executing,
    Testing,
    Completed,
    Cancelled,
}

/// `<root>/<projectId>/state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectState {
    pub project_id: String,
    pub version: u64,
    pub status: ProjectStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub requirements: Option<Value>,
    #[serde(default)]
    pub plan: Option<Value>,
    #[serde(default)]
    pub phases: Vec<Value>,
    #[serde(default)]
    pub tasks: Vec<Value>,
    #[serde(default)]
    pub artifacts: Vec<Value>,
}

impl ProjectState {
    pub fn new(project_id: impl Into<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            project_id: project_id.into(),
            version: 1,
            status: ProjectStatus::Planning,
            created_at: now,
            updated_at: now,
            requirements: None,
            plan: None,
            phases: Vec::new(),
            tasks: Vec::new(),
            artifacts: Vec::new(),
        }
    }
}
