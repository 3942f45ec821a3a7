//! [`Task`]: the recursion unit. Identity, a bound strategy (`Arc<dyn
//! ExecutionStrategy>`), and a `DashMap`-backed artifact/context store.
//! Parents hold strong references to children; children hold a [`Weak`]
//! back-pointer to their parent, avoiding reference cycles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::errors::{ClassifiedError, EngineError};
use crate::external::{SimplePromptClient, ToolRegistry};
use crate::manager::TaskManager;
use crate::strategy::{ExecutionStrategy, StrategyOutcome};

/// The services [`Task::lookup`] resolves by name, walking the task -> parent
/// chain. Kept as a typed enum rather than `serde_json::Value` since
/// `llmClient`/`toolRegistry`/`taskManager` are trait-object collaborators,
/// not JSON data — `context` (the generic key/value bag) is the JSON-valued
/// counterpart for everything else.
#[derive(Clone)]
pub enum ServiceHandle {
    LlmClient(Arc<dyn SimplePromptClient>),
    ToolRegistry(Arc<dyn ToolRegistry>),
    TaskManager(Arc<TaskManager>),
    WorkspaceDir(String),
}

/// `pending -> running -> {completed|failed|cancelled}`, monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Cancelled)
    }
}

/// A named, typed value a task produces. Name uniqueness is enforced per
/// task; once a name is written its `artifact_type` is fixed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub value: Value,
    pub description: String,
    pub artifact_type: String,
    pub timestamp: DateTime<Utc>,
}

/// One entry of a task's append-only conversation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Progress snapshot returned in answer to a `status` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub id: String,
    pub description: String,
    pub state: TaskState,
    pub runs: u64,
    pub artifact_count: usize,
}

/// The closed message set tasks accept on their mailbox.
#[derive(Debug, Clone)]
pub enum TaskMessage {
    Start,
    Status,
    Cancel,
    Completed { result: Value },
    Failed { error: ClassifiedError },
    ChildFailed { child: String, error: ClassifiedError },
    Abort,
    /// Anything outside the closed set: acknowledged, never rejected.
    Unknown(String),
}

/// The synchronous reply to a delivered [`TaskMessage`]. Strategy
/// panics/errors are converted here rather than allowed to escape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageOutcome {
    pub success: bool,
    pub result: Value,
    #[serde(default)]
    pub acknowledged: bool,
}

impl MessageOutcome {
    fn success(result: Value) -> Self {
        Self {
            success: true,
            result,
            acknowledged: false,
        }
    }

    fn acknowledged() -> Self {
        Self {
            success: true,
            result: Value::Null,
            acknowledged: true,
        }
    }

    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: Value::String(message.into()),
            acknowledged: false,
        }
    }
}

/// Construction options for [`Task`].
#[derive(TypedBuilder)]
#[builder(build_method(into = Task))]
pub struct TaskConfig {
    #[builder(default = Uuid::new_v4().to_string(), setter(transform = |s: impl Into<String>| s.into()))]
    pub id: String,
    #[builder(setter(transform = |s: impl Into<String>| s.into()))]
    pub description: String,
    pub strategy: Arc<dyn ExecutionStrategy>,
    #[builder(default = None, setter(strip_option))]
    pub parent: Option<Weak<Task>>,
    #[builder(default = None, setter(strip_option))]
    pub workspace_dir: Option<String>,
    #[builder(default = None)]
    pub options: Option<Value>,
}

impl From<TaskConfig> for Task {
    fn from(config: TaskConfig) -> Self {
        let task = Task {
            id: config.id,
            description: config.description,
            strategy: config.strategy,
            parent: RwLock::new(config.parent),
            children: DashMap::new(),
            state: RwLock::new(TaskState::Pending),
            artifacts: DashMap::new(),
            conversation: Mutex::new(Vec::new()),
            context: DashMap::new(),
            services: DashMap::new(),
            workspace_dir: config.workspace_dir.clone(),
            options: config.options,
            runs: AtomicU64::new(0),
        };
        if let Some(dir) = config.workspace_dir {
            task.services.insert("workspaceDir".to_string(), ServiceHandle::WorkspaceDir(dir));
        }
        task
    }
}

/// The recursion unit. Mutated only by its bound strategy or by incoming
/// [`TaskMessage`]s; `parent == None` iff this task is the root.
pub struct Task {
    pub id: String,
    pub description: String,
    strategy: Arc<dyn ExecutionStrategy>,
    parent: RwLock<Option<Weak<Task>>>,
    children: DashMap<String, Arc<Task>>,
    state: RwLock<TaskState>,
    artifacts: DashMap<String, Artifact>,
    conversation: Mutex<Vec<ConversationEntry>>,
    /// Free-form key/value bag for arbitrary JSON metadata (not services).
    context: DashMap<String, Value>,
    /// Named collaborators resolved by [`Task::lookup`]: `llmClient`,
    /// `toolRegistry`, `taskManager`, `workspaceDir`.
    services: DashMap<String, ServiceHandle>,
    workspace_dir: Option<String>,
    options: Option<Value>,
    runs: AtomicU64,
}

impl Task {
    pub fn builder() -> TaskConfigBuilder<((), (), (), (), (), ())> {
        TaskConfig::builder()
    }

    pub fn state(&self) -> TaskState {
        *self.state.read().unwrap()
    }

    pub fn is_root(&self) -> bool {
        self.parent.read().unwrap().is_none()
    }

    pub fn parent(&self) -> Option<Arc<Task>> {
        self.parent.read().unwrap().as_ref().and_then(Weak::upgrade)
    }

    fn set_parent(&self, parent: Weak<Task>) {
        *self.parent.write().unwrap() = Some(parent);
    }

    pub fn register_child(self: &Arc<Self>, child: Arc<Task>) {
        child.set_parent(Arc::downgrade(self));
        self.children.insert(child.id.clone(), child);
    }

    pub fn child(&self, id: &str) -> Option<Arc<Task>> {
        self.children.get(id).map(|entry| entry.clone())
    }

    /// Task-construction-time options, e.g. `{tool, toolName, prompt,
    /// steps, subtasks, recursive, ...}` — the fields the four concrete
    /// strategies' `can_handle` inspect.
    pub fn options(&self) -> Option<&Value> {
        self.options.as_ref()
    }

    pub fn workspace_dir(&self) -> Option<&str> {
        self.workspace_dir.as_deref()
    }

    pub fn children(&self) -> Vec<Arc<Task>> {
        self.children.iter().map(|entry| entry.clone()).collect()
    }

    /// Per-task name uniqueness and the fixed-type-once-written invariant
    /// are enforced here.
    pub fn store_artifact(
        &self,
        name: impl Into<String>,
        value: Value,
        description: impl Into<String>,
        artifact_type: impl Into<String>,
    ) -> Result<(), EngineError> {
        let name = name.into();
        let artifact_type = artifact_type.into();
        if let Some(existing) = self.artifacts.get(&name) {
            if existing.artifact_type != artifact_type {
                return Err(EngineError::InvalidTask(format!(
                    "artifact `{name}` already has type `{}`, cannot rewrite as `{artifact_type}`",
                    existing.artifact_type
                )));
            }
        }
        self.artifacts.insert(
            name.clone(),
            Artifact {
                name,
                value,
                description: description.into(),
                artifact_type,
                timestamp: Utc::now(),
            },
        );
        Ok(())
    }

    pub fn get_all_artifacts(&self) -> Vec<Artifact> {
        self.artifacts.iter().map(|entry| entry.clone()).collect()
    }

    pub fn append_conversation(&self, role: impl Into<String>, content: impl Into<String>) {
        self.conversation.lock().unwrap().push(ConversationEntry {
            role: role.into(),
            content: content.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn conversation(&self) -> Vec<ConversationEntry> {
        self.conversation.lock().unwrap().clone()
    }

    pub fn set_context(&self, key: impl Into<String>, value: Value) {
        self.context.insert(key.into(), value);
    }

    pub fn get_context(&self, key: &str) -> Option<Value> {
        self.context.get(key).map(|entry| entry.clone())
    }

    /// Registers a named collaborator for [`Task::lookup`] (`llmClient`,
    /// `toolRegistry`, `taskManager`).
    pub fn set_service(&self, name: impl Into<String>, handle: ServiceHandle) {
        self.services.insert(name.into(), handle);
    }

    /// Walks the task -> parent chain, returning the first match among
    /// registered services.
    pub fn lookup(self: &Arc<Self>, name: &str) -> Option<ServiceHandle> {
        if let Some(handle) = self.services.get(name) {
            return Some(handle.clone());
        }
        self.parent().and_then(|parent| parent.lookup(name))
    }

    pub fn status(&self) -> TaskStatus {
        TaskStatus {
            id: self.id.clone(),
            description: self.description.clone(),
            state: self.state(),
            runs: self.runs.load(Ordering::SeqCst),
            artifact_count: self.artifacts.len(),
        }
    }

    /// The single synchronous entry point for delivering a message to this
    /// task. A strategy may spawn asynchronous work but must not let
    /// exceptions escape; failures convert to `{success:false, result}`.
    pub async fn receive_message(self: &Arc<Self>, message: TaskMessage, ctx: &ExecutionContext) -> MessageOutcome {
        match message {
            TaskMessage::Start => self.handle_start(ctx).await,
            TaskMessage::Status => MessageOutcome::success(serde_json::to_value(self.status()).unwrap_or(Value::Null)),
            TaskMessage::Cancel => self.handle_cancel(),
            TaskMessage::Completed { result } => self.handle_child_completed(result),
            TaskMessage::Failed { error } => self.handle_failed(error),
            TaskMessage::ChildFailed { child, error } => self.handle_child_failed(child, error),
            TaskMessage::Abort => self.handle_cancel(),
            TaskMessage::Unknown(_) => MessageOutcome::acknowledged(),
        }
    }

    async fn handle_start(self: &Arc<Self>, ctx: &ExecutionContext) -> MessageOutcome {
        if self.state().is_terminal() {
            return MessageOutcome::failure(format!("task `{}` is already terminal", self.id));
        }
        *self.state.write().unwrap() = TaskState::Running;
        self.runs.fetch_add(1, Ordering::SeqCst);

        let task = self.clone();
        let ctx = ctx.clone();
        let strategy = self.strategy.clone();
        let outcome = tokio::spawn(async move { strategy.execute(task, ctx).await }).await;

        match outcome {
            Ok(Ok(result)) => {
                *self.state.write().unwrap() = TaskState::Completed;
                self.propagate_to_parent_on_completion(&result);
                MessageOutcome::success(result.result)
            }
            Ok(Err(error)) => {
                *self.state.write().unwrap() = TaskState::Failed;
                self.notify_parent_of_failure(&error);
                MessageOutcome::failure(error.message)
            }
            Err(_) => {
                let error = ClassifiedError::new(format!("strategy for task `{}` panicked", self.id));
                *self.state.write().unwrap() = TaskState::Failed;
                self.notify_parent_of_failure(&error);
                MessageOutcome::failure(error.message)
            }
        }
    }

    fn handle_cancel(self: &Arc<Self>) -> MessageOutcome {
        *self.state.write().unwrap() = TaskState::Cancelled;
        for child in self.children() {
            let _ = child.handle_cancel();
        }
        MessageOutcome::acknowledged()
    }

    /// Parent copies all child artifacts into its own store, then records
    /// `childComplete=true`. The actual artifact copy happens where the
    /// child has a concrete reference to hand over —
    /// `propagate_to_parent_on_completion`, run by the child itself right
    /// after its strategy resolves; this handler covers a `completed`
    /// notification arriving through the explicit message protocol, where
    /// only the result (not the sending child) is known.
    fn handle_child_completed(&self, result: Value) -> MessageOutcome {
        self.set_context("childComplete", Value::Bool(true));
        let _ = result;
        MessageOutcome::acknowledged()
    }

    fn handle_failed(&self, error: ClassifiedError) -> MessageOutcome {
        *self.state.write().unwrap() = TaskState::Failed;
        MessageOutcome::failure(error.message)
    }

    fn handle_child_failed(&self, child: String, error: ClassifiedError) -> MessageOutcome {
        tracing::warn!(task_id = %self.id, child = %child, error = %error, "child task failed");
        MessageOutcome::acknowledged()
    }

    /// When a child completes, the parent copies every one of its artifacts
    /// into its own store (name collisions are last-write-wins).
    fn propagate_to_parent_on_completion(&self, _result: &StrategyOutcome) {
        if let Some(parent) = self.parent() {
            for artifact in self.get_all_artifacts() {
                let _ = parent.store_artifact(artifact.name, artifact.value, artifact.description, artifact.artifact_type);
            }
            parent.set_context("childComplete", Value::Bool(true));
        }
    }

    fn notify_parent_of_failure(&self, error: &ClassifiedError) {
        if let Some(parent) = self.parent() {
            if let Some(grandparent) = parent.parent() {
                let _ = grandparent.handle_child_failed(self.id.clone(), error.clone());
            }
        }
    }

    /// Looks up a bound [`TaskManager`] for hierarchical delegation; absent
    /// one is a hard failure.
    pub fn require_task_manager(self: &Arc<Self>) -> Result<Arc<TaskManager>, EngineError> {
        match self.lookup("taskManager") {
            Some(ServiceHandle::TaskManager(manager)) => Ok(manager),
            _ => Err(EngineError::InvalidTask(
                "TaskManager is required for hierarchical delegation".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::atomic::AtomicStrategy;

    fn test_strategy() -> Arc<dyn ExecutionStrategy> {
        Arc::new(AtomicStrategy::new())
    }

    #[test]
    fn new_task_starts_pending_and_is_root_without_parent() {
        let task: Arc<Task> = Arc::new(
            Task::builder()
                .description("do the thing")
                .strategy(test_strategy())
                .build(),
        );
        assert_eq!(task.state(), TaskState::Pending);
        assert!(task.is_root());
    }

    #[test]
    fn store_artifact_rejects_type_change_on_same_name() {
        let task: Arc<Task> = Arc::new(
            Task::builder()
                .description("do the thing")
                .strategy(test_strategy())
                .build(),
        );
        task.store_artifact("report", Value::from("v1"), "first", "text").unwrap();
        let result = task.store_artifact("report", Value::from(1), "second", "number");
        assert!(result.is_err());
    }

    #[test]
    fn register_child_sets_weak_parent_link() {
        let parent: Arc<Task> = Arc::new(
            Task::builder()
                .description("parent")
                .strategy(test_strategy())
                .build(),
        );
        let child: Arc<Task> = Arc::new(
            Task::builder()
                .description("child")
                .strategy(test_strategy())
                .build(),
        );
        parent.register_child(child.clone());
        assert!(child.parent().is_some());
        assert_eq!(child.parent().unwrap().id, parent.id);
    }

    #[test]
    fn lookup_walks_up_to_parent_context() {
        let parent: Arc<Task> = Arc::new(
            Task::builder()
                .description("parent")
                .strategy(test_strategy())
                .build(),
        );
        parent.set_service("workspaceDir", ServiceHandle::WorkspaceDir("/workspace".to_string()));
        let child: Arc<Task> = Arc::new(
            Task::builder()
                .description("child")
                .strategy(test_strategy())
                .build(),
        );
        parent.register_child(child.clone());
        assert!(matches!(child.lookup("workspaceDir"), Some(ServiceHandle::WorkspaceDir(dir)) if dir == "/workspace"));
        assert!(child.lookup("missingKey").is_none());
    }
}
