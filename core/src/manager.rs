//! [`TaskManager`]: factory that materializes child tasks bound to a
//! strategy and a parent, registers them for lookup, and delivers messages.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::errors::EngineError;
use crate::strategy::resolver::StrategyResolver;
use crate::strategy::ExecutionStrategy;
use crate::task::{MessageOutcome, ServiceHandle, Task, TaskMessage};

/// Creates child tasks bound to a resolved strategy and a parent, and keeps
/// an addressable registry so tasks can be looked up by id.
pub struct TaskManager {
    resolver: StrategyResolver,
    registry: DashMap<String, Arc<Task>>,
    self_ref: std::sync::OnceLock<Weak<TaskManager>>,
}

impl TaskManager {
    pub fn new(resolver: StrategyResolver) -> Arc<Self> {
        let manager = Arc::new(Self {
            resolver,
            registry: DashMap::new(),
            self_ref: std::sync::OnceLock::new(),
        });
        let _ = manager.self_ref.set(Arc::downgrade(&manager));
        manager
    }

    /// Registers the new task for lookup, binds the given strategy (or
    /// resolves one via [`StrategyResolver::select_strategy`] against `ctx`
    /// when the caller did not request a specific one), and wires the
    /// parent/child back-pointers.
    pub fn create_task(
        self: &Arc<Self>,
        description: impl Into<String>,
        parent: Option<Arc<Task>>,
        strategy: Option<Arc<dyn ExecutionStrategy>>,
        options: Option<Value>,
        ctx: &ExecutionContext,
    ) -> Arc<Task> {
        let description = description.into();
        let strategy = strategy.unwrap_or_else(|| self.resolve_strategy(&description, options.as_ref(), ctx));

        let task: Arc<Task> = Arc::new(
            Task::builder()
                .description(description)
                .options(options)
                .strategy(strategy)
                .build(),
        );

        task.set_service("taskManager", ServiceHandle::TaskManager(self.clone()));
        if let Some(parent) = &parent {
            parent.register_child(task.clone());
        }
        self.registry.insert(task.id.clone(), task.clone());
        task
    }

    /// Runs the registered strategies' `can_handle` against a disposable
    /// probe carrying the same description/options the real task will get;
    /// every `can_handle` implementation in this crate only inspects a
    /// task's description/options, never its identity, so resolving against
    /// a throwaway value ahead of the real construction is equivalent and
    /// avoids needing interior mutability on [`Task::strategy`].
    fn resolve_strategy(&self, description: &str, options: Option<&Value>, ctx: &ExecutionContext) -> Arc<dyn ExecutionStrategy> {
        let fallback = self.resolver.fallback_strategy();
        let probe = Task::builder()
            .description(description.to_string())
            .options(options.cloned())
            .strategy(fallback.clone())
            .build();
        self.resolver.select_strategy(&probe, ctx).unwrap_or(fallback)
    }

    pub fn resolver(&self) -> &StrategyResolver {
        &self.resolver
    }

    pub fn lookup_task(&self, id: &str) -> Option<Arc<Task>> {
        self.registry.get(id).map(|entry| entry.clone())
    }

    /// Delivers a message to a registered task by id.
    pub async fn deliver(&self, task_id: &str, message: TaskMessage, ctx: &ExecutionContext) -> Result<MessageOutcome, EngineError> {
        let task = self
            .lookup_task(task_id)
            .ok_or_else(|| EngineError::InvalidTask(format!("unknown task `{task_id}`")))?;
        Ok(task.receive_message(message, ctx).await)
    }

    pub fn deregister(&self, task_id: &str) {
        self.registry.remove(task_id);
    }
}
