//! [`StrategyResolver`]: picks the [`ExecutionStrategy`] that should run a
//! task from an ordered, priority-tagged registry. Registrations are kept
//! in an ordered `Vec<(Arc<dyn ExecutionStrategy>, i32)>`, sorted by
//! priority on registration rather than resolution, so `select_strategy` is
//! a single linear scan.

use std::sync::{Arc, RwLock};

use crate::context::ExecutionContext;
use crate::errors::EngineError;
use crate::task::Task;

use super::atomic::AtomicStrategy;
use super::{ExecutionStrategy, StrategyKind};

/// Default registration order: more specialized strategies are tried first,
/// Atomic is always the fallback.
pub const DEFAULT_PRIORITIES: [(StrategyKind, i32); 4] = [
    (StrategyKind::Recursive, 30),
    (StrategyKind::Parallel, 20),
    (StrategyKind::Sequential, 10),
    (StrategyKind::Atomic, 0),
];

struct Entry {
    strategy: Arc<dyn ExecutionStrategy>,
    priority: i32,
}

pub struct StrategyResolver {
    entries: RwLock<Vec<Entry>>,
}

impl Default for StrategyResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl StrategyResolver {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Registers a strategy at a priority; higher priorities are tried
    /// first. Re-sorts immediately so [`Self::select_strategy`] never sorts.
    /// Rejects a second registration for a [`StrategyKind`] already present.
    pub fn register(&self, strategy: Arc<dyn ExecutionStrategy>, priority: i32) -> Result<(), EngineError> {
        let mut entries = self.entries.write().unwrap();
        if entries.iter().any(|entry| entry.strategy.kind() == strategy.kind()) {
            return Err(EngineError::InvalidTask(format!(
                "a strategy of kind `{}` is already registered",
                strategy.kind()
            )));
        }
        entries.push(Entry { strategy, priority });
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(())
    }

    /// The first registered strategy (by descending priority) whose
    /// `can_handle` accepts the task.
    pub fn select_strategy(&self, task: &Task, ctx: &ExecutionContext) -> Option<Arc<dyn ExecutionStrategy>> {
        let entries = self.entries.read().unwrap();
        entries
            .iter()
            .find(|entry| entry.strategy.can_handle(task, ctx))
            .map(|entry| entry.strategy.clone())
    }

    /// The strategy a newly created task falls back to when no explicit
    /// strategy is supplied: the registered Atomic strategy, or a fresh
    /// default one if the resolver was never seeded with one.
    pub fn fallback_strategy(&self) -> Arc<dyn ExecutionStrategy> {
        let entries = self.entries.read().unwrap();
        entries
            .iter()
            .find(|entry| entry.strategy.kind() == StrategyKind::Atomic)
            .map(|entry| entry.strategy.clone())
            .unwrap_or_else(|| Arc::new(AtomicStrategy::new()))
    }

    /// Looks up a registered strategy by kind, used by the Recursive
    /// strategy to dispatch a decomposed subtask's declared `strategy`
    /// under `mixed` composition.
    pub fn resolve_kind(&self, kind: StrategyKind) -> Option<Arc<dyn ExecutionStrategy>> {
        let entries = self.entries.read().unwrap();
        entries
            .iter()
            .find(|entry| entry.strategy.kind() == kind)
            .map(|entry| entry.strategy.clone())
    }

    /// Default-populated resolver: Recursive, Parallel, Sequential, Atomic
    /// registered at the priorities in [`DEFAULT_PRIORITIES`].
    pub fn with_defaults(
        recursive: Arc<dyn ExecutionStrategy>,
        parallel: Arc<dyn ExecutionStrategy>,
        sequential: Arc<dyn ExecutionStrategy>,
        atomic: Arc<dyn ExecutionStrategy>,
    ) -> Self {
        let resolver = Self::new();
        resolver.register(recursive, 30).expect("fresh resolver");
        resolver.register(parallel, 20).expect("fresh resolver");
        resolver.register(sequential, 10).expect("fresh resolver");
        resolver.register(atomic, 0).expect("fresh resolver");
        resolver
    }

    /// Copies this resolver's registrations into a fresh one, then applies
    /// `overrides` (each a `(strategy, priority)` re-registration, replacing
    /// any entry of the same kind). `skip_defaults` omits the base
    /// registrations entirely, keeping only `overrides`.
    pub fn clone_with_overrides(&self, overrides: Vec<(Arc<dyn ExecutionStrategy>, i32)>, skip_defaults: bool) -> Self {
        let resolver = Self::new();
        if !skip_defaults {
            let entries = self.entries.read().unwrap();
            for entry in entries.iter() {
                let _ = resolver.register(entry.strategy.clone(), entry.priority);
            }
        }
        for (strategy, priority) in overrides {
            resolver.replace(strategy, priority);
        }
        resolver
    }

    /// Registers a strategy, replacing any existing entry of the same kind
    /// rather than rejecting it (used by [`Self::clone_with_overrides`]).
    fn replace(&self, strategy: Arc<dyn ExecutionStrategy>, priority: i32) {
        let mut entries = self.entries.write().unwrap();
        entries.retain(|entry| entry.strategy.kind() != strategy.kind());
        entries.push(Entry { strategy, priority });
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));
    }
}
