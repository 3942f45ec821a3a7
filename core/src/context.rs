//! [`ExecutionContext`]: the immutable record threaded through every level of
//! task recursion. Every "update" returns a new value; nothing here ever
//! mutates `self`. Construction is driven by a handful of named constructors
//! (`root`, `create_child`, `create_sibling`, ...) rather than a single wide
//! struct literal.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::EngineConfig;

/// One entry of the top-down path from the root task to the current one.
/// Breadcrumbs are append-only: a child's trail is its parent's trail plus
/// exactly one new entry, never reordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breadcrumb {
    pub task_id: String,
    pub depth: u32,
    pub timestamp: DateTime<Utc>,
}

/// Named-field overrides accepted by [`ExecutionContext::create_child`] and
/// [`ExecutionContext::create_sibling`]. Every field left `None` inherits the
/// parent's value unchanged.
#[derive(Debug, Clone, Default)]
pub struct ContextOverrides {
    pub session_id: Option<String>,
    pub correlation_id: Option<String>,
    pub max_depth: Option<u32>,
    pub deadline: Option<Option<DateTime<Utc>>>,
    pub metadata: Option<HashMap<String, Value>>,
    pub user_context: Option<Value>,
}

/// The immutable per-invocation record carried through task execution.
///
/// `config` is wrapped in an [`Arc`] since it is genuinely frozen: cloning an
/// `ExecutionContext` must be cheap, and every descendant shares the exact
/// same configuration instance rather than a deep copy of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub task_id: String,
    pub session_id: String,
    pub correlation_id: String,
    pub depth: u32,
    pub max_depth: u32,
    pub start_time: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub breadcrumbs: Vec<Breadcrumb>,
    pub shared_state: HashMap<String, Value>,
    pub previous_results: Vec<Value>,
    pub dependencies: HashMap<String, Value>,
    pub metadata: HashMap<String, Value>,
    pub user_context: Value,
    pub config: Arc<EngineConfig>,
}

impl ExecutionContext {
    /// Builds the context for a root task (`depth == 0`).
    pub fn root(
        task_id: impl Into<String>,
        session_id: impl Into<String>,
        max_depth: u32,
        config: Arc<EngineConfig>,
    ) -> Self {
        let task_id = task_id.into();
        let now = Utc::now();
        Self {
            breadcrumbs: vec![Breadcrumb {
                task_id: task_id.clone(),
                depth: 0,
                timestamp: now,
            }],
            task_id,
            session_id: session_id.into(),
            correlation_id: uuid::Uuid::new_v4().to_string(),
            depth: 0,
            max_depth,
            start_time: now,
            deadline: None,
            shared_state: HashMap::new(),
            previous_results: Vec::new(),
            dependencies: HashMap::new(),
            metadata: HashMap::new(),
            user_context: Value::Null,
            config,
        }
    }

    /// `depth + 1`, breadcrumbs extended by one entry, everything else
    /// inherited except fields named in `overrides`.
    pub fn create_child(&self, task_id: impl Into<String>, overrides: Option<ContextOverrides>) -> Self {
        let task_id = task_id.into();
        let overrides = overrides.unwrap_or_default();
        let mut breadcrumbs = self.breadcrumbs.clone();
        breadcrumbs.push(Breadcrumb {
            task_id: task_id.clone(),
            depth: self.depth + 1,
            timestamp: Utc::now(),
        });
        Self {
            task_id,
            session_id: overrides.session_id.unwrap_or_else(|| self.session_id.clone()),
            correlation_id: overrides
                .correlation_id
                .unwrap_or_else(|| self.correlation_id.clone()),
            depth: self.depth + 1,
            max_depth: overrides.max_depth.unwrap_or(self.max_depth),
            start_time: self.start_time,
            deadline: overrides.deadline.unwrap_or(self.deadline),
            breadcrumbs,
            shared_state: self.shared_state.clone(),
            previous_results: Vec::new(),
            dependencies: self.dependencies.clone(),
            metadata: overrides.metadata.unwrap_or_else(|| self.metadata.clone()),
            user_context: overrides.user_context.unwrap_or_else(|| self.user_context.clone()),
            config: self.config.clone(),
        }
    }

    /// Same parent and depth as `self`; copies `previous_results` and
    /// `shared_state` forward instead of resetting them.
    pub fn create_sibling(&self, task_id: impl Into<String>, overrides: Option<ContextOverrides>) -> Self {
        let task_id = task_id.into();
        let overrides = overrides.unwrap_or_default();
        let mut breadcrumbs = self.breadcrumbs.clone();
        if let Some(last) = breadcrumbs.last_mut() {
            *last = Breadcrumb {
                task_id: task_id.clone(),
                depth: self.depth,
                timestamp: Utc::now(),
            };
        }
        Self {
            task_id,
            session_id: overrides.session_id.unwrap_or_else(|| self.session_id.clone()),
            correlation_id: overrides
                .correlation_id
                .unwrap_or_else(|| self.correlation_id.clone()),
            depth: self.depth,
            max_depth: overrides.max_depth.unwrap_or(self.max_depth),
            start_time: self.start_time,
            deadline: overrides.deadline.unwrap_or(self.deadline),
            breadcrumbs,
            shared_state: self.shared_state.clone(),
            previous_results: self.previous_results.clone(),
            dependencies: self.dependencies.clone(),
            metadata: overrides.metadata.unwrap_or_else(|| self.metadata.clone()),
            user_context: overrides.user_context.unwrap_or_else(|| self.user_context.clone()),
            config: self.config.clone(),
        }
    }

    /// `N` children with an identical base and distinct ids, for fan-out
    /// under the Parallel strategy.
    pub fn create_parallel_contexts(&self, task_ids: &[String]) -> Vec<Self> {
        task_ids
            .iter()
            .map(|id| self.create_child(id.clone(), None))
            .collect()
    }

    /// Folds results from parallel children back onto `self`: previous
    /// results are concatenated in input order, shared state merges
    /// last-write-wins in input order.
    pub fn merge_parallel_results(&self, children: &[Self]) -> Self {
        let mut merged = self.clone();
        for child in children {
            if let Some(last) = child.previous_results.last() {
                merged.previous_results.push(last.clone());
            }
            for (k, v) in &child.shared_state {
                merged.shared_state.insert(k.clone(), v.clone());
            }
        }
        merged
    }

    pub fn with_result(&self, result: Value) -> Self {
        let mut next = self.clone();
        next.previous_results.push(result);
        next
    }

    pub fn with_shared_state(&self, key: impl Into<String>, value: Value) -> Self {
        let mut next = self.clone();
        next.shared_state.insert(key.into(), value);
        next
    }

    pub fn with_shared_states(&self, entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        let mut next = self.clone();
        next.shared_state.extend(entries);
        next
    }

    pub fn with_dependency(&self, task_id: impl Into<String>, result: Value) -> Self {
        let mut next = self.clone();
        next.dependencies.insert(task_id.into(), result);
        next
    }

    pub fn with_metadata(&self, key: impl Into<String>, value: Value) -> Self {
        let mut next = self.clone();
        next.metadata.insert(key.into(), value);
        next
    }

    pub fn with_deadline(&self, deadline: Option<DateTime<Utc>>) -> Self {
        let mut next = self.clone();
        next.deadline = deadline;
        next
    }

    pub fn can_decompose(&self) -> bool {
        self.depth < self.max_depth
    }

    pub fn is_expired(&self) -> bool {
        match self.deadline {
            Some(deadline) => Utc::now() > deadline,
            None => false,
        }
    }

    /// Lossless JSON round-trip. `ExecutionContext` already derives
    /// [`Serialize`]/[`Deserialize`]; this is a thin named wrapper for
    /// callers that want `to_object`/`from_object` symmetry.
    pub fn to_object(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    pub fn from_object(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }

    /// Resolves a dotted path (`a.b.c`) against a [`Value`], used by the
    /// Atomic strategy's `$previous.<i>.<path>` / `$<taskId>.<path>` /
    /// `$context.<field>` parameter references.
    pub fn resolve_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
        path.split('.').try_fold(value, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Arc<EngineConfig> {
        Arc::new(EngineConfig::builder().build())
    }

    #[test]
    fn child_increments_depth_and_extends_breadcrumbs() {
        let root = ExecutionContext::root("root", "session-1", 5, cfg());
        let child = root.create_child("child-1", None);
        assert_eq!(child.depth, 1);
        assert_eq!(child.breadcrumbs.len(), 2);
        assert_eq!(child.breadcrumbs[0].task_id, "root");
        assert_eq!(child.breadcrumbs[1].task_id, "child-1");
    }

    #[test]
    fn sibling_keeps_depth_and_copies_forward_state() {
        let root = ExecutionContext::root("root", "session-1", 5, cfg());
        let root = root.with_result(Value::from(1)).with_shared_state("k", Value::from("v"));
        let sibling = root.create_sibling("sibling-1", None);
        assert_eq!(sibling.depth, root.depth);
        assert_eq!(sibling.previous_results, root.previous_results);
        assert_eq!(sibling.shared_state.get("k"), Some(&Value::from("v")));
    }

    #[test]
    fn merge_parallel_results_concatenates_in_order_and_last_write_wins() {
        let root = ExecutionContext::root("root", "session-1", 5, cfg());
        let children = root.create_parallel_contexts(&["a".into(), "b".into()]);
        let child_a = children[0].with_result(Value::from("a-result")).with_shared_state("k", Value::from(1));
        let child_b = children[1].with_result(Value::from("b-result")).with_shared_state("k", Value::from(2));
        let merged = root.merge_parallel_results(&[child_a, child_b]);
        assert_eq!(
            merged.previous_results,
            vec![Value::from("a-result"), Value::from("b-result")]
        );
        assert_eq!(merged.shared_state.get("k"), Some(&Value::from(2)));
    }

    #[test]
    fn can_decompose_respects_max_depth() {
        let root = ExecutionContext::root("root", "session-1", 1, cfg());
        assert!(root.can_decompose());
        let child = root.create_child("child", None);
        assert!(!child.can_decompose());
    }

    #[test]
    fn to_object_from_object_round_trips() {
        let root = ExecutionContext::root("root", "session-1", 5, cfg())
            .with_shared_state("k", Value::from("v"))
            .with_dependency("dep-1", Value::from(42));
        let object = root.to_object().unwrap();
        let restored = ExecutionContext::from_object(object).unwrap();
        assert_eq!(restored.task_id, root.task_id);
        assert_eq!(restored.shared_state, root.shared_state);
        assert_eq!(restored.dependencies, root.dependencies);
    }

    #[test]
    fn resolve_path_walks_nested_objects_and_arrays() {
        let value = serde_json::json!({"a": {"b": [1, 2, {"c": "deep"}]}});
        let found = ExecutionContext::resolve_path(&value, "a.b.2.c");
        assert_eq!(found, Some(&Value::from("deep")));
    }
}
