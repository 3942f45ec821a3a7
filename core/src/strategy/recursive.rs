//! The Recursive strategy: decomposes a task into subtasks and dispatches
//! them under one of three composition modes. Under `mixed` composition,
//! subtasks form a DAG via `dependsOn`, resolved wave-by-wave with Kahn's
//! algorithm.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::errors::ClassifiedError;
use crate::external::{LlmRequest, SimplePromptClient};
use crate::task::{ServiceHandle, Task, TaskMessage};

use super::{ComplexityEstimate, ExecutionStrategy, StrategyKind, StrategyOutcome};

/// How decomposed subtasks are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompositionMode {
    Sequential,
    Parallel,
    Mixed,
}

/// One subtask produced by a [`Decomposer`]. `id` is a decomposition-local
/// identifier (not the eventual [`Task::id`]) used only to express
/// `depends_on` edges for [`CompositionMode::Mixed`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskDescriptor {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub options: Value,
    #[serde(default, rename = "dependsOn")]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decomposition {
    pub subtasks: Vec<SubtaskDescriptor>,
    pub composition: CompositionMode,
    #[serde(default = "default_aggregation")]
    pub aggregation: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

fn default_aggregation() -> String {
    "aggregate".to_string()
}

/// Produces a [`Decomposition`] for a task, or `None` to fall back to direct
/// execution.
#[async_trait]
pub trait Decomposer: Send + Sync {
    async fn decompose(&self, task: &Task, ctx: &ExecutionContext) -> Result<Option<Decomposition>, ClassifiedError>;
}

/// Reads an explicit decomposition straight out of `task.options().decomposition`
/// (`{subtasks, composition, aggregation}`). This is the decomposer every
/// [`RecursiveStrategy`] is seeded with: it requires no external
/// collaborator and gives callers full control over the DAG shape.
pub struct ConfiguredDecomposer;

#[async_trait]
impl Decomposer for ConfiguredDecomposer {
    async fn decompose(&self, task: &Task, _ctx: &ExecutionContext) -> Result<Option<Decomposition>, ClassifiedError> {
        let Some(raw) = task.options().and_then(|o| o.get("decomposition")) else {
            return Ok(None);
        };
        let decomposition: Decomposition = serde_json::from_value(raw.clone())
            .map_err(|e| ClassifiedError::new(format!("invalid decomposition: {e}")))?;
        Ok(Some(decomposition))
    }
}

/// Asks a bound [`SimplePromptClient`] to propose a decomposition as JSON,
/// the same prompt-then-parse shape the Atomic strategy uses for
/// `expectJSON` LLM calls. Used when `task.options().decompose == "llm"`.
pub struct LlmDecomposer;

#[async_trait]
impl Decomposer for LlmDecomposer {
    async fn decompose(&self, task: &Task, _ctx: &ExecutionContext) -> Result<Option<Decomposition>, ClassifiedError> {
        let wants_llm = task
            .options()
            .and_then(|o| o.get("decompose"))
            .and_then(Value::as_str)
            .map(|s| s == "llm")
            .unwrap_or(false);
        if !wants_llm {
            return Ok(None);
        }
        let client = match task.lookup("llmClient") {
            Some(ServiceHandle::LlmClient(client)) => client,
            _ => return Err(ClassifiedError::new("SimplePromptClient not configured")),
        };
        let prompt = format!(
            "Break the following task into a JSON object of shape \
             {{\"subtasks\":[{{\"id\":string,\"description\":string,\"dependsOn\":[string]}}],\
             \"composition\":\"sequential|parallel|mixed\",\"aggregation\":\"aggregate|merge|first|last\"}}.\n\
             Task: {}",
            task.description
        );
        let response = client
            .request(LlmRequest::new(prompt))
            .await
            .map_err(|e| ClassifiedError::new(e.to_string()))?;
        let content = response
            .extract_content()
            .ok_or_else(|| ClassifiedError::new("cannot extract content from LLM response"))?;
        let decomposition: Decomposition =
            serde_json::from_str(content).map_err(|e| ClassifiedError::new(format!("failed to parse decomposition: {e}")))?;
        Ok(Some(decomposition))
    }
}

/// Heuristic score used only when a task does not explicitly opt in or out:
/// word count is a cheap proxy for "this description describes more than
/// one step".
fn complexity_score(task: &Task) -> f64 {
    let words = task.description.split_whitespace().count();
    (words as f64 / 40.0).min(1.0)
}

pub struct RecursiveStrategy {
    decomposers: Vec<Arc<dyn Decomposer>>,
    cache: DashMap<String, Decomposition>,
}

impl Default for RecursiveStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl RecursiveStrategy {
    pub fn new() -> Self {
        Self {
            decomposers: vec![Arc::new(LlmDecomposer), Arc::new(ConfiguredDecomposer)],
            cache: DashMap::new(),
        }
    }

    pub fn with_decomposers(decomposers: Vec<Arc<dyn Decomposer>>) -> Self {
        Self {
            decomposers,
            cache: DashMap::new(),
        }
    }

    fn cache_key(task: &Task) -> String {
        task.description.trim().to_lowercase()
    }

    async fn decompose(&self, task: &Task, ctx: &ExecutionContext) -> Result<Option<Decomposition>, ClassifiedError> {
        if ctx.config.use_cache {
            if let Some(cached) = self.cache.get(&Self::cache_key(task)) {
                return Ok(Some(cached.clone()));
            }
        }
        for decomposer in &self.decomposers {
            if let Some(decomposition) = decomposer.decompose(task, ctx).await? {
                if ctx.config.use_cache {
                    self.cache.insert(Self::cache_key(task), decomposition.clone());
                }
                return Ok(Some(decomposition));
            }
        }
        Ok(None)
    }

    /// Ancestor-description walk: recursion without a DAG is only a cycle
    /// if some ancestor carries the exact same description, since task ids
    /// are always freshly minted per decomposition.
    fn detects_cycle(ctx: &ExecutionContext, description: &str) -> bool {
        ctx.metadata
            .get("decompositionPath")
            .and_then(Value::as_array)
            .map(|path| path.iter().any(|entry| entry.as_str() == Some(description)))
            .unwrap_or(false)
    }

    fn push_decomposition_path(ctx: &ExecutionContext, description: &str) -> ExecutionContext {
        let mut path: Vec<Value> = ctx
            .metadata
            .get("decompositionPath")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        path.push(Value::String(description.to_string()));
        ctx.with_metadata("decompositionPath", Value::Array(path))
    }
}

#[async_trait]
impl ExecutionStrategy for RecursiveStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Recursive
    }

    fn can_handle(&self, task: &Task, ctx: &ExecutionContext) -> bool {
        let options = task.options();
        if options.and_then(|o| o.get("recursive")).and_then(Value::as_bool).unwrap_or(false) {
            return true;
        }
        if options.and_then(|o| o.get("strategy")).and_then(Value::as_str) == Some("recursive") {
            return true;
        }
        let already_shaped = options
            .map(|o| {
                o.get("subtasks").is_some() || o.get("steps").is_some() || o.get("operations").is_some() || o.get("batch").is_some()
            })
            .unwrap_or(false);
        if already_shaped {
            return false;
        }
        complexity_score(task) >= ctx.config.decompose_threshold
    }

    async fn execute(&self, task: Arc<Task>, ctx: ExecutionContext) -> Result<StrategyOutcome, ClassifiedError> {
        if !ctx.can_decompose() {
            return Err(ClassifiedError::with_code(
                "Maximum recursion depth exceeded",
                "max_depth_exceeded",
            ));
        }
        if ctx.config.cycle_detection && Self::detects_cycle(&ctx, &task.description) {
            return Err(ClassifiedError::with_code(
                "circular dependency detected among subtasks",
                "CIRCULAR_DEPENDENCY",
            ));
        }

        let Some(decomposition) = self.decompose(&task, &ctx).await? else {
            return execute_directly(&task, &ctx).await;
        };
        if decomposition.subtasks.is_empty() {
            return execute_directly(&task, &ctx).await;
        }

        let manager = task.require_task_manager()?;
        let child_ctx_base = Self::push_decomposition_path(&ctx, &task.description);

        let dependencies = match decomposition.composition {
            CompositionMode::Sequential => run_sequential(&manager, &task, &child_ctx_base, &decomposition.subtasks).await?,
            CompositionMode::Parallel => run_wave(&manager, &task, &child_ctx_base, &decomposition.subtasks).await?,
            CompositionMode::Mixed => run_mixed(&manager, &task, &child_ctx_base, &decomposition.subtasks).await?,
        };

        let aggregated = aggregate(&decomposition, &dependencies);
        Ok(StrategyOutcome::success(aggregated).with_metadata(decomposition.metadata.unwrap_or(Value::Null)))
    }

    fn estimate_complexity(&self, task: &Task, ctx: &ExecutionContext) -> ComplexityEstimate {
        let score = complexity_score(task);
        ComplexityEstimate {
            estimated_time_ms: (1000.0 + 4000.0 * score) as u64,
            estimated_cost: score,
            confidence: 0.4,
            reasoning: format!(
                "heuristic complexity {score:.2} against threshold {:.2}",
                ctx.config.decompose_threshold
            ),
        }
    }
}

async fn execute_directly(task: &Arc<Task>, ctx: &ExecutionContext) -> Result<StrategyOutcome, ClassifiedError> {
    let atomic = super::atomic::AtomicStrategy::new();
    atomic.execute(task.clone(), ctx.clone()).await
}

async fn run_sequential(
    manager: &Arc<crate::manager::TaskManager>,
    parent: &Arc<Task>,
    base_ctx: &ExecutionContext,
    subtasks: &[SubtaskDescriptor],
) -> Result<HashMap<String, Value>, ClassifiedError> {
    let mut results = HashMap::new();
    let mut current_ctx = base_ctx.clone();
    for descriptor in subtasks {
        let child = manager.create_task(
            descriptor.description.clone(),
            Some(parent.clone()),
            None,
            Some(descriptor.options.clone()),
            &current_ctx,
        );
        let child_ctx = current_ctx.create_child(child.id.clone(), None);
        let outcome = child.receive_message(TaskMessage::Start, &child_ctx).await;
        if !outcome.success {
            return Err(ClassifiedError::new(format!("subtask `{}` failed: {}", descriptor.id, outcome.result)));
        }
        current_ctx = current_ctx.with_result(outcome.result.clone()).with_dependency(descriptor.id.clone(), outcome.result.clone());
        results.insert(descriptor.id.clone(), outcome.result);
    }
    Ok(results)
}

async fn run_wave(
    manager: &Arc<crate::manager::TaskManager>,
    parent: &Arc<Task>,
    base_ctx: &ExecutionContext,
    subtasks: &[SubtaskDescriptor],
) -> Result<HashMap<String, Value>, ClassifiedError> {
    let child_ids: Vec<String> = subtasks.iter().map(|s| s.id.clone()).collect();
    let children: Vec<_> = subtasks
        .iter()
        .map(|s| manager.create_task(s.description.clone(), Some(parent.clone()), None, Some(s.options.clone()), base_ctx))
        .collect();
    let child_contexts = base_ctx.create_parallel_contexts(&children.iter().map(|c| c.id.clone()).collect::<Vec<_>>());

    let mut join_set = tokio::task::JoinSet::new();
    for ((local_id, child), child_ctx) in child_ids.into_iter().zip(children).zip(child_contexts) {
        join_set.spawn(async move {
            let outcome = child.receive_message(TaskMessage::Start, &child_ctx).await;
            (local_id, outcome)
        });
    }

    let mut results = HashMap::new();
    while let Some(joined) = join_set.join_next().await {
        let Ok((local_id, outcome)) = joined else { continue };
        if !outcome.success {
            return Err(ClassifiedError::new(format!("subtask `{local_id}` failed: {}", outcome.result)));
        }
        results.insert(local_id, outcome.result);
    }
    Ok(results)
}

/// Kahn's algorithm over `dependsOn` edges: each wave is the current
/// in-degree-zero frontier, run concurrently, before the next wave's edges
/// are released.
async fn run_mixed(
    manager: &Arc<crate::manager::TaskManager>,
    parent: &Arc<Task>,
    base_ctx: &ExecutionContext,
    subtasks: &[SubtaskDescriptor],
) -> Result<HashMap<String, Value>, ClassifiedError> {
    let mut remaining: HashMap<String, &SubtaskDescriptor> = subtasks.iter().map(|s| (s.id.clone(), s)).collect();
    let mut indegree: HashMap<String, usize> = subtasks.iter().map(|s| (s.id.clone(), s.depends_on.len())).collect();
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
    for s in subtasks {
        for dep in &s.depends_on {
            dependents.entry(dep.clone()).or_default().push(s.id.clone());
        }
    }

    let mut results: HashMap<String, Value> = HashMap::new();
    let mut ctx = base_ctx.clone();
    let mut frontier: VecDeque<String> = indegree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(id, _)| id.clone())
        .collect();

    let mut processed = 0usize;
    while !frontier.is_empty() {
        let wave: Vec<SubtaskDescriptor> = frontier.drain(..).filter_map(|id| remaining.remove(&id).cloned()).collect();
        processed += wave.len();
        let wave_results = run_wave(manager, parent, &ctx, &wave).await?;
        for (id, value) in &wave_results {
            ctx = ctx.with_dependency(id.clone(), value.clone());
            results.insert(id.clone(), value.clone());
            if let Some(children) = dependents.get(id) {
                for child_id in children {
                    if let Some(deg) = indegree.get_mut(child_id) {
                        *deg -= 1;
                        if *deg == 0 {
                            frontier.push_back(child_id.clone());
                        }
                    }
                }
            }
        }
    }

    if processed != subtasks.len() {
        return Err(ClassifiedError::with_code(
            "circular dependency detected among subtasks",
            "CIRCULAR_DEPENDENCY",
        ));
    }
    Ok(results)
}

fn aggregate(decomposition: &Decomposition, results: &HashMap<String, Value>) -> Value {
    let ordered: Vec<Value> = decomposition
        .subtasks
        .iter()
        .filter_map(|s| results.get(&s.id).cloned())
        .collect();
    match decomposition.aggregation.as_str() {
        "merge" => {
            let mut merged = serde_json::Map::new();
            for value in &ordered {
                if let Value::Object(map) = value {
                    for (k, v) in map {
                        merged.insert(k.clone(), v.clone());
                    }
                }
            }
            Value::Object(merged)
        }
        "first" => ordered.first().cloned().unwrap_or(Value::Null),
        "last" => ordered.last().cloned().unwrap_or(Value::Null),
        _ => Value::Array(ordered),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn ctx(depth: u32, max_depth: u32) -> ExecutionContext {
        let mut context = ExecutionContext::root("root", "session", max_depth, Arc::new(EngineConfig::default()));
        context.depth = depth;
        context
    }

    #[test]
    fn can_handle_is_independent_of_depth() {
        let strategy = RecursiveStrategy::new();
        let task: Arc<Task> = Arc::new(
            Task::builder()
                .description("recursive work")
                .strategy(Arc::new(crate::strategy::atomic::AtomicStrategy::new()))
                .options(Some(serde_json::json!({"recursive": true})))
                .build(),
        );
        assert!(strategy.can_handle(&task, &ctx(0, 5)));
        assert!(strategy.can_handle(&task, &ctx(5, 5)));
    }

    #[tokio::test]
    async fn execute_rejects_once_max_depth_is_reached() {
        let strategy = RecursiveStrategy::new();
        let task: Arc<Task> = Arc::new(
            Task::builder()
                .description("recursive work")
                .strategy(Arc::new(crate::strategy::atomic::AtomicStrategy::new()))
                .options(Some(serde_json::json!({"recursive": true})))
                .build(),
        );
        let error = strategy.execute(task, ctx(5, 5)).await.unwrap_err();
        assert_eq!(error.code.as_deref(), Some("max_depth_exceeded"));
    }

    #[test]
    fn can_handle_defers_to_other_strategies_for_pre_shaped_tasks() {
        let strategy = RecursiveStrategy::new();
        let task: Arc<Task> = Arc::new(
            Task::builder()
                .description("already a batch job with many words describing lots of steps to take care of")
                .strategy(Arc::new(crate::strategy::atomic::AtomicStrategy::new()))
                .options(Some(serde_json::json!({"batch": true, "items": []})))
                .build(),
        );
        assert!(!strategy.can_handle(&task, &ctx(0, 5)));
    }

    #[test]
    fn detects_cycle_matches_repeated_description_in_path() {
        let context = ctx(1, 5).with_metadata("decompositionPath", serde_json::json!(["write report"]));
        assert!(RecursiveStrategy::detects_cycle(&context, "write report"));
        assert!(!RecursiveStrategy::detects_cycle(&context, "write summary"));
    }

    #[test]
    fn aggregate_merge_combines_object_results_in_order() {
        let decomposition = Decomposition {
            subtasks: vec![
                SubtaskDescriptor {
                    id: "a".into(),
                    description: "a".into(),
                    options: Value::Null,
                    depends_on: vec![],
                },
                SubtaskDescriptor {
                    id: "b".into(),
                    description: "b".into(),
                    options: Value::Null,
                    depends_on: vec![],
                },
            ],
            composition: CompositionMode::Mixed,
            aggregation: "merge".to_string(),
            metadata: None,
        };
        let mut results = HashMap::new();
        results.insert("a".to_string(), serde_json::json!({"x": 1}));
        results.insert("b".to_string(), serde_json::json!({"y": 2}));
        let merged = aggregate(&decomposition, &results);
        assert_eq!(merged, serde_json::json!({"x": 1, "y": 2}));
    }
}
