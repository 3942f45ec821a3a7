//! The Parallel strategy: fans a task's subtasks out across a
//! [`crate::queue::TaskQueue`]-mediated bounded pool, built on
//! `tokio::task::JoinSet`, so `maxConcurrency` is honored even when more
//! subtasks are produced than there are slots.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::errors::ClassifiedError;
use crate::queue::{AddOptions, TaskQueue, TaskQueueConfig};
use crate::task::{Task, TaskMessage};

use super::{ComplexityEstimate, ExecutionStrategy, StrategyKind, StrategyOutcome};

struct SubtaskSpec {
    description: String,
    options: Value,
}

pub struct ParallelStrategy;

impl Default for ParallelStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl ParallelStrategy {
    pub fn new() -> Self {
        Self
    }

    /// Extracts subtask specs from `subtasks[]`, `operations[]`,
    /// `batch+items[]+template`, or `map+collection[]`.
    fn subtask_specs(task: &Task) -> Vec<SubtaskSpec> {
        let Some(options) = task.options() else {
            return Vec::new();
        };

        if let Some(subtasks) = options.get("subtasks").and_then(Value::as_array) {
            return subtasks
                .iter()
                .enumerate()
                .map(|(i, item)| SubtaskSpec {
                    description: item
                        .get("description")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("subtask {i}")),
                    options: item.clone(),
                })
                .collect();
        }

        if let Some(operations) = options.get("operations").and_then(Value::as_array) {
            return operations
                .iter()
                .enumerate()
                .map(|(i, op)| SubtaskSpec {
                    description: format!("{}-op-{i}", task.description),
                    options: op.clone(),
                })
                .collect();
        }

        if options.get("batch").and_then(Value::as_bool).unwrap_or(false) {
            let items = options.get("items").and_then(Value::as_array).cloned().unwrap_or_default();
            let template = options.get("template").cloned().unwrap_or(Value::Object(Default::default()));
            return items
                .into_iter()
                .enumerate()
                .map(|(i, item)| {
                    let mut merged = template.clone();
                    if let Value::Object(map) = &mut merged {
                        map.insert("input".to_string(), item);
                    }
                    SubtaskSpec {
                        description: format!("{}-batch-{i}", task.description),
                        options: merged,
                    }
                })
                .collect();
        }

        if options.get("map").is_some() {
            let collection = options.get("collection").and_then(Value::as_array).cloned().unwrap_or_default();
            let mapper = options.get("map").cloned().unwrap_or(Value::Null);
            return collection
                .into_iter()
                .enumerate()
                .map(|(i, item)| SubtaskSpec {
                    description: format!("{}-map-{i}", task.description),
                    options: serde_json::json!({"operation": mapper.clone(), "item": item}),
                })
                .collect();
        }

        Vec::new()
    }

    fn max_concurrency(task: &Task) -> usize {
        task.options()
            .and_then(|o| o.get("maxConcurrency").or_else(|| o.get("concurrency")))
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(4)
    }

    fn timeout_per_task(task: &Task) -> Option<Duration> {
        task.options()
            .and_then(|o| o.get("timeoutPerTask"))
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
    }

    fn fail_fast(task: &Task) -> bool {
        task.options()
            .and_then(|o| o.get("failFast"))
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }

    fn aggregation(task: &Task) -> String {
        task.options()
            .and_then(|o| o.get("aggregationType").or_else(|| o.get("aggregation")))
            .and_then(Value::as_str)
            .unwrap_or("array")
            .to_string()
    }
}

#[async_trait]
impl ExecutionStrategy for ParallelStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Parallel
    }

    fn can_handle(&self, task: &Task, _ctx: &ExecutionContext) -> bool {
        let Some(options) = task.options() else {
            return false;
        };
        options.get("parallel").and_then(Value::as_bool).unwrap_or(false)
            || options.get("strategy").and_then(Value::as_str) == Some("parallel")
            || options.get("concurrent").and_then(Value::as_bool).unwrap_or(false)
            || !Self::subtask_specs(task).is_empty()
    }

    async fn execute(&self, task: Arc<Task>, ctx: ExecutionContext) -> Result<StrategyOutcome, ClassifiedError> {
        let manager = task.require_task_manager()?;
        let specs = Self::subtask_specs(&task);
        if specs.is_empty() {
            return Ok(StrategyOutcome::success(Value::Array(Vec::new())));
        }

        let children: Vec<_> = specs
            .into_iter()
            .map(|spec| manager.create_task(spec.description, Some(task.clone()), None, Some(spec.options), &ctx))
            .collect();
        let child_ids: Vec<String> = children.iter().map(|c| c.id.clone()).collect();
        let child_contexts = ctx.create_parallel_contexts(&child_ids);

        let queue = TaskQueue::new(TaskQueueConfig {
            concurrency: Self::max_concurrency(&task),
            default_timeout: Self::timeout_per_task(&task),
            default_retry_limit: 0,
            ..Default::default()
        });
        let fail_fast = Self::fail_fast(&task);

        let mut join_set = tokio::task::JoinSet::new();
        for (index, (child, child_ctx)) in children.iter().cloned().zip(child_contexts.iter().cloned()).enumerate() {
            let queue = queue.clone();
            join_set.spawn(async move {
                let child_for_fn = child.clone();
                let child_ctx_for_fn = child_ctx.clone();
                let task_fn = Arc::new(move || {
                    let child = child_for_fn.clone();
                    let ctx = child_ctx_for_fn.clone();
                    Box::pin(async move {
                        let outcome = child.receive_message(TaskMessage::Start, &ctx).await;
                        if outcome.success {
                            Ok(outcome.result)
                        } else {
                            Err(ClassifiedError::new(outcome.result.to_string()))
                        }
                    }) as Pin<Box<dyn std::future::Future<Output = Result<Value, ClassifiedError>> + Send>>
                });
                let result = queue.add(task_fn, AddOptions::default()).await;
                (index, child.id.clone(), result)
            });
        }

        let mut results: Vec<Option<Value>> = vec![None; children.len()];
        let mut failures = Vec::new();
        let mut aborted = false;

        while let Some(joined) = join_set.join_next().await {
            let Ok((index, child_id, result)) = joined else {
                continue;
            };
            match result {
                Ok(value) => results[index] = Some(value),
                Err(error) => {
                    failures.push(serde_json::json!({"taskId": child_id, "error": error.to_string()}));
                    if fail_fast && !aborted {
                        aborted = true;
                        join_set.abort_all();
                    }
                }
            }
        }

        if fail_fast && !failures.is_empty() {
            return Err(ClassifiedError::new(format!(
                "{} of {} parallel subtasks failed",
                failures.len(),
                results.len()
            )));
        }

        let successes: Vec<Value> = results.iter().flatten().cloned().collect();

        let aggregated = match Self::aggregation(&task).as_str() {
            "object" => Value::Object(
                child_ids
                    .iter()
                    .zip(results.iter())
                    .filter_map(|(id, value)| value.clone().map(|v| (id.clone(), v)))
                    .collect(),
            ),
            "sum" => Value::from(successes.iter().filter_map(Value::as_f64).sum::<f64>()),
            "concat" => {
                if successes.iter().all(Value::is_string) {
                    Value::String(successes.iter().filter_map(Value::as_str).collect::<Vec<_>>().join(""))
                } else {
                    Value::Array(successes.iter().filter_map(Value::as_array).flatten().cloned().collect())
                }
            }
            "first" => successes.first().cloned().unwrap_or(Value::Null),
            "last" => successes.last().cloned().unwrap_or(Value::Null),
            "all" | "custom" => Value::Array(
                child_ids
                    .iter()
                    .zip(results.iter())
                    .map(|(id, value)| match value {
                        Some(v) => serde_json::json!({"taskId": id, "success": true, "result": v}),
                        None => serde_json::json!({"taskId": id, "success": false}),
                    })
                    .collect(),
            ),
            _ => Value::Array(successes),
        };

        Ok(StrategyOutcome::success(aggregated).with_metadata(serde_json::json!({"failures": failures})))
    }

    fn estimate_complexity(&self, task: &Task, _ctx: &ExecutionContext) -> ComplexityEstimate {
        let specs = Self::subtask_specs(task).len().max(1);
        let concurrency = Self::max_concurrency(task).max(1);
        let rounds = (specs as f64 / concurrency as f64).ceil().max(1.0);
        ComplexityEstimate {
            estimated_time_ms: (500.0 * rounds) as u64,
            estimated_cost: 0.0,
            confidence: 0.6,
            reasoning: format!("{specs} subtask(s) across {concurrency} concurrent slot(s)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_handle_requires_parallel_markers_or_subtasks() {
        let strategy = ParallelStrategy::new();
        let task: Arc<Task> = Arc::new(
            Task::builder()
                .description("no markers")
                .strategy(Arc::new(crate::strategy::atomic::AtomicStrategy::new()))
                .build(),
        );
        let ctx = ExecutionContext::root("root", "s", 5, Arc::new(crate::config::EngineConfig::default()));
        assert!(!strategy.can_handle(&task, &ctx));

        let task_with_subtasks: Arc<Task> = Arc::new(
            Task::builder()
                .description("fan out")
                .strategy(Arc::new(crate::strategy::atomic::AtomicStrategy::new()))
                .options(Some(serde_json::json!({"subtasks": [{"description": "a"}]})))
                .build(),
        );
        assert!(strategy.can_handle(&task_with_subtasks, &ctx));
    }

    #[test]
    fn subtask_specs_extracts_batch_items_with_template() {
        let task: Arc<Task> = Arc::new(
            Task::builder()
                .description("batch")
                .strategy(Arc::new(crate::strategy::atomic::AtomicStrategy::new()))
                .options(Some(serde_json::json!({
                    "batch": true,
                    "items": [1, 2, 3],
                    "template": {"tool": "double"}
                })))
                .build(),
        );
        let specs = ParallelStrategy::subtask_specs(&task);
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[1].options.get("input"), Some(&Value::from(2)));
        assert_eq!(specs[1].options.get("tool"), Some(&Value::from("double")));
    }
}
