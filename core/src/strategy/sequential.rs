//! The Sequential strategy: an ordered list of children executed one at a
//! time, each seeing the accumulated result of the previous one via
//! `ctx.with_result`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::errors::ClassifiedError;
use crate::task::{Task, TaskMessage};

use super::{ComplexityEstimate, ExecutionStrategy, StrategyKind, StrategyOutcome};

pub struct SequentialStrategy;

impl Default for SequentialStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl SequentialStrategy {
    pub fn new() -> Self {
        Self
    }

    fn steps(task: &Task) -> Vec<Value> {
        task.options()
            .and_then(|o| o.get("steps"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }

    fn continue_on_error(task: &Task) -> bool {
        task.options()
            .and_then(|o| o.get("continueOnError"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[async_trait]
impl ExecutionStrategy for SequentialStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Sequential
    }

    fn can_handle(&self, task: &Task, _ctx: &ExecutionContext) -> bool {
        let options = task.options();
        !Self::steps(task).is_empty()
            || options
                .and_then(|o| o.get("sequential"))
                .and_then(Value::as_bool)
                .unwrap_or(false)
    }

    async fn execute(&self, task: Arc<Task>, ctx: ExecutionContext) -> Result<StrategyOutcome, ClassifiedError> {
        let manager = task.require_task_manager()?;
        let steps = Self::steps(&task);
        let fail_fast = !Self::continue_on_error(&task);

        let mut results = Vec::with_capacity(steps.len());
        let mut failures = Vec::new();
        let mut current_ctx = ctx.clone();

        for (index, step) in steps.iter().enumerate() {
            let description = step
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("step")
                .to_string();
            let child = manager.create_task(
                format!("{description} (step {index})"),
                Some(task.clone()),
                None,
                Some(step.clone()),
                &current_ctx,
            );
            let child_ctx = current_ctx.create_child(child.id.clone(), None);
            let outcome = child.receive_message(TaskMessage::Start, &child_ctx).await;

            if outcome.success {
                current_ctx = current_ctx.with_result(outcome.result.clone());
                results.push(outcome.result);
            } else {
                failures.push(serde_json::json!({"step": index, "error": outcome.result}));
                if fail_fast {
                    return Err(ClassifiedError::new(format!(
                        "step {index} failed: {}",
                        outcome.result
                    )));
                }
            }
        }

        Ok(StrategyOutcome::success(Value::Array(results)).with_metadata(serde_json::json!({"failures": failures})))
    }

    fn estimate_complexity(&self, task: &Task, _ctx: &ExecutionContext) -> ComplexityEstimate {
        let steps = Self::steps(task).len().max(1);
        ComplexityEstimate {
            estimated_time_ms: 500 * steps as u64,
            estimated_cost: 0.0,
            confidence: 0.7,
            reasoning: format!("{steps} sequential step(s)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_handle_requires_steps_or_sequential_flag() {
        let strategy = SequentialStrategy::new();
        let task: Arc<Task> = Arc::new(
            Task::builder()
                .description("no steps")
                .strategy(Arc::new(crate::strategy::atomic::AtomicStrategy::new()))
                .build(),
        );
        let ctx = ExecutionContext::root("root", "s", 5, Arc::new(crate::config::EngineConfig::default()));
        assert!(!strategy.can_handle(&task, &ctx));
    }
}
