//! The Atomic strategy: a single closure/tool/LLM call wrapped in the
//! common strategy contract. This is also the resolver's fallback
//! strategy, so `can_handle` is unconditionally `true` — every task has a
//! description.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::errors::ClassifiedError;
use crate::external::{LlmRequest, SimplePromptClient, Tool, ToolRegistry};
use crate::retry::{ExponentialBackoff, RetryHandler};
use crate::task::{ServiceHandle, Task};

use super::{ComplexityEstimate, ExecutionStrategy, StrategyKind, StrategyOutcome};

/// The "function" execution type: a task-bound native callable. JSON
/// options cannot hold a callable, so a task may carry one of these
/// instead of `tool`/`prompt` options.
#[async_trait]
pub trait NativeFn: Send + Sync {
    async fn call(&self, params: Value, ctx: Option<&ExecutionContext>) -> Result<Value, ClassifiedError>;
}

enum ExecutionKind {
    Tool { name: String },
    Function,
    Llm { prompt: String },
}

pub struct AtomicStrategy {
    native_fns: dashmap::DashMap<String, Arc<dyn NativeFn>>,
}

impl Default for AtomicStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl AtomicStrategy {
    pub fn new() -> Self {
        Self {
            native_fns: dashmap::DashMap::new(),
        }
    }

    /// Registers a native callable for a task id, used for the "function"
    /// execution kind.
    pub fn bind_function(&self, task_id: impl Into<String>, f: Arc<dyn NativeFn>) {
        self.native_fns.insert(task_id.into(), f);
    }

    fn execution_kind(&self, task: &Task) -> ExecutionKind {
        if self.native_fns.contains_key(&task.id) {
            return ExecutionKind::Function;
        }
        let options = task.options();
        if let Some(name) = options
            .and_then(|o| o.get("tool").or_else(|| o.get("toolName")))
            .and_then(Value::as_str)
        {
            return ExecutionKind::Tool { name: name.to_string() };
        }
        if let Some(prompt) = options.and_then(|o| o.get("prompt")).and_then(Value::as_str) {
            return ExecutionKind::Llm {
                prompt: prompt.to_string(),
            };
        }
        ExecutionKind::Llm {
            prompt: task.description.clone(),
        }
    }
}

#[async_trait]
impl ExecutionStrategy for AtomicStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Atomic
    }

    fn can_handle(&self, _task: &Task, _ctx: &ExecutionContext) -> bool {
        true
    }

    async fn execute(&self, task: Arc<Task>, ctx: ExecutionContext) -> Result<StrategyOutcome, ClassifiedError> {
        let options = task.options().cloned().unwrap_or_else(|| Value::Object(Default::default()));
        let retries = options.get("retries").and_then(Value::as_u64).unwrap_or(0) as u32;
        let retry_handler = RetryHandler::new(
            Arc::new(ExponentialBackoff::new(ctx.config.default_base_retry_delay, ctx.config.backoff_factor)),
            retries + 1,
        );

        let kind_name = match self.execution_kind(&task) {
            ExecutionKind::Tool { name } => format!("tool:{name}"),
            ExecutionKind::Function => "function".to_string(),
            ExecutionKind::Llm { .. } => "llm".to_string(),
        };
        tracing::debug!(task_id = %task.id, kind = %kind_name, "atomic strategy dispatching");

        let task_for_attempts = task.clone();
        let ctx_for_attempts = ctx.clone();
        let options_for_attempts = options.clone();
        let outcome = retry_handler
            .execute_with_retry(|_attempt, _previous| {
                let task = task_for_attempts.clone();
                let ctx = ctx_for_attempts.clone();
                let options = options_for_attempts.clone();
                async move { dispatch_once(self, &task, &ctx, &options).await }
            })
            .await;

        match outcome.data {
            Some(value) => Ok(StrategyOutcome::success(value)),
            None => Err(outcome.error.unwrap_or_else(|| ClassifiedError::new("atomic execution failed"))),
        }
    }

    fn estimate_complexity(&self, _task: &Task, _ctx: &ExecutionContext) -> ComplexityEstimate {
        ComplexityEstimate {
            estimated_time_ms: 500,
            estimated_cost: 0.0,
            confidence: 0.9,
            reasoning: "atomic tasks perform a single bounded call".to_string(),
        }
    }
}

async fn dispatch_once(
    strategy: &AtomicStrategy,
    task: &Arc<Task>,
    ctx: &ExecutionContext,
    options: &Value,
) -> Result<Value, ClassifiedError> {
    match strategy.execution_kind(task) {
        ExecutionKind::Tool { name } => execute_tool(task, ctx, options, &name).await,
        ExecutionKind::Function => execute_function(strategy, task, ctx, options).await,
        ExecutionKind::Llm { prompt } => execute_llm(task, ctx, options, &prompt).await,
    }
}

async fn execute_tool(task: &Arc<Task>, ctx: &ExecutionContext, options: &Value, name: &str) -> Result<Value, ClassifiedError> {
    let registry = match task.lookup("toolRegistry") {
        Some(ServiceHandle::ToolRegistry(registry)) => registry,
        _ => return Err(ClassifiedError::with_code("Tool registry not configured", "tool_missing")),
    };
    let tool = registry
        .get_tool(name)
        .ok_or_else(|| ClassifiedError::with_code(format!("tool `{name}` not found"), "tool_missing"))?;

    let mut params = resolve_param_references(options.get("params").cloned().unwrap_or(Value::Null), ctx);
    if options.get("includeContext").and_then(Value::as_bool).unwrap_or(false) {
        if let Value::Object(map) = &mut params {
            let snapshot = ctx.to_object().map_err(|e| ClassifiedError::new(e.to_string()))?;
            map.insert("context".to_string(), snapshot);
        }
    }

    let outcome = tool.execute(params).await;
    if !outcome.success {
        return Err(ClassifiedError::with_code(
            outcome.error.unwrap_or_else(|| "tool execution failed".to_string()),
            "tool_failure",
        ));
    }
    let result = outcome.result.unwrap_or(Value::Null);
    validate_output(&result, options.get("outputSchema"))?;
    Ok(result)
}

async fn execute_function(
    strategy: &AtomicStrategy,
    task: &Arc<Task>,
    ctx: &ExecutionContext,
    options: &Value,
) -> Result<Value, ClassifiedError> {
    let native_fn = strategy
        .native_fns
        .get(&task.id)
        .map(|entry| entry.clone())
        .ok_or_else(|| ClassifiedError::new("no bound function for this task"))?;
    let params = resolve_param_references(options.get("params").cloned().unwrap_or(Value::Null), ctx);
    let requires_context = options.get("requiresContext").and_then(Value::as_bool).unwrap_or(false);
    let result = if requires_context {
        native_fn.call(params, Some(ctx)).await?
    } else {
        native_fn.call(params, None).await?
    };
    validate_output(&result, options.get("outputSchema"))?;
    Ok(result)
}

async fn execute_llm(task: &Arc<Task>, ctx: &ExecutionContext, options: &Value, prompt_template: &str) -> Result<Value, ClassifiedError> {
    let client = match task.lookup("llmClient") {
        Some(ServiceHandle::LlmClient(client)) => client,
        _ => return Err(ClassifiedError::new("SimplePromptClient not configured")),
    };

    let prompt = template_prompt(prompt_template, ctx);
    let mut request = LlmRequest::new(prompt);
    request.system_prompt = options.get("systemPrompt").and_then(Value::as_str).map(str::to_string);
    request.chat_history = options
        .get("chatHistory")
        .and_then(Value::as_array)
        .map(|items| items.clone());
    request.max_tokens = options.get("maxTokens").and_then(Value::as_u64).unwrap_or(1000) as u32;

    let response = client.request(request).await.map_err(|e| ClassifiedError::new(e.to_string()))?;
    let content = response
        .extract_content()
        .ok_or_else(|| ClassifiedError::new("Cannot extract content from LLM response"))?
        .to_string();

    let expect_json = options.get("expectJSON").and_then(Value::as_bool).unwrap_or(false)
        || options.get("parseJSON").and_then(Value::as_bool).unwrap_or(false);

    let result = if expect_json {
        serde_json::from_str(&content).map_err(|_| ClassifiedError::new("Failed to parse JSON"))?
    } else {
        Value::String(content)
    };

    validate_output(&result, options.get("outputSchema"))?;
    Ok(result)
}

/// Resolves `$context.<field>` / `$previous.<i>.<path>` / `$shared.<key>` /
/// `$<taskId>.<path>` references inside `params` before invocation,
/// recursing into nested objects/arrays.
fn resolve_param_references(value: Value, ctx: &ExecutionContext) -> Value {
    match value {
        Value::String(s) => resolve_single_reference(&s, ctx).unwrap_or(Value::String(s)),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, resolve_param_references(v, ctx)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(|v| resolve_param_references(v, ctx)).collect()),
        other => other,
    }
}

fn resolve_single_reference(s: &str, ctx: &ExecutionContext) -> Option<Value> {
    if let Some(rest) = s.strip_prefix("$context.") {
        let object = ctx.to_object().ok()?;
        return ExecutionContext::resolve_path(&object, rest).cloned();
    }
    if let Some(rest) = s.strip_prefix("$previous.") {
        let (index, path) = rest.split_once('.')?;
        let index: usize = index.parse().ok()?;
        let value = ctx.previous_results.get(index)?;
        return ExecutionContext::resolve_path(value, path).cloned();
    }
    if let Some(rest) = s.strip_prefix("$shared.") {
        return ctx.shared_state.get(rest).cloned();
    }
    if let Some(rest) = s.strip_prefix('$') {
        let (task_id, path) = rest.split_once('.')?;
        let value = ctx.dependencies.get(task_id)?;
        return ExecutionContext::resolve_path(value, path).cloned();
    }
    None
}

/// Substitutes `{{name}}` in order from `ctx.sharedState`, then `ctx` scalar
/// fields, leaving unresolved placeholders as literal text.
fn template_prompt(template: &str, ctx: &ExecutionContext) -> String {
    let mut scalars: HashMap<&str, String> = HashMap::new();
    scalars.insert("taskId", ctx.task_id.clone());
    scalars.insert("sessionId", ctx.session_id.clone());
    scalars.insert("depth", ctx.depth.to_string());
    scalars.insert("maxDepth", ctx.max_depth.to_string());

    let mut result = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            result.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let name = after[..end].trim();
        if let Some(value) = ctx.shared_state.get(name).and_then(Value::as_str) {
            result.push_str(value);
        } else if let Some(value) = scalars.get(name) {
            result.push_str(value);
        } else {
            result.push_str("{{");
            result.push_str(name);
            result.push_str("}}");
        }
        rest = &after[end + 2..];
    }
    result.push_str(rest);
    result
}

/// `outputSchema` validation: `{required:true}`, `{type}`, and
/// `{type:'object', properties:{k:{required:true}}}`.
fn validate_output(value: &Value, schema: Option<&Value>) -> Result<(), ClassifiedError> {
    let Some(schema) = schema else {
        return Ok(());
    };
    if schema.get("required").and_then(Value::as_bool).unwrap_or(false) && value.is_null() {
        return Err(ClassifiedError::new("output failed validation: required value is null"));
    }
    if let Some(expected_type) = schema.get("type").and_then(Value::as_str) {
        if !value_matches_type(value, expected_type) {
            return Err(ClassifiedError::new(format!(
                "output failed validation: expected type `{expected_type}`"
            )));
        }
        if expected_type == "object" {
            if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
                for (key, rule) in properties {
                    let required = rule.get("required").and_then(Value::as_bool).unwrap_or(false);
                    if required && value.get(key).is_none() {
                        return Err(ClassifiedError::new(format!(
                            "output failed validation: missing required property `{key}`"
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}

fn value_matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn ctx() -> ExecutionContext {
        ExecutionContext::root("root", "session", 5, Arc::new(EngineConfig::default()))
    }

    #[test]
    fn template_prompt_substitutes_shared_state_then_scalars() {
        let context = ctx().with_shared_state("topic", Value::from("rust"));
        let rendered = template_prompt("writing about {{topic}} for task {{taskId}}", &context);
        assert_eq!(rendered, "writing about rust for task root");
    }

    #[test]
    fn template_prompt_leaves_unknown_placeholders_literal() {
        let context = ctx();
        let rendered = template_prompt("value: {{unknown}}", &context);
        assert_eq!(rendered, "value: {{unknown}}");
    }

    #[test]
    fn resolve_param_references_reads_shared_state() {
        let context = ctx().with_shared_state("k", Value::from("v"));
        let resolved = resolve_param_references(Value::String("$shared.k".to_string()), &context);
        assert_eq!(resolved, Value::from("v"));
    }

    #[test]
    fn resolve_param_references_reads_dependency_by_path() {
        let context = ctx().with_dependency("dep-1", serde_json::json!({"nested": {"value": 42}}));
        let resolved = resolve_param_references(Value::String("$dep-1.nested.value".to_string()), &context);
        assert_eq!(resolved, Value::from(42));
    }

    #[test]
    fn validate_output_rejects_missing_required_property() {
        let schema = serde_json::json!({"type": "object", "properties": {"name": {"required": true}}});
        let value = serde_json::json!({});
        assert!(validate_output(&value, Some(&schema)).is_err());
    }
}
