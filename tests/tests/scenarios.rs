//! End-to-end scenario tests exercising the engine the way a caller would:
//! through `TaskQueue`, `TaskManager`, and `Task::receive_message` rather
//! than any single module's internals.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use task_engine_core::config::EngineConfig;
use task_engine_core::context::ExecutionContext;
use task_engine_core::errors::ClassifiedError;
use task_engine_core::external::{Tool, ToolOutcome, ToolRegistry};
use task_engine_core::manager::TaskManager;
use task_engine_core::queue::events::QueueEvent;
use task_engine_core::queue::{AddOptions, QueueFn, TaskQueue, TaskQueueConfig};
use task_engine_core::strategy::atomic::AtomicStrategy;
use task_engine_core::strategy::parallel::ParallelStrategy;
use task_engine_core::strategy::recursive::RecursiveStrategy;
use task_engine_core::strategy::resolver::StrategyResolver;
use task_engine_core::strategy::sequential::SequentialStrategy;
use task_engine_core::task::{ServiceHandle, TaskMessage};

fn default_resolver() -> StrategyResolver {
    StrategyResolver::with_defaults(
        Arc::new(RecursiveStrategy::new()),
        Arc::new(ParallelStrategy::new()),
        Arc::new(SequentialStrategy::new()),
        Arc::new(AtomicStrategy::new()),
    )
}

/// A tool that hands back whatever it was given under `params.value`,
/// standing in for a real tool call across the scenario tests below.
struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    async fn execute(&self, params: Value) -> ToolOutcome {
        ToolOutcome::ok(params.get("value").cloned().unwrap_or(Value::Null))
    }
}

struct EchoRegistry;

impl ToolRegistry for EchoRegistry {
    fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        (name == "echo").then(|| Arc::new(EchoTool) as Arc<dyn Tool>)
    }
}

/// Scenario 1: queue(concurrency=2), 5 tasks each sleeping 100ms. All 5
/// complete; observed max concurrent <= 2.
#[tokio::test]
async fn queue_concurrency_bounds_five_sleeping_tasks() {
    let queue = TaskQueue::new(TaskQueueConfig {
        concurrency: 2,
        ..Default::default()
    });
    let concurrent = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for i in 0..5 {
        let queue = queue.clone();
        let concurrent = concurrent.clone();
        let max_seen = max_seen.clone();
        handles.push(tokio::spawn(async move {
            let task_fn: QueueFn = Arc::new(move || {
                let concurrent = concurrent.clone();
                let max_seen = max_seen.clone();
                Box::pin(async move {
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                    Ok(Value::from(i))
                }) as Pin<Box<dyn Future<Output = Result<Value, ClassifiedError>> + Send>>
            });
            queue.add(task_fn, AddOptions::default()).await
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }
    assert_eq!(results.len(), 5);
    assert!(max_seen.load(Ordering::SeqCst) <= 2);
}

/// Scenario 2: pause, add priorities [1, 10, 5, 0] in that order, resume.
/// Expected start order: 10, 5, 1, 0.
#[tokio::test]
async fn priority_ordering_runs_highest_first() {
    let queue = TaskQueue::new(TaskQueueConfig {
        concurrency: 1,
        ..Default::default()
    });
    let mut events = queue.subscribe();
    queue.pause();

    let priorities = [1, 10, 5, 0];
    let mut handles = Vec::new();
    for priority in priorities {
        let queue = queue.clone();
        let id = format!("p{priority}");
        handles.push(tokio::spawn(async move {
            let task_fn: QueueFn = Arc::new(|| Box::pin(async { Ok(Value::Null) }));
            queue
                .add(
                    task_fn,
                    AddOptions {
                        id: Some(id),
                        priority: Some(priority),
                        ..Default::default()
                    },
                )
                .await
        }));
    }
    // Give every `add` a chance to land in the heap before the paused
    // supervisor is allowed to start popping from it.
    tokio::time::sleep(Duration::from_millis(50)).await;
    queue.resume();

    let mut started_order = Vec::new();
    while started_order.len() < priorities.len() {
        if let Ok(QueueEvent::Started { id }) = events.recv().await {
            started_order.push(id);
        }
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(started_order, vec!["p10", "p5", "p1", "p0"]);
}

/// Scenario 3: a task that throws on first call and returns "ok" on the
/// second, with retryLimit=2. Resolves "ok" after exactly 2 attempts;
/// `retrying{attempts:1,maxAttempts:3}` emitted once.
#[tokio::test]
async fn retry_recovers_after_one_transient_failure() {
    let queue = TaskQueue::new(TaskQueueConfig {
        default_base_retry_delay: Duration::from_millis(1),
        ..Default::default()
    });
    let mut events = queue.subscribe();
    let calls = Arc::new(AtomicU32::new(0));
    let calls_for_fn = calls.clone();
    let task_fn: QueueFn = Arc::new(move || {
        let calls = calls_for_fn.clone();
        Box::pin(async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ClassifiedError::new("transient"))
            } else {
                Ok(Value::from("ok"))
            }
        })
    });

    let result = queue
        .add(
            task_fn,
            AddOptions {
                retry_limit: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(result, Value::from("ok"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let mut retrying_events = 0;
    while let Ok(event) = events.try_recv() {
        if let QueueEvent::Retrying { attempts, max_attempts, .. } = event {
            retrying_events += 1;
            assert_eq!(attempts, 1);
            assert_eq!(max_attempts, 3);
        }
    }
    assert_eq!(retrying_events, 1);
}

/// Scenario 4: parent with three subtasks {sub-1:"a", sub-2:"b", sub-3:"c"},
/// aggregationType="array". Expected result: ["a","b","c"] in input order
/// regardless of completion order.
#[tokio::test]
async fn parallel_aggregation_preserves_input_order() {
    let manager = TaskManager::new(default_resolver());
    let options = json!({
        "subtasks": [
            {"description": "sub-1", "tool": "echo", "params": {"value": "a"}},
            {"description": "sub-2", "tool": "echo", "params": {"value": "b"}},
            {"description": "sub-3", "tool": "echo", "params": {"value": "c"}},
        ],
        "aggregationType": "array",
    });
    let probe_ctx = ExecutionContext::root("probe", "session", 5, Arc::new(EngineConfig::default()));
    let parent = manager.create_task("fan out", None, Some(Arc::new(ParallelStrategy::new())), Some(options), &probe_ctx);
    parent.set_service("toolRegistry", ServiceHandle::ToolRegistry(Arc::new(EchoRegistry)));

    let ctx = ExecutionContext::root(parent.id.clone(), "session", 5, Arc::new(EngineConfig::default()));
    let outcome = parent.receive_message(TaskMessage::Start, &ctx).await;
    assert!(outcome.success, "expected success, got {:?}", outcome.result);
    assert_eq!(outcome.result, json!(["a", "b", "c"]));
}

/// Builds a decomposition that always proposes one subtask identical in
/// shape to its parent, nested `levels` deep — enough to outlast any
/// `maxDepth` this test exercises.
fn self_similar_decomposition(levels: u32) -> Value {
    if levels == 0 {
        return json!({"recursive": true});
    }
    json!({
        "recursive": true,
        "decomposition": {
            "subtasks": [{
                "id": "child",
                "description": "recurse",
                "options": self_similar_decomposition(levels - 1),
            }],
            "composition": "sequential",
        },
    })
}

/// Scenario 5: Recursive task with maxDepth=3, decomposition always
/// returning one subtask identical to the parent. Fails at depth 3 with
/// `max_depth_exceeded`.
#[tokio::test]
async fn recursive_strategy_fails_once_max_depth_is_reached() {
    let manager = TaskManager::new(default_resolver());
    let config = Arc::new(EngineConfig::builder().max_depth(3).use_cache(false).build());
    let probe_ctx = ExecutionContext::root("probe", "session", 3, config.clone());
    let root = manager.create_task(
        "recurse",
        None,
        Some(Arc::new(RecursiveStrategy::new())),
        Some(self_similar_decomposition(10)),
        &probe_ctx,
    );

    let ctx = ExecutionContext::root(root.id.clone(), "session", 3, config);
    let outcome = root.receive_message(TaskMessage::Start, &ctx).await;
    assert!(!outcome.success);
    assert_eq!(outcome.result.as_str(), Some("Maximum recursion depth exceeded"));
}

/// Scenario 6: child completes with artifacts {A, B}; parent's store ends
/// up holding both with identical (value, description, type), and an
/// explicit `completed` notification is acknowledged.
#[tokio::test]
async fn child_completion_propagates_artifacts_to_parent() {
    let manager = TaskManager::new(default_resolver());
    let probe_ctx = ExecutionContext::root("probe", "session", 5, Arc::new(EngineConfig::default()));
    let parent = manager.create_task("parent", None, None, None, &probe_ctx);
    let child = manager.create_task(
        "child",
        Some(parent.clone()),
        Some(Arc::new(AtomicStrategy::new())),
        Some(json!({"tool": "echo", "params": {"value": "done"}})),
        &probe_ctx,
    );
    child.set_service("toolRegistry", ServiceHandle::ToolRegistry(Arc::new(EchoRegistry)));
    child.store_artifact("A", json!(1), "first artifact", "number").unwrap();
    child.store_artifact("B", json!("two"), "second artifact", "string").unwrap();

    let ctx = ExecutionContext::root(child.id.clone(), "session", 5, Arc::new(EngineConfig::default()));
    let outcome = child.receive_message(TaskMessage::Start, &ctx).await;
    assert!(outcome.success, "expected success, got {:?}", outcome.result);

    let stored: HashMap<_, _> = parent.get_all_artifacts().into_iter().map(|a| (a.name.clone(), a)).collect();
    assert_eq!(stored["A"].value, json!(1));
    assert_eq!(stored["A"].description, "first artifact");
    assert_eq!(stored["A"].artifact_type, "number");
    assert_eq!(stored["B"].value, json!("two"));
    assert_eq!(stored["B"].description, "second artifact");
    assert_eq!(stored["B"].artifact_type, "string");

    let completed = parent.receive_message(TaskMessage::Completed { result: json!("done") }, &ctx).await;
    assert!(completed.acknowledged);
}
