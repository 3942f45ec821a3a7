//! [`TaskQueue`]: priority queue with bounded parallelism, per-item timeout,
//! retry with exponential backoff, pause/resume/drain, event stream, and
//! statistics.
//!
//! A single background `tokio::task` owns the queue's mutable state and
//! reacts to a `tokio::sync::Notify`, admitting work through a
//! `tokio::sync::Semaphore` sized to `concurrency`, and broadcasting
//! [`events::QueueEvent`]s to any subscriber.

pub mod events;
pub mod item;
pub mod stats;

use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot, Mutex, Notify, Semaphore};

use crate::errors::{ClassifiedError, EngineError};
use events::QueueEvent;
use item::{HeapOrderedId, ItemState, QueuedItemMeta};
use stats::{QueueCounters, QueueStats};

pub type QueueFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<Value, ClassifiedError>> + Send>> + Send + Sync>;

/// Concurrency must be at least 1; a zero timeout means unbounded.
#[derive(Debug, Clone)]
pub struct TaskQueueConfig {
    pub concurrency: usize,
    pub default_timeout: Option<Duration>,
    pub default_retry_limit: u32,
    pub default_base_retry_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            default_timeout: None,
            default_retry_limit: 2,
            default_base_retry_delay: Duration::from_millis(200),
            backoff_factor: 2.0,
        }
    }
}

/// Per-call overrides accepted by [`TaskQueue::add`].
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    pub id: Option<String>,
    pub priority: Option<i32>,
    pub timeout: Option<Duration>,
    pub retry_limit: Option<u32>,
}

struct QueueEntry {
    meta: QueuedItemMeta,
    task_fn: QueueFn,
    resolver: Option<oneshot::Sender<Result<Value, ClassifiedError>>>,
    state: ItemState,
}

struct QueueState {
    heap: Mutex<BinaryHeap<HeapOrderedId>>,
    entries: DashMap<String, QueueEntry>,
}

/// Current snapshot returned by [`TaskQueue::get_status`].
#[derive(Debug, Clone, Copy)]
pub struct QueueStatus {
    pub queued: usize,
    pub running: usize,
    pub paused: bool,
    pub draining: bool,
}

pub struct TaskQueue {
    config: TaskQueueConfig,
    state: Arc<QueueState>,
    semaphore: Arc<Semaphore>,
    notify: Arc<Notify>,
    paused: Arc<AtomicBool>,
    draining: Arc<AtomicBool>,
    running: Arc<std::sync::atomic::AtomicUsize>,
    counters: Arc<QueueCounters>,
    events_tx: broadcast::Sender<QueueEvent>,
    drained_notify: Arc<Notify>,
    supervisor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TaskQueue {
    pub fn new(config: TaskQueueConfig) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(1024);
        let queue = Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(config.concurrency.max(1))),
            state: Arc::new(QueueState {
                heap: Mutex::new(BinaryHeap::new()),
                entries: DashMap::new(),
            }),
            notify: Arc::new(Notify::new()),
            paused: Arc::new(AtomicBool::new(false)),
            draining: Arc::new(AtomicBool::new(false)),
            running: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            counters: Arc::new(QueueCounters::default()),
            events_tx,
            drained_notify: Arc::new(Notify::new()),
            config,
            supervisor: Mutex::new(None),
        });
        let handle = tokio::spawn(run_supervisor(queue.clone()));
        if let Ok(mut guard) = queue.supervisor.try_lock() {
            *guard = Some(handle);
        }
        queue
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events_tx.subscribe()
    }

    /// Enqueues a unit of work and returns its eventual result. Rejects
    /// immediately with [`EngineError::QueueDraining`] once `drain()` has
    /// started.
    pub async fn add(&self, task_fn: QueueFn, options: AddOptions) -> Result<Value, EngineError> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(EngineError::QueueDraining);
        }

        let meta = QueuedItemMeta::new(
            options.priority.unwrap_or(0),
            options.retry_limit.unwrap_or(self.config.default_retry_limit) + 1,
            options.timeout.or(self.config.default_timeout),
            self.config.default_base_retry_delay,
        );
        let id = options.id.unwrap_or_else(|| meta.id.clone());
        let mut meta = meta;
        meta.id = id.clone();

        let (tx, rx) = oneshot::channel();
        {
            let mut heap = self.state.heap.lock().await;
            heap.push(HeapOrderedId {
                id: id.clone(),
                priority: meta.priority,
                added_at: meta.added_at,
            });
        }
        self.state.entries.insert(
            id.clone(),
            QueueEntry {
                meta,
                task_fn,
                resolver: Some(tx),
                state: ItemState::Queued,
            },
        );
        self.counters.total_added.fetch_add(1, Ordering::SeqCst);
        let _ = self.events_tx.send(QueueEvent::Queued { id });
        self.notify.notify_waiters();

        rx.await
            .map_err(|_| EngineError::Other("queue item dropped before completion".to_string()))?
            .map_err(EngineError::from)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Drops all queued (not running) items; their futures fail with
    /// `cancelled`. Returns the number of items dropped.
    pub async fn clear(&self) -> usize {
        let mut heap = self.state.heap.lock().await;
        let mut cleared = 0;
        while let Some(item) = heap.pop() {
            if let Some((_, mut entry)) = self.state.entries.remove(&item.id) {
                if let Some(resolver) = entry.resolver.take() {
                    let _ = resolver.send(Err(ClassifiedError::with_code("cancelled", "task_cancelled")));
                }
                let _ = self.events_tx.send(QueueEvent::Cancelled { id: item.id });
                cleared += 1;
            }
        }
        cleared
    }

    /// Cancels a queued item by id. Has no effect on an item that is already
    /// running.
    pub async fn cancel(&self, id: &str) -> bool {
        let mut heap = self.state.heap.lock().await;
        let mut rebuilt = BinaryHeap::new();
        let mut found = false;
        while let Some(item) = heap.pop() {
            if item.id == id {
                found = true;
                continue;
            }
            rebuilt.push(item);
        }
        *heap = rebuilt;
        drop(heap);

        if found {
            if let Some((_, mut entry)) = self.state.entries.remove(id) {
                if let Some(resolver) = entry.resolver.take() {
                    let _ = resolver.send(Err(ClassifiedError::with_code("cancelled", "task_cancelled")));
                }
            }
            let _ = self.events_tx.send(QueueEvent::Cancelled { id: id.to_string() });
        }
        found
    }

    /// Stops admitting new items and resolves once every running and
    /// queued item has reached a terminal state.
    pub async fn drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        self.wait_for_all().await;
        let _ = self.events_tx.send(QueueEvent::Drained);
    }

    /// Resolves once the queue has no queued or running items left.
    pub async fn wait_for_all(&self) {
        loop {
            let empty = self.state.entries.is_empty();
            if empty {
                return;
            }
            self.drained_notify.notified().await;
        }
    }

    /// Adjusts how many items may run concurrently. May immediately admit
    /// more runners; never interrupts running items. Implemented by
    /// swapping the semaphore's permit count via `add_permits`; shrinking is
    /// best-effort since already-acquired permits finish naturally.
    pub fn set_concurrency(&self, n: usize) {
        let current = self.semaphore.available_permits();
        let target = n.max(1);
        if target > current {
            self.semaphore.add_permits(target - current);
        }
        self.notify.notify_waiters();
    }

    pub fn get_status(&self) -> QueueStatus {
        QueueStatus {
            queued: self.state.entries.len().saturating_sub(self.running.load(Ordering::SeqCst)),
            running: self.running.load(Ordering::SeqCst),
            paused: self.paused.load(Ordering::SeqCst),
            draining: self.draining.load(Ordering::SeqCst),
        }
    }

    pub fn get_stats(&self) -> QueueStats {
        self.counters.snapshot()
    }
}

async fn run_supervisor(queue: Arc<TaskQueue>) {
    loop {
        if queue.draining.load(Ordering::SeqCst) && queue.state.entries.is_empty() {
            return;
        }

        if queue.paused.load(Ordering::SeqCst) {
            queue.notify.notified().await;
            continue;
        }

        let next_id = {
            let mut heap = queue.state.heap.lock().await;
            heap.pop().map(|item| item.id)
        };

        let Some(id) = next_id else {
            if queue.state.entries.is_empty() {
                let _ = queue.events_tx.send(QueueEvent::Idle);
                queue.drained_notify.notify_waiters();
            }
            tokio::select! {
                _ = queue.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
            continue;
        };

        let Ok(permit) = queue.semaphore.clone().acquire_owned().await else {
            return;
        };
        queue.running.fetch_add(1, Ordering::SeqCst);
        let queue_for_task = queue.clone();
        tokio::spawn(async move {
            run_item(&queue_for_task, &id).await;
            queue_for_task.running.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
            queue_for_task.notify.notify_waiters();
            queue_for_task.drained_notify.notify_waiters();
        });
    }
}

async fn run_item(queue: &Arc<TaskQueue>, id: &str) {
    let _ = queue.events_tx.send(QueueEvent::Started { id: id.to_string() });
    let started_at = std::time::Instant::now();

    loop {
        let (task_fn, timeout, max_attempts, attempt, retry_base_delay, backoff_factor) = {
            let Some(mut entry) = queue.state.entries.get_mut(id) else {
                return;
            };
            entry.meta.attempts += 1;
            entry.state = ItemState::Running;
            (
                entry.task_fn.clone(),
                entry.meta.timeout,
                entry.meta.max_attempts,
                entry.meta.attempts,
                entry.meta.retry_base_delay,
                queue.config.backoff_factor,
            )
        };

        let attempt_result = match timeout {
            Some(duration) => match tokio::time::timeout(duration, task_fn()).await {
                Ok(result) => result,
                Err(_) => Err(ClassifiedError::with_code(format!("`{id}` timed out"), "timeout")),
            },
            None => task_fn().await,
        };

        match attempt_result {
            Ok(value) => {
                let duration_ms = started_at.elapsed().as_millis() as u64;
                queue.counters.total_completed.fetch_add(1, Ordering::SeqCst);
                queue.counters.total_duration_ms.fetch_add(duration_ms, Ordering::SeqCst);
                if let Some((_, mut entry)) = queue.state.entries.remove(id) {
                    if let Some(resolver) = entry.resolver.take() {
                        let _ = resolver.send(Ok(value.clone()));
                    }
                }
                let _ = queue.events_tx.send(QueueEvent::Completed {
                    id: id.to_string(),
                    result: value,
                    duration_ms,
                });
                return;
            }
            Err(error) => {
                if attempt < max_attempts {
                    let _ = queue.events_tx.send(QueueEvent::Retrying {
                        id: id.to_string(),
                        attempts: attempt,
                        max_attempts,
                    });
                    let delay = retry_base_delay.mul_f64(backoff_factor.powi(attempt as i32 - 1));
                    tokio::time::sleep(delay).await;
                    continue;
                }
                queue.counters.total_failed.fetch_add(1, Ordering::SeqCst);
                if let Some((_, mut entry)) = queue.state.entries.remove(id) {
                    if let Some(resolver) = entry.resolver.take() {
                        let _ = resolver.send(Err(error.clone()));
                    }
                }
                let _ = queue.events_tx.send(QueueEvent::Failed {
                    id: id.to_string(),
                    error: error.message,
                    attempts: attempt,
                });
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn boxed_fn<F, Fut>(f: F) -> QueueFn
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ClassifiedError>> + Send + 'static,
    {
        Arc::new(move || Box::pin(f()) as Pin<Box<dyn Future<Output = Result<Value, ClassifiedError>> + Send>>)
    }

    #[tokio::test]
    async fn add_resolves_with_the_task_fn_result() {
        let queue = TaskQueue::new(TaskQueueConfig::default());
        let result = queue
            .add(boxed_fn(|| async { Ok(Value::from(42)) }), AddOptions::default())
            .await
            .unwrap();
        assert_eq!(result, Value::from(42));
    }

    #[tokio::test]
    async fn add_after_drain_is_rejected() {
        let queue = TaskQueue::new(TaskQueueConfig::default());
        queue.draining.store(true, Ordering::SeqCst);
        let result = queue.add(boxed_fn(|| async { Ok(Value::Null) }), AddOptions::default()).await;
        assert!(matches!(result, Err(EngineError::QueueDraining)));
    }

    #[tokio::test]
    async fn retries_until_success_within_limit() {
        let queue = TaskQueue::new(TaskQueueConfig {
            default_base_retry_delay: Duration::from_millis(1),
            ..Default::default()
        });
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let task_fn = boxed_fn(move || {
            let calls = calls_clone.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(ClassifiedError::new("transient"))
                } else {
                    Ok(Value::from("done"))
                }
            }
        });
        let result = queue
            .add(
                task_fn,
                AddOptions {
                    retry_limit: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(result, Value::from("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn concurrency_bounds_simultaneous_running_items() {
        let queue = TaskQueue::new(TaskQueueConfig {
            concurrency: 2,
            ..Default::default()
        });
        let concurrent = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let max_seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let task_fn = boxed_fn(move || {
                    let concurrent = concurrent.clone();
                    let max_seen = max_seen.clone();
                    async move {
                        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                        Ok(Value::Null)
                    }
                });
                queue.add(task_fn, AddOptions::default()).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }
}
