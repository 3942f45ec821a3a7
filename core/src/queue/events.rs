//! `TaskQueue` lifecycle events, broadcast on a `tokio::sync::broadcast`
//! channel rather than maintained via a hand-rolled observer list.

use serde_json::Value;

#[derive(Debug, Clone)]
pub enum QueueEvent {
    Queued { id: String },
    Started { id: String },
    Completed { id: String, result: Value, duration_ms: u64 },
    Failed { id: String, error: String, attempts: u32 },
    Retrying { id: String, attempts: u32, max_attempts: u32 },
    Idle,
    Drained,
    Cancelled { id: String },
}
