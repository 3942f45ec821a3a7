//! The queued item type: ordering is `(priority desc, added_at asc)`,
//! realized via a custom `Ord` so the admission loop's `BinaryHeap` pops
//! the right item directly.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Per-item queue metadata. `resolve`/`reject` are realized by a oneshot
/// channel held by the caller's `Future` instead, so they are not fields
/// here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct QueuedItemMeta {
    pub id: String,
    pub priority: i32,
    pub added_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub timeout: Option<std::time::Duration>,
    pub retry_base_delay: std::time::Duration,
}

impl QueuedItemMeta {
    pub fn new(priority: i32, max_attempts: u32, timeout: Option<std::time::Duration>, retry_base_delay: std::time::Duration) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            priority,
            added_at: Utc::now(),
            attempts: 0,
            max_attempts,
            timeout,
            retry_base_delay,
        }
    }
}

/// Ordering wrapper consumed by the admission `BinaryHeap`: priority desc,
/// ties broken by FIFO on `added_at`.
pub struct HeapOrderedId {
    pub id: String,
    pub priority: i32,
    pub added_at: DateTime<Utc>,
}

impl PartialEq for HeapOrderedId {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.added_at == other.added_at
    }
}
impl Eq for HeapOrderedId {}

impl PartialOrd for HeapOrderedId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapOrderedId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.added_at.cmp(&self.added_at))
    }
}
