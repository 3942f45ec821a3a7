//! Queue statistics snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub total_added: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub average_duration_ms: f64,
    pub success_rate: f64,
}

/// The live counters a running queue updates; [`QueueStats`] is the
/// immutable snapshot taken from these on `getStats()`.
#[derive(Default)]
pub struct QueueCounters {
    pub total_added: AtomicU64,
    pub total_completed: AtomicU64,
    pub total_failed: AtomicU64,
    pub total_duration_ms: AtomicU64,
}

impl QueueCounters {
    pub fn snapshot(&self) -> QueueStats {
        let total_added = self.total_added.load(Ordering::SeqCst);
        let total_completed = self.total_completed.load(Ordering::SeqCst);
        let total_failed = self.total_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let terminal = total_completed + total_failed;
        QueueStats {
            total_added,
            total_completed,
            total_failed,
            average_duration_ms: if total_completed == 0 {
                0.0
            } else {
                total_duration_ms as f64 / total_completed as f64
            },
            success_rate: if terminal == 0 {
                0.0
            } else {
                total_completed as f64 / terminal as f64
            },
        }
    }
}
