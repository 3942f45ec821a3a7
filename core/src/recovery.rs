//! [`ErrorRecovery`]: error classification is `errors::ErrorClass` itself;
//! this module adds the recovery-strategy registry, the strategy fallback
//! table, partial-result salvage, and state snapshot/rollback.
//!
//! The fallback table generalizes "try primary, on failure try secondary"
//! into a data-driven lookup rather than a hardcoded pair.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::errors::{ClassifiedError, EngineError, ErrorClass};
use crate::strategy::StrategyKind;

/// One recorded recovery attempt, keyed by `errorClass:taskId`.
#[derive(Debug, Clone)]
pub struct RecoveryAttempt {
    pub key: String,
    pub timestamp: DateTime<Utc>,
    pub error_class: ErrorClass,
    pub success: bool,
    pub strategy_used: Option<StrategyKind>,
}

#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    pub success: bool,
    pub action: String,
    pub fallback_strategy: Option<StrategyKind>,
    pub delay: Option<Duration>,
}

/// A pluggable per-error-class recovery action.
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    async fn recover(&self, error: &ClassifiedError) -> RecoveryOutcome;
}

/// Summary returned by [`ErrorRecovery::recover_partial_results`].
#[derive(Debug, Clone)]
pub struct PartialResults {
    pub partial: bool,
    pub completed: Vec<String>,
    pub pending: Vec<String>,
    pub failed: Vec<String>,
    pub completion_percentage: f64,
    pub error_class: ErrorClass,
    pub can_resume: bool,
    pub resume_strategy: Option<StrategyKind>,
    pub resume_skip_completed: bool,
    pub resume_retry_failed: bool,
    pub resume_continue_from_checkpoint: bool,
    pub recoverable: bool,
}

/// Exposes the subtask partition an in-flight recursive execution needs to
/// salvage partial progress.
pub trait SubtaskInventory {
    fn completed_subtasks(&self) -> Vec<String>;
    fn pending_subtasks(&self) -> Vec<String>;
    fn failed_subtasks(&self) -> Vec<String>;
}

/// A point-in-time snapshot of queue and progress state, restorable by
/// [`ErrorRecovery::rollback_state`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StateSnapshot {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub queue_state: serde_json::Value,
    pub progress_state: serde_json::Value,
    pub context_snapshot: serde_json::Value,
}

/// Collaborator exposing export/import hooks used to build and restore a
/// [`StateSnapshot`].
pub trait Snapshottable {
    fn export_state(&self) -> serde_json::Value;
    fn import_state(&self, state: serde_json::Value);
}

/// Fallback table consulted after N consecutive failures of one strategy on
/// one task.
fn fallback_for(strategy: StrategyKind) -> Option<StrategyKind> {
    match strategy {
        StrategyKind::Recursive => Some(StrategyKind::Atomic),
        StrategyKind::Parallel => Some(StrategyKind::Sequential),
        StrategyKind::Sequential => Some(StrategyKind::Atomic),
        StrategyKind::Atomic => None,
    }
}

/// False for fatal classes or messages matching `circular dependency` or
/// `not found`.
pub fn is_recoverable(error: &ClassifiedError) -> bool {
    let class = error.class();
    if class.is_fatal() {
        return false;
    }
    let message = error.message.to_lowercase();
    !(message.contains("circular dependency") || message.contains("not found"))
}

/// Registry of per-error-class recovery strategies, bounded recovery-attempt
/// history (auto-pruned older than 24h), and the strategy fallback table.
pub struct ErrorRecovery {
    strategies: DashMap<ErrorClass, Arc<dyn RecoveryStrategy>>,
    history: DashMap<String, Vec<RecoveryAttempt>>,
    max_recovery_attempts: usize,
}

impl ErrorRecovery {
    pub fn new(max_recovery_attempts: usize) -> Self {
        Self {
            strategies: DashMap::new(),
            history: DashMap::new(),
            max_recovery_attempts,
        }
    }

    pub fn register(&self, class: ErrorClass, strategy: Arc<dyn RecoveryStrategy>) {
        self.strategies.insert(class, strategy);
    }

    /// Looks up the fallback strategy for `current` and logs the
    /// transition. Never mutates the task.
    pub fn fallback_strategy(
        &self,
        task_id: &str,
        current: StrategyKind,
        error: &ClassifiedError,
    ) -> RecoveryOutcome {
        match fallback_for(current) {
            Some(fallback) => {
                tracing::warn!(task_id, %current, %fallback, error = %error, "falling back to alternate strategy");
                RecoveryOutcome {
                    success: true,
                    action: "fallback".to_string(),
                    fallback_strategy: Some(fallback),
                    delay: None,
                }
            }
            None => {
                tracing::info!(task_id, %current, error = %error, "no fallback strategy available");
                RecoveryOutcome {
                    success: false,
                    action: "no_fallback".to_string(),
                    fallback_strategy: None,
                    delay: None,
                }
            }
        }
    }

    pub fn recover_partial_results(
        &self,
        inventory: &dyn SubtaskInventory,
        error: &ClassifiedError,
    ) -> PartialResults {
        let completed = inventory.completed_subtasks();
        let pending = inventory.pending_subtasks();
        let failed = inventory.failed_subtasks();
        let total = completed.len() + pending.len() + failed.len();
        let completion_percentage = if total == 0 {
            0.0
        } else {
            (completed.len() as f64 / total as f64) * 100.0
        };

        let (resume_strategy, resume_skip_completed, resume_retry_failed, resume_continue_from_checkpoint) =
            if completion_percentage >= 80.0 {
                (Some(StrategyKind::Atomic), true, false, false)
            } else if failed.len() >= 3 {
                (Some(StrategyKind::Sequential), false, true, false)
            } else {
                (Some(StrategyKind::Recursive), false, false, true)
            };

        PartialResults {
            partial: true,
            completed,
            pending,
            failed,
            completion_percentage,
            error_class: error.class(),
            can_resume: is_recoverable(error),
            resume_strategy,
            resume_skip_completed,
            resume_retry_failed,
            resume_continue_from_checkpoint,
            recoverable: is_recoverable(error),
        }
    }

    /// History-bounded, registry-driven recovery dispatch.
    pub async fn recover(&self, error: &ClassifiedError, task_id: &str) -> Result<RecoveryOutcome, EngineError> {
        let class = error.class();
        let key = format!("{class}:{task_id}");

        self.prune_history(&key);

        let attempt_count = self.history.get(&key).map(|entries| entries.len()).unwrap_or(0);
        if attempt_count >= self.max_recovery_attempts {
            return Err(EngineError::MaxRecoveryAttemptsExceeded(task_id.to_string()));
        }

        let Some(strategy) = self.strategies.get(&class).map(|entry| entry.clone()) else {
            return Err(EngineError::NoRecoveryStrategy(class));
        };

        let outcome = strategy.recover(error).await;
        self.history.entry(key.clone()).or_default().push(RecoveryAttempt {
            key,
            timestamp: Utc::now(),
            error_class: class,
            success: outcome.success,
            strategy_used: outcome.fallback_strategy,
        });
        Ok(outcome)
    }

    fn prune_history(&self, key: &str) {
        if let Some(mut entries) = self.history.get_mut(key) {
            let cutoff = Utc::now() - chrono::Duration::hours(24);
            entries.retain(|attempt| attempt.timestamp >= cutoff);
        }
    }

    pub fn create_state_snapshot(
        &self,
        id: impl Into<String>,
        queue: &dyn Snapshottable,
        progress: &dyn Snapshottable,
        context_snapshot: serde_json::Value,
    ) -> StateSnapshot {
        StateSnapshot {
            id: id.into(),
            timestamp: Utc::now(),
            queue_state: queue.export_state(),
            progress_state: progress.export_state(),
            context_snapshot,
        }
    }

    pub fn rollback_state(&self, snapshot: &StateSnapshot, queue: &dyn Snapshottable, progress: &dyn Snapshottable) {
        queue.import_state(snapshot.queue_state.clone());
        progress.import_state(snapshot.progress_state.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedInventory {
        completed: Vec<String>,
        pending: Vec<String>,
        failed: Vec<String>,
    }

    impl SubtaskInventory for FixedInventory {
        fn completed_subtasks(&self) -> Vec<String> {
            self.completed.clone()
        }
        fn pending_subtasks(&self) -> Vec<String> {
            self.pending.clone()
        }
        fn failed_subtasks(&self) -> Vec<String> {
            self.failed.clone()
        }
    }

    #[test]
    fn fallback_table_has_expected_entries() {
        assert_eq!(fallback_for(StrategyKind::Recursive), Some(StrategyKind::Atomic));
        assert_eq!(fallback_for(StrategyKind::Parallel), Some(StrategyKind::Sequential));
        assert_eq!(fallback_for(StrategyKind::Sequential), Some(StrategyKind::Atomic));
        assert_eq!(fallback_for(StrategyKind::Atomic), None);
    }

    #[test]
    fn is_recoverable_rejects_fatal_and_circular() {
        assert!(!is_recoverable(&ClassifiedError::new("auth_error: denied")));
        assert!(!is_recoverable(&ClassifiedError::new("circular dependency detected")));
        assert!(is_recoverable(&ClassifiedError::new("network unreachable")));
    }

    #[test]
    fn partial_results_high_completion_resumes_atomic() {
        let recovery = ErrorRecovery::new(3);
        let inventory = FixedInventory {
            completed: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            pending: vec!["e".into()],
            failed: vec![],
        };
        let result = recovery.recover_partial_results(&inventory, &ClassifiedError::new("timeout"));
        assert_eq!(result.resume_strategy, Some(StrategyKind::Atomic));
        assert!(result.resume_skip_completed);
    }

    #[test]
    fn partial_results_many_failures_resumes_sequential() {
        let recovery = ErrorRecovery::new(3);
        let inventory = FixedInventory {
            completed: vec!["a".into()],
            pending: vec![],
            failed: vec!["b".into(), "c".into(), "d".into()],
        };
        let result = recovery.recover_partial_results(&inventory, &ClassifiedError::new("tool_failure"));
        assert_eq!(result.resume_strategy, Some(StrategyKind::Sequential));
        assert!(result.resume_retry_failed);
    }

    #[tokio::test]
    async fn recover_fails_after_max_attempts() {
        struct AlwaysSucceeds;
        #[async_trait]
        impl RecoveryStrategy for AlwaysSucceeds {
            async fn recover(&self, _error: &ClassifiedError) -> RecoveryOutcome {
                RecoveryOutcome {
                    success: true,
                    action: "retried".into(),
                    fallback_strategy: None,
                    delay: None,
                }
            }
        }
        let recovery = ErrorRecovery::new(2);
        recovery.register(ErrorClass::Network, Arc::new(AlwaysSucceeds));
        let error = ClassifiedError::new("network unreachable");
        recovery.recover(&error, "task-1").await.unwrap();
        recovery.recover(&error, "task-1").await.unwrap();
        let result = recovery.recover(&error, "task-1").await;
        assert!(matches!(result, Err(EngineError::MaxRecoveryAttemptsExceeded(_))));
    }

    #[tokio::test]
    async fn recover_without_registered_strategy_fails() {
        let recovery = ErrorRecovery::new(3);
        let result = recovery.recover(&ClassifiedError::new("parsing failed"), "task-1").await;
        assert!(matches!(result, Err(EngineError::NoRecoveryStrategy(_))));
    }
}
