//! [`ExecutionStrategy`] and the four concrete strategies, selected by a
//! [`resolver::StrategyResolver`].

pub mod atomic;
pub mod parallel;
pub mod recursive;
pub mod resolver;
pub mod sequential;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::errors::ClassifiedError;
use crate::task::Task;

/// Identifies which concrete strategy produced or should handle a result;
/// used by the [`crate::recovery::ErrorRecovery`] fallback table and by
/// [`resolver::StrategyResolver`] registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyKind {
    Atomic,
    Sequential,
    Parallel,
    Recursive,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StrategyKind::Atomic => "atomic",
            StrategyKind::Sequential => "sequential",
            StrategyKind::Parallel => "parallel",
            StrategyKind::Recursive => "recursive",
        };
        f.write_str(s)
    }
}

/// The result of running a strategy against a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyOutcome {
    pub success: bool,
    pub result: Value,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl StrategyOutcome {
    pub fn success(result: Value) -> Self {
        Self {
            success: true,
            result,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A strategy's self-reported cost/time estimate for a task, used to compare
/// candidate strategies before committing to one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplexityEstimate {
    pub estimated_time_ms: u64,
    pub estimated_cost: f64,
    pub confidence: f64,
    pub reasoning: String,
}

/// The common strategy interface: whether it can handle a task, how to run
/// it, and a cost estimate for comparison against other strategies.
#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    fn can_handle(&self, task: &Task, ctx: &ExecutionContext) -> bool;

    async fn execute(&self, task: Arc<Task>, ctx: ExecutionContext) -> Result<StrategyOutcome, ClassifiedError>;

    fn estimate_complexity(&self, task: &Task, ctx: &ExecutionContext) -> ComplexityEstimate;
}
