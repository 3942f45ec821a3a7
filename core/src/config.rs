//! Engine-wide configuration: a `#[derive(TypedBuilder)]` struct with
//! sensible defaults on every field so callers only set what they care
//! about.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

/// Frozen, shared via `Arc` from every [`crate::context::ExecutionContext`]
/// descended from a given root.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct EngineConfig {
    /// TaskQueue concurrency.
    #[builder(default = 4)]
    pub concurrency: usize,

    /// `0` means unbounded.
    #[builder(default = Duration::from_secs(0))]
    pub default_timeout: Duration,

    #[builder(default = 2)]
    pub default_retry_limit: u32,

    #[builder(default = Duration::from_millis(200))]
    pub default_base_retry_delay: Duration,

    #[builder(default = 2.0)]
    pub backoff_factor: f64,

    /// Recursion ceiling for [`crate::context::ExecutionContext::can_decompose`].
    #[builder(default = 5)]
    pub max_depth: u32,

    /// Bound on recovery attempts per `errorClass:taskId` key.
    #[builder(default = 3)]
    pub max_recovery_attempts: u32,

    /// Complexity score threshold above which Recursive decomposes rather
    /// than falling back to direct execution.
    #[builder(default = 0.6)]
    pub decompose_threshold: f64,

    /// Whether the Recursive strategy caches decompositions keyed on
    /// `task.id + canonicalized description`.
    #[builder(default = true)]
    pub use_cache: bool,

    /// Whether Recursive checks ancestors for cycles before decomposing.
    #[builder(default = true)]
    pub cycle_detection: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
