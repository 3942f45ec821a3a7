//! The error taxonomy shared by every component of the engine.
//!
//! One [`thiserror`]-derived enum carries every distinguishable engine
//! failure, and [`ErrorClass`] is the coarser classification used for
//! retry/recovery decisions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// The error classes recognized by [`crate::recovery::ErrorRecovery`] and
/// [`crate::retry::RetryHandler`]. Matched, in this order, against a
/// [`ClassifiedError`]'s message/code, never against a concrete Rust type —
/// classification is deliberately stringly-typed at the boundary since errors
/// may originate from arbitrary external collaborators (tools, LLM clients).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    Network,
    Timeout,
    RateLimit,
    Parsing,
    ToolMissing,
    ToolFailure,
    ToolTimeout,
    LlmFailure,
    LlmTokenLimit,
    AuthError,
    PermissionError,
    ResourceExhausted,
    ValidationError,
    CircularDependency,
    MaxDepthExceeded,
    TaskCancelled,
    QueueDraining,
    Unknown,
}

impl ErrorClass {
    /// The ordered table this classifier is matched against.
    const ORDER: &'static [(&'static str, ErrorClass)] = &[
        ("network", ErrorClass::Network),
        ("timeout", ErrorClass::Timeout),
        ("rate_limit", ErrorClass::RateLimit),
        ("parsing", ErrorClass::Parsing),
        ("tool_missing", ErrorClass::ToolMissing),
        ("tool_failure", ErrorClass::ToolFailure),
        ("tool_timeout", ErrorClass::ToolTimeout),
        ("llm_failure", ErrorClass::LlmFailure),
        ("llm_token_limit", ErrorClass::LlmTokenLimit),
        ("auth_error", ErrorClass::AuthError),
        ("permission_error", ErrorClass::PermissionError),
        ("resource_exhausted", ErrorClass::ResourceExhausted),
        ("validation_error", ErrorClass::ValidationError),
        ("circular dependency", ErrorClass::CircularDependency),
        ("max recursion depth", ErrorClass::MaxDepthExceeded),
    ];

    /// Classifies a [`ClassifiedError`]: an explicit `code` always wins;
    /// otherwise the message is scanned against [`Self::ORDER`].
    pub fn classify(err: &ClassifiedError) -> ErrorClass {
        if let Some(code) = err.code.as_deref() {
            if let Some(class) = Self::from_code(code) {
                return class;
            }
        }
        let haystack = err.message.to_lowercase();
        for (needle, class) in Self::ORDER {
            if haystack.contains(needle) {
                return *class;
            }
        }
        ErrorClass::Unknown
    }

    fn from_code(code: &str) -> Option<ErrorClass> {
        match code {
            "ECONNREFUSED" | "EHOSTUNREACH" => Some(ErrorClass::Network),
            "ETIMEDOUT" => Some(ErrorClass::Timeout),
            "AUTH_ERROR" => Some(ErrorClass::AuthError),
            "PERMISSION_DENIED" => Some(ErrorClass::PermissionError),
            "CIRCULAR_DEPENDENCY" => Some(ErrorClass::CircularDependency),
            // Codes this engine stamps on its own internal errors (queue
            // cancellation, draining) rather than on arbitrary external
            // messages; matched against `ErrorClass`'s own `Display` tag.
            "task_cancelled" => Some(ErrorClass::TaskCancelled),
            "queue_draining" => Some(ErrorClass::QueueDraining),
            "max_depth_exceeded" => Some(ErrorClass::MaxDepthExceeded),
            _ => None,
        }
    }

    /// Fatal classes are never recovered: they surface upward regardless of
    /// retry budget or recovery strategy registration.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorClass::AuthError
                | ErrorClass::PermissionError
                | ErrorClass::CircularDependency
                | ErrorClass::MaxDepthExceeded
        )
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::Network => "network",
            ErrorClass::Timeout => "timeout",
            ErrorClass::RateLimit => "rate_limit",
            ErrorClass::Parsing => "parsing",
            ErrorClass::ToolMissing => "tool_missing",
            ErrorClass::ToolFailure => "tool_failure",
            ErrorClass::ToolTimeout => "tool_timeout",
            ErrorClass::LlmFailure => "llm_failure",
            ErrorClass::LlmTokenLimit => "llm_token_limit",
            ErrorClass::AuthError => "auth_error",
            ErrorClass::PermissionError => "permission_error",
            ErrorClass::ResourceExhausted => "resource_exhausted",
            ErrorClass::ValidationError => "validation_error",
            ErrorClass::CircularDependency => "circular_dependency",
            ErrorClass::MaxDepthExceeded => "max_depth_exceeded",
            ErrorClass::TaskCancelled => "task_cancelled",
            ErrorClass::QueueDraining => "queue_draining",
            ErrorClass::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A boundary-crossing error: whatever a tool, LLM client, or strategy threw,
/// reduced to a message plus an optional machine-readable `code`. This is the
/// shape [`ErrorClass::classify`] operates on; it owns no `source` chain
/// because collaborators live behind `dyn` trait objects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub message: String,
    pub code: Option<String>,
}

impl ClassifiedError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code.into()),
        }
    }

    pub fn class(&self) -> ErrorClass {
        ErrorClass::classify(self)
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ClassifiedError {}

impl From<&str> for ClassifiedError {
    fn from(value: &str) -> Self {
        ClassifiedError::new(value)
    }
}

impl From<String> for ClassifiedError {
    fn from(value: String) -> Self {
        ClassifiedError::new(value)
    }
}

/// A task-related error, shared freely across task boundaries via `Arc`
/// rather than cloned or boxed.
pub type TaskError = Arc<ClassifiedError>;

pub fn task_error(message: impl Into<String>) -> TaskError {
    Arc::new(ClassifiedError::new(message))
}

/// The engine-level error enum: everything that is not a [`TaskError`]
/// produced by user strategies but arises from the substrate itself
/// (malformed queue items, expired deadlines, draining queues, ...).
#[derive(thiserror::Error, Debug, Clone)]
pub enum EngineError {
    #[error("maximum recursion depth exceeded")]
    MaxDepthExceeded,

    #[error("cycle detected: {0}")]
    CycleDetected(String),

    #[error("circular dependency detected among subtasks")]
    CircularDependency,

    #[error("`{0}` timed out")]
    Timeout(String),

    #[error("task was cancelled")]
    TaskCancelled,

    #[error("queue is draining, no further items are accepted")]
    QueueDraining,

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("no queued item found for id `{0}`")]
    UnknownQueueItem(String),

    #[error("maximum recovery attempts exceeded for `{0}`")]
    MaxRecoveryAttemptsExceeded(String),

    #[error("no recovery strategy available for error class `{0}`")]
    NoRecoveryStrategy(ErrorClass),

    #[error("state is locked")]
    StateLocked,

    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(Arc<std::io::Error>),

    #[error(transparent)]
    Json(Arc<serde_json::Error>),
}

impl From<std::io::Error> for EngineError {
    fn from(value: std::io::Error) -> Self {
        EngineError::Io(Arc::new(value))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(value: serde_json::Error) -> Self {
        EngineError::Json(Arc::new(value))
    }
}

impl From<ClassifiedError> for EngineError {
    fn from(value: ClassifiedError) -> Self {
        EngineError::Other(value.message)
    }
}

impl From<EngineError> for ClassifiedError {
    fn from(value: EngineError) -> Self {
        ClassifiedError::new(value.to_string())
    }
}

impl From<TaskError> for EngineError {
    fn from(value: TaskError) -> Self {
        EngineError::Other(value.message.clone())
    }
}
