//! Error types shared across the scheduler, the submission surface and the router.

use thiserror::Error;
use crate::task::TaskId;

/// Errors returned directly to a submitting caller.
///
/// These never travel through a result channel: they are produced at the
/// submission boundary, before or instead of a task being admitted.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Malformed task parameters; the task never entered the queue.
    #[error("invalid task: {0}")]
    Validation(String),

    /// The bounded queue is saturated. Retry later.
    #[error("no slot available: task queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// No result arrived before the deadline. The task keeps running.
    #[error("timed out waiting for a result of task {0}")]
    Timeout(TaskId),

    /// The task id has no open result channel (never submitted, already
    /// finished, or its channel was taken as a stream).
    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    /// The scheduler has stopped accepting work.
    #[error("server is shutting down")]
    ShuttingDown,

    /// Startup configuration was rejected.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Per-task failures, delivered as the final payload of a task.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskError {
    #[error("prompt of {n_prompt} tokens does not fit the slot context of {n_ctx} tokens")]
    ContextOverflow { n_prompt: usize, n_ctx: usize },

    #[error("engine failure: {0}")]
    Engine(String),

    #[error("invalid slot id {0}")]
    InvalidSlot(usize),

    #[error("slot file error: {0}")]
    SlotFile(String),

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl TaskError {
    /// Convert a caught panic payload into a uniform internal error.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown error".to_string()
        };
        TaskError::Internal(message)
    }
}

/// Failure reported by an [`Engine`](crate::engine::Engine) implementation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("decode failed: {0}")]
    Decode(String),

    #[error("no state for sequence {0}")]
    MissingState(usize),

    #[error("state blob rejected: {0}")]
    InvalidState(String),

    #[error("{0}")]
    Other(String),
}

impl From<EngineError> for TaskError {
    fn from(err: EngineError) -> Self {
        TaskError::Engine(err.to_string())
    }
}

/// A model instance could not be brought up by the router.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("failed to spawn instance for model '{model}': {reason}")]
pub struct SpawnError {
    pub model: String,
    pub reason: String,
}

/// Errors surfaced by [`InstanceRouter::route`](crate::router::InstanceRouter::route).
#[cfg(feature = "router")]
#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Server(#[from] ServerError),
}

/// Result alias for submission-level operations.
pub type Result<T> = std::result::Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ServerError::QueueFull { capacity: 8 };
        assert_eq!(err.to_string(), "no slot available: task queue is full (capacity 8)");

        let err = TaskError::ContextOverflow { n_prompt: 600, n_ctx: 512 };
        assert!(err.to_string().contains("600"));

        let err: TaskError = EngineError::Decode("oom".into()).into();
        assert_eq!(err, TaskError::Engine("decode failed: oom".into()));
    }

    #[test]
    fn test_panic_payload_conversion() {
        let caught = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(TaskError::from_panic(caught), TaskError::Internal("boom".into()));

        let caught = std::panic::catch_unwind(|| panic!("{} {}", "formatted", 1)).unwrap_err();
        assert_eq!(TaskError::from_panic(caught), TaskError::Internal("formatted 1".into()));
    }
}
