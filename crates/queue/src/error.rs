//! Queue error model.

use baton_core::CoreError;
use baton_store::StoreError;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors surfaced to queue callers.
///
/// Processing failures are deliberately absent: they never reach the caller
/// and only show up as error count / backoff state.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Invalid configuration; the queue refuses to start.
    #[error("invalid queue configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid item: {0}")]
    Item(#[from] CoreError),

    /// The queue instance has been destroyed or deactivated.
    #[error("queue instance destroyed")]
    Destroyed,
}

impl QueueError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Outcome reported by a processor for one batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessError {
    #[error("processing failed: {0}")]
    Failed(String),

    /// No result arrived within the process timeout.
    #[error("task timeout")]
    Timeout,
}

impl ProcessError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}
