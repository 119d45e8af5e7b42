use std::time::Duration;

use runq_protocol::RunState;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors surfaced by the queue core.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is full ({queued}/{capacity})")]
    QueueFull { queued: usize, capacity: usize },

    #[error("run {0} already exists")]
    Duplicate(String),

    #[error("run {0} not found")]
    NotFound(String),

    #[error("cannot {operation} run {run_id} in state {state}")]
    IllegalTransition {
        run_id: String,
        state: RunState,
        operation: &'static str,
    },

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("run exceeded timeout of {0:?}")]
    Timeout(Duration),

    #[error("store error: {0}")]
    Store(#[source] anyhow::Error),
}

impl QueueError {
    pub(crate) fn store(err: anyhow::Error) -> Self {
        QueueError::Store(err)
    }
}

/// Failure raised by an executor while producing output.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The requested shape (async stream / blocking iterator) is not
    /// provided by this executor; the worker falls through to the next one.
    #[error("streaming not supported by this executor")]
    Unsupported,

    #[error("{0}")]
    Failed(String),
}

impl ExecutorError {
    pub fn failed(message: impl Into<String>) -> Self {
        ExecutorError::Failed(message.into())
    }
}
