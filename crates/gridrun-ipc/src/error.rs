//! Error types for the task-host protocol.

use gridrun_core::TaskError;
use thiserror::Error;

/// Errors that can occur while talking to a task host.
#[derive(Debug, Error)]
pub enum IpcError {
    /// Reading or writing a frame failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame did not hold a valid envelope.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The connection to the host is gone.
    #[error("Connection to task host lost")]
    ConnectionLost,

    /// No response within the call timeout.
    #[error("Timeout waiting for task host response")]
    Timeout,

    /// The host ran the request and the task reported an error.
    #[error("Task error: {0}")]
    Task(TaskError),

    /// The host answered with a response of the wrong kind.
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl From<IpcError> for TaskError {
    fn from(e: IpcError) -> Self {
        match e {
            IpcError::Task(inner) => inner,
            other => TaskError::Transport(other.to_string()),
        }
    }
}
