//! Core domain errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Core domain errors for GridRun.
#[derive(Debug, Error)]
pub enum CoreError {
    /// No factory registered under this type name.
    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),

    /// Invalid task manifest.
    #[error("Invalid task manifest: {0}")]
    InvalidManifest(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by user task callbacks or by the channel used to reach them.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum TaskError {
    /// The callback itself reported a failure.
    #[error("{0}")]
    Callback(String),

    /// A division descriptor or payload could not be encoded or decoded.
    #[error("Division serialization failed: {0}")]
    Serialization(String),

    /// The object hosting the task is unreachable (crashed actor, lost process).
    #[error("Task host unreachable: {0}")]
    Transport(String),
}

impl TaskError {
    /// Shorthand for a callback failure.
    pub fn callback(message: impl Into<String>) -> Self {
        Self::Callback(message.into())
    }

    /// Returns true if the error means the hosting side is gone.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
