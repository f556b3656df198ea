//! Manager error types.

use gridrun_core::{JobId, TaskInstanceId};
use thiserror::Error;

/// Errors raised by a task instance.
#[derive(Debug, Clone, Error)]
pub enum InstanceError {
    /// The instance already fired its completion.
    #[error("Task instance {0} is already completed")]
    AlreadyCompleted(TaskInstanceId),

    /// The job id was never issued by this instance.
    #[error("Job {0} does not belong to this task instance")]
    UnknownJob(JobId),

    /// The master could not build the payload of a division.
    #[error("Failed to build job division: {0}")]
    DivisionBuild(String),

    /// The master's host is unreachable.
    #[error("Lost connection to task host: {0}")]
    Transport(String),
}

/// Errors raised while materializing repository handles.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to spawn task host for '{repository}': {reason}")]
    Spawn { repository: String, reason: String },

    #[error("Task host for '{repository}' did not answer after {attempts} attempts")]
    Handshake { repository: String, attempts: u32 },

    #[error("Failed to create master '{type_name}': {reason}")]
    CreateMaster { type_name: String, reason: String },
}

/// Errors raised by repository discovery.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Repository directory not found: {0}")]
    DirectoryNotFound(String),

    #[error("Repository '{0}' contains no task manifest")]
    Empty(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors delivered to an agent waiting for work.
#[derive(Debug, Clone, Error)]
pub enum DistributionError {
    /// Building the division failed; the catalog entry must stop being launched.
    #[error("Task instance {instance_id} failed to build a job: {message}")]
    DivisionBuild {
        instance_id: TaskInstanceId,
        repository: String,
        master_id: String,
        message: String,
    },
}

/// Errors surfaced by management and agent operations.
#[derive(Debug, Error)]
pub enum GridError {
    #[error("Task instance not found: {0}")]
    TaskNotFound(String),

    #[error("Master task not found: {0}")]
    MasterNotFound(String),

    #[error("Slave task not found: {0}")]
    SlaveNotFound(String),

    #[error("Task '{id}' is not a {expected} task")]
    WrongRole { id: String, expected: &'static str },

    #[error("Repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("Repository '{0}' is marked for removal")]
    RepositoryMarkedForRemoval(String),

    #[error("Task '{0}' cannot be loaded")]
    CannotBeLoaded(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Instance(#[from] InstanceError),
}

impl GridError {
    /// Stable error code reported in management responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::TaskNotFound(_) => "TASK_NOT_FOUND",
            Self::MasterNotFound(_) => "MASTER_NOT_FOUND",
            Self::SlaveNotFound(_) => "SLAVE_NOT_FOUND",
            Self::WrongRole { .. } => "WRONG_ROLE",
            Self::RepositoryNotFound(_) => "REPOSITORY_NOT_FOUND",
            Self::RepositoryMarkedForRemoval(_) => "REPOSITORY_MARKED_FOR_REMOVAL",
            Self::CannotBeLoaded(_) => "CANNOT_BE_LOADED",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::InvalidSchedule(_) => "INVALID_SCHEDULE",
            Self::Registry(_) => "HOST_UNAVAILABLE",
            Self::Catalog(_) => "CATALOG_ERROR",
            Self::Instance(_) => "TASK_ERROR",
        }
    }
}
