//! Job, descriptor and result types exchanged with agents.

use serde::{Deserialize, Serialize};

use crate::{JobId, TaskInstanceId};

/// One unit of work handed to an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,

    /// Name of the master task that produced the job.
    pub task_name: String,

    /// Opaque payload built by the master for this division.
    pub payload: String,
}

/// What an agent receives when it asks for work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// False when no work is available; the agent polls again later.
    pub enabled: bool,

    pub instance_id: Option<TaskInstanceId>,

    /// Plugin type name of the slave to run.
    pub slave_type_name: Option<String>,

    /// Repository holding the slave binary.
    pub repository: Option<String>,

    /// Checksum of the slave binary, lets agents reuse cached bytes.
    pub slave_checksum: Option<String>,

    pub job: Option<Job>,
}

impl TaskDescriptor {
    /// A descriptor carrying no work.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            instance_id: None,
            slave_type_name: None,
            repository: None,
            slave_checksum: None,
            job: None,
        }
    }

    /// A descriptor for a dispatched job.
    pub fn enabled(instance_id: TaskInstanceId, job: Job) -> Self {
        Self {
            enabled: true,
            instance_id: Some(instance_id),
            slave_type_name: None,
            repository: None,
            slave_checksum: None,
            job: Some(job),
        }
    }

    /// Builder method to describe the slave that executes the job.
    pub fn with_slave(
        mut self,
        repository: impl Into<String>,
        type_name: impl Into<String>,
        checksum: Option<String>,
    ) -> Self {
        self.repository = Some(repository.into());
        self.slave_type_name = Some(type_name.into());
        self.slave_checksum = checksum;
        self
    }
}

/// Result an agent returns for a finished job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub instance_id: TaskInstanceId,
    pub job_id: JobId,
    pub task_name: String,
    pub result: String,
}

/// Identifies the job an agent gives up on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelInfo {
    pub instance_id: TaskInstanceId,
    pub job_id: JobId,
    pub task_name: String,
}
