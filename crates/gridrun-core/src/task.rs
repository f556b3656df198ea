//! User callback interfaces for master and slave tasks.
//!
//! A master task splits a job into opaque divisions, turns a division into
//! the payload an agent runs, and validates what agents send back. The
//! manager drives these callbacks from a task instance; it never interprets
//! division strings itself.
//!
//! [`DistribTask`] is the typed flavor: divisions are plain Rust values and
//! [`Distributed`] takes care of their JSON encoding.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{AgentInfo, Job, TaskError, TaskResult};

/// Master side of a splittable job.
#[async_trait]
pub trait MasterTask: Send {
    /// Split the work. Every returned division must be distinct.
    async fn start_task(&mut self, custom_data: &str) -> Result<Vec<String>, TaskError>;

    /// Build the payload `agent` receives for `division`.
    async fn set_job(&mut self, division: &str, agent: &AgentInfo) -> Result<String, TaskError>;

    /// Validate a result. `Ok(false)` sends the division back to the queue.
    async fn set_worker_job_state(
        &mut self,
        result: &TaskResult,
        division: &str,
    ) -> Result<bool, TaskError>;

    /// Called once every division is done.
    async fn on_saving_results(&mut self) -> Result<(), TaskError>;

    /// Textual outcome reported to the caller of an execution.
    async fn result(&mut self) -> Result<Option<String>, TaskError> {
        Ok(None)
    }

    /// Called when the owning instance completes, successfully or not.
    async fn on_stopping(&mut self) {}

    /// Whether in-treatment divisions may be handed out again once no
    /// waiting division remains.
    fn redispatch_in_treatment(&self) -> bool {
        false
    }
}

/// Worker side of a splittable job.
pub trait SlaveTask: Send {
    /// Run one job and return its result payload.
    fn run_job(&mut self, job: &Job) -> Result<String, TaskError>;

    fn steps_goal(&self) -> u64 {
        1
    }

    fn steps_completed(&self) -> u64 {
        0
    }
}

/// A master task working on typed divisions.
pub trait DistribTask: Send + 'static {
    type Division: Serialize + DeserializeOwned + Send;

    fn start_task(&mut self, custom_data: &str) -> Result<Vec<Self::Division>, TaskError>;

    /// Payload for the agent. Defaults to the encoded division itself.
    fn set_job(
        &mut self,
        division: &Self::Division,
        _agent: &AgentInfo,
    ) -> Result<String, TaskError> {
        Ok(serde_json::to_string(division)?)
    }

    fn set_worker_job_state(
        &mut self,
        result: &TaskResult,
        division: Self::Division,
    ) -> Result<bool, TaskError>;

    fn on_saving_results(&mut self) -> Result<(), TaskError> {
        Ok(())
    }

    fn result(&self) -> Option<String> {
        None
    }

    fn redispatch_in_treatment(&self) -> bool {
        false
    }
}

/// Adapts a [`DistribTask`] to the string-based [`MasterTask`] interface.
pub struct Distributed<T>(pub T);

impl<T: DistribTask> Distributed<T> {
    fn decode(division: &str) -> Result<T::Division, TaskError> {
        Ok(serde_json::from_str(division)?)
    }
}

#[async_trait]
impl<T: DistribTask> MasterTask for Distributed<T> {
    async fn start_task(&mut self, custom_data: &str) -> Result<Vec<String>, TaskError> {
        self.0
            .start_task(custom_data)?
            .iter()
            .map(|division| serde_json::to_string(division).map_err(TaskError::from))
            .collect()
    }

    async fn set_job(&mut self, division: &str, agent: &AgentInfo) -> Result<String, TaskError> {
        let division = Self::decode(division)?;
        self.0.set_job(&division, agent)
    }

    async fn set_worker_job_state(
        &mut self,
        result: &TaskResult,
        division: &str,
    ) -> Result<bool, TaskError> {
        let division = Self::decode(division)?;
        self.0.set_worker_job_state(result, division)
    }

    async fn on_saving_results(&mut self) -> Result<(), TaskError> {
        self.0.on_saving_results()
    }

    async fn result(&mut self) -> Result<Option<String>, TaskError> {
        Ok(self.0.result())
    }

    fn redispatch_in_treatment(&self) -> bool {
        self.0.redispatch_in_treatment()
    }
}
