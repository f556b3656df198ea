//! Message types and framing.
//!
//! Every frame is a big-endian length prefix followed by one JSON
//! [`Envelope`]. Responses reuse the id of the request they answer.

use bytes::{Bytes, BytesMut};
use gridrun_core::{AgentInfo, Job, TaskError, TaskResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::IpcError;

/// A request or response tagged with its correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub id: u64,
    pub body: T,
}

impl<T: Serialize> Envelope<T> {
    pub(crate) fn encode(&self) -> Result<Bytes, IpcError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

impl<T: DeserializeOwned> Envelope<T> {
    pub(crate) fn decode(frame: &BytesMut) -> Result<Self, IpcError> {
        Ok(serde_json::from_slice(frame)?)
    }
}

/// Requests sent by the manager to a task host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum HostRequest {
    CreateMasterTask { type_name: String },
    CreateSlaveTask { type_name: String },
    StartTask { handle: u64, custom_data: String },
    SetJob { handle: u64, division: String, agent: AgentInfo },
    SetWorkerJobState { handle: u64, result: TaskResult, division: String },
    SaveResults { handle: u64 },
    TaskResult { handle: u64 },
    RunJob { handle: u64, job: Job },
    ReleaseTask { handle: u64 },
    Ping,
    Close,
}

impl HostRequest {
    /// Operation name, for logs.
    pub fn op(&self) -> &'static str {
        match self {
            Self::CreateMasterTask { .. } => "create_master_task",
            Self::CreateSlaveTask { .. } => "create_slave_task",
            Self::StartTask { .. } => "start_task",
            Self::SetJob { .. } => "set_job",
            Self::SetWorkerJobState { .. } => "set_worker_job_state",
            Self::SaveResults { .. } => "save_results",
            Self::TaskResult { .. } => "task_result",
            Self::RunJob { .. } => "run_job",
            Self::ReleaseTask { .. } => "release_task",
            Self::Ping => "ping",
            Self::Close => "close",
        }
    }
}

/// Responses sent by a task host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HostResponse {
    MasterCreated { handle: u64, redispatch_in_treatment: bool },
    SlaveCreated { handle: u64 },
    Divisions { divisions: Vec<String> },
    Payload { payload: String },
    Accepted { accepted: bool },
    TaskResult { result: Option<String> },
    JobDone { result: String, steps_goal: u64, steps_completed: u64 },
    Pong { pid: u32 },
    Done,
    Failed { error: TaskError },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_is_tagged_by_op() {
        let envelope = Envelope {
            id: 7,
            body: HostRequest::StartTask {
                handle: 1,
                custom_data: "{}".into(),
            },
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains(r#""op":"start_task""#));
        assert!(json.contains(r#""id":7"#));
    }

    #[test]
    fn test_failed_response_carries_task_error() {
        let envelope = Envelope {
            id: 1,
            body: HostResponse::Failed {
                error: TaskError::callback("boom"),
            },
        };
        let bytes = envelope.encode().unwrap();
        let decoded: Envelope<HostResponse> =
            Envelope::decode(&BytesMut::from(&bytes[..])).unwrap();
        assert_eq!(decoded.body, envelope.body);
    }
}
