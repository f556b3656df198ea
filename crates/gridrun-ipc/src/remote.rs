//! A master task living inside a task host.

use async_trait::async_trait;
use gridrun_core::{AgentInfo, MasterTask, TaskError, TaskResult};
use tracing::debug;

use crate::protocol::{HostRequest, HostResponse};
use crate::{HostClient, IpcError};

/// Proxy forwarding every callback to a hosted master.
pub struct RemoteMaster {
    client: HostClient,
    handle: u64,
    redispatch_in_treatment: bool,
}

impl RemoteMaster {
    /// Ask the host to construct a master of `type_name`.
    pub async fn create(client: HostClient, type_name: &str) -> Result<Self, IpcError> {
        let response = client
            .call(HostRequest::CreateMasterTask {
                type_name: type_name.to_string(),
            })
            .await?;
        match response {
            HostResponse::MasterCreated {
                handle,
                redispatch_in_treatment,
            } => Ok(Self {
                client,
                handle,
                redispatch_in_treatment,
            }),
            other => Err(unexpected(other)),
        }
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }
}

fn unexpected(response: HostResponse) -> IpcError {
    IpcError::UnexpectedResponse(format!("{response:?}"))
}

#[async_trait]
impl MasterTask for RemoteMaster {
    async fn start_task(&mut self, custom_data: &str) -> Result<Vec<String>, TaskError> {
        let request = HostRequest::StartTask {
            handle: self.handle,
            custom_data: custom_data.to_string(),
        };
        match self.client.call(request).await? {
            HostResponse::Divisions { divisions } => Ok(divisions),
            other => Err(unexpected(other).into()),
        }
    }

    async fn set_job(&mut self, division: &str, agent: &AgentInfo) -> Result<String, TaskError> {
        let request = HostRequest::SetJob {
            handle: self.handle,
            division: division.to_string(),
            agent: agent.clone(),
        };
        match self.client.call(request).await? {
            HostResponse::Payload { payload } => Ok(payload),
            other => Err(unexpected(other).into()),
        }
    }

    async fn set_worker_job_state(
        &mut self,
        result: &TaskResult,
        division: &str,
    ) -> Result<bool, TaskError> {
        let request = HostRequest::SetWorkerJobState {
            handle: self.handle,
            result: result.clone(),
            division: division.to_string(),
        };
        match self.client.call(request).await? {
            HostResponse::Accepted { accepted } => Ok(accepted),
            other => Err(unexpected(other).into()),
        }
    }

    async fn on_saving_results(&mut self) -> Result<(), TaskError> {
        match self
            .client
            .call(HostRequest::SaveResults {
                handle: self.handle,
            })
            .await?
        {
            HostResponse::Done => Ok(()),
            other => Err(unexpected(other).into()),
        }
    }

    async fn result(&mut self) -> Result<Option<String>, TaskError> {
        match self
            .client
            .call(HostRequest::TaskResult {
                handle: self.handle,
            })
            .await?
        {
            HostResponse::TaskResult { result } => Ok(result),
            other => Err(unexpected(other).into()),
        }
    }

    async fn on_stopping(&mut self) {
        let request = HostRequest::ReleaseTask {
            handle: self.handle,
        };
        if let Err(e) = self.client.call(request).await {
            debug!(handle = self.handle, error = %e, "Release of hosted master failed");
        }
    }

    fn redispatch_in_treatment(&self) -> bool {
        self.redispatch_in_treatment
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use gridrun_core::PluginRegistry;

    use super::*;

    fn connect() -> HostClient {
        let mut plugins = PluginRegistry::new();
        gridrun_tasks::register(&mut plugins);
        let (client_io, host_io) = tokio::io::duplex(64 * 1024);
        let (host_read, host_write) = tokio::io::split(host_io);
        tokio::spawn(crate::serve(host_read, host_write, plugins));
        let (read, write) = tokio::io::split(client_io);
        HostClient::spawn(read, write, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_remote_master_splits_work() {
        let client = connect();
        let mut master = RemoteMaster::create(client, gridrun_tasks::primes::MASTER_TYPE)
            .await
            .unwrap();
        let divisions = master
            .start_task(r#"{"divisions":3,"work_unit":5}"#)
            .await
            .unwrap();
        assert_eq!(divisions.len(), 3);
        assert!(!master.redispatch_in_treatment());
    }

    #[tokio::test]
    async fn test_unknown_type_fails_creation() {
        let client = connect();
        let err = RemoteMaster::create(client, "missing").await.err().unwrap();
        assert!(matches!(err, IpcError::Task(_)));
    }

    #[tokio::test]
    async fn test_lost_host_surfaces_as_transport_error() {
        let client = connect();
        let mut master = RemoteMaster::create(client.clone(), gridrun_tasks::primes::MASTER_TYPE)
            .await
            .unwrap();
        client.shutdown();

        let err = master.start_task("").await.unwrap_err();
        assert!(err.is_transport());
    }
}
