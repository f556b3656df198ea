//! Host side of the task-host protocol.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use gridrun_core::{MasterTask, PluginRegistry, SlaveTask, TaskError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::protocol::{Envelope, HostRequest, HostResponse};
use crate::IpcError;

type SharedSink<W> = Arc<Mutex<FramedWrite<W, LengthDelimitedCodec>>>;

/// Serve requests until `Close` or end of stream.
///
/// Pings are answered from the read loop so that a long-running callback
/// never starves the manager's heartbeat. Everything else runs in order on
/// a single worker task that owns the task objects.
pub async fn serve<R, W>(reader: R, writer: W, plugins: PluginRegistry) -> Result<(), IpcError>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut frames = FramedRead::new(reader, LengthDelimitedCodec::new());
    let sink: SharedSink<W> = Arc::new(Mutex::new(FramedWrite::new(
        writer,
        LengthDelimitedCodec::new(),
    )));

    let (work_tx, mut work_rx) = mpsc::unbounded_channel::<Envelope<HostRequest>>();
    let worker_sink = Arc::clone(&sink);
    let worker = tokio::spawn(async move {
        let mut host = TaskHost::new(plugins);
        while let Some(envelope) = work_rx.recv().await {
            let body = host.handle(envelope.body).await;
            if let Err(e) = reply(&worker_sink, envelope.id, body).await {
                warn!(error = %e, "Failed to write response, stopping worker");
                break;
            }
        }
        host.release_all().await;
    });

    let mut close_id = None;
    while let Some(frame) = frames.next().await {
        let envelope = Envelope::<HostRequest>::decode(&frame?)?;
        match envelope.body {
            HostRequest::Ping => {
                reply(
                    &sink,
                    envelope.id,
                    HostResponse::Pong {
                        pid: std::process::id(),
                    },
                )
                .await?;
            }
            HostRequest::Close => {
                info!("Close requested");
                close_id = Some(envelope.id);
                break;
            }
            _ => {
                if work_tx.send(envelope).is_err() {
                    return Err(IpcError::ConnectionLost);
                }
            }
        }
    }

    drop(work_tx);
    if let Err(e) = worker.await {
        warn!(error = %e, "Task worker ended abnormally");
    }
    if let Some(id) = close_id {
        reply(&sink, id, HostResponse::Done).await?;
    }
    Ok(())
}

async fn reply<W>(sink: &SharedSink<W>, id: u64, body: HostResponse) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
{
    let frame = Envelope { id, body }.encode()?;
    sink.lock().await.send(frame).await?;
    Ok(())
}

/// Owns the task objects created on behalf of the manager.
struct TaskHost {
    plugins: PluginRegistry,
    masters: HashMap<u64, Box<dyn MasterTask>>,
    slaves: HashMap<u64, Box<dyn SlaveTask>>,
    next_handle: u64,
}

impl TaskHost {
    fn new(plugins: PluginRegistry) -> Self {
        Self {
            plugins,
            masters: HashMap::new(),
            slaves: HashMap::new(),
            next_handle: 1,
        }
    }

    async fn handle(&mut self, request: HostRequest) -> HostResponse {
        let op = request.op();
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(error) => {
                debug!(op, error = %error, "Request failed");
                HostResponse::Failed { error }
            }
        }
    }

    async fn dispatch(&mut self, request: HostRequest) -> Result<HostResponse, TaskError> {
        let response = match request {
            HostRequest::CreateMasterTask { type_name } => {
                let master = self
                    .plugins
                    .create_master(&type_name)
                    .map_err(|e| TaskError::callback(e.to_string()))?;
                let redispatch_in_treatment = master.redispatch_in_treatment();
                let handle = self.allocate();
                self.masters.insert(handle, master);
                info!(handle, type_name = %type_name, "Master task created");
                HostResponse::MasterCreated {
                    handle,
                    redispatch_in_treatment,
                }
            }
            HostRequest::CreateSlaveTask { type_name } => {
                let slave = self
                    .plugins
                    .create_slave(&type_name)
                    .map_err(|e| TaskError::callback(e.to_string()))?;
                let handle = self.allocate();
                self.slaves.insert(handle, slave);
                HostResponse::SlaveCreated { handle }
            }
            HostRequest::StartTask {
                handle,
                custom_data,
            } => HostResponse::Divisions {
                divisions: self.master(handle)?.start_task(&custom_data).await?,
            },
            HostRequest::SetJob {
                handle,
                division,
                agent,
            } => HostResponse::Payload {
                payload: self.master(handle)?.set_job(&division, &agent).await?,
            },
            HostRequest::SetWorkerJobState {
                handle,
                result,
                division,
            } => HostResponse::Accepted {
                accepted: self
                    .master(handle)?
                    .set_worker_job_state(&result, &division)
                    .await?,
            },
            HostRequest::SaveResults { handle } => {
                self.master(handle)?.on_saving_results().await?;
                HostResponse::Done
            }
            HostRequest::TaskResult { handle } => HostResponse::TaskResult {
                result: self.master(handle)?.result().await?,
            },
            HostRequest::RunJob { handle, job } => {
                let slave = self
                    .slaves
                    .get_mut(&handle)
                    .ok_or_else(|| unknown_handle(handle))?;
                let result = slave.run_job(&job)?;
                HostResponse::JobDone {
                    result,
                    steps_goal: slave.steps_goal(),
                    steps_completed: slave.steps_completed(),
                }
            }
            HostRequest::ReleaseTask { handle } => {
                if let Some(mut master) = self.masters.remove(&handle) {
                    master.on_stopping().await;
                }
                self.slaves.remove(&handle);
                HostResponse::Done
            }
            HostRequest::Ping => HostResponse::Pong {
                pid: std::process::id(),
            },
            HostRequest::Close => HostResponse::Done,
        };
        Ok(response)
    }

    fn master(&mut self, handle: u64) -> Result<&mut Box<dyn MasterTask>, TaskError> {
        self.masters
            .get_mut(&handle)
            .ok_or_else(|| unknown_handle(handle))
    }

    fn allocate(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    async fn release_all(&mut self) {
        for (_, mut master) in self.masters.drain() {
            master.on_stopping().await;
        }
        self.slaves.clear();
    }
}

fn unknown_handle(handle: u64) -> TaskError {
    TaskError::callback(format!("unknown task handle {handle}"))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use gridrun_core::{AgentId, AgentInfo, Job, JobId, TaskInstanceId, TaskResult};

    use super::*;
    use crate::HostClient;

    fn start_host() -> (HostClient, tokio::task::JoinHandle<Result<(), IpcError>>) {
        let mut plugins = PluginRegistry::new();
        gridrun_tasks::register(&mut plugins);

        let (client_io, host_io) = tokio::io::duplex(64 * 1024);
        let (host_read, host_write) = tokio::io::split(host_io);
        let (client_read, client_write) = tokio::io::split(client_io);

        let server = tokio::spawn(serve(host_read, host_write, plugins));
        let client = HostClient::spawn(client_read, client_write, Duration::from_secs(5));
        (client, server)
    }

    #[tokio::test]
    async fn test_ping_returns_host_pid() {
        let (client, _server) = start_host();
        let pid = client.ping().await.unwrap();
        assert_eq!(pid, std::process::id());
    }

    #[tokio::test]
    async fn test_master_and_slave_round_trip() {
        let (client, _server) = start_host();

        let master = match client
            .call(HostRequest::CreateMasterTask {
                type_name: gridrun_tasks::primes::MASTER_TYPE.into(),
            })
            .await
            .unwrap()
        {
            HostResponse::MasterCreated { handle, .. } => handle,
            other => panic!("unexpected response {other:?}"),
        };
        let slave = match client
            .call(HostRequest::CreateSlaveTask {
                type_name: gridrun_tasks::primes::SLAVE_TYPE.into(),
            })
            .await
            .unwrap()
        {
            HostResponse::SlaveCreated { handle } => handle,
            other => panic!("unexpected response {other:?}"),
        };

        let divisions = match client
            .call(HostRequest::StartTask {
                handle: master,
                custom_data: r#"{"divisions":1,"work_unit":10}"#.into(),
            })
            .await
            .unwrap()
        {
            HostResponse::Divisions { divisions } => divisions,
            other => panic!("unexpected response {other:?}"),
        };
        assert_eq!(divisions.len(), 1);

        let payload = match client
            .call(HostRequest::SetJob {
                handle: master,
                division: divisions[0].clone(),
                agent: AgentInfo::new(AgentId::new("a"), "node"),
            })
            .await
            .unwrap()
        {
            HostResponse::Payload { payload } => payload,
            other => panic!("unexpected response {other:?}"),
        };

        let job = Job {
            id: JobId::new(1),
            task_name: "PrimeFinder".into(),
            payload,
        };
        let output = match client
            .call(HostRequest::RunJob { handle: slave, job })
            .await
            .unwrap()
        {
            HostResponse::JobDone { result, .. } => result,
            other => panic!("unexpected response {other:?}"),
        };
        assert_eq!(output, "[2,3,5,7]");

        let accepted = client
            .call(HostRequest::SetWorkerJobState {
                handle: master,
                result: TaskResult {
                    instance_id: TaskInstanceId::new("i"),
                    job_id: JobId::new(1),
                    task_name: "PrimeFinder".into(),
                    result: output,
                },
                division: divisions[0].clone(),
            })
            .await
            .unwrap();
        assert_eq!(accepted, HostResponse::Accepted { accepted: true });
    }

    #[tokio::test]
    async fn test_unknown_handle_is_a_task_error() {
        let (client, _server) = start_host();
        let err = client
            .call(HostRequest::SaveResults { handle: 99 })
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::Task(TaskError::Callback(_))));
    }

    #[tokio::test]
    async fn test_close_ends_server_and_connection() {
        let (client, server) = start_host();
        let response = client.call(HostRequest::Close).await.unwrap();
        assert_eq!(response, HostResponse::Done);
        server.await.unwrap().unwrap();

        let mut closed = client.closed();
        tokio::time::timeout(Duration::from_secs(5), closed.wait_for(|c| *c))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(client.ping().await, Err(IpcError::ConnectionLost)));
    }
}
