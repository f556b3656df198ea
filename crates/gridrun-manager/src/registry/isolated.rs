//! Master tasks running on their own actor task.
//!
//! The actor owns the user object; callers talk to it through a command
//! channel. If the user code panics, the actor dies and every later call
//! fails with a transport error instead of unwinding into the manager.

use async_trait::async_trait;
use gridrun_core::{AgentInfo, MasterTask, TaskError, TaskResult};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

type Reply<T> = oneshot::Sender<Result<T, TaskError>>;

enum Command {
    Start {
        custom_data: String,
        reply: Reply<Vec<String>>,
    },
    SetJob {
        division: String,
        agent: AgentInfo,
        reply: Reply<String>,
    },
    SetWorkerJobState {
        result: TaskResult,
        division: String,
        reply: Reply<bool>,
    },
    SaveResults {
        reply: Reply<()>,
    },
    Result {
        reply: Reply<Option<String>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a master task hosted on an actor.
pub struct IsolatedMaster {
    commands: mpsc::Sender<Command>,
    redispatch: bool,
}

impl IsolatedMaster {
    /// Move `master` onto a new actor task.
    pub fn spawn(master: Box<dyn MasterTask>) -> Self {
        let redispatch = master.redispatch_in_treatment();
        let (commands, rx) = mpsc::channel(16);
        tokio::spawn(run(master, rx));
        Self {
            commands,
            redispatch,
        }
    }

    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, TaskError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| TaskError::Transport("isolated task stopped".into()))?;
        rx.await
            .map_err(|_| TaskError::Transport("isolated task crashed".into()))?
    }
}

#[async_trait]
impl MasterTask for IsolatedMaster {
    async fn start_task(&mut self, custom_data: &str) -> Result<Vec<String>, TaskError> {
        let custom_data = custom_data.to_string();
        self.call(|reply| Command::Start { custom_data, reply }).await
    }

    async fn set_job(&mut self, division: &str, agent: &AgentInfo) -> Result<String, TaskError> {
        let division = division.to_string();
        let agent = agent.clone();
        self.call(|reply| Command::SetJob {
            division,
            agent,
            reply,
        })
        .await
    }

    async fn set_worker_job_state(
        &mut self,
        result: &TaskResult,
        division: &str,
    ) -> Result<bool, TaskError> {
        let result = result.clone();
        let division = division.to_string();
        self.call(|reply| Command::SetWorkerJobState {
            result,
            division,
            reply,
        })
        .await
    }

    async fn on_saving_results(&mut self) -> Result<(), TaskError> {
        self.call(|reply| Command::SaveResults { reply }).await
    }

    async fn result(&mut self) -> Result<Option<String>, TaskError> {
        self.call(|reply| Command::Result { reply }).await
    }

    async fn on_stopping(&mut self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Stop { reply }).await.is_ok() {
            rx.await.ok();
        }
    }

    fn redispatch_in_treatment(&self) -> bool {
        self.redispatch
    }
}

async fn run(mut master: Box<dyn MasterTask>, mut commands: mpsc::Receiver<Command>) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Start { custom_data, reply } => {
                reply.send(master.start_task(&custom_data).await).ok();
            }
            Command::SetJob {
                division,
                agent,
                reply,
            } => {
                reply.send(master.set_job(&division, &agent).await).ok();
            }
            Command::SetWorkerJobState {
                result,
                division,
                reply,
            } => {
                reply
                    .send(master.set_worker_job_state(&result, &division).await)
                    .ok();
            }
            Command::SaveResults { reply } => {
                reply.send(master.on_saving_results().await).ok();
            }
            Command::Result { reply } => {
                reply.send(master.result().await).ok();
            }
            Command::Stop { reply } => {
                master.on_stopping().await;
                reply.send(()).ok();
                debug!("Isolated master stopped");
                return;
            }
        }
    }
    error!("Isolated master dropped without stop");
}

#[cfg(test)]
mod tests {
    use gridrun_core::{AgentId, JobId, TaskInstanceId};

    use super::*;

    struct Fragile;

    #[async_trait]
    impl MasterTask for Fragile {
        async fn start_task(&mut self, custom_data: &str) -> Result<Vec<String>, TaskError> {
            if custom_data == "boom" {
                panic!("user code failure");
            }
            Ok(vec!["a".into(), "b".into()])
        }

        async fn set_job(&mut self, division: &str, _agent: &AgentInfo) -> Result<String, TaskError> {
            Ok(division.to_uppercase())
        }

        async fn set_worker_job_state(
            &mut self,
            result: &TaskResult,
            _division: &str,
        ) -> Result<bool, TaskError> {
            Ok(result.result == "ok")
        }

        async fn on_saving_results(&mut self) -> Result<(), TaskError> {
            Err(TaskError::callback("read-only"))
        }
    }

    #[tokio::test]
    async fn test_calls_reach_the_actor() {
        let mut master = IsolatedMaster::spawn(Box::new(Fragile));
        assert_eq!(master.start_task("").await.unwrap(), vec!["a", "b"]);

        let agent = AgentInfo::new(AgentId::new("a"), "node");
        assert_eq!(master.set_job("a", &agent).await.unwrap(), "A");

        let result = TaskResult {
            instance_id: TaskInstanceId::new("i"),
            job_id: JobId::new(1),
            task_name: "t".into(),
            result: "ok".into(),
        };
        assert!(master.set_worker_job_state(&result, "a").await.unwrap());
        assert_eq!(
            master.on_saving_results().await,
            Err(TaskError::callback("read-only"))
        );
        assert_eq!(master.result().await.unwrap(), None);
        master.on_stopping().await;
    }

    #[tokio::test]
    async fn test_panic_becomes_transport_error() {
        let mut master = IsolatedMaster::spawn(Box::new(Fragile));
        let err = master.start_task("boom").await.unwrap_err();
        assert!(err.is_transport());

        let agent = AgentInfo::new(AgentId::new("a"), "node");
        assert!(master.set_job("a", &agent).await.unwrap_err().is_transport());
        master.on_stopping().await;
    }
}
