//! Connector to a `gridrun-host` child process.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use gridrun_core::MasterTask;
use gridrun_ipc::{HostClient, RemoteMaster};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::HostConfig;
use crate::error::RegistryError;

/// Live connection to a task host.
///
/// A watchdog pings the host every `ping_interval`. A failed ping, a closed
/// stream or an exited child flips the lost flag, observed through
/// [`RemoteConnector::lost`].
pub struct RemoteConnector {
    repository: String,
    client: HostClient,
    child: Arc<Mutex<Option<Child>>>,
    lost: watch::Receiver<bool>,
    watchdog: JoinHandle<()>,
    config: HostConfig,
}

impl RemoteConnector {
    /// Start the host binary for `repository` and wait for it to answer.
    pub async fn spawn(
        repository: &str,
        directory: &Path,
        config: &HostConfig,
    ) -> Result<Self, RegistryError> {
        let mut child = Command::new(&config.binary)
            .arg("--repository")
            .arg(repository)
            .arg("--directory")
            .arg(directory)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RegistryError::Spawn {
                repository: repository.to_string(),
                reason: e.to_string(),
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(RegistryError::Spawn {
                repository: repository.to_string(),
                reason: "child stdio not captured".to_string(),
            });
        };
        info!(repository, pid = ?child.id(), "Spawned task host");

        let client = HostClient::spawn(stdout, stdin, config.call_timeout);
        if let Err(e) = handshake(&client, repository, config).await {
            client.shutdown();
            child.start_kill().ok();
            return Err(e);
        }
        Ok(Self::attach(repository, client, Some(child), config))
    }

    /// Wrap an already connected client and start the watchdog.
    pub fn attach(
        repository: &str,
        client: HostClient,
        child: Option<Child>,
        config: &HostConfig,
    ) -> Self {
        let (lost_tx, lost) = watch::channel(false);
        let child = Arc::new(Mutex::new(child));
        let watchdog = tokio::spawn(watchdog(
            repository.to_string(),
            client.clone(),
            Arc::clone(&child),
            config.clone(),
            lost_tx,
        ));
        Self {
            repository: repository.to_string(),
            client,
            child,
            lost,
            watchdog,
            config: config.clone(),
        }
    }

    /// Receiver flipping to `true` once the host is gone.
    pub fn lost(&self) -> watch::Receiver<bool> {
        self.lost.clone()
    }

    pub fn is_lost(&self) -> bool {
        *self.lost.borrow()
    }

    /// Create a master on the host.
    pub async fn create_master(&self, type_name: &str) -> Result<Box<dyn MasterTask>, RegistryError> {
        let master = RemoteMaster::create(self.client.clone(), type_name)
            .await
            .map_err(|e| RegistryError::CreateMaster {
                type_name: type_name.to_string(),
                reason: e.to_string(),
            })?;
        debug!(repository = %self.repository, handle = master.handle(), "Remote master created");
        Ok(Box::new(master))
    }

    /// Ask the host to exit, then make sure the child is gone.
    pub async fn close(&self) {
        self.watchdog.abort();
        if !self.client.is_closed() {
            let request = self.client.call(gridrun_ipc::HostRequest::Close);
            if timeout(self.config.ping_timeout, request).await.is_err() {
                debug!(repository = %self.repository, "Task host did not acknowledge close");
            }
        }
        self.client.shutdown();

        if let Some(mut child) = self.child.lock().await.take() {
            child.start_kill().ok();
            match timeout(self.config.ping_timeout, child.wait()).await {
                Ok(Ok(status)) => debug!(repository = %self.repository, %status, "Task host exited"),
                _ => warn!(repository = %self.repository, "Task host did not exit in time"),
            }
        }
        info!(repository = %self.repository, "Task host connector closed");
    }
}

impl Drop for RemoteConnector {
    fn drop(&mut self) {
        self.watchdog.abort();
    }
}

async fn handshake(client: &HostClient, repository: &str, config: &HostConfig) -> Result<u32, RegistryError> {
    for attempt in 1..=config.connect_retries {
        match timeout(config.ping_timeout, client.ping()).await {
            Ok(Ok(pid)) => {
                debug!(repository, pid, attempt, "Task host answered");
                return Ok(pid);
            }
            Ok(Err(e)) => debug!(repository, attempt, error = %e, "Task host handshake failed"),
            Err(_) => debug!(repository, attempt, "Task host handshake timed out"),
        }
        sleep(config.connect_retry_delay).await;
    }
    Err(RegistryError::Handshake {
        repository: repository.to_string(),
        attempts: config.connect_retries,
    })
}

async fn watchdog(
    repository: String,
    client: HostClient,
    child: Arc<Mutex<Option<Child>>>,
    config: HostConfig,
    lost: watch::Sender<bool>,
) {
    let mut closed = client.closed();
    let mut ticker = tokio::time::interval(config.ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = closed.wait_for(|closed| *closed) => break "connection closed".to_string(),
        }

        if let Some(child) = child.lock().await.as_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                break format!("process exited with {status}");
            }
        }

        match timeout(config.ping_timeout, client.ping()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => break format!("ping failed: {e}"),
            Err(_) => break "ping timed out".to_string(),
        }
    };

    warn!(repository = %repository, reason = %reason, "Lost task host");
    client.shutdown();
    lost.send_replace(true);
}
