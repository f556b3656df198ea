//! Repository instance registry.
//!
//! Each repository with running work has one [`RepositoryHandle`], the
//! resource able to build its master tasks: direct calls into the plugin
//! registry, one actor per master, or a separate host process.
//!
//! Handles are never released explicitly. They live in an [`ExpiringMap`]
//! refreshed on every acquire; once idle for the creator TTL the sweep asks
//! whether the repository is still busy (running instances or an in-flight
//! launch) and vetoes the removal if so. A removed handle is closed in the
//! background and a [`RegistryEvent::Closed`] is sent so that the manager can
//! finish a pending repository deletion.

mod isolated;
mod remote;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use gridrun_core::{CreatorKind, GridTask, MasterTask, PluginRegistry};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use isolated::IsolatedMaster;
pub use remote::RemoteConnector;

use crate::config::Config;
use crate::error::RegistryError;
use crate::expiring::{ExpiringMap, Removal};
use crate::tables::RunningTasks;

/// Lifecycle notifications sent to the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// The handle of `repository` was closed.
    Closed { repository: String },
    /// The host process of `repository` stopped answering.
    HostLost { repository: String },
}

/// How master tasks of a repository are built.
pub enum Creator {
    InProcess(PluginRegistry),
    Isolated(PluginRegistry),
    Remote(RemoteConnector),
}

impl Creator {
    pub fn kind(&self) -> CreatorKind {
        match self {
            Self::InProcess(_) => CreatorKind::InProcess,
            Self::Isolated(_) => CreatorKind::Isolated,
            Self::Remote(_) => CreatorKind::RemoteProcess,
        }
    }

    async fn create_master(&self, type_name: &str) -> Result<Box<dyn MasterTask>, RegistryError> {
        let local = |plugins: &PluginRegistry| {
            plugins
                .create_master(type_name)
                .map_err(|e| RegistryError::CreateMaster {
                    type_name: type_name.to_string(),
                    reason: e.to_string(),
                })
        };
        match self {
            Self::InProcess(plugins) => local(plugins),
            Self::Isolated(plugins) => {
                let master = local(plugins)?;
                Ok(Box::new(IsolatedMaster::spawn(master)))
            }
            Self::Remote(connector) => connector.create_master(type_name).await,
        }
    }

    async fn close(&self) {
        if let Self::Remote(connector) = self {
            connector.close().await;
        }
    }
}

/// Per-repository creator with its acquire count.
pub struct RepositoryHandle {
    repository: String,
    creator: Creator,
    lives: AtomicU64,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl RepositoryHandle {
    fn new(repository: &str, creator: Creator) -> Self {
        Self {
            repository: repository.to_string(),
            creator,
            lives: AtomicU64::new(0),
            watcher: Mutex::new(None),
        }
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn kind(&self) -> CreatorKind {
        self.creator.kind()
    }

    /// Number of times the handle was acquired.
    pub fn lives(&self) -> u64 {
        self.lives.load(Ordering::SeqCst)
    }

    /// Build a master task of type `type_name`.
    pub async fn create_master(&self, type_name: &str) -> Result<Box<dyn MasterTask>, RegistryError> {
        self.creator.create_master(type_name).await
    }

    async fn close(&self) {
        if let Some(watcher) = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watcher.abort();
        }
        self.creator.close().await;
        info!(repository = %self.repository, kind = ?self.kind(), "Repository handle closed");
    }
}

/// Registry of live repository handles.
pub struct RepositoryInstanceRegistry {
    handles: ExpiringMap<String, Arc<RepositoryHandle>>,
    running: Arc<RunningTasks>,
    plugins: PluginRegistry,
    host: crate::config::HostConfig,
    events: mpsc::UnboundedSender<RegistryEvent>,
}

impl RepositoryInstanceRegistry {
    pub fn new(
        config: &Config,
        plugins: PluginRegistry,
        running: Arc<RunningTasks>,
        events: mpsc::UnboundedSender<RegistryEvent>,
    ) -> Self {
        let handles: ExpiringMap<String, Arc<RepositoryHandle>> =
            ExpiringMap::new(config.creator_ttl, config.creator_sweep_interval);

        let busy = Arc::clone(&running);
        handles.on_removing(move |repository, _| {
            if busy.is_busy(repository) {
                debug!(repository = %repository, "Repository busy, keeping handle");
                Removal::Veto
            } else {
                Removal::Proceed
            }
        });

        let closed = events.clone();
        handles.on_removed(move |repository, handle: Arc<RepositoryHandle>| {
            info!(repository = %repository, "Repository handle expired");
            let closed = closed.clone();
            tokio::spawn(async move {
                handle.close().await;
                closed.send(RegistryEvent::Closed { repository }).ok();
            });
        });

        Self {
            handles,
            running,
            plugins,
            host: config.host.clone(),
            events,
        }
    }

    /// Live handle of the task's repository, created on first use.
    ///
    /// Concurrent first uses may both build a creator; the first one stored
    /// wins and the other is closed.
    pub async fn acquire(
        &self,
        task: &GridTask,
        directory: &Path,
    ) -> Result<Arc<RepositoryHandle>, RegistryError> {
        let repository = task.repository.as_str();
        let _pin = self.running.pin(repository);

        if let Some(handle) = self.refresh(repository) {
            handle.lives.fetch_add(1, Ordering::SeqCst);
            return Ok(handle);
        }

        let creator = self.materialize(task, directory).await?;
        let fresh = Arc::new(RepositoryHandle::new(repository, creator));

        let existing = {
            let mut handles = self.handles.lock();
            match handles.get(&repository.to_string()).cloned() {
                Some(existing) => {
                    handles.touch(&repository.to_string());
                    Some(existing)
                }
                None => {
                    handles.set(repository.to_string(), Arc::clone(&fresh));
                    None
                }
            }
        };

        let handle = match existing {
            Some(existing) => {
                debug!(repository, "Lost creation race, closing duplicate handle");
                fresh.close().await;
                existing
            }
            None => {
                self.watch_host(&fresh);
                info!(repository, kind = ?fresh.kind(), "Repository handle created");
                fresh
            }
        };
        handle.lives.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    /// Handle of `repository` if one is live. Does not refresh it.
    pub fn get(&self, repository: &str) -> Option<Arc<RepositoryHandle>> {
        self.handles.get(&repository.to_string())
    }

    pub fn contains(&self, repository: &str) -> bool {
        self.handles.contains_key(&repository.to_string())
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Close the handle of `repository` now, busy or not.
    pub async fn evict(&self, repository: &str) -> bool {
        let Some(handle) = self.handles.remove(&repository.to_string()) else {
            return false;
        };
        info!(repository, "Evicting repository handle");
        handle.close().await;
        self.events
            .send(RegistryEvent::Closed {
                repository: repository.to_string(),
            })
            .ok();
        true
    }

    /// Run one expiry sweep now.
    pub fn sweep(&self) -> usize {
        self.handles.sweep()
    }

    fn refresh(&self, repository: &str) -> Option<Arc<RepositoryHandle>> {
        let key = repository.to_string();
        let mut handles = self.handles.lock();
        if handles.touch(&key) {
            handles.get(&key).cloned()
        } else {
            None
        }
    }

    async fn materialize(&self, task: &GridTask, directory: &Path) -> Result<Creator, RegistryError> {
        let creator = match task.creator {
            CreatorKind::InProcess => Creator::InProcess(self.plugins.clone()),
            CreatorKind::Isolated => Creator::Isolated(self.plugins.clone()),
            CreatorKind::RemoteProcess => Creator::Remote(
                RemoteConnector::spawn(&task.repository, directory, &self.host).await?,
            ),
        };
        Ok(creator)
    }

    /// Forward the loss of a host process as [`RegistryEvent::HostLost`].
    fn watch_host(&self, handle: &Arc<RepositoryHandle>) {
        let Creator::Remote(connector) = &handle.creator else {
            return;
        };
        let mut lost = connector.lost();
        let events = self.events.clone();
        let repository = handle.repository.clone();
        let watcher = tokio::spawn(async move {
            if lost.wait_for(|lost| *lost).await.is_ok() {
                warn!(repository = %repository, "Task host lost");
                events.send(RegistryEvent::HostLost { repository }).ok();
            }
        });
        *handle
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(watcher);
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use gridrun_core::{GridTaskState, TaskInstanceId, TaskRole};

    use super::*;

    const TTL: Duration = Duration::from_millis(50);

    fn registry(running: Arc<RunningTasks>) -> (RepositoryInstanceRegistry, mpsc::UnboundedReceiver<RegistryEvent>) {
        let config = Config {
            creator_ttl: TTL,
            creator_sweep_interval: Duration::from_secs(3600),
            ..Config::default()
        };
        let mut plugins = PluginRegistry::new();
        gridrun_tasks::register(&mut plugins);
        let (tx, rx) = mpsc::unbounded_channel();
        (RepositoryInstanceRegistry::new(&config, plugins, running, tx), rx)
    }

    fn task(creator: CreatorKind) -> GridTask {
        GridTask {
            id: "m1".into(),
            name: "PrimeFinder".into(),
            type_name: gridrun_tasks::primes::MASTER_TYPE.into(),
            repository: "Primes".into(),
            role: TaskRole::Master,
            binary: PathBuf::from("primes.bin"),
            platform_target: std::env::consts::ARCH.into(),
            creator,
            state: GridTaskState::WaitingForExecution,
            checksum: None,
        }
    }

    async fn expire() {
        tokio::time::sleep(TTL + Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn test_acquire_reuses_handle() {
        let (registry, _rx) = registry(RunningTasks::new());
        let first = registry.acquire(&task(CreatorKind::InProcess), Path::new(".")).await.unwrap();
        let second = registry.acquire(&task(CreatorKind::InProcess), Path::new(".")).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.lives(), 2);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_isolated_handle_builds_masters() {
        let (registry, _rx) = registry(RunningTasks::new());
        let handle = registry.acquire(&task(CreatorKind::Isolated), Path::new(".")).await.unwrap();
        assert_eq!(handle.kind(), CreatorKind::Isolated);

        let mut master = handle
            .create_master(gridrun_tasks::primes::MASTER_TYPE)
            .await
            .unwrap();
        let divisions = master.start_task(r#"{"divisions":3}"#).await.unwrap();
        assert_eq!(divisions.len(), 3);
        master.on_stopping().await;

        let err = handle.create_master("missing").await.err().unwrap();
        assert!(matches!(err, RegistryError::CreateMaster { .. }));
    }

    #[tokio::test]
    async fn test_busy_repository_is_not_closed() {
        let running = RunningTasks::new();
        let (registry, mut rx) = registry(Arc::clone(&running));
        registry.acquire(&task(CreatorKind::InProcess), Path::new(".")).await.unwrap();

        let instance = TaskInstanceId::new("i1");
        running.add("Primes", instance.clone());
        expire().await;
        assert_eq!(registry.sweep(), 0);
        assert!(registry.contains("Primes"));

        running.remove("Primes", &instance);
        expire().await;
        assert_eq!(registry.sweep(), 1);
        assert!(!registry.contains("Primes"));
        assert_eq!(
            rx.recv().await,
            Some(RegistryEvent::Closed {
                repository: "Primes".into()
            })
        );
    }

    #[tokio::test]
    async fn test_handle_closes_only_after_idle_ttl() {
        let (registry, _rx) = registry(RunningTasks::new());
        for _ in 0..3 {
            registry.acquire(&task(CreatorKind::InProcess), Path::new(".")).await.unwrap();
        }
        assert_eq!(registry.sweep(), 0);
        expire().await;
        assert_eq!(registry.sweep(), 1);
    }

    #[tokio::test]
    async fn test_evict_closes_immediately() {
        let running = RunningTasks::new();
        let (registry, mut rx) = registry(Arc::clone(&running));
        registry.acquire(&task(CreatorKind::InProcess), Path::new(".")).await.unwrap();
        running.add("Primes", TaskInstanceId::new("i1"));

        assert!(registry.evict("Primes").await);
        assert!(!registry.evict("Primes").await);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_remote_spawn_failure_is_reported() {
        let running = RunningTasks::new();
        let config = Config {
            host: crate::config::HostConfig {
                binary: "/nonexistent/gridrun-host".into(),
                ..Default::default()
            },
            ..Config::default()
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let registry = RepositoryInstanceRegistry::new(&config, PluginRegistry::new(), running, tx);

        let err = registry
            .acquire(&task(CreatorKind::RemoteProcess), Path::new("."))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::Spawn { .. }));
        assert!(registry.is_empty());
    }
}
