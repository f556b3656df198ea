//! The grid manager.
//!
//! [`GridManager`] owns the authoritative state of the grid: the catalog,
//! the table of running task instances, the per-repository running lists,
//! the agent liveness map and the repository handles. Agents and management
//! clients call into it concurrently.
//!
//! Lock order: the task table is always locked before the running lists.
//! The catalog and the expiring maps are leaf locks.
//!
//! Background notifications (instance completions, repository handle
//! events, lost agents) are funnelled through channels into one event loop
//! that holds only a weak reference to the manager.

mod summary;


use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use gridrun_core::{
    AgentId, AgentInfo, CancelInfo, GridTask, GridTaskState, PluginRegistry, TaskDescriptor,
    TaskInstanceId, TaskProgress, TaskResult,
};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use summary::{AgentProgressSummary, GridSummary, TaskMessage, TaskSummary, MAX_MESSAGES};

use crate::catalog::{self, Catalog, RepositoryRecord};
use crate::config::Config;
use crate::distribution::{Dispatch, JobDistributor};
use crate::error::{DistributionError, GridError, InstanceError};
use crate::expiring::ExpiringMap;
use crate::instance::{Completion, InstanceSpec, JoinOutcome, TaskInstance};
use crate::registry::{RegistryEvent, RepositoryInstanceRegistry};
use crate::scheduler::{ScheduleKey, Scheduler};
use crate::tables::{RunningTasks, TaskTable, WorkingAgents};

/// Error attached to instances whose host process went away.
const HOST_CLOSED: &str = "Hosting instance closed";

/// Error attached to instances aborted through the management API.
pub const ABORTED_BY_USER: &str = "Task is aborted by user";

/// Result of a repository removal request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemovalOutcome {
    /// Files and catalog entries are gone.
    Removed,
    /// Tasks are running or being launched; deletion happens once the
    /// repository is idle and its handle closed.
    Deferred,
}

/// Central coordinator of the grid.
pub struct GridManager {
    config: Config,
    catalog: Catalog,
    tasks: Arc<AsyncMutex<TaskTable>>,
    running: Arc<RunningTasks>,
    agents: Arc<ExpiringMap<AgentId, AgentInfo>>,
    progress: ExpiringMap<AgentId, TaskProgress>,
    working: Arc<WorkingAgents>,
    distributor: Arc<JobDistributor>,
    registry: RepositoryInstanceRegistry,
    scheduler: Scheduler,
    completions: mpsc::UnboundedSender<Completion>,
    messages: Mutex<BTreeMap<String, Vec<TaskMessage>>>,
    removal: AsyncMutex<()>,
    events: Mutex<Option<JoinHandle<()>>>,
}

impl GridManager {
    /// Build the manager and start its background loops.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(config: Config, plugins: PluginRegistry) -> Arc<Self> {
        let (completions, completion_rx) = mpsc::unbounded_channel();
        let (registry_tx, registry_rx) = mpsc::unbounded_channel();
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();

        let agents: Arc<ExpiringMap<AgentId, AgentInfo>> =
            Arc::new(ExpiringMap::new(config.agent_ttl, config.agent_sweep_interval));
        agents.on_removed(move |agent_id, _| {
            lost_tx.send(agent_id).ok();
        });

        let tasks = Arc::new(AsyncMutex::new(TaskTable::new()));
        let running = RunningTasks::new();
        let working = WorkingAgents::new();
        let distributor = JobDistributor::new(
            &config,
            Arc::clone(&tasks),
            Arc::clone(&agents),
            Arc::clone(&working),
        );
        let registry =
            RepositoryInstanceRegistry::new(&config, plugins, Arc::clone(&running), registry_tx);

        let manager = Arc::new(Self {
            progress: ExpiringMap::new(config.progress_ttl, config.agent_sweep_interval),
            catalog: Catalog::new(),
            tasks,
            running,
            agents,
            working,
            distributor,
            registry,
            scheduler: Scheduler::new(),
            completions,
            messages: Mutex::new(BTreeMap::new()),
            removal: AsyncMutex::new(()),
            events: Mutex::new(None),
            config,
        });

        manager.distributor.start();
        let handle = tokio::spawn(run_events(
            Arc::downgrade(&manager),
            completion_rx,
            registry_rx,
            lost_rx,
        ));
        *lock(&manager.events) = Some(handle);
        info!("Grid manager started");
        manager
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn distributor(&self) -> &Arc<JobDistributor> {
        &self.distributor
    }

    pub fn registry(&self) -> &RepositoryInstanceRegistry {
        &self.registry
    }

    // ------------------------------------------------------------------
    // Agent protocol
    // ------------------------------------------------------------------

    /// Register an agent, assigning an id when it has none.
    pub fn register(&self, mut agent: AgentInfo) -> AgentId {
        if agent.id.is_empty() {
            agent.id = AgentId::generate();
        }
        let id = agent.id.clone();
        info!(
            agent_id = %id,
            machine = %agent.machine_name,
            processors = agent.processor_count,
            "Agent registered"
        );
        self.agents.set(id.clone(), agent);
        id
    }

    /// Refresh the liveness entry of an agent.
    pub fn ping(&self, agent: AgentInfo) -> Result<(), GridError> {
        if agent.id.is_empty() {
            return Err(GridError::InvalidArgument("agent id is empty".into()));
        }
        debug!(agent_id = %agent.id, "Agent ping");
        self.agents.set(agent.id.clone(), agent);
        Ok(())
    }

    /// The agent leaves cleanly. Same repair as an expired lease.
    pub async fn disconnect(&self, agent_id: &AgentId) {
        if self.agents.remove(agent_id).is_some() {
            info!(agent_id = %agent_id, "Agent disconnected");
        }
        self.on_agent_lost(agent_id).await;
    }

    /// Store the progress report of an agent.
    pub fn update_progress(&self, agent_id: &AgentId, progress: TaskProgress) {
        self.agents.touch(agent_id);
        self.progress.set(agent_id.clone(), progress);
    }

    /// Wait for a job. Always answers with a well-formed descriptor.
    pub async fn get_descriptor(&self, agent: AgentInfo) -> TaskDescriptor {
        if agent.id.is_empty() {
            return TaskDescriptor::disabled();
        }
        let agent_id = agent.id.clone();
        self.agents.set(agent_id.clone(), agent.clone());
        self.working.remove(&agent_id);

        match self.distributor.get_descriptor(agent).await {
            Ok(Dispatch::Assigned { descriptor, .. }) => descriptor,
            Ok(Dispatch::Idle) => TaskDescriptor::disabled(),
            Err(DistributionError::DivisionBuild {
                instance_id,
                master_id,
                message,
                ..
            }) => {
                warn!(
                    agent_id = %agent_id,
                    instance_id = %instance_id,
                    master_id = %master_id,
                    error = %message,
                    "Division build failed, master cannot be loaded"
                );
                self.catalog.set_state(&master_id, GridTaskState::CannotBeLoaded);
                if let Some(instance) = self.instance(&instance_id).await {
                    instance.fail(message).await;
                }
                TaskDescriptor::disabled()
            }
        }
    }

    /// Hand back the result of a job.
    pub async fn join(&self, agent_id: &AgentId, result: TaskResult) -> Result<JoinOutcome, GridError> {
        self.working.remove(agent_id);
        let Some(instance) = self.instance(&result.instance_id).await else {
            debug!(agent_id = %agent_id, instance_id = %result.instance_id, "Result for an unknown instance");
            return Ok(JoinOutcome::Ignored);
        };

        match instance.join(agent_id, &result).await {
            Ok(outcome) => {
                if outcome == JoinOutcome::Accepted {
                    let agent = self.agent_info(agent_id);
                    self.distributor.set_division_stats(
                        &agent,
                        instance.repository(),
                        instance.master_id(),
                        false,
                        false,
                    );
                }
                debug!(agent_id = %agent_id, job_id = %result.job_id, ?outcome, "Result joined");
                Ok(outcome)
            }
            Err(InstanceError::Transport(message)) => {
                warn!(instance_id = %instance.id(), error = %message, "Lost task host during join");
                Ok(JoinOutcome::Abandoned)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The agent gives up its job. Returns true if a division was released.
    pub async fn cancel(&self, agent_id: &AgentId, info: CancelInfo) -> bool {
        self.working.remove(agent_id);
        let Some(instance) = self.instance(&info.instance_id).await else {
            return false;
        };

        let released = instance.cancel(agent_id, info.job_id).await;
        let agent = self.agent_info(agent_id);
        self.distributor
            .set_division_stats(&agent, instance.repository(), instance.master_id(), false, true);
        self.distributor.on_check_cancel_abuse(agent_id, &info);
        released
    }

    // ------------------------------------------------------------------
    // Management protocol
    // ------------------------------------------------------------------

    /// Discover and register the repository unpacked in `directory`.
    pub async fn add_task_libs(&self, name: &str, directory: &Path) -> Result<Vec<GridTask>, GridError> {
        if self.catalog.is_marked(name) {
            return Err(GridError::RepositoryMarkedForRemoval(name.to_string()));
        }
        let tasks = catalog::discover(name, directory, self.config.default_creator).await?;
        self.catalog
            .register_repository(name, directory, tasks.clone());
        Ok(tasks)
    }

    /// Register every repository found under the configured root.
    pub async fn load_repositories(&self) -> Result<usize, GridError> {
        let root = self.config.repository_path.clone();
        if !tokio::fs::try_exists(&root).await.unwrap_or(false) {
            warn!(path = %root.display(), "Repository root does not exist");
            return Ok(0);
        }

        let mut entries = tokio::fs::read_dir(&root)
            .await
            .map_err(crate::error::CatalogError::from)?;
        let mut loaded = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(crate::error::CatalogError::from)?
        {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            match self.add_task_libs(&name, &path).await {
                Ok(tasks) => {
                    loaded += 1;
                    info!(repository = %name, tasks = tasks.len(), "Repository loaded");
                }
                Err(e) => warn!(repository = %name, error = %e, "Skipping repository"),
            }
        }
        Ok(loaded)
    }

    /// Mark a repository for removal; delete it now if nothing runs.
    pub async fn remove_task_repository(&self, name: &str) -> Result<RemovalOutcome, GridError> {
        let _removal = self.removal.lock().await;
        if self.catalog.repository(name).is_none() {
            return Err(GridError::RepositoryNotFound(name.to_string()));
        }

        let running_masters: Vec<String> = {
            let tasks = self.tasks.lock().await;
            self.running
                .instances(name)
                .iter()
                .filter_map(|id| tasks.get(id))
                .map(|instance| instance.master_id().to_string())
                .collect()
        };
        self.catalog.mark_for_removal(name, &running_masters)?;

        // Launch pins count as well: a launch checks the mark after pinning.
        if self.running.is_busy(name) {
            info!(repository = name, running = running_masters.len(), "Repository removal deferred");
            return Ok(RemovalOutcome::Deferred);
        }

        self.registry.evict(name).await;
        self.complete_removal(name).await;
        Ok(RemovalOutcome::Removed)
    }

    /// Start an instance of `master_id` whose jobs run `slave_id`.
    pub async fn launch_task(
        &self,
        master_id: &str,
        slave_id: &str,
        custom_data: &str,
    ) -> Result<Arc<TaskInstance>, GridError> {
        let (master, slave) = self.catalog.prepare_execution(master_id, slave_id)?;
        let repository = master.repository.clone();

        let pin = self.running.pin(&repository);
        let record = match self.catalog.repository(&repository) {
            Some(record) if !record.marked_for_removal => record,
            Some(_) => {
                drop(pin);
                self.catalog.finish_execution(master_id);
                self.settle_removal(&repository).await;
                return Err(GridError::RepositoryMarkedForRemoval(repository));
            }
            None => {
                self.catalog.finish_execution(master_id);
                return Err(GridError::RepositoryNotFound(repository));
            }
        };

        let built = match self.registry.acquire(&master, &record.directory).await {
            Ok(handle) => handle.create_master(&master.type_name).await,
            Err(e) => Err(e),
        };
        let task = match built {
            Ok(task) => task,
            Err(e) => {
                error!(master_id, repository = %repository, error = %e, "Failed to materialize master task");
                self.catalog.set_state(master_id, GridTaskState::CannotBeLoaded);
                drop(pin);
                self.settle_removal(&repository).await;
                return Err(e.into());
            }
        };

        let spec = InstanceSpec {
            name: master.name.clone(),
            master_id: master.id.clone(),
            repository: repository.clone(),
            slave_type_name: slave.type_name.clone(),
            slave_checksum: slave.checksum.clone(),
            custom_data: custom_data.to_string(),
            max_failed_joins: self.config.max_failed_joins,
        };
        let instance = TaskInstance::new(spec, task, self.completions.clone());
        {
            let mut tasks = self.tasks.lock().await;
            tasks.insert(Arc::clone(&instance));
            self.running.add(&repository, instance.id().clone());
        }
        drop(pin);
        self.distributor.add_new_statistics(&repository, master_id);

        info!(
            instance_id = %instance.id(),
            master_id,
            slave_id,
            repository = %repository,
            "Task launched"
        );
        Ok(instance)
    }

    /// Launch and wait for completion. The outcome is kept in the task messages.
    pub async fn execute_task(
        &self,
        master_id: &str,
        slave_id: &str,
        custom_data: &str,
    ) -> Result<Completion, GridError> {
        let instance = self.launch_task(master_id, slave_id, custom_data).await?;
        let completion = instance.wait_completion().await;

        let mut messages = lock(&self.messages);
        let list = messages.entry(completion.repository.clone()).or_default();
        list.push(TaskMessage::from(&completion));
        if list.len() > MAX_MESSAGES {
            let excess = list.len() - MAX_MESSAGES;
            list.drain(..excess);
        }
        Ok(completion)
    }

    /// Fail a running instance on behalf of the user.
    pub async fn abort_task(&self, instance_id: &TaskInstanceId) -> Result<(), GridError> {
        let instance = self
            .instance(instance_id)
            .await
            .ok_or_else(|| GridError::TaskNotFound(instance_id.to_string()))?;
        info!(instance_id = %instance_id, "Aborting task");
        instance.fail(ABORTED_BY_USER).await;
        Ok(())
    }

    /// Launch `master_id` at every instant of the cron `expression`.
    pub fn schedule_task(
        self: &Arc<Self>,
        repository: &str,
        master_id: &str,
        slave_id: &str,
        expression: &str,
        custom_data: &str,
    ) -> Result<(), GridError> {
        let master = self
            .catalog
            .find(master_id)
            .ok_or_else(|| GridError::MasterNotFound(master_id.to_string()))?;
        if master.repository != repository {
            return Err(GridError::InvalidArgument(format!(
                "master '{master_id}' does not belong to repository '{repository}'"
            )));
        }
        if self.catalog.find(slave_id).is_none() {
            return Err(GridError::SlaveNotFound(slave_id.to_string()));
        }

        let key = ScheduleKey {
            repository: repository.to_string(),
            master_id: master_id.to_string(),
            slave_id: slave_id.to_string(),
        };
        let weak = Arc::downgrade(self);
        let (master_id, slave_id, custom_data) =
            (master_id.to_string(), slave_id.to_string(), custom_data.to_string());
        self.scheduler.schedule(key, expression, move || {
            let weak = weak.clone();
            let (master_id, slave_id, custom_data) =
                (master_id.clone(), slave_id.clone(), custom_data.clone());
            async move {
                let Some(manager) = weak.upgrade() else {
                    return false;
                };
                if let Err(e) = manager.launch_task(&master_id, &slave_id, &custom_data).await {
                    warn!(master_id = %master_id, error = %e, "Scheduled launch failed");
                }
                true
            }
        })
    }

    pub fn unschedule_task(&self, repository: &str, master_id: &str, slave_id: &str) -> bool {
        self.scheduler.unschedule(&ScheduleKey {
            repository: repository.to_string(),
            master_id: master_id.to_string(),
            slave_id: slave_id.to_string(),
        })
    }

    pub fn schedules(&self) -> Vec<(ScheduleKey, String)> {
        self.scheduler.list()
    }

    /// Catalog entries, optionally restricted to one repository.
    pub fn grid_tasks(&self, repository: Option<&str>) -> Result<Vec<GridTask>, GridError> {
        if let Some(name) = repository {
            if self.catalog.repository(name).is_none() {
                return Err(GridError::RepositoryNotFound(name.to_string()));
            }
        }
        Ok(self.catalog.list(repository))
    }

    pub fn repositories(&self) -> Vec<RepositoryRecord> {
        self.catalog.repositories()
    }

    /// Running instances in launch order.
    pub async fn task_summaries(&self) -> Vec<TaskSummary> {
        let instances = self.tasks.lock().await.snapshot();
        instances.iter().map(|i| TaskSummary::from(i.as_ref())).collect()
    }

    /// Snapshot of the whole grid.
    pub async fn grid_summary(&self) -> GridSummary {
        let tasks = self.task_summaries().await;
        let agents: HashMap<AgentId, AgentInfo> = self.agents.snapshot().into_iter().collect();
        let progress = summary::aggregate_progress(&self.progress.snapshot(), &agents);

        GridSummary {
            connected_agents: agents.len(),
            working_agents: self.working.len(),
            waiting_agents: self.distributor.waiting(),
            tasks,
            progress,
            statistics: self.distributor.tasks_execution_statistics(),
            grid: self.distributor.grid_statistics(),
            distribution: self.distributor.distribution_history(),
            repositories: self.catalog.repositories(),
            messages: lock(&self.messages).clone(),
        }
    }

    pub fn connected_agents(&self) -> usize {
        self.agents.len()
    }

    pub fn working_agents(&self) -> usize {
        self.working.len()
    }

    pub async fn running_instances(&self) -> usize {
        self.tasks.lock().await.len()
    }

    // ------------------------------------------------------------------
    // Internal handlers
    // ------------------------------------------------------------------

    async fn instance(&self, id: &TaskInstanceId) -> Option<Arc<TaskInstance>> {
        self.tasks.lock().await.get(id)
    }

    fn agent_info(&self, agent_id: &AgentId) -> AgentInfo {
        self.agents
            .get(agent_id)
            .unwrap_or_else(|| AgentInfo::new(agent_id.clone(), String::new()))
    }

    /// An instance fired its completion.
    async fn task_complete(&self, completion: Completion) {
        let id = &completion.instance_id;
        let repository = completion.repository.as_str();

        let (emptied, master_still_running) = {
            let mut tasks = self.tasks.lock().await;
            tasks.remove(id);
            let emptied = self.running.remove(repository, id);
            let master_still_running = tasks
                .iter()
                .any(|i| i.master_id() == completion.master_id);
            (emptied, master_still_running)
        };
        self.working.release_instance(id);

        if completion.master_unusable {
            self.catalog.set_state(&completion.master_id, GridTaskState::CannotBeLoaded);
        }
        if !master_still_running {
            self.catalog.finish_execution(&completion.master_id);
        }
        info!(
            instance_id = %id,
            repository,
            failed = completion.error.is_some(),
            "Task instance removed"
        );

        if !emptied {
            return;
        }
        // A closed handle reports back through on_registry_closed, which
        // finishes a pending removal. Healthy handles close on expiry.
        if completion.error.is_some() {
            self.registry.evict(repository).await;
        } else {
            self.settle_removal(repository).await;
        }
    }

    /// Finish a deferred removal once nothing holds the repository and no
    /// handle is left to report its close.
    async fn settle_removal(&self, repository: &str) {
        if self.catalog.is_marked(repository)
            && !self.running.is_busy(repository)
            && !self.registry.contains(repository)
        {
            self.complete_removal(repository).await;
        }
    }

    /// The host process of `repository` is gone: fail its instances and
    /// drop the handle.
    async fn on_host_lost(&self, repository: &str) {
        let instances: Vec<Arc<TaskInstance>> = {
            let tasks = self.tasks.lock().await;
            self.running
                .instances(repository)
                .iter()
                .filter_map(|id| tasks.get(id))
                .collect()
        };
        warn!(repository, instances = instances.len(), "Failing instances of lost host");
        for instance in instances {
            instance.fail(HOST_CLOSED).await;
        }
        self.registry.evict(repository).await;
    }

    async fn on_registry_closed(&self, repository: &str) {
        if self.catalog.is_marked(repository) && !self.running.is_busy(repository) {
            self.complete_removal(repository).await;
        }
    }

    /// Release whatever the agent held in every instance.
    async fn on_agent_lost(&self, agent_id: &AgentId) {
        self.progress.remove(agent_id);
        self.working.remove(agent_id);
        let instances = self.tasks.lock().await.snapshot();
        let mut released = 0;
        for instance in instances {
            if instance.lost_agent(agent_id).await {
                released += 1;
            }
        }
        info!(agent_id = %agent_id, released, "Agent lost");
    }

    /// Purge a repository from the catalog and delete its files. Idempotent.
    async fn complete_removal(&self, repository: &str) {
        let Some(record) = self.catalog.purge(repository) else {
            return;
        };
        match tokio::fs::remove_dir_all(&record.directory).await {
            Ok(()) => info!(repository, path = %record.directory.display(), "Repository deleted"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(repository, "Repository removed from catalog")
            }
            Err(e) => warn!(repository, error = %e, "Failed to delete repository files"),
        }
    }
}

impl Drop for GridManager {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.events).take() {
            handle.abort();
        }
    }
}

enum Event {
    Completed(Completion),
    Registry(RegistryEvent),
    AgentLost(AgentId),
}

async fn run_events(
    manager: Weak<GridManager>,
    mut completions: mpsc::UnboundedReceiver<Completion>,
    mut registry: mpsc::UnboundedReceiver<RegistryEvent>,
    mut lost: mpsc::UnboundedReceiver<AgentId>,
) {
    loop {
        let event = tokio::select! {
            Some(completion) = completions.recv() => Event::Completed(completion),
            Some(event) = registry.recv() => Event::Registry(event),
            Some(agent_id) = lost.recv() => Event::AgentLost(agent_id),
            else => break,
        };
        let Some(manager) = manager.upgrade() else {
            break;
        };
        match event {
            Event::Completed(completion) => manager.task_complete(completion).await,
            Event::Registry(RegistryEvent::Closed { repository }) => {
                manager.on_registry_closed(&repository).await
            }
            Event::Registry(RegistryEvent::HostLost { repository }) => {
                manager.on_host_lost(&repository).await
            }
            Event::AgentLost(agent_id) => manager.on_agent_lost(&agent_id).await,
        }
    }
    debug!("Manager event loop stopped");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
