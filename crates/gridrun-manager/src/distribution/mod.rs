//! Job distribution.
//!
//! Agents asking for work are parked in a waiting room. A periodic
//! rebalancing pass takes the whole room as one batch and serves it:
//!
//! - tasks are visited in launch order (first one able to supply a job wins),
//! - among the batch, the agent with the most processors gets the job
//!   (first arrival on ties),
//! - agents left over when no task can supply a job get an idle answer.
//!
//! The pass waits until every available agent is in the room, or until it
//! has skipped `max_gathering_ticks` passes, so that simultaneous requests
//! are matched together. This trades strict arrival order for best-fit
//! placement.
//!
//! Agents that keep cancelling the same task are put on an avoid list for a
//! while and stop receiving jobs from it.

mod stats;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use gridrun_core::{
    AgentId, AgentInfo, CancelInfo, InitializationStatus, TaskDescriptor, TaskInstanceId,
};
use serde::Serialize;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

pub use stats::{
    AgentLightStatistics, DailyStatistics, ExecutionStats, GridStatistics, TaskLightStatistics,
    TaskShare, RECENT_DURATIONS,
};

use crate::config::Config;
use crate::error::{DistributionError, InstanceError};
use crate::expiring::ExpiringMap;
use crate::instance::TaskInstance;
use crate::tables::{TaskTable, WorkingAgents};

/// Answer to a waiting agent.
pub enum Dispatch {
    Assigned {
        descriptor: TaskDescriptor,
        instance: Arc<TaskInstance>,
    },
    Idle,
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Assigned { descriptor, .. } => f
                .debug_struct("Assigned")
                .field("descriptor", descriptor)
                .finish_non_exhaustive(),
            Self::Idle => f.write_str("Idle"),
        }
    }
}

type Reply = oneshot::Sender<Result<Dispatch, DistributionError>>;

struct WaitingAgent {
    info: AgentInfo,
    reply: Reply,
}

#[derive(Default)]
struct WaitingRoom {
    agents: Vec<WaitingAgent>,
    skipped_ticks: u32,
}

/// Counter and last instant of enabled descriptors for one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistributionRecord {
    pub task_name: String,
    pub master_id: String,
    pub count: u64,
    pub last: DateTime<Utc>,
}

type AvoidKey = (AgentId, String);

/// Tunables of the distributor, taken from [`Config`].
#[derive(Debug, Clone)]
pub struct DistributorSettings {
    pub rebalance_interval: Duration,
    pub max_gathering_ticks: u32,
    pub max_cancellations: u32,
    pub check_cancel_abuse: bool,
}

impl From<&Config> for DistributorSettings {
    fn from(config: &Config) -> Self {
        Self {
            rebalance_interval: config.rebalance_interval,
            max_gathering_ticks: config.max_gathering_ticks,
            max_cancellations: config.max_cancellations,
            check_cancel_abuse: config.check_cancel_abuse,
        }
    }
}

/// Matches waiting agents with running task instances.
pub struct JobDistributor {
    settings: DistributorSettings,
    tasks: Arc<AsyncMutex<TaskTable>>,
    agents: Arc<ExpiringMap<AgentId, AgentInfo>>,
    working: Arc<WorkingAgents>,
    room: Mutex<WaitingRoom>,
    avoid: ExpiringMap<AvoidKey, ()>,
    cancels: Arc<Mutex<HashMap<AvoidKey, u32>>>,
    stats: Mutex<ExecutionStats>,
    history: Mutex<HashMap<(String, String), DistributionRecord>>,
    rebalancer: Mutex<Option<JoinHandle<()>>>,
}

impl JobDistributor {
    /// Create a distributor. Call [`JobDistributor::start`] to run the pass.
    pub fn new(
        config: &Config,
        tasks: Arc<AsyncMutex<TaskTable>>,
        agents: Arc<ExpiringMap<AgentId, AgentInfo>>,
        working: Arc<WorkingAgents>,
    ) -> Arc<Self> {
        let cancels: Arc<Mutex<HashMap<AvoidKey, u32>>> = Arc::default();
        let avoid = ExpiringMap::new(config.avoid_ttl, config.avoid_sweep_interval);
        let counters = Arc::clone(&cancels);
        avoid.on_removed(move |key: AvoidKey, _| {
            debug!(agent_id = %key.0, task = %key.1, "Agent no longer avoided");
            counters
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);
        });

        Arc::new(Self {
            settings: DistributorSettings::from(config),
            tasks,
            agents,
            working,
            room: Mutex::new(WaitingRoom::default()),
            avoid,
            cancels,
            stats: Mutex::new(ExecutionStats::default()),
            history: Mutex::new(HashMap::new()),
            rebalancer: Mutex::new(None),
        })
    }

    /// Spawn the periodic rebalancing pass.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = self.settings.rebalance_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(distributor) = weak.upgrade() else {
                    break;
                };
                distributor.rebalance().await;
            }
        });
        if let Some(previous) = lock(&self.rebalancer).replace(handle) {
            previous.abort();
        }
    }

    /// Wait until the next pass answers this agent.
    ///
    /// A second request from the same agent replaces the first one, which
    /// then resolves as idle.
    pub async fn get_descriptor(&self, agent: AgentInfo) -> Result<Dispatch, DistributionError> {
        let (reply, rx) = oneshot::channel();
        {
            let mut room = lock(&self.room);
            room.agents.retain(|w| w.info.id != agent.id);
            trace!(agent_id = %agent.id, waiting = room.agents.len() + 1, "Agent waiting for work");
            room.agents.push(WaitingAgent { info: agent, reply });
        }
        rx.await.unwrap_or(Ok(Dispatch::Idle))
    }

    /// Number of agents parked in the waiting room.
    pub fn waiting(&self) -> usize {
        lock(&self.room).agents.len()
    }

    /// One distribution pass.
    pub async fn rebalance(&self) {
        let Some(mut batch) = self.gather() else {
            return;
        };

        let instances = self.tasks.lock().await.snapshot();
        let mut exhausted: HashSet<TaskInstanceId> = HashSet::new();

        while !batch.is_empty() {
            let Some(instance) = instances
                .iter()
                .find(|i| !exhausted.contains(i.id()) && can_supply(i))
            else {
                break;
            };

            let Some(pick) = self.best_fit(&batch, instance.name()) else {
                trace!(instance_id = %instance.id(), "Every waiting agent avoids this task");
                exhausted.insert(instance.id().clone());
                continue;
            };
            let agent = batch.remove(pick);

            match instance.get_job(&agent.info).await {
                Ok(Some(job)) => {
                    let spec = instance.spec();
                    let descriptor = TaskDescriptor::enabled(instance.id().clone(), job.clone())
                        .with_slave(
                            spec.repository.clone(),
                            spec.slave_type_name.clone(),
                            spec.slave_checksum.clone(),
                        );
                    let assigned = Dispatch::Assigned {
                        descriptor,
                        instance: Arc::clone(instance),
                    };
                    if agent.reply.send(Ok(assigned)).is_err() {
                        debug!(agent_id = %agent.info.id, "Agent left before assignment, releasing job");
                        instance.cancel(&agent.info.id, job.id).await;
                        continue;
                    }

                    self.working
                        .set(agent.info.id.clone(), instance.id().clone());
                    self.set_division_stats(&agent.info, instance.repository(), instance.master_id(), true, false);
                    self.record_distribution(instance.name(), instance.master_id());
                    info!(
                        agent_id = %agent.info.id,
                        instance_id = %instance.id(),
                        job_id = %job.id,
                        processors = agent.info.processor_count,
                        "Assigned job"
                    );
                }
                Ok(None) => {
                    exhausted.insert(instance.id().clone());
                    batch.insert(pick, agent);
                }
                Err(InstanceError::Transport(message)) => {
                    warn!(instance_id = %instance.id(), error = %message, "Lost task host, dropping instance");
                    self.tasks.lock().await.remove(instance.id());
                    instance.fail(message).await;
                    exhausted.insert(instance.id().clone());
                    batch.insert(pick, agent);
                }
                Err(e) => {
                    exhausted.insert(instance.id().clone());
                    let error = DistributionError::DivisionBuild {
                        instance_id: instance.id().clone(),
                        repository: instance.repository().to_string(),
                        master_id: instance.master_id().to_string(),
                        message: e.to_string(),
                    };
                    agent.reply.send(Err(error)).ok();
                }
            }
        }

        for agent in batch {
            agent.reply.send(Ok(Dispatch::Idle)).ok();
        }
    }

    /// Take the waiting room if enough agents gathered.
    fn gather(&self) -> Option<Vec<WaitingAgent>> {
        let mut room = lock(&self.room);
        if room.agents.is_empty() {
            room.skipped_ticks = 0;
            return None;
        }

        let available = self.agents.len().saturating_sub(self.working.len());
        if room.agents.len() < available && room.skipped_ticks < self.settings.max_gathering_ticks {
            room.skipped_ticks += 1;
            trace!(
                waiting = room.agents.len(),
                available,
                skipped = room.skipped_ticks,
                "Gathering agents"
            );
            return None;
        }

        room.skipped_ticks = 0;
        Some(std::mem::take(&mut room.agents))
    }

    /// Index of the agent with the most processors not avoiding `task_name`.
    fn best_fit(&self, batch: &[WaitingAgent], task_name: &str) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (index, waiting) in batch.iter().enumerate() {
            if self.is_avoided(&waiting.info.id, task_name) {
                continue;
            }
            match best {
                Some(b) if batch[b].info.processor_count >= waiting.info.processor_count => {}
                _ => best = Some(index),
            }
        }
        best
    }

    pub fn is_avoided(&self, agent: &AgentId, task_name: &str) -> bool {
        self.avoid
            .contains_key(&(agent.clone(), task_name.to_string()))
    }

    /// Count a cancellation. Returns true if the agent now avoids the task.
    pub fn on_check_cancel_abuse(&self, agent: &AgentId, info: &CancelInfo) -> bool {
        if !self.settings.check_cancel_abuse {
            return false;
        }

        let key = (agent.clone(), info.task_name.clone());
        let count = {
            let mut cancels = lock(&self.cancels);
            let count = cancels.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let max = self.settings.max_cancellations;
        if count < max {
            return false;
        }
        if count == max || !self.avoid.touch(&key) {
            self.avoid.set(key, ());
            warn!(agent_id = %agent, task = %info.task_name, cancellations = count, "Agent placed on avoid list");
        }
        true
    }

    /// Create the statistics bucket of a (repository, master) pair.
    pub fn add_new_statistics(&self, repository: &str, master_id: &str) {
        lock(&self.stats).add(repository, master_id);
    }

    /// Record an assignment (`init`), a cancellation or a finished job.
    pub fn set_division_stats(
        &self,
        agent: &AgentInfo,
        repository: &str,
        master_id: &str,
        init: bool,
        cancel: bool,
    ) {
        lock(&self.stats).record(agent, repository, master_id, init, cancel, Utc::now());
    }

    pub fn tasks_execution_statistics(&self) -> Vec<TaskLightStatistics> {
        lock(&self.stats).light()
    }

    pub fn grid_statistics(&self) -> GridStatistics {
        let connected = self.agents.len();
        lock(&self.stats).grid(connected)
    }

    /// Enabled descriptors handed out, per task.
    pub fn distribution_history(&self) -> Vec<DistributionRecord> {
        let mut records: Vec<DistributionRecord> =
            lock(&self.history).values().cloned().collect();
        records.sort_by(|a, b| (&a.task_name, &a.master_id).cmp(&(&b.task_name, &b.master_id)));
        records
    }

    fn record_distribution(&self, task_name: &str, master_id: &str) {
        let now = Utc::now();
        lock(&self.history)
            .entry((task_name.to_string(), master_id.to_string()))
            .and_modify(|r| {
                r.count += 1;
                r.last = now;
            })
            .or_insert_with(|| DistributionRecord {
                task_name: task_name.to_string(),
                master_id: master_id.to_string(),
                count: 1,
                last: now,
            });
    }
}

impl Drop for JobDistributor {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.rebalancer).take() {
            handle.abort();
        }
    }
}

fn can_supply(instance: &TaskInstance) -> bool {
    if instance.is_completed() {
        return false;
    }
    match instance.initialization_status() {
        InitializationStatus::NotInitialized => true,
        InitializationStatus::Initialized => {
            !instance.all_jobs_dispatched() || instance.redispatches()
        }
        _ => false,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
