//! One running execution of a master task.
//!
//! A [`TaskInstance`] owns the user's [`MasterTask`] and the division table
//! built from its `start_task` callback. Every mutation goes through the
//! instance's own async mutex, so `get_job`, `join`, `cancel` and
//! `lost_agent` are linearized per instance while distinct instances
//! progress in parallel.
//!
//! Flags read by the distributor on every pass (completed, all dispatched,
//! initialization status, step counters) are mirrored in atomics and only
//! written while holding the instance lock.
//!
//! Completion happens exactly once. The outcome is published on a watch
//! channel for callers waiting on the instance and sent to the manager's
//! event loop.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use gridrun_core::{
    AgentId, AgentInfo, DivisionState, InitializationStatus, Job, JobId, MasterTask, TaskError,
    TaskInstanceId, TaskResult,
};
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::InstanceError;

/// Static description of an instance, fixed at launch.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub name: String,
    pub master_id: String,
    pub repository: String,
    pub slave_type_name: String,
    pub slave_checksum: Option<String>,
    pub custom_data: String,
    pub max_failed_joins: u32,
}

/// Outcome of an instance, published once.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completion {
    pub instance_id: TaskInstanceId,
    pub name: String,
    pub master_id: String,
    pub repository: String,
    pub result: Option<String>,
    pub error: Option<String>,
    /// The master failed to build a division; it must not be launched again.
    pub master_unusable: bool,
}

/// What happened to a joined result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinOutcome {
    /// The division is done.
    Accepted,
    /// The division went back to the queue.
    Rejected,
    /// Late or duplicate result, nothing changed.
    Ignored,
    /// The division failed too often and the instance was abandoned.
    Abandoned,
}

struct Division {
    descriptor: String,
    state: DivisionState,
    failures: u32,
}

#[derive(Default)]
struct Divisions {
    master: Option<Box<dyn MasterTask>>,
    table: Vec<Division>,
    jobs: HashMap<JobId, usize>,
    holders: HashMap<AgentId, usize>,
    last_job: u64,
    redispatch: bool,
}

impl Divisions {
    /// Put back whatever `agent` holds. Returns true if a division was released.
    fn release(&mut self, agent: &AgentId) -> bool {
        let Some(index) = self.holders.remove(agent) else {
            return false;
        };
        let division = &mut self.table[index];
        if division.state == DivisionState::InTreatment {
            division.state = DivisionState::Waiting;
            return true;
        }
        false
    }

    fn next_division(&self) -> Option<usize> {
        self.table
            .iter()
            .position(|d| d.state == DivisionState::Waiting)
            .or_else(|| {
                self.redispatch
                    .then(|| {
                        self.table
                            .iter()
                            .position(|d| d.state == DivisionState::InTreatment)
                    })
                    .flatten()
            })
    }

    fn all_dispatched(&self) -> bool {
        !self.table.is_empty() && self.table.iter().all(|d| d.state != DivisionState::Waiting)
    }

    fn all_done(&self) -> bool {
        self.table.iter().all(|d| d.state == DivisionState::Done)
    }
}

/// A running master task and its division table.
pub struct TaskInstance {
    id: TaskInstanceId,
    spec: InstanceSpec,
    redispatch: bool,
    status: AtomicU8,
    completed: AtomicBool,
    unusable: AtomicBool,
    all_dispatched: AtomicBool,
    steps_goal: AtomicU64,
    steps_completed: AtomicU64,
    divisions: Mutex<Divisions>,
    completion: watch::Sender<Option<Completion>>,
    events: mpsc::UnboundedSender<Completion>,
}

impl fmt::Debug for TaskInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskInstance")
            .field("id", &self.id)
            .field("name", &self.spec.name)
            .field("status", &self.initialization_status())
            .field("completed", &self.is_completed())
            .finish_non_exhaustive()
    }
}

impl TaskInstance {
    /// Wrap a freshly created master. Completions are also sent to `events`.
    pub fn new(
        spec: InstanceSpec,
        master: Box<dyn MasterTask>,
        events: mpsc::UnboundedSender<Completion>,
    ) -> Arc<Self> {
        let (completion, _) = watch::channel(None);
        let redispatch = master.redispatch_in_treatment();
        Arc::new(Self {
            id: TaskInstanceId::generate(),
            spec,
            redispatch,
            status: AtomicU8::new(InitializationStatus::NotInitialized.as_u8()),
            completed: AtomicBool::new(false),
            unusable: AtomicBool::new(false),
            all_dispatched: AtomicBool::new(false),
            steps_goal: AtomicU64::new(0),
            steps_completed: AtomicU64::new(0),
            divisions: Mutex::new(Divisions {
                master: Some(master),
                redispatch,
                ..Divisions::default()
            }),
            completion,
            events,
        })
    }

    pub fn id(&self) -> &TaskInstanceId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn master_id(&self) -> &str {
        &self.spec.master_id
    }

    pub fn repository(&self) -> &str {
        &self.spec.repository
    }

    pub fn spec(&self) -> &InstanceSpec {
        &self.spec
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn all_jobs_dispatched(&self) -> bool {
        self.all_dispatched.load(Ordering::SeqCst)
    }

    /// The master hands out divisions still in treatment once none is waiting.
    pub fn redispatches(&self) -> bool {
        self.redispatch
    }

    pub fn initialization_status(&self) -> InitializationStatus {
        InitializationStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn steps_goal(&self) -> u64 {
        self.steps_goal.load(Ordering::SeqCst)
    }

    pub fn steps_completed(&self) -> u64 {
        self.steps_completed.load(Ordering::SeqCst)
    }

    /// Receiver observing the completion outcome.
    pub fn subscribe(&self) -> watch::Receiver<Option<Completion>> {
        self.completion.subscribe()
    }

    /// Wait until the instance completes.
    pub async fn wait_completion(&self) -> Completion {
        let mut rx = self.completion.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(completion) => completion.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| self.outcome(None, Some("Task instance dropped".to_string())))
    }

    /// Snapshot of every division and its state, in dispatch order.
    pub async fn division_states(&self) -> Vec<(String, DivisionState)> {
        self.divisions
            .lock()
            .await
            .table
            .iter()
            .map(|d| (d.descriptor.clone(), d.state))
            .collect()
    }

    /// Hand the next division to `agent`.
    ///
    /// Returns `Ok(None)` while the instance is not ready; the first call
    /// starts initialization in the background. A division already held by
    /// `agent` is released first.
    pub async fn get_job(self: &Arc<Self>, agent: &AgentInfo) -> Result<Option<Job>, InstanceError> {
        let mut st = self.divisions.lock().await;
        if self.is_completed() {
            warn!(instance_id = %self.id, agent_id = %agent.id, "Job requested from a completed task instance");
            return Ok(None);
        }

        match self.initialization_status() {
            InitializationStatus::NotInitialized => {
                if let Some(master) = st.master.take() {
                    self.set_status(InitializationStatus::Initializing);
                    info!(instance_id = %self.id, name = %self.spec.name, "Initializing task instance");
                    let this = Arc::clone(self);
                    tokio::spawn(async move { this.initialize(master).await });
                }
                return Ok(None);
            }
            InitializationStatus::Initialized => {}
            _ => return Ok(None),
        }

        if st.release(&agent.id) {
            debug!(instance_id = %self.id, agent_id = %agent.id, "Released previous division of agent");
        }

        let Some(index) = st.next_division() else {
            self.publish_dispatched(&st);
            return Ok(None);
        };
        let descriptor = st.table[index].descriptor.clone();

        let built = match st.master.as_mut() {
            Some(master) => master.set_job(&descriptor, agent).await,
            None => return Ok(None),
        };

        match built {
            Ok(payload) => {
                st.last_job += 1;
                let job_id = JobId::new(st.last_job);
                // A redispatched division changes holder.
                st.holders.retain(|_, held| *held != index);
                st.table[index].state = DivisionState::InTreatment;
                st.jobs.insert(job_id, index);
                st.holders.insert(agent.id.clone(), index);
                self.publish_dispatched(&st);

                debug!(instance_id = %self.id, agent_id = %agent.id, job_id = %job_id, "Job dispatched");
                Ok(Some(Job {
                    id: job_id,
                    task_name: self.spec.name.clone(),
                    payload,
                }))
            }
            Err(e) => {
                let message = format!("Failed to build job for division {descriptor}: {e}");
                warn!(instance_id = %self.id, error = %e, "Division build failed");
                if !e.is_transport() {
                    self.unusable.store(true, Ordering::SeqCst);
                }
                self.complete_locked(&mut st, Some(message.clone())).await.ok();
                if e.is_transport() {
                    Err(InstanceError::Transport(message))
                } else {
                    Err(InstanceError::DivisionBuild(message))
                }
            }
        }
    }

    /// Hand a result to the master for validation.
    pub async fn join(&self, agent: &AgentId, result: &TaskResult) -> Result<JoinOutcome, InstanceError> {
        let mut st = self.divisions.lock().await;
        if self.is_completed() {
            debug!(instance_id = %self.id, job_id = %result.job_id, "Result joined after completion");
            return Ok(JoinOutcome::Ignored);
        }

        let index = *st
            .jobs
            .get(&result.job_id)
            .ok_or(InstanceError::UnknownJob(result.job_id))?;
        if st.holders.get(agent) == Some(&index) {
            st.holders.remove(agent);
        }
        if st.table[index].state == DivisionState::Done {
            debug!(instance_id = %self.id, job_id = %result.job_id, "Duplicate result ignored");
            return Ok(JoinOutcome::Ignored);
        }

        let descriptor = st.table[index].descriptor.clone();
        let verdict = match st.master.as_mut() {
            Some(master) => master.set_worker_job_state(result, &descriptor).await,
            None => Err(TaskError::Transport("master task unavailable".into())),
        };

        let rejection = match verdict {
            Ok(true) => None,
            Ok(false) => Some("result rejected by the master".to_string()),
            Err(e) if e.is_transport() => {
                let message = format!("Lost master while joining division {descriptor}: {e}");
                self.complete_locked(&mut st, Some(message.clone())).await.ok();
                return Err(InstanceError::Transport(message));
            }
            Err(e) => Some(e.to_string()),
        };

        if let Some(reason) = rejection {
            let failures = {
                let division = &mut st.table[index];
                division.failures += 1;
                division.failures
            };
            if failures > self.spec.max_failed_joins {
                let message =
                    format!("Division {descriptor} failed {failures} times, last error: {reason}");
                warn!(instance_id = %self.id, failures, "Abandoning task instance");
                self.complete_locked(&mut st, Some(message)).await?;
                return Ok(JoinOutcome::Abandoned);
            }

            if !st.holders.values().any(|held| *held == index) {
                st.table[index].state = DivisionState::Waiting;
            }
            self.publish_dispatched(&st);
            debug!(instance_id = %self.id, failures, reason = %reason, "Division rejected");
            return Ok(JoinOutcome::Rejected);
        }

        st.table[index].state = DivisionState::Done;
        self.steps_completed.fetch_add(1, Ordering::SeqCst);
        self.publish_dispatched(&st);

        if st.all_done() {
            let saved = match st.master.as_mut() {
                Some(master) => master.on_saving_results().await,
                None => Ok(()),
            };
            let error = saved
                .err()
                .map(|e| format!("Saving task results failed: {e}"));
            self.complete_locked(&mut st, error).await?;
        }
        Ok(JoinOutcome::Accepted)
    }

    /// The agent gave up its job. Returns true if a division went back to the queue.
    pub async fn cancel(&self, agent: &AgentId, job_id: JobId) -> bool {
        let mut st = self.divisions.lock().await;
        if self.is_completed() {
            return false;
        }
        let released = st.release(agent);
        self.publish_dispatched(&st);
        debug!(instance_id = %self.id, agent_id = %agent, job_id = %job_id, released, "Job cancelled");
        released
    }

    /// The agent vanished. Safe to call at any stage of the lifecycle.
    pub async fn lost_agent(&self, agent: &AgentId) -> bool {
        if self.initialization_status() != InitializationStatus::Initialized {
            return false;
        }
        let mut st = self.divisions.lock().await;
        if self.is_completed() {
            return false;
        }
        let released = st.release(agent);
        if released {
            info!(instance_id = %self.id, agent_id = %agent, "Division of lost agent back in queue");
        }
        self.publish_dispatched(&st);
        released
    }

    /// Complete with an error. A no-op on an already completed instance.
    pub async fn fail(&self, reason: impl Into<String>) {
        let mut st = self.divisions.lock().await;
        if let Err(e) = self.complete_locked(&mut st, Some(reason.into())).await {
            debug!(error = %e, "Ignoring failure of completed instance");
        }
    }

    async fn initialize(self: Arc<Self>, mut master: Box<dyn MasterTask>) {
        let started = AssertUnwindSafe(master.start_task(&self.spec.custom_data))
            .catch_unwind()
            .await;

        let mut st = self.divisions.lock().await;
        let started = match started {
            Ok(started) => started,
            Err(panic) => {
                // Never reused after a panic.
                drop(master);
                if !self.is_completed() {
                    let message = format!("Task initialization panicked: {}", panic_message(&*panic));
                    self.set_status(InitializationStatus::InitializationFailed);
                    warn!(instance_id = %self.id, error = %message, "Task initialization failed");
                    self.complete_locked(&mut st, Some(message)).await.ok();
                }
                return;
            }
        };
        if self.is_completed() {
            master.on_stopping().await;
            return;
        }
        st.master = Some(master);

        let failure = match started {
            Err(e) => Some(format!("Task initialization failed: {e}")),
            Ok(divisions) if divisions.is_empty() => {
                self.set_status(InitializationStatus::InitializedButNoWork);
                info!(instance_id = %self.id, "Task instance has no work");
                self.complete_locked(&mut st, None).await.ok();
                return;
            }
            Ok(divisions) => {
                let distinct: HashSet<&String> = divisions.iter().collect();
                if distinct.len() != divisions.len() {
                    Some("Job divisions are not distinct".to_string())
                } else {
                    st.table = divisions
                        .into_iter()
                        .map(|descriptor| Division {
                            descriptor,
                            state: DivisionState::Waiting,
                            failures: 0,
                        })
                        .collect();
                    None
                }
            }
        };

        match failure {
            Some(message) => {
                self.set_status(InitializationStatus::InitializationFailed);
                warn!(instance_id = %self.id, error = %message, "Task initialization failed");
                self.complete_locked(&mut st, Some(message)).await.ok();
            }
            None => {
                self.steps_goal.store(st.table.len() as u64, Ordering::SeqCst);
                self.publish_dispatched(&st);
                self.set_status(InitializationStatus::Initialized);
                info!(instance_id = %self.id, divisions = st.table.len(), "Task instance initialized");
            }
        }
    }

    /// Mark the instance completed and publish the outcome.
    async fn complete_locked(&self, st: &mut Divisions, error: Option<String>) -> Result<(), InstanceError> {
        if self.completed.swap(true, Ordering::SeqCst) {
            return Err(InstanceError::AlreadyCompleted(self.id.clone()));
        }

        let mut error = error;
        let mut result = None;
        if let Some(master) = st.master.as_mut() {
            if error.is_none() {
                match master.result().await {
                    Ok(value) => result = value,
                    Err(e) => error = Some(format!("Failed to read task result: {e}")),
                }
            }
            master.on_stopping().await;
        }
        st.holders.clear();

        match &error {
            Some(message) => warn!(instance_id = %self.id, error = %message, "Task instance failed"),
            None => info!(instance_id = %self.id, steps = self.steps_completed(), "Task instance completed"),
        }

        let completion = self.outcome(result, error);
        self.completion.send_replace(Some(completion.clone()));
        self.events.send(completion).ok();
        Ok(())
    }

    fn outcome(&self, result: Option<String>, error: Option<String>) -> Completion {
        Completion {
            instance_id: self.id.clone(),
            name: self.spec.name.clone(),
            master_id: self.spec.master_id.clone(),
            repository: self.spec.repository.clone(),
            result,
            error,
            master_unusable: self.unusable.load(Ordering::SeqCst),
        }
    }

    fn set_status(&self, status: InitializationStatus) {
        self.status.store(status.as_u8(), Ordering::SeqCst);
    }

    fn publish_dispatched(&self, st: &Divisions) {
        self.all_dispatched.store(st.all_dispatched(), Ordering::SeqCst);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
