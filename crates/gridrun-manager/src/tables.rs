//! Shared tables owned by the manager.
//!
//! Lock order: the task table (async mutex held by the manager) is always
//! acquired before [`RunningTasks`]. `RunningTasks` and [`WorkingAgents`]
//! use synchronous mutexes that are never held across an await point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use gridrun_core::{AgentId, TaskInstanceId};

use crate::instance::TaskInstance;

/// Running instances in launch order.
#[derive(Default)]
pub struct TaskTable {
    instances: Vec<Arc<TaskInstance>>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, instance: Arc<TaskInstance>) {
        self.instances.push(instance);
    }

    pub fn get(&self, id: &TaskInstanceId) -> Option<Arc<TaskInstance>> {
        self.instances.iter().find(|i| i.id() == id).cloned()
    }

    pub fn remove(&mut self, id: &TaskInstanceId) -> Option<Arc<TaskInstance>> {
        let index = self.instances.iter().position(|i| i.id() == id)?;
        Some(self.instances.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<TaskInstance>> {
        self.instances.iter()
    }

    /// Copy of the table for work done outside the lock.
    pub fn snapshot(&self) -> Vec<Arc<TaskInstance>> {
        self.instances.clone()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

#[derive(Default)]
struct Running {
    per_repository: HashMap<String, Vec<TaskInstanceId>>,
    pinned: HashMap<String, usize>,
}

/// Instances running per repository, plus short-lived pins taken while a
/// launch is in progress.
///
/// A repository is busy while it has a running instance or a pin; the
/// handle registry refuses to close busy repositories.
#[derive(Default)]
pub struct RunningTasks {
    inner: Mutex<Running>,
}

impl RunningTasks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Running> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, repository: &str, id: TaskInstanceId) {
        self.lock()
            .per_repository
            .entry(repository.to_string())
            .or_default()
            .push(id);
    }

    /// Remove an instance. Returns true if the repository has no instance left.
    pub fn remove(&self, repository: &str, id: &TaskInstanceId) -> bool {
        let mut running = self.lock();
        let Some(list) = running.per_repository.get_mut(repository) else {
            return true;
        };
        list.retain(|i| i != id);
        if list.is_empty() {
            running.per_repository.remove(repository);
            return true;
        }
        false
    }

    pub fn instances(&self, repository: &str) -> Vec<TaskInstanceId> {
        self.lock()
            .per_repository
            .get(repository)
            .cloned()
            .unwrap_or_default()
    }

    pub fn count(&self, repository: &str) -> usize {
        self.lock()
            .per_repository
            .get(repository)
            .map_or(0, Vec::len)
    }

    pub fn is_busy(&self, repository: &str) -> bool {
        let running = self.lock();
        running
            .per_repository
            .get(repository)
            .is_some_and(|list| !list.is_empty())
            || running.pinned.get(repository).is_some_and(|n| *n > 0)
    }

    /// Keep `repository` busy until the guard is dropped.
    pub fn pin(self: &Arc<Self>, repository: &str) -> PinGuard {
        *self
            .lock()
            .pinned
            .entry(repository.to_string())
            .or_insert(0) += 1;
        PinGuard {
            running: Arc::clone(self),
            repository: repository.to_string(),
        }
    }

    fn unpin(&self, repository: &str) {
        let mut running = self.lock();
        if let Some(count) = running.pinned.get_mut(repository) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                running.pinned.remove(repository);
            }
        }
    }
}

/// Pin returned by [`RunningTasks::pin`].
pub struct PinGuard {
    running: Arc<RunningTasks>,
    repository: String,
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.running.unpin(&self.repository);
    }
}

/// Agents currently executing a job, with the instance they work for.
#[derive(Default)]
pub struct WorkingAgents {
    inner: Mutex<HashMap<AgentId, TaskInstanceId>>,
}

impl WorkingAgents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<AgentId, TaskInstanceId>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, agent: AgentId, instance: TaskInstanceId) {
        self.lock().insert(agent, instance);
    }

    pub fn remove(&self, agent: &AgentId) -> Option<TaskInstanceId> {
        self.lock().remove(agent)
    }

    pub fn get(&self, agent: &AgentId) -> Option<TaskInstanceId> {
        self.lock().get(agent).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Forget every agent working for `instance`.
    pub fn release_instance(&self, instance: &TaskInstanceId) {
        self.lock().retain(|_, working_for| working_for != instance);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_tasks_reports_empty_repository() {
        let running = RunningTasks::new();
        let a = TaskInstanceId::new("a");
        let b = TaskInstanceId::new("b");
        running.add("Primes", a.clone());
        running.add("Primes", b.clone());

        assert_eq!(running.count("Primes"), 2);
        assert!(!running.remove("Primes", &a));
        assert!(running.remove("Primes", &b));
        assert!(!running.is_busy("Primes"));
    }

    #[test]
    fn test_pin_keeps_repository_busy() {
        let running = RunningTasks::new();
        let first = running.pin("Primes");
        let second = running.pin("Primes");
        assert!(running.is_busy("Primes"));

        drop(first);
        assert!(running.is_busy("Primes"));
        drop(second);
        assert!(!running.is_busy("Primes"));
    }

    #[test]
    fn test_working_agents_release_instance() {
        let working = WorkingAgents::new();
        let instance = TaskInstanceId::new("i1");
        working.set(AgentId::new("a"), instance.clone());
        working.set(AgentId::new("b"), TaskInstanceId::new("i2"));

        working.release_instance(&instance);
        assert_eq!(working.len(), 1);
        assert_eq!(working.get(&AgentId::new("b")), Some(TaskInstanceId::new("i2")));
    }
}
