//! Snapshot types returned by `grid_summary`.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use gridrun_core::{AgentId, AgentInfo, InitializationStatus, TaskInstanceId, TaskProgress};
use serde::Serialize;

use crate::catalog::RepositoryRecord;
use crate::distribution::{DistributionRecord, GridStatistics, TaskLightStatistics};
use crate::instance::{Completion, TaskInstance};

/// Messages kept per repository.
pub const MAX_MESSAGES: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSummary {
    pub instance_id: TaskInstanceId,
    pub master_id: String,
    pub repository: String,
    pub name: String,
    pub steps_goal: u64,
    pub steps_completed: u64,
    pub initialization_status: InitializationStatus,
    pub completed: bool,
}

impl From<&TaskInstance> for TaskSummary {
    fn from(instance: &TaskInstance) -> Self {
        Self {
            instance_id: instance.id().clone(),
            master_id: instance.master_id().to_string(),
            repository: instance.repository().to_string(),
            name: instance.name().to_string(),
            steps_goal: instance.steps_goal(),
            steps_completed: instance.steps_completed(),
            initialization_status: instance.initialization_status(),
            completed: instance.is_completed(),
        }
    }
}

/// Agents reporting progress for one instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentProgressSummary {
    pub instance_id: TaskInstanceId,
    pub task_name: String,
    pub agents: usize,
    pub mflops: f64,
    pub bandwidth_kbps: f64,
}

/// Outcome of a finished `execute_task`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskMessage {
    pub instance_id: TaskInstanceId,
    pub master_id: String,
    pub result: Option<String>,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl From<&Completion> for TaskMessage {
    fn from(completion: &Completion) -> Self {
        Self {
            instance_id: completion.instance_id.clone(),
            master_id: completion.master_id.clone(),
            result: completion.result.clone(),
            error: completion.error.clone(),
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridSummary {
    pub connected_agents: usize,
    pub working_agents: usize,
    pub waiting_agents: usize,
    pub tasks: Vec<TaskSummary>,
    pub progress: Vec<AgentProgressSummary>,
    pub statistics: Vec<TaskLightStatistics>,
    pub grid: GridStatistics,
    pub distribution: Vec<DistributionRecord>,
    pub repositories: Vec<RepositoryRecord>,
    pub messages: BTreeMap<String, Vec<TaskMessage>>,
}

/// Group progress reports by instance, summing the reporters' benchmarks.
pub(crate) fn aggregate_progress(
    progress: &[(AgentId, TaskProgress)],
    agents: &HashMap<AgentId, AgentInfo>,
) -> Vec<AgentProgressSummary> {
    let mut grouped: BTreeMap<TaskInstanceId, AgentProgressSummary> = BTreeMap::new();
    for (agent_id, report) in progress {
        let entry = grouped
            .entry(report.instance_id.clone())
            .or_insert_with(|| AgentProgressSummary {
                instance_id: report.instance_id.clone(),
                task_name: report.task_name.clone(),
                agents: 0,
                mflops: 0.0,
                bandwidth_kbps: 0.0,
            });
        entry.agents += 1;
        if let Some(info) = agents.get(agent_id) {
            entry.mflops += info.mflops;
            entry.bandwidth_kbps += info.bandwidth_kbps;
        }
    }
    grouped.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(instance: &str) -> TaskProgress {
        TaskProgress {
            instance_id: TaskInstanceId::new(instance),
            task_name: "PrimeFinder".into(),
            steps_goal: 10,
            steps_completed: 1,
        }
    }

    #[test]
    fn test_progress_is_grouped_by_instance() {
        let a = AgentInfo::new(AgentId::new("a"), "node-a").with_performance(100.0, 10.0);
        let b = AgentInfo::new(AgentId::new("b"), "node-b").with_performance(50.0, 5.0);
        let agents: HashMap<AgentId, AgentInfo> =
            [(a.id.clone(), a.clone()), (b.id.clone(), b.clone())].into();
        let progress = vec![
            (a.id.clone(), report("i1")),
            (b.id.clone(), report("i1")),
            (AgentId::new("gone"), report("i2")),
        ];

        let summary = aggregate_progress(&progress, &agents);
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].agents, 2);
        assert_eq!(summary[0].mflops, 150.0);
        assert_eq!(summary[1].agents, 1);
        assert_eq!(summary[1].mflops, 0.0);
    }
}
