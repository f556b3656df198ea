//! Prometheus metrics collection and formatting.
//!
//! This module provides metrics in Prometheus text exposition format.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Arc;

use gridrun_core::GridTaskState;

use crate::state::AppState;

/// Collect all metrics from AppState and format as Prometheus text.
pub async fn collect_metrics(state: &Arc<AppState>) -> String {
    let mut output = String::new();

    collect_agent_metrics(state, &mut output);
    collect_task_metrics(state, &mut output).await;
    collect_catalog_metrics(state, &mut output);
    collect_distribution_metrics(state, &mut output);

    output
}

/// Collect agent counts.
fn collect_agent_metrics(state: &Arc<AppState>, output: &mut String) {
    let manager = &state.manager;
    let connected = manager.connected_agents();
    let working = manager.working_agents();
    let waiting = manager.distributor().waiting();

    writeln!(output, "# HELP gridrun_agents Number of agents by activity").ok();
    writeln!(output, "# TYPE gridrun_agents gauge").ok();
    writeln!(output, "gridrun_agents{{state=\"connected\"}} {connected}").ok();
    writeln!(output, "gridrun_agents{{state=\"working\"}} {working}").ok();
    writeln!(output, "gridrun_agents{{state=\"waiting\"}} {waiting}").ok();
}

/// Collect running task instances per repository.
async fn collect_task_metrics(state: &Arc<AppState>, output: &mut String) {
    let tasks = state.manager.task_summaries().await;

    let mut per_repository: BTreeMap<String, u64> = BTreeMap::new();
    let mut steps_goal = 0u64;
    let mut steps_completed = 0u64;
    for task in &tasks {
        *per_repository.entry(task.repository.clone()).or_default() += 1;
        steps_goal += task.steps_goal;
        steps_completed += task.steps_completed;
    }

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP gridrun_task_instances Running task instances by repository"
    )
    .ok();
    writeln!(output, "# TYPE gridrun_task_instances gauge").ok();
    for (repository, count) in &per_repository {
        writeln!(
            output,
            "gridrun_task_instances{{repository=\"{repository}\"}} {count}"
        )
        .ok();
    }

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP gridrun_task_steps Division steps of running instances"
    )
    .ok();
    writeln!(output, "# TYPE gridrun_task_steps gauge").ok();
    writeln!(output, "gridrun_task_steps{{kind=\"goal\"}} {steps_goal}").ok();
    writeln!(output, "gridrun_task_steps{{kind=\"completed\"}} {steps_completed}").ok();
}

/// Collect catalog entries by state.
fn collect_catalog_metrics(state: &Arc<AppState>, output: &mut String) {
    let tasks = state.manager.catalog().list(None);

    let mut waiting = 0u64;
    let mut running = 0u64;
    let mut running_before_removal = 0u64;
    let mut waiting_for_removal = 0u64;
    let mut cannot_be_loaded = 0u64;

    for task in &tasks {
        match task.state {
            GridTaskState::WaitingForExecution => waiting += 1,
            GridTaskState::Running => running += 1,
            GridTaskState::RunningBeforeRemoval => running_before_removal += 1,
            GridTaskState::WaitingForRemoval => waiting_for_removal += 1,
            GridTaskState::CannotBeLoaded => cannot_be_loaded += 1,
        }
    }
    let repositories = state.manager.repositories().len();

    writeln!(output).ok();
    writeln!(output, "# HELP gridrun_catalog_tasks Catalog entries by state").ok();
    writeln!(output, "# TYPE gridrun_catalog_tasks gauge").ok();
    writeln!(
        output,
        "gridrun_catalog_tasks{{state=\"waiting_for_execution\"}} {waiting}"
    )
    .ok();
    writeln!(output, "gridrun_catalog_tasks{{state=\"running\"}} {running}").ok();
    writeln!(
        output,
        "gridrun_catalog_tasks{{state=\"running_before_removal\"}} {running_before_removal}"
    )
    .ok();
    writeln!(
        output,
        "gridrun_catalog_tasks{{state=\"waiting_for_removal\"}} {waiting_for_removal}"
    )
    .ok();
    writeln!(
        output,
        "gridrun_catalog_tasks{{state=\"cannot_be_loaded\"}} {cannot_be_loaded}"
    )
    .ok();

    writeln!(output).ok();
    writeln!(output, "# HELP gridrun_repositories Registered repositories").ok();
    writeln!(output, "# TYPE gridrun_repositories gauge").ok();
    writeln!(output, "gridrun_repositories {repositories}").ok();
}

/// Collect distributed jobs and finished executions.
fn collect_distribution_metrics(state: &Arc<AppState>, output: &mut String) {
    let distributor = state.manager.distributor();
    let history = distributor.distribution_history();
    let grid = distributor.grid_statistics();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP gridrun_jobs_distributed_total Jobs handed to agents by master"
    )
    .ok();
    writeln!(output, "# TYPE gridrun_jobs_distributed_total counter").ok();
    for record in &history {
        writeln!(
            output,
            "gridrun_jobs_distributed_total{{master_id=\"{}\"}} {}",
            record.master_id, record.count
        )
        .ok();
    }

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP gridrun_jobs_executed_total Jobs joined back by agents"
    )
    .ok();
    writeln!(output, "# TYPE gridrun_jobs_executed_total counter").ok();
    writeln!(output, "gridrun_jobs_executed_total {}", grid.total_count).ok();
    writeln!(
        output,
        "gridrun_jobs_execution_seconds_total {:.3}",
        grid.total_duration_ms as f64 / 1000.0
    )
    .ok();
}

#[cfg(test)]
mod tests {
    use gridrun_core::PluginRegistry;

    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn test_collect_metrics_empty_state() {
        let state = AppState::new(Config::default(), PluginRegistry::new());
        let output = collect_metrics(&state).await;

        // Should contain agent metrics
        assert!(output.contains("gridrun_agents{state=\"connected\"} 0"));
        assert!(output.contains("gridrun_agents{state=\"waiting\"} 0"));

        // Should contain catalog metrics
        assert!(output.contains("gridrun_catalog_tasks{state=\"cannot_be_loaded\"} 0"));
        assert!(output.contains("gridrun_repositories 0"));

        // No per-repository series without running instances
        assert!(!output.contains("gridrun_task_instances{"));
        assert!(output.contains("gridrun_jobs_executed_total 0"));
    }

    #[tokio::test]
    async fn test_collect_metrics_counts_agents() {
        let state = AppState::new(Config::default(), PluginRegistry::new());
        state.manager.register(gridrun_core::AgentInfo::new(
            gridrun_core::AgentId::new("a"),
            "node-a",
        ));

        let output = collect_metrics(&state).await;
        assert!(output.contains("gridrun_agents{state=\"connected\"} 1"));
        assert!(output.contains("gridrun_agents{state=\"working\"} 0"));
    }
}
