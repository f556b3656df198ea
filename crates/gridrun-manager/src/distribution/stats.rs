//! Execution statistics per repository, master and agent.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use gridrun_core::{AgentId, AgentInfo};
use serde::Serialize;

/// Number of recent durations reported per agent.
pub const RECENT_DURATIONS: usize = 10;

/// Execution record of one agent for one master.
#[derive(Debug, Clone)]
pub struct DivisionExecutionStat {
    pub agent: AgentInfo,
    pub execution_count: u64,
    /// Completed executions with the instant they finished.
    pub runs: Vec<(DateTime<Utc>, Duration)>,
    /// Set when a job is handed out, cleared when its result comes back.
    pub last_distribution: Option<DateTime<Utc>>,
}

impl DivisionExecutionStat {
    fn new(agent: AgentInfo) -> Self {
        Self {
            agent,
            execution_count: 0,
            runs: Vec::new(),
            last_distribution: None,
        }
    }

    fn total(&self) -> Duration {
        self.runs.iter().map(|(_, d)| *d).sum()
    }
}

/// Statistics bucket of one (repository, master) pair.
#[derive(Debug, Clone)]
pub struct TaskExecutionStatistics {
    pub repository: String,
    pub master_id: String,
    pub agents: HashMap<AgentId, DivisionExecutionStat>,
}

/// Recent durations of one agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentLightStatistics {
    pub agent_id: AgentId,
    pub machine_name: String,
    pub execution_count: u64,
    pub last_durations_ms: Vec<u64>,
    pub average_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskLightStatistics {
    pub repository: String,
    pub master_id: String,
    pub agents: Vec<AgentLightStatistics>,
}

/// Share of the grid's work done by one (repository, master) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskShare {
    pub repository: String,
    pub master_id: String,
    pub count: u64,
    pub duration_ms: u64,
    pub count_percent: f64,
    pub time_percent: f64,
    pub agents_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyStatistics {
    pub date: NaiveDate,
    pub count: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GridStatistics {
    pub total_count: u64,
    pub total_duration_ms: u64,
    pub tasks: Vec<TaskShare>,
    pub daily: Vec<DailyStatistics>,
}

/// All buckets, keyed by (repository, master id).
#[derive(Debug, Default)]
pub struct ExecutionStats {
    buckets: BTreeMap<(String, String), TaskExecutionStatistics>,
}

impl ExecutionStats {
    /// Create the bucket for a pair unless it already exists.
    pub fn add(&mut self, repository: &str, master_id: &str) {
        self.buckets
            .entry((repository.to_string(), master_id.to_string()))
            .or_insert_with(|| TaskExecutionStatistics {
                repository: repository.to_string(),
                master_id: master_id.to_string(),
                agents: HashMap::new(),
            });
    }

    /// Record an assignment (`init`), a cancellation or a finished job.
    pub fn record(
        &mut self,
        agent: &AgentInfo,
        repository: &str,
        master_id: &str,
        init: bool,
        cancel: bool,
        now: DateTime<Utc>,
    ) {
        self.add(repository, master_id);
        let Some(bucket) = self
            .buckets
            .get_mut(&(repository.to_string(), master_id.to_string()))
        else {
            return;
        };

        if cancel {
            bucket.agents.remove(&agent.id);
            return;
        }

        let stat = bucket
            .agents
            .entry(agent.id.clone())
            .or_insert_with(|| DivisionExecutionStat::new(agent.clone()));
        stat.agent = agent.clone();

        if init {
            stat.last_distribution = Some(now);
        } else if let Some(started) = stat.last_distribution.take() {
            let elapsed = (now - started).to_std().unwrap_or_default();
            stat.execution_count += 1;
            stat.runs.push((now, elapsed));
        }
    }

    /// Last durations and their average, per agent.
    pub fn light(&self) -> Vec<TaskLightStatistics> {
        self.buckets
            .values()
            .map(|bucket| {
                let mut agents: Vec<AgentLightStatistics> = bucket
                    .agents
                    .values()
                    .map(|stat| {
                        let skip = stat.runs.len().saturating_sub(RECENT_DURATIONS);
                        let last: Vec<u64> = stat.runs[skip..]
                            .iter()
                            .map(|(_, d)| d.as_millis() as u64)
                            .collect();
                        let average_ms = if last.is_empty() {
                            0.0
                        } else {
                            last.iter().sum::<u64>() as f64 / last.len() as f64
                        };
                        AgentLightStatistics {
                            agent_id: stat.agent.id.clone(),
                            machine_name: stat.agent.machine_name.clone(),
                            execution_count: stat.execution_count,
                            last_durations_ms: last,
                            average_ms,
                        }
                    })
                    .collect();
                agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
                TaskLightStatistics {
                    repository: bucket.repository.clone(),
                    master_id: bucket.master_id.clone(),
                    agents,
                }
            })
            .collect()
    }

    /// Grid-wide shares and daily totals. `connected` is the number of live agents.
    pub fn grid(&self, connected: usize) -> GridStatistics {
        let mut total_count = 0u64;
        let mut total_duration = Duration::ZERO;
        let mut daily: BTreeMap<NaiveDate, (u64, Duration)> = BTreeMap::new();

        for stat in self.buckets.values().flat_map(|b| b.agents.values()) {
            total_count += stat.execution_count;
            total_duration += stat.total();
            for (at, duration) in &stat.runs {
                let day = daily.entry(at.date_naive()).or_default();
                day.0 += 1;
                day.1 += *duration;
            }
        }

        let tasks = self
            .buckets
            .values()
            .map(|bucket| {
                let count: u64 = bucket.agents.values().map(|s| s.execution_count).sum();
                let duration: Duration = bucket.agents.values().map(|s| s.total()).sum();
                TaskShare {
                    repository: bucket.repository.clone(),
                    master_id: bucket.master_id.clone(),
                    count,
                    duration_ms: duration.as_millis() as u64,
                    count_percent: percent(count as f64, total_count as f64),
                    time_percent: percent(duration.as_secs_f64(), total_duration.as_secs_f64()),
                    agents_percent: percent(bucket.agents.len() as f64, connected as f64),
                }
            })
            .collect();

        GridStatistics {
            total_count,
            total_duration_ms: total_duration.as_millis() as u64,
            tasks,
            daily: daily
                .into_iter()
                .map(|(date, (count, duration))| DailyStatistics {
                    date,
                    count,
                    duration_ms: duration.as_millis() as u64,
                })
                .collect(),
        }
    }
}

fn percent(part: f64, whole: f64) -> f64 {
    if whole <= 0.0 {
        0.0
    } else {
        part * 100.0 / whole
    }
}
