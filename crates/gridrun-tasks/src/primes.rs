//! PrimeFinder: finds the primes of a range split into equal slices.

use std::collections::BTreeSet;

use gridrun_core::{
    DistribTask, Distributed, Job, PluginRegistry, SlaveTask, TaskError, TaskResult,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const MASTER_TYPE: &str = "primes::master";
pub const SLAVE_TYPE: &str = "primes::slave";

/// Half-open range `[lower, upper)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimesRange {
    pub lower: u64,
    pub upper: u64,
}

/// Custom data accepted by the master, every field optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrimeSettings {
    pub divisions: u64,
    pub work_unit: u64,
}

impl Default for PrimeSettings {
    fn default() -> Self {
        Self {
            divisions: 10,
            work_unit: 10_000,
        }
    }
}

impl PrimeSettings {
    fn parse(custom_data: &str) -> Result<Self, TaskError> {
        if custom_data.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(custom_data)
            .map_err(|e| TaskError::callback(format!("invalid prime settings: {e}")))
    }
}

/// Master: one division per slice, merges the primes agents report.
#[derive(Debug, Default)]
pub struct PrimeFinderMaster {
    primes: BTreeSet<u64>,
    saved: Option<String>,
}

impl DistribTask for PrimeFinderMaster {
    type Division = PrimesRange;

    fn start_task(&mut self, custom_data: &str) -> Result<Vec<PrimesRange>, TaskError> {
        let settings = PrimeSettings::parse(custom_data)?;
        info!(
            divisions = settings.divisions,
            work_unit = settings.work_unit,
            "Splitting prime search"
        );
        (0..settings.divisions)
            .map(|i| {
                let bound = |n: u64| {
                    n.checked_mul(settings.work_unit).ok_or_else(|| {
                        TaskError::callback(format!(
                            "prime range overflows: {} divisions of {}",
                            settings.divisions, settings.work_unit
                        ))
                    })
                };
                Ok(PrimesRange {
                    lower: bound(i)?,
                    upper: bound(i + 1)?,
                })
            })
            .collect()
    }

    fn set_worker_job_state(
        &mut self,
        result: &TaskResult,
        division: PrimesRange,
    ) -> Result<bool, TaskError> {
        let found: Vec<u64> = serde_json::from_str(&result.result)?;
        if found
            .iter()
            .any(|p| *p < division.lower || *p >= division.upper)
        {
            debug!(job_id = %result.job_id, "Rejecting primes outside of the division");
            return Ok(false);
        }
        self.primes.extend(found);
        Ok(true)
    }

    fn on_saving_results(&mut self) -> Result<(), TaskError> {
        let primes: Vec<u64> = self.primes.iter().copied().collect();
        self.saved = Some(serde_json::to_string(&primes)?);
        Ok(())
    }

    fn result(&self) -> Option<String> {
        self.saved.clone()
    }
}

/// Slave: returns the JSON list of primes in its range.
#[derive(Debug, Default)]
pub struct PrimeFinderSlave {
    goal: u64,
    completed: u64,
}

impl SlaveTask for PrimeFinderSlave {
    fn run_job(&mut self, job: &Job) -> Result<String, TaskError> {
        let range: PrimesRange = serde_json::from_str(&job.payload)?;
        self.goal = range.upper.saturating_sub(range.lower);
        self.completed = 0;

        let mut primes = Vec::new();
        for candidate in range.lower..range.upper {
            if is_prime(candidate) {
                primes.push(candidate);
            }
            self.completed += 1;
        }
        Ok(serde_json::to_string(&primes)?)
    }

    fn steps_goal(&self) -> u64 {
        self.goal
    }

    fn steps_completed(&self) -> u64 {
        self.completed
    }
}

fn is_prime(candidate: u64) -> bool {
    if candidate < 2 {
        return false;
    }
    let mut d = 2;
    while d <= candidate / d {
        if candidate % d == 0 {
            return false;
        }
        d += 1;
    }
    true
}

pub fn register(registry: &mut PluginRegistry) {
    registry.register_master(MASTER_TYPE, || {
        Box::new(Distributed(PrimeFinderMaster::default()))
    });
    registry.register_slave(SLAVE_TYPE, || Box::new(PrimeFinderSlave::default()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridrun_core::{AgentId, AgentInfo, JobId, MasterTask, TaskInstanceId};

    fn job(payload: &str) -> Job {
        Job {
            id: JobId::new(1),
            task_name: "PrimeFinder".into(),
            payload: payload.into(),
        }
    }

    #[test]
    fn test_slave_finds_primes_in_half_open_range() {
        let mut slave = PrimeFinderSlave::default();
        let out = slave.run_job(&job(r#"{"lower":0,"upper":20}"#)).unwrap();
        assert_eq!(out, "[2,3,5,7,11,13,17,19]");
        assert_eq!(slave.steps_goal(), 20);
        assert_eq!(slave.steps_completed(), 20);
    }

    #[test]
    fn test_master_splits_by_settings() {
        let mut master = PrimeFinderMaster::default();
        let divisions = master
            .start_task(r#"{"divisions":4,"work_unit":1000}"#)
            .unwrap();
        assert_eq!(divisions.len(), 4);
        assert_eq!(divisions[3], PrimesRange { lower: 3000, upper: 4000 });

        let defaults = master.start_task("").unwrap();
        assert_eq!(defaults.len(), 10);
    }

    #[test]
    fn test_master_rejects_overflowing_range() {
        let mut master = PrimeFinderMaster::default();
        let settings = format!(r#"{{"divisions":2,"work_unit":{}}}"#, u64::MAX);
        let err = master.start_task(&settings).unwrap_err();
        assert!(err.to_string().contains("overflows"));
    }

    #[test]
    fn test_is_prime_large_candidates() {
        assert!(!is_prime(u64::MAX));
        assert!(!is_prime(u64::MAX - 1));
        assert!(is_prime(4_294_967_291));
    }

    #[test]
    fn test_master_rejects_out_of_range_primes() {
        let mut master = PrimeFinderMaster::default();
        let result = TaskResult {
            instance_id: TaskInstanceId::new("i"),
            job_id: JobId::new(1),
            task_name: "PrimeFinder".into(),
            result: "[2,3,101]".into(),
        };
        let accepted = master
            .set_worker_job_state(&result, PrimesRange { lower: 0, upper: 100 })
            .unwrap();
        assert!(!accepted);
    }

    #[tokio::test]
    async fn test_registered_master_runs_through_adapter() {
        let mut registry = PluginRegistry::new();
        register(&mut registry);

        let mut master = registry.create_master(MASTER_TYPE).unwrap();
        let mut slave = registry.create_slave(SLAVE_TYPE).unwrap();
        let agent = AgentInfo::new(AgentId::new("a"), "node");

        let divisions = master
            .start_task(r#"{"divisions":2,"work_unit":10}"#)
            .await
            .unwrap();
        for (i, division) in divisions.iter().enumerate() {
            let payload = master.set_job(division, &agent).await.unwrap();
            let output = slave.run_job(&job(&payload)).unwrap();
            let result = TaskResult {
                instance_id: TaskInstanceId::new("i"),
                job_id: JobId::new(i as u64),
                task_name: "PrimeFinder".into(),
                result: output,
            };
            assert!(master.set_worker_job_state(&result, division).await.unwrap());
        }
        master.on_saving_results().await.unwrap();
        assert_eq!(
            master.result().await.unwrap().as_deref(),
            Some("[2,3,5,7,11,13,17,19]")
        );
    }
}
