//! Agent information types.

use serde::{Deserialize, Serialize};

use crate::{AgentId, TaskInstanceId};

/// Information an agent declares about itself on every call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Identity assigned at registration. Empty before registration.
    #[serde(default)]
    pub id: AgentId,

    pub user_name: String,

    pub machine_name: String,

    /// Address the agent was last seen from.
    #[serde(default)]
    pub ip_address: String,

    /// Number of logical processors, used for best-fit assignment.
    pub processor_count: u32,

    /// Benchmarked floating point throughput.
    #[serde(default)]
    pub mflops: f64,

    /// Benchmarked network bandwidth.
    #[serde(default)]
    pub bandwidth_kbps: f64,

    /// Physical memory in bytes.
    #[serde(default)]
    pub total_physical_memory: u64,
}

impl AgentInfo {
    /// Create a new AgentInfo for a machine.
    pub fn new(id: AgentId, machine_name: impl Into<String>) -> Self {
        Self {
            id,
            user_name: String::new(),
            machine_name: machine_name.into(),
            ip_address: String::new(),
            processor_count: 1,
            mflops: 0.0,
            bandwidth_kbps: 0.0,
            total_physical_memory: 0,
        }
    }

    /// Builder method to set the processor count.
    pub fn with_processors(mut self, processor_count: u32) -> Self {
        self.processor_count = processor_count;
        self
    }

    /// Builder method to set benchmark figures.
    pub fn with_performance(mut self, mflops: f64, bandwidth_kbps: f64) -> Self {
        self.mflops = mflops;
        self.bandwidth_kbps = bandwidth_kbps;
        self
    }

    /// Builder method to set the user running the agent.
    pub fn with_user(mut self, user_name: impl Into<String>) -> Self {
        self.user_name = user_name.into();
        self
    }
}

/// Progress an agent reports for the job it is running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub instance_id: TaskInstanceId,
    pub task_name: String,
    pub steps_goal: u64,
    pub steps_completed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_info_builder() {
        let agent = AgentInfo::new(AgentId::new("a1"), "node-1")
            .with_processors(8)
            .with_performance(1200.0, 512.0)
            .with_user("grid");

        assert_eq!(agent.processor_count, 8);
        assert_eq!(agent.user_name, "grid");
        assert_eq!(agent.mflops, 1200.0);
    }

    #[test]
    fn test_agent_info_deserializes_without_optional_fields() {
        let json = r#"{"user_name":"u","machine_name":"m","processor_count":2}"#;
        let agent: AgentInfo = serde_json::from_str(json).unwrap();
        assert!(agent.id.is_empty());
        assert_eq!(agent.processor_count, 2);
    }
}
