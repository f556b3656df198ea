//! GridRun Core Domain Types
//!
//! This crate contains the pure domain of the grid coordinator, with no
//! dependencies on:
//! - Network transports
//! - Process hosting
//! - Runtime specifics
//!
//! The user callback interfaces for master and slave tasks, and the plugin
//! registry that materializes them from a type name, also live here so that
//! both the manager and the out-of-process host can share them.

pub mod agent;
pub mod catalog;
pub mod error;
pub mod ids;
pub mod job;
pub mod plugin;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use agent::{AgentInfo, TaskProgress};
pub use catalog::{GridTask, TaskManifest};
pub use error::{CoreError, TaskError};
pub use ids::{AgentId, JobId, TaskInstanceId};
pub use job::{CancelInfo, Job, TaskDescriptor, TaskResult};
pub use plugin::PluginRegistry;
pub use status::{CreatorKind, DivisionState, GridTaskState, InitializationStatus, TaskRole};
pub use task::{DistribTask, Distributed, MasterTask, SlaveTask};
