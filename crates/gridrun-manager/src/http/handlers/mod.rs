//! HTTP request handlers.

mod agents;
mod health;
mod management;

pub use agents::{cancel, descriptor, disconnect, join, ping, progress, register};
pub use health::{health_check, metrics_handler};
pub use management::{
    abort_task, add_repository, execute_task, grid_summary, grid_tasks, launch_task,
    remove_repository, repository_tasks, schedule_task,
};
