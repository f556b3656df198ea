//! GridRun Manager Library
//!
//! This crate provides the grid coordinator: job distribution across agents,
//! the task instance lifecycle, repository hosting and the HTTP surface that
//! exposes the agent and management protocols.

pub mod catalog;
pub mod config;
pub mod distribution;
pub mod error;
pub mod expiring;
pub mod http;
pub mod instance;
pub mod manager;
pub mod metrics;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod tables;

pub use config::{Config, HostConfig};
pub use distribution::JobDistributor;
pub use error::GridError;
pub use expiring::ExpiringMap;
pub use instance::TaskInstance;
pub use manager::GridManager;
pub use registry::RepositoryInstanceRegistry;
pub use state::AppState;
