//! Manager configuration.

use std::path::PathBuf;
use std::time::Duration;

use gridrun_core::CreatorKind;

/// Settings for out-of-process task hosts.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Path of the `gridrun-host` executable.
    pub binary: PathBuf,

    /// Handshake attempts before giving up on a freshly spawned host.
    pub connect_retries: u32,

    /// Delay between handshake attempts.
    pub connect_retry_delay: Duration,

    /// Heartbeat period of the watchdog.
    pub ping_interval: Duration,

    /// Deadline for a heartbeat answer.
    pub ping_timeout: Duration,

    /// Deadline for any other request.
    pub call_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("gridrun-host"),
            connect_retries: 4,
            connect_retry_delay: Duration::from_millis(100),
            ping_interval: Duration::from_secs(1),
            ping_timeout: Duration::from_secs(1),
            call_timeout: Duration::from_secs(5),
        }
    }
}

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server bind address.
    pub bind_addr: String,

    /// Directory holding one subdirectory per repository.
    pub repository_path: PathBuf,

    /// Silence after which an agent is considered lost.
    pub agent_ttl: Duration,
    pub agent_sweep_interval: Duration,

    /// Lifetime of an agent's last progress report.
    pub progress_ttl: Duration,

    /// Idle time after which a repository handle is closed.
    pub creator_ttl: Duration,
    pub creator_sweep_interval: Duration,

    /// Cadence of the job distribution pass.
    pub rebalance_interval: Duration,

    /// Passes skipped while gathering agents before distributing anyway.
    pub max_gathering_ticks: u32,

    /// How long an agent stays excluded from a task it keeps cancelling.
    pub avoid_ttl: Duration,
    pub avoid_sweep_interval: Duration,

    /// Cancellations of the same task that put an agent on the avoid list.
    pub max_cancellations: u32,
    pub check_cancel_abuse: bool,

    /// Failed joins tolerated per division before the instance is abandoned.
    pub max_failed_joins: u32,

    /// Creator used for repositories that do not need a separate process.
    pub default_creator: CreatorKind,

    pub host: HostConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8700".to_string(),
            repository_path: PathBuf::from("repositories"),
            agent_ttl: Duration::from_secs(60),
            agent_sweep_interval: Duration::from_secs(10),
            progress_ttl: Duration::from_secs(60),
            creator_ttl: Duration::from_secs(120),
            creator_sweep_interval: Duration::from_secs(10),
            rebalance_interval: Duration::from_millis(300),
            max_gathering_ticks: 4,
            avoid_ttl: Duration::from_secs(60),
            avoid_sweep_interval: Duration::from_secs(10),
            max_cancellations: 3,
            check_cancel_abuse: true,
            max_failed_joins: 3,
            default_creator: CreatorKind::Isolated,
            host: HostConfig::default(),
        }
    }
}
