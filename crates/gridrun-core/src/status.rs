//! Status enums for task instances, divisions and catalog entries.

use serde::{Deserialize, Serialize};

/// Initialization progress of a task instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InitializationStatus {
    /// Created, the first job request will start initialization.
    #[default]
    NotInitialized,
    /// The master's start callback is running.
    Initializing,
    /// Divisions are known and can be dispatched.
    Initialized,
    /// The start callback failed or produced invalid divisions.
    InitializationFailed,
    /// The start callback produced no divisions at all.
    InitializedButNoWork,
}

impl InitializationStatus {
    /// Returns true once initialization reached an outcome.
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::NotInitialized | Self::Initializing)
    }

    /// Decode a value produced by [`InitializationStatus::as_u8`].
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Initializing,
            2 => Self::Initialized,
            3 => Self::InitializationFailed,
            4 => Self::InitializedButNoWork,
            _ => Self::NotInitialized,
        }
    }

    /// Compact encoding, used to publish the status through an atomic.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::NotInitialized => 0,
            Self::Initializing => 1,
            Self::Initialized => 2,
            Self::InitializationFailed => 3,
            Self::InitializedButNoWork => 4,
        }
    }
}

/// State of one unit of splittable work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DivisionState {
    #[default]
    Waiting,
    InTreatment,
    Done,
}

/// State of a catalog entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GridTaskState {
    /// Loaded and idle.
    #[default]
    WaitingForExecution,
    /// At least one instance is running.
    Running,
    /// Running while its repository is marked for removal.
    RunningBeforeRemoval,
    /// Idle, its repository will be removed once the handle closes.
    WaitingForRemoval,
    /// Materializing the task failed; launches are refused.
    CannotBeLoaded,
}

impl GridTaskState {
    /// Returns true if the state must survive an instance completion.
    pub fn is_sticky(&self) -> bool {
        matches!(self, Self::RunningBeforeRemoval | Self::CannotBeLoaded)
    }
}

/// Role of a task type inside its repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskRole {
    /// Master with a free-form implementation.
    Master,
    /// Master built on the typed division adapter.
    MasterLight,
    /// Worker-side task executed by agents.
    Slave,
}

impl TaskRole {
    pub fn is_master(&self) -> bool {
        matches!(self, Self::Master | Self::MasterLight)
    }
}

/// Strategy used to materialize task objects for a repository.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CreatorKind {
    /// Direct calls into plugin objects.
    InProcess,
    /// Each master task runs on its own actor task.
    #[default]
    Isolated,
    /// Tasks run inside a separate hosting process.
    RemoteProcess,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialization_status_roundtrips_through_u8() {
        for status in [
            InitializationStatus::NotInitialized,
            InitializationStatus::Initializing,
            InitializationStatus::Initialized,
            InitializationStatus::InitializationFailed,
            InitializationStatus::InitializedButNoWork,
        ] {
            assert_eq!(InitializationStatus::from_u8(status.as_u8()), status);
        }
    }

    #[test]
    fn test_sticky_states() {
        assert!(GridTaskState::CannotBeLoaded.is_sticky());
        assert!(GridTaskState::RunningBeforeRemoval.is_sticky());
        assert!(!GridTaskState::Running.is_sticky());
    }

    #[test]
    fn test_role_serialization() {
        let json = serde_json::to_string(&TaskRole::MasterLight).unwrap();
        assert_eq!(json, "\"MASTER_LIGHT\"");
    }
}
