//! Newtype wrappers for identifiers to ensure type safety.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Create an id from a string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a new random id.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Get the inner string reference.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner string.
            pub fn into_inner(self) -> String {
                self.0
            }

            /// Returns true if no id was assigned.
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_id!(
    /// Identity of a remote agent, fixed at registration.
    ///
    /// Agent information may change between pings; lookups always key on
    /// this id, never on the info value.
    AgentId
);

string_id!(
    /// Unique identifier of one running master task instance.
    TaskInstanceId
);

impl Default for AgentId {
    fn default() -> Self {
        Self(String::new())
    }
}

/// Identifier of one dispatched job, unique within its task instance.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_id_generate() {
        let id1 = TaskInstanceId::generate();
        let id2 = TaskInstanceId::generate();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_id_display() {
        let id = AgentId::new("agent-7");
        assert_eq!(format!("{}", id), "agent-7");
        assert_eq!(JobId::new(42).to_string(), "42");
    }

    #[test]
    fn test_default_agent_id_is_empty() {
        assert!(AgentId::default().is_empty());
        assert!(!AgentId::generate().is_empty());
    }

    #[test]
    fn test_job_id_is_transparent_in_json() {
        let json = serde_json::to_string(&JobId::new(9)).unwrap();
        assert_eq!(json, "9");
    }
}
