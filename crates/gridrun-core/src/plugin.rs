//! Plugin registration: maps task type names to factories.
//!
//! Task binaries are never loaded dynamically. A host (the manager itself or
//! the out-of-process host) registers the task types it links against, and
//! catalog entries refer to them by `type_name`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::{CoreError, MasterTask, SlaveTask};

type MasterFactory = Arc<dyn Fn() -> Box<dyn MasterTask> + Send + Sync>;
type SlaveFactory = Arc<dyn Fn() -> Box<dyn SlaveTask> + Send + Sync>;

/// Registry of task factories keyed by type name.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    masters: HashMap<String, MasterFactory>,
    slaves: HashMap<String, SlaveFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a master task factory.
    pub fn register_master<F>(&mut self, type_name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn MasterTask> + Send + Sync + 'static,
    {
        self.masters.insert(type_name.into(), Arc::new(factory));
    }

    /// Register a slave task factory.
    pub fn register_slave<F>(&mut self, type_name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn SlaveTask> + Send + Sync + 'static,
    {
        self.slaves.insert(type_name.into(), Arc::new(factory));
    }

    /// Construct a fresh master task.
    pub fn create_master(&self, type_name: &str) -> Result<Box<dyn MasterTask>, CoreError> {
        self.masters
            .get(type_name)
            .map(|factory| factory())
            .ok_or_else(|| CoreError::UnknownTaskType(type_name.to_string()))
    }

    /// Construct a fresh slave task.
    pub fn create_slave(&self, type_name: &str) -> Result<Box<dyn SlaveTask>, CoreError> {
        self.slaves
            .get(type_name)
            .map(|factory| factory())
            .ok_or_else(|| CoreError::UnknownTaskType(type_name.to_string()))
    }

    pub fn has_master(&self, type_name: &str) -> bool {
        self.masters.contains_key(type_name)
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut masters: Vec<_> = self.masters.keys().collect();
        let mut slaves: Vec<_> = self.slaves.keys().collect();
        masters.sort();
        slaves.sort();
        f.debug_struct("PluginRegistry")
            .field("masters", &masters)
            .field("slaves", &slaves)
            .finish()
    }
}
