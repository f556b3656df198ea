//! Shared application state.

use std::sync::Arc;

use gridrun_core::PluginRegistry;

use crate::config::Config;
use crate::manager::GridManager;

/// State shared by the HTTP handlers.
pub struct AppState {
    /// The grid coordinator.
    pub manager: Arc<GridManager>,
}

impl AppState {
    /// Start a manager and wrap it in an Arc'd state.
    pub fn new(config: Config, plugins: PluginRegistry) -> Arc<Self> {
        Arc::new(Self {
            manager: GridManager::new(config, plugins),
        })
    }

    /// Wrap an already running manager.
    pub fn with_manager(manager: Arc<GridManager>) -> Arc<Self> {
        Arc::new(Self { manager })
    }

    pub fn config(&self) -> &Config {
        self.manager.config()
    }
}
