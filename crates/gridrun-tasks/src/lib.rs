//! Built-in GridRun task plugins.
//!
//! Hosts call [`register`] to make every built-in task type available to
//! catalog entries that name it.

use gridrun_core::PluginRegistry;

pub mod primes;

/// Register every built-in task type.
pub fn register(registry: &mut PluginRegistry) {
    primes::register(registry);
}
