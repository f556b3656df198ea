//! Cron triggers for recurring launches.

use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use cron::Schedule;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::GridError;

/// Identity of a recurring launch. Scheduling the same key again replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ScheduleKey {
    pub repository: String,
    pub master_id: String,
    pub slave_id: String,
}

struct Trigger {
    expression: String,
    handle: JoinHandle<()>,
}

/// Registered cron triggers.
#[derive(Default)]
pub struct Scheduler {
    triggers: Mutex<HashMap<ScheduleKey, Trigger>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ScheduleKey, Trigger>> {
        self.triggers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `fire` at every instant matching `expression` (6 or 7 fields,
    /// seconds first). Replaces any trigger registered under `key`.
    pub fn schedule<F, Fut>(&self, key: ScheduleKey, expression: &str, fire: F) -> Result<(), GridError>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let schedule = Schedule::from_str(expression)
            .map_err(|e| GridError::InvalidSchedule(format!("{expression}: {e}")))?;

        let label = key.clone();
        let handle = tokio::spawn(async move {
            for next in schedule.upcoming(Utc) {
                let wait = (next - Utc::now()).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;
                debug!(repository = %label.repository, master_id = %label.master_id, "Cron trigger fired");
                if !fire().await {
                    break;
                }
            }
        });

        info!(
            repository = %key.repository,
            master_id = %key.master_id,
            expression,
            "Task scheduled"
        );
        let trigger = Trigger {
            expression: expression.to_string(),
            handle,
        };
        if let Some(previous) = self.lock().insert(key, trigger) {
            previous.handle.abort();
        }
        Ok(())
    }

    /// Cancel the trigger of `key`. Returns false if none was registered.
    pub fn unschedule(&self, key: &ScheduleKey) -> bool {
        match self.lock().remove(key) {
            Some(trigger) => {
                trigger.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Registered keys and their expressions.
    pub fn list(&self) -> Vec<(ScheduleKey, String)> {
        let mut triggers: Vec<(ScheduleKey, String)> = self
            .lock()
            .iter()
            .map(|(k, t)| (k.clone(), t.expression.clone()))
            .collect();
        triggers.sort();
        triggers
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for trigger in self.lock().values() {
            trigger.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn key() -> ScheduleKey {
        ScheduleKey {
            repository: "Primes".into(),
            master_id: "m1".into(),
            slave_id: "s1".into(),
        }
    }

    #[test]
    fn test_invalid_expression_is_rejected() {
        let scheduler = Scheduler::new();
        let err = scheduler
            .schedule(key(), "not a cron", || async { true })
            .unwrap_err();
        assert!(matches!(err, GridError::InvalidSchedule(_)));
        assert!(scheduler.list().is_empty());
    }

    #[tokio::test]
    async fn test_every_second_trigger_fires() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        scheduler
            .schedule(key(), "* * * * * *", move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    true
                }
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2200)).await;
        assert!(fired.load(Ordering::SeqCst) >= 1);
        assert!(scheduler.unschedule(&key()));
        assert!(!scheduler.unschedule(&key()));
    }

    #[tokio::test]
    async fn test_reschedule_replaces_trigger() {
        let scheduler = Scheduler::new();
        scheduler
            .schedule(key(), "0 0 * * * *", || async { true })
            .unwrap();
        scheduler
            .schedule(key(), "0 30 * * * *", || async { true })
            .unwrap();

        let triggers = scheduler.list();
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].1, "0 30 * * * *");
    }
}
