//! Stalled evaluation watchdog.
//!
//! An evaluation that crashes mid-flight leaves its task `in_progress` with no
//! crown record. The lock is not reset automatically; stalled tasks are logged
//! and surfaced through the API so an operator can see them.

use crate::storage::{Storage, StorageError};
use chrono::{DateTime, Utc};
use crown_core::{Config, Task};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Watchdog settings.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    /// How long an evaluation may hold the lock before it counts as stalled.
    pub stall_timeout: Duration,
    pub check_interval: Duration,
}

impl WatchdogConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            stall_timeout: config.stall_timeout(),
            check_interval: config.stall_check_interval(),
        }
    }
}

/// Periodically reports tasks whose evaluation has stalled.
#[derive(Debug)]
pub struct Watchdog {
    storage: Arc<Storage>,
    config: WatchdogConfig,
    shutdown: AtomicBool,
}

impl Watchdog {
    pub fn new(storage: Arc<Storage>, config: WatchdogConfig) -> Self {
        Self {
            storage,
            config,
            shutdown: AtomicBool::new(false),
        }
    }

    /// One scan. Returns the stalled tasks after logging each of them.
    pub async fn check(&self, now: DateTime<Utc>) -> Result<Vec<Task>, StorageError> {
        let timeout = chrono::Duration::from_std(self.config.stall_timeout)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(timeout).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let stalled = self.storage.list_stalled_evaluations(cutoff).await?;
        for task in &stalled {
            let held_for = task
                .crown_started_at
                .map(|started| (now - started).num_seconds())
                .unwrap_or_default();
            warn!(
                task_id = %task.id,
                team = %task.team,
                held_for_secs = held_for,
                "crown evaluation appears stalled"
            );
        }
        Ok(stalled)
    }

    /// Scan every `check_interval` until [`Watchdog::shutdown`] is called.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.config.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if self.shutdown.load(Ordering::SeqCst) {
                debug!("watchdog stopping");
                break;
            }
            if let Err(err) = self.check(Utc::now()).await {
                warn!(error = %err, "stall check failed");
            }
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::create_test_storage;
    use crate::storage::TaskStore;
    use crown_core::TaskRun;

    fn watchdog(storage: Storage, timeout_secs: u64) -> Watchdog {
        Watchdog::new(
            Arc::new(storage),
            WatchdogConfig {
                stall_timeout: Duration::from_secs(timeout_secs),
                check_interval: Duration::from_millis(10),
            },
        )
    }

    #[tokio::test]
    async fn reports_only_old_locks() {
        let ts = create_test_storage().await;
        let task = Task::new("team", "stuck");
        ts.storage.insert_task(&task).await.unwrap();
        assert!(ts.storage.try_begin_evaluation(&task.id).await.unwrap());

        let dog = watchdog(ts.storage.clone(), 60);
        assert!(dog.check(Utc::now()).await.unwrap().is_empty());

        let later = Utc::now() + chrono::Duration::seconds(120);
        let stalled = dog.check(later).await.unwrap();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].id, task.id);
        assert!(stalled[0].evaluation_stalled(later, Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn crowned_and_idle_tasks_are_not_stalled() {
        let ts = create_test_storage().await;
        let idle = Task::new("team", "idle");
        ts.storage.insert_task(&idle).await.unwrap();

        let crowned = Task::new("team", "crowned");
        ts.storage.insert_task(&crowned).await.unwrap();
        let run = TaskRun::new(crowned.id.clone(), "a", None);
        ts.storage.insert_run(&run).await.unwrap();
        assert!(ts.storage.try_begin_evaluation(&crowned.id).await.unwrap());
        ts.storage
            .set_crown_winner(&crowned.id, &run.id, "only one")
            .await
            .unwrap();

        let dog = watchdog(ts.storage.clone(), 0);
        let later = Utc::now() + chrono::Duration::seconds(5);
        assert!(dog.check(later).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_stops_after_shutdown() {
        let ts = create_test_storage().await;
        let dog = Arc::new(watchdog(ts.storage.clone(), 60));
        let handle = tokio::spawn({
            let dog = Arc::clone(&dog);
            async move { dog.run().await }
        });
        dog.shutdown();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
