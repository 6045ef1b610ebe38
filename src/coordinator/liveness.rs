//! Liveness monitor: reclaims expired leases and tasks held by silent workers.
//!
//! Runs on a fixed interval. Every reset is a compare-and-set against the
//! status and owner observed during the scan, so a task that was acknowledged
//! or finished in the meantime is left alone and a reclaimed task is requeued
//! once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Coordinator;
use crate::error::DatabaseError;
use crate::store::{TaskGuard, TaskUpdate};
use crate::tasks::{Task, TaskStatus, WorkerStatus};

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_leases: usize,
    pub failed_workers: usize,
    pub recovered_tasks: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct LivenessMonitor {
    coordinator: Arc<Coordinator>,
    interval: Duration,
}

impl LivenessMonitor {
    pub fn new(coordinator: Arc<Coordinator>, interval: Duration) -> Self {
        Self {
            coordinator,
            interval,
        }
    }

    /// Spawn the sweep loop. The first sweep runs immediately.
    ///
    /// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop sweeping.
    pub fn spawn(self) -> (JoinHandle<()>, Arc<AtomicBool>) {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);

        let handle = tokio::spawn(async move {
            info!(interval_secs = self.interval.as_secs(), "Liveness monitor started");
            let mut tick = tokio::time::interval(self.interval);

            loop {
                tick.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    info!("Liveness monitor stopped");
                    break;
                }
                let report = self.sweep().await;
                if !report.is_empty() {
                    info!(
                        expired_leases = report.expired_leases,
                        failed_workers = report.failed_workers,
                        recovered_tasks = report.recovered_tasks,
                        "Liveness sweep reclaimed work"
                    );
                }
            }
        });

        (handle, shutdown_flag)
    }

    /// Single sweep: expire leases, then fail silent workers and recover their tasks.
    pub async fn sweep(&self) -> SweepReport {
        let expired_leases = self.expire_leases().await;
        let failed_workers = self.fail_silent_workers().await;
        let recovered_tasks = self.recover_orphaned_tasks().await;
        SweepReport {
            expired_leases,
            failed_workers,
            recovered_tasks,
        }
    }

    /// Return every `leased` task whose deadline has passed to the queue.
    async fn expire_leases(&self) -> usize {
        let leased = match self
            .coordinator
            .store()
            .list_tasks_by_status(TaskStatus::Leased)
            .await
        {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "Failed to list leased tasks, will retry next sweep");
                return 0;
            }
        };

        let now = self.coordinator.now();
        let mut expired = 0;
        for task in leased.iter().filter(|t| t.lease_expired(now)) {
            if self.release(task, TaskStatus::Leased).await {
                info!(task_id = task.id, worker_id = ?task.worker_id, "Lease expired");
                expired += 1;
            }
        }
        expired
    }

    /// Mark `active` workers that stopped heartbeating as `failed`.
    async fn fail_silent_workers(&self) -> usize {
        let workers = match self.coordinator.store().list_workers().await {
            Ok(workers) => workers,
            Err(e) => {
                warn!(error = %e, "Failed to list workers, will retry next sweep");
                return 0;
            }
        };

        let now = self.coordinator.now();
        let timeout = self.coordinator.worker_timeout();
        let mut failed = 0;
        for worker in workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Active && w.is_silent(now, timeout))
        {
            match self
                .coordinator
                .store()
                .mark_worker_failed(worker.id, worker.last_heartbeat)
                .await
            {
                Ok(true) => {
                    warn!(
                        worker_id = worker.id,
                        last_heartbeat = %worker.last_heartbeat,
                        "Worker missed heartbeats, marked failed"
                    );
                    failed += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(worker_id = worker.id, error = %e, "Failed to mark worker failed");
                }
            }
        }
        failed
    }

    /// Return every `processing` task owned by a `failed` worker to the queue.
    async fn recover_orphaned_tasks(&self) -> usize {
        let store = self.coordinator.store();
        let (workers, processing) = match tokio::try_join!(
            store.list_workers(),
            store.list_tasks_by_status(TaskStatus::Processing)
        ) {
            Ok(lists) => lists,
            Err(e) => {
                warn!(error = %e, "Failed to scan for orphaned tasks, will retry next sweep");
                return 0;
            }
        };

        let failed: Vec<_> = workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Failed)
            .map(|w| w.id)
            .collect();

        let mut recovered = 0;
        for task in processing
            .iter()
            .filter(|t| t.worker_id.is_some_and(|owner| failed.contains(&owner)))
        {
            if self.release(task, TaskStatus::Processing).await {
                info!(task_id = task.id, worker_id = ?task.worker_id, "Recovered task from failed worker");
                recovered += 1;
            }
        }
        recovered
    }

    /// CAS the task from `expected` back to `pending` and requeue it.
    /// Returns false if it moved on since the scan.
    async fn release(&self, task: &Task, expected: TaskStatus) -> bool {
        let Some(owner) = task.worker_id else {
            return false;
        };

        let result = self
            .coordinator
            .store()
            .update_task(
                task.id,
                TaskGuard::owned(expected, owner),
                TaskUpdate::release(self.coordinator.now()),
            )
            .await;

        match result {
            Ok(_) => {
                self.coordinator.queue().requeue(task.id).await;
                true
            }
            Err(DatabaseError::Conflict { .. }) => {
                debug!(task_id = task.id, "Task moved on since scan, skipping");
                false
            }
            Err(e) => {
                warn!(task_id = task.id, error = %e, "Failed to release task, will retry next sweep");
                false
            }
        }
    }
}
