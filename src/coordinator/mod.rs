//! Coordinator: accepts tasks, hands them out under leases, and records results.
//!
//! A fetch claims the queue head and leases the task to the caller in one step;
//! the worker then confirms with `acknowledge`. Leases that are never confirmed,
//! and tasks held by workers that stop heartbeating, are reclaimed by the
//! [`liveness`] monitor.

pub mod liveness;
pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::CoordinatorConfig;
use crate::error::{DatabaseError, DispatchError};
use crate::store::{Database, TaskGuard, TaskUpdate};
use crate::tasks::model::{QueueSnapshot, WorkerStatus};
use crate::tasks::{Completion, ReadyQueue, Task, TaskId, TaskStatus, Worker, WorkerId};

pub use liveness::{LivenessMonitor, SweepReport};
pub use routes::coordinator_routes;

/// Task dispatcher shared by the HTTP handlers and the liveness monitor.
pub struct Coordinator {
    db: Arc<dyn Database>,
    queue: ReadyQueue,
    clock: Arc<dyn Clock>,
    lease_duration: Duration,
    worker_timeout: Duration,
}

impl Coordinator {
    pub fn new(
        db: Arc<dyn Database>,
        clock: Arc<dyn Clock>,
        lease_duration: Duration,
        worker_timeout: Duration,
    ) -> Self {
        Self {
            db,
            queue: ReadyQueue::new(),
            clock,
            lease_duration,
            worker_timeout,
        }
    }

    pub fn from_config(
        db: Arc<dyn Database>,
        clock: Arc<dyn Clock>,
        config: &CoordinatorConfig,
    ) -> Self {
        Self::new(db, clock, config.lease_duration, config.worker_timeout)
    }

    pub fn store(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn queue(&self) -> &ReadyQueue {
        &self.queue
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn worker_timeout(&self) -> Duration {
        self.worker_timeout
    }

    fn lease_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.lease_duration)
            .ok()
            .and_then(|lease| now.checked_add_signed(lease))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    // ── Tasks ───────────────────────────────────────────────────────

    /// Persist a new `pending` task and make it dispatchable.
    pub async fn submit(&self, description: &str) -> Result<TaskId, DispatchError> {
        if description.trim().is_empty() {
            return Err(DispatchError::Validation(
                "description must not be empty".into(),
            ));
        }

        let task = self.db.create_task(description, self.clock.now()).await?;
        self.queue.enqueue(task.id).await;
        info!(task_id = task.id, "Task submitted");
        Ok(task.id)
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<Task, DispatchError> {
        self.db
            .get_task(task_id)
            .await?
            .ok_or_else(|| DispatchError::task_not_found(task_id))
    }

    /// Claim the oldest dispatchable task and lease it to `worker_id`.
    ///
    /// Never waits: an empty queue is reported as `QueueEmpty`.
    pub async fn fetch(&self, worker_id: WorkerId) -> Result<Task, DispatchError> {
        let worker = self.require_worker(worker_id).await?;
        if worker.status != WorkerStatus::Active {
            return Err(DispatchError::Conflict(format!(
                "worker {worker_id} is marked failed; send a heartbeat to rejoin"
            )));
        }

        loop {
            let Some(task_id) = self.queue.claim_head().await else {
                return Err(DispatchError::QueueEmpty);
            };

            let now = self.clock.now();
            let update = TaskUpdate::lease(worker_id, self.lease_deadline(now), now);
            match self
                .db
                .update_task(task_id, TaskGuard::status(TaskStatus::Pending), update)
                .await
            {
                Ok(task) => {
                    info!(task_id, worker_id, "Task leased");
                    return Ok(task);
                }
                Err(DatabaseError::Conflict { .. } | DatabaseError::NotFound { .. }) => {
                    debug!(task_id, "Dropping stale queue entry");
                }
                Err(e) => {
                    self.queue.restore_head(task_id).await;
                    warn!(task_id, worker_id, error = %e, "Lease write failed, task kept at head");
                    return Err(e.into());
                }
            }
        }
    }

    /// Confirm a lease: `leased → processing`.
    pub async fn acknowledge(
        &self,
        task_id: TaskId,
        worker_id: WorkerId,
    ) -> Result<Task, DispatchError> {
        let task = self.get_task(task_id).await?;
        if task.status != TaskStatus::Leased || !task.is_owned_by(worker_id) {
            return Err(DispatchError::Conflict(format!(
                "task {task_id} is not leased to worker {worker_id}"
            )));
        }

        let now = self.clock.now();
        if task.lease_expired(now) {
            return Err(DispatchError::Conflict(format!(
                "lease on task {task_id} has expired"
            )));
        }

        let task = self
            .db
            .update_task(
                task_id,
                TaskGuard::owned(TaskStatus::Leased, worker_id),
                TaskUpdate::processing(worker_id, now),
            )
            .await?;
        info!(task_id, worker_id, "Task acknowledged");
        Ok(task)
    }

    /// Record a progress marker or the final outcome of a task.
    ///
    /// Repeating an identical final report returns the stored task unchanged.
    pub async fn complete(
        &self,
        task_id: TaskId,
        worker_id: WorkerId,
        completion: Completion,
    ) -> Result<Task, DispatchError> {
        let task = self.get_task(task_id).await?;

        let (target, result) = match &completion {
            Completion::Progress => {
                if task.is_owned_by(worker_id) {
                    debug!(task_id, worker_id, "Progress reported");
                    return Ok(task);
                }
                return Err(not_owner(task_id, worker_id));
            }
            Completion::Succeeded(r) => (TaskStatus::Completed, r.clone()),
            Completion::Failed(r) => (TaskStatus::Failed, r.clone()),
        };

        if task.status.is_terminal() {
            if is_repeat(&task, worker_id, &completion) {
                debug!(task_id, worker_id, "Duplicate completion ignored");
                return Ok(task);
            }
            return Err(DispatchError::Conflict(format!(
                "task {task_id} is already {}",
                task.status
            )));
        }

        if task.status != TaskStatus::Processing || !task.is_owned_by(worker_id) {
            return Err(not_owner(task_id, worker_id));
        }

        let update = TaskUpdate::finish(target, result, worker_id, self.clock.now());
        match self
            .db
            .update_task(
                task_id,
                TaskGuard::owned(TaskStatus::Processing, worker_id),
                update,
            )
            .await
        {
            Ok(task) => {
                info!(task_id, worker_id, status = %task.status, "Task finished");
                Ok(task)
            }
            // A concurrent retry of the same report may have won the write.
            Err(DatabaseError::Conflict { reason, .. }) => {
                let current = self.get_task(task_id).await?;
                if is_repeat(&current, worker_id, &completion) {
                    Ok(current)
                } else {
                    Err(DispatchError::Conflict(reason))
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    // ── Workers ─────────────────────────────────────────────────────

    pub async fn register(&self) -> Result<Worker, DispatchError> {
        let worker = self.db.create_worker(self.clock.now()).await?;
        info!(worker_id = worker.id, "Worker registered");
        Ok(worker)
    }

    /// Refresh a worker's heartbeat. A failed worker becomes active again.
    pub async fn heartbeat(&self, worker_id: WorkerId) -> Result<Worker, DispatchError> {
        let previous = self.require_worker(worker_id).await?;
        let worker = self
            .db
            .update_worker_heartbeat(worker_id, self.clock.now())
            .await?;
        if previous.status == WorkerStatus::Failed {
            info!(worker_id, "Failed worker rejoined");
        } else {
            debug!(worker_id, "Heartbeat");
        }
        Ok(worker)
    }

    pub async fn list_workers(&self) -> Result<Vec<Worker>, DispatchError> {
        Ok(self.db.list_workers().await?)
    }

    async fn require_worker(&self, worker_id: WorkerId) -> Result<Worker, DispatchError> {
        self.db
            .get_worker(worker_id)
            .await?
            .ok_or_else(|| DispatchError::worker_not_found(worker_id))
    }

    // ── Queue ───────────────────────────────────────────────────────

    /// Reload the ready queue from the `pending` rows. Returns the queue depth.
    pub async fn rebuild_queue(&self) -> Result<usize, DispatchError> {
        let pending = self.db.list_tasks_by_status(TaskStatus::Pending).await?;
        self.queue.rebuild(pending.iter().map(|t| t.id)).await;
        let depth = self.queue.len().await;
        info!(depth, "Ready queue rebuilt");
        Ok(depth)
    }

    /// Current queue contents without claiming anything.
    pub async fn ready_snapshot(&self) -> QueueSnapshot {
        let task_ids = self.queue.snapshot().await;
        QueueSnapshot {
            depth: task_ids.len(),
            task_ids,
        }
    }
}

fn not_owner(task_id: TaskId, worker_id: WorkerId) -> DispatchError {
    DispatchError::Conflict(format!("worker {worker_id} does not own task {task_id}"))
}

/// Whether `task` already holds exactly this final report from `worker_id`.
fn is_repeat(task: &Task, worker_id: WorkerId, completion: &Completion) -> bool {
    completion.terminal_status() == Some(task.status)
        && task.completed_by == Some(worker_id)
        && task.result.as_deref() == completion.result()
}
