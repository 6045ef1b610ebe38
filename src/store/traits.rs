//! `Database` trait: the task store and worker registry the coordinator relies on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::tasks::model::{Task, TaskId, TaskStatus, Worker, WorkerId};

/// Precondition for a task write. The write applies only if the stored row
/// still has `status` and, when given, `worker_id` as its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskGuard {
    pub status: TaskStatus,
    pub worker_id: Option<WorkerId>,
}

impl TaskGuard {
    /// Expect `status`, whoever owns the task.
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status,
            worker_id: None,
        }
    }

    /// Expect `status` with `worker_id` as owner.
    pub fn owned(status: TaskStatus, worker_id: WorkerId) -> Self {
        Self {
            status,
            worker_id: Some(worker_id),
        }
    }
}

/// New values for every mutable task column.
///
/// The constructors are the only transitions the dispatcher performs, so the
/// ownership columns always agree with the status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskUpdate {
    pub status: TaskStatus,
    pub worker_id: Option<WorkerId>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub completed_by: Option<WorkerId>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TaskUpdate {
    /// `pending → leased`.
    pub fn lease(worker_id: WorkerId, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            status: TaskStatus::Leased,
            worker_id: Some(worker_id),
            lease_expires_at: Some(expires_at),
            result: None,
            completed_by: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// `leased → processing`.
    pub fn processing(worker_id: WorkerId, now: DateTime<Utc>) -> Self {
        Self {
            status: TaskStatus::Processing,
            worker_id: Some(worker_id),
            lease_expires_at: None,
            result: None,
            completed_by: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Back to `pending` with ownership cleared.
    pub fn release(now: DateTime<Utc>) -> Self {
        Self {
            status: TaskStatus::Pending,
            worker_id: None,
            lease_expires_at: None,
            result: None,
            completed_by: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// `processing → completed | failed`.
    pub fn finish(
        status: TaskStatus,
        result: String,
        worker_id: WorkerId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            status,
            worker_id: None,
            lease_expires_at: None,
            result: Some(result),
            completed_by: Some(worker_id),
            completed_at: Some(now),
            updated_at: now,
        }
    }
}

/// Backend-agnostic persistence for tasks and workers.
///
/// Every method is atomic with respect to a single record.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a new `pending` task and return it with its assigned id.
    async fn create_task(
        &self,
        description: &str,
        now: DateTime<Utc>,
    ) -> Result<Task, DatabaseError>;

    /// Get a task by id.
    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, DatabaseError>;

    /// Compare-and-set a task.
    ///
    /// Returns `DatabaseError::Conflict` if `guard` no longer matches the
    /// stored row and `DatabaseError::NotFound` if the task does not exist.
    async fn update_task(
        &self,
        id: TaskId,
        guard: TaskGuard,
        update: TaskUpdate,
    ) -> Result<Task, DatabaseError>;

    /// All tasks with `status`, oldest id first.
    async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, DatabaseError>;

    // ── Workers ─────────────────────────────────────────────────────

    /// Register a new `active` worker.
    async fn create_worker(&self, now: DateTime<Utc>) -> Result<Worker, DatabaseError>;

    /// Get a worker by id.
    async fn get_worker(&self, id: WorkerId) -> Result<Option<Worker>, DatabaseError>;

    /// Refresh a worker's heartbeat and mark it `active`.
    async fn update_worker_heartbeat(
        &self,
        id: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Worker, DatabaseError>;

    /// All workers, oldest id first.
    async fn list_workers(&self) -> Result<Vec<Worker>, DatabaseError>;

    /// Transition an `active` worker to `failed`, provided its heartbeat is
    /// still `observed_heartbeat`.
    ///
    /// Returns false if the worker is already failed or heartbeated since.
    async fn mark_worker_failed(
        &self,
        id: WorkerId,
        observed_heartbeat: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;
}
