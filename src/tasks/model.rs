//! Task and worker records, plus the request/response bodies of the HTTP API.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type TaskId = i64;
pub type WorkerId = i64;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the ready queue.
    Pending,
    /// Handed to a worker that has not acknowledged yet.
    Leased,
    /// Acknowledged and being executed.
    Processing,
    /// Finished with a result.
    Completed,
    /// Finished with a failure reported by the worker.
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Leased => "leased",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Statuses in which a task has an owning worker.
    pub fn is_owned(&self) -> bool {
        matches!(self, Self::Leased | Self::Processing)
    }

    /// Check whether the dispatch protocol allows moving to `target`.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, Leased)
                | (Leased, Processing)
                // Lease expiry
                | (Leased, Pending)
                // Owner declared dead
                | (Processing, Pending)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "leased" => Ok(Self::Leased),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// A unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub status: TaskStatus,
    /// Present only once the task is terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Owning worker; set iff the status is `leased` or `processing`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,
    /// Set iff the status is `leased`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Worker that reported the terminal outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_by: Option<WorkerId>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Whether `worker_id` currently owns this task.
    pub fn is_owned_by(&self, worker_id: WorkerId) -> bool {
        self.status.is_owned() && self.worker_id == Some(worker_id)
    }

    /// Whether the lease has run out at `now`. Always false outside `leased`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Leased
            && self.lease_expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// Liveness status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    /// Set only by the liveness monitor; cleared by the next heartbeat.
    Failed,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown worker status: {other}")),
        }
    }
}

/// A registered worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub last_heartbeat: DateTime<Utc>,
    pub status: WorkerStatus,
    pub registered_at: DateTime<Utc>,
}

impl Worker {
    /// Whether the worker has been silent for longer than `timeout` at `now`.
    pub fn is_silent(&self, now: DateTime<Utc>, timeout: std::time::Duration) -> bool {
        match chrono::Duration::from_std(timeout) {
            Ok(timeout) => now - self.last_heartbeat > timeout,
            Err(_) => false,
        }
    }
}

/// What a worker reports through `complete`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Still working; never changes status.
    Progress,
    Succeeded(String),
    Failed(String),
}

impl Completion {
    /// Terminal status this report leads to, if any.
    pub fn terminal_status(&self) -> Option<TaskStatus> {
        match self {
            Self::Progress => None,
            Self::Succeeded(_) => Some(TaskStatus::Completed),
            Self::Failed(_) => Some(TaskStatus::Failed),
        }
    }

    pub fn result(&self) -> Option<&str> {
        match self {
            Self::Progress => None,
            Self::Succeeded(r) | Self::Failed(r) => Some(r),
        }
    }
}

// ── Wire types ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdResponse {
    pub id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchQuery {
    pub worker_id: WorkerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckRequest {
    pub worker_id: WorkerId,
}

/// Body of `POST /tasks/{id}/complete`. A missing `result` is a progress marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub worker_id: WorkerId,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub failed: bool,
}

impl CompleteRequest {
    pub fn from_completion(worker_id: WorkerId, completion: &Completion) -> Self {
        Self {
            worker_id,
            result: completion.result().map(str::to_string),
            failed: matches!(completion, Completion::Failed(_)),
        }
    }

    pub fn into_completion(self) -> Completion {
        match (self.result, self.failed) {
            (None, _) => Completion::Progress,
            (Some(r), false) => Completion::Succeeded(r),
            (Some(r), true) => Completion::Failed(r),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub depth: usize,
    pub task_ids: Vec<TaskId>,
}

/// Error body returned by every failing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: String,
}
