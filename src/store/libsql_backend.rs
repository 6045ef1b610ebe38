//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Every write is a single
//! statement with `RETURNING`, so a row is never re-read between the write
//! and the response.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{Database, TaskGuard, TaskUpdate};
use crate::tasks::model::{Task, TaskId, TaskStatus, Worker, WorkerId, WorkerStatus};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run a query expected to yield at most one task row.
    async fn query_task(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("{op} row: {e}"))),
        }
    }

    /// Run a query expected to yield at most one worker row.
    async fn query_worker(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Option<Worker>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_worker(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("{op} row: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(ndt.and_utc());
    }
    Err(DatabaseError::Serialization(format!(
        "invalid timestamp: {s:?}"
    )))
}

fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.as_deref().map(parse_datetime).transpose()
}

fn row_error(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("Failed to read row: {e}"))
}

/// Convert an optional integer to a libsql Value.
fn opt_int(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

/// Convert an optional timestamp to a libsql Value.
fn opt_datetime(v: Option<DateTime<Utc>>) -> libsql::Value {
    match v {
        Some(dt) => libsql::Value::Text(dt.to_rfc3339()),
        None => libsql::Value::Null,
    }
}

/// Column list for task SELECT / RETURNING clauses.
const TASK_COLUMNS: &str = "id, description, status, result, worker_id, lease_expires_at, completed_by, created_at, completed_at, updated_at";

const WORKER_COLUMNS: &str = "id, last_heartbeat, status, registered_at";

/// Map a libsql Row to a Task. Column order matches TASK_COLUMNS.
fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let status_str: String = row.get(2).map_err(row_error)?;
    let status = status_str
        .parse::<TaskStatus>()
        .map_err(DatabaseError::Serialization)?;
    let created_str: String = row.get(7).map_err(row_error)?;
    let updated_str: String = row.get(9).map_err(row_error)?;

    Ok(Task {
        id: row.get(0).map_err(row_error)?,
        description: row.get(1).map_err(row_error)?,
        status,
        result: row.get(3).ok(),
        worker_id: row.get(4).ok(),
        lease_expires_at: parse_optional_datetime(row.get(5).ok())?,
        completed_by: row.get(6).ok(),
        created_at: parse_datetime(&created_str)?,
        completed_at: parse_optional_datetime(row.get(8).ok())?,
        updated_at: parse_datetime(&updated_str)?,
    })
}

/// Map a libsql Row to a Worker. Column order matches WORKER_COLUMNS.
fn row_to_worker(row: &libsql::Row) -> Result<Worker, DatabaseError> {
    let heartbeat_str: String = row.get(1).map_err(row_error)?;
    let status_str: String = row.get(2).map_err(row_error)?;
    let registered_str: String = row.get(3).map_err(row_error)?;

    Ok(Worker {
        id: row.get(0).map_err(row_error)?,
        last_heartbeat: parse_datetime(&heartbeat_str)?,
        status: status_str
            .parse::<WorkerStatus>()
            .map_err(DatabaseError::Serialization)?,
        registered_at: parse_datetime(&registered_str)?,
    })
}

fn task_not_found(id: TaskId) -> DatabaseError {
    DatabaseError::NotFound {
        entity: "task".into(),
        id: id.to_string(),
    }
}

fn worker_not_found(id: WorkerId) -> DatabaseError {
    DatabaseError::NotFound {
        entity: "worker".into(),
        id: id.to_string(),
    }
}

fn describe_owner(owner: Option<WorkerId>) -> String {
    owner.map_or_else(|| "none".to_string(), |w| w.to_string())
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn create_task(
        &self,
        description: &str,
        now: DateTime<Utc>,
    ) -> Result<Task, DatabaseError> {
        let now_str = now.to_rfc3339();
        let task = self
            .query_task(
                "create_task",
                &format!(
                    "INSERT INTO tasks (description, status, created_at, updated_at)
                     VALUES (?1, 'pending', ?2, ?2)
                     RETURNING {TASK_COLUMNS}"
                ),
                params![description, now_str],
            )
            .await?
            .ok_or_else(|| DatabaseError::Query("create_task: no row returned".into()))?;
        debug!(task_id = task.id, "Task created");
        Ok(task)
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, DatabaseError> {
        self.query_task(
            "get_task",
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![id],
        )
        .await
    }

    async fn update_task(
        &self,
        id: TaskId,
        guard: TaskGuard,
        update: TaskUpdate,
    ) -> Result<Task, DatabaseError> {
        if !guard.status.can_transition_to(update.status) {
            return Err(DatabaseError::Conflict {
                entity: "task".into(),
                id: id.to_string(),
                reason: format!("illegal transition {} -> {}", guard.status, update.status),
            });
        }

        let updated = self
            .query_task(
                "update_task",
                &format!(
                    "UPDATE tasks SET status = ?1, worker_id = ?2, lease_expires_at = ?3,
                         result = ?4, completed_by = ?5, completed_at = ?6, updated_at = ?7
                     WHERE id = ?8 AND status = ?9 AND (?10 IS NULL OR worker_id = ?10)
                     RETURNING {TASK_COLUMNS}"
                ),
                params![
                    update.status.as_str(),
                    opt_int(update.worker_id),
                    opt_datetime(update.lease_expires_at),
                    update.result,
                    opt_int(update.completed_by),
                    opt_datetime(update.completed_at),
                    update.updated_at.to_rfc3339(),
                    id,
                    guard.status.as_str(),
                    opt_int(guard.worker_id),
                ],
            )
            .await?;

        if let Some(task) = updated {
            debug!(task_id = id, from = %guard.status, to = %task.status, "Task updated");
            return Ok(task);
        }

        // Nothing matched: tell a missing row apart from a lost race.
        match self.get_task(id).await? {
            None => Err(task_not_found(id)),
            Some(current) => Err(DatabaseError::Conflict {
                entity: "task".into(),
                id: id.to_string(),
                reason: format!(
                    "task {id} is {} (owner {}), expected {} (owner {})",
                    current.status,
                    describe_owner(current.worker_id),
                    guard.status,
                    guard
                        .worker_id
                        .map_or_else(|| "any".to_string(), |w| w.to_string()),
                ),
            }),
        }
    }

    async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 ORDER BY id ASC"),
                params![status.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks_by_status: {e}")))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks_by_status row: {e}")))?
        {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    // ── Workers ─────────────────────────────────────────────────────

    async fn create_worker(&self, now: DateTime<Utc>) -> Result<Worker, DatabaseError> {
        let now_str = now.to_rfc3339();
        let worker = self
            .query_worker(
                "create_worker",
                &format!(
                    "INSERT INTO workers (last_heartbeat, status, registered_at)
                     VALUES (?1, 'active', ?1)
                     RETURNING {WORKER_COLUMNS}"
                ),
                params![now_str],
            )
            .await?
            .ok_or_else(|| DatabaseError::Query("create_worker: no row returned".into()))?;
        debug!(worker_id = worker.id, "Worker created");
        Ok(worker)
    }

    async fn get_worker(&self, id: WorkerId) -> Result<Option<Worker>, DatabaseError> {
        self.query_worker(
            "get_worker",
            &format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = ?1"),
            params![id],
        )
        .await
    }

    async fn update_worker_heartbeat(
        &self,
        id: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Worker, DatabaseError> {
        self.query_worker(
            "update_worker_heartbeat",
            &format!(
                "UPDATE workers SET last_heartbeat = ?1, status = 'active'
                 WHERE id = ?2
                 RETURNING {WORKER_COLUMNS}"
            ),
            params![now.to_rfc3339(), id],
        )
        .await?
        .ok_or_else(|| worker_not_found(id))
    }

    async fn list_workers(&self) -> Result<Vec<Worker>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {WORKER_COLUMNS} FROM workers ORDER BY id ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_workers: {e}")))?;

        let mut workers = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_workers row: {e}")))?
        {
            workers.push(row_to_worker(&row)?);
        }
        Ok(workers)
    }

    async fn mark_worker_failed(
        &self,
        id: WorkerId,
        observed_heartbeat: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE workers SET status = 'failed'
                 WHERE id = ?1 AND status = 'active' AND last_heartbeat = ?2",
                params![id, observed_heartbeat.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_worker_failed: {e}")))?;

        if changed > 0 {
            return Ok(true);
        }
        match self.get_worker(id).await? {
            Some(_) => Ok(false),
            None => Err(worker_not_found(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    // ── Task tests ──────────────────────────────────────────────────

    #[tokio::test]
    async fn create_and_get_task() {
        let db = test_db().await;
        let now = Utc::now();

        let task = db.create_task("compute pi", now).await.unwrap();
        assert_eq!(task.id, 1);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.worker_id.is_none());

        let fetched = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched, task);
    }

    #[tokio::test]
    async fn task_ids_are_monotonic() {
        let db = test_db().await;
        let now = Utc::now();
        let a = db.create_task("a", now).await.unwrap();
        let b = db.create_task("b", now).await.unwrap();
        assert!(b.id > a.id);
    }

    #[tokio::test]
    async fn get_task_not_found() {
        let db = test_db().await;
        assert!(db.get_task(42).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_task_applies_when_guard_matches() {
        let db = test_db().await;
        let now = Utc::now();
        let task = db.create_task("work", now).await.unwrap();

        let expires = now + chrono::Duration::seconds(30);
        let leased = db
            .update_task(
                task.id,
                TaskGuard::status(TaskStatus::Pending),
                TaskUpdate::lease(9, expires, now),
            )
            .await
            .unwrap();
        assert_eq!(leased.status, TaskStatus::Leased);
        assert_eq!(leased.worker_id, Some(9));
        assert_eq!(
            leased.lease_expires_at.map(|d| d.timestamp()),
            Some(expires.timestamp())
        );
    }

    #[tokio::test]
    async fn update_task_conflicts_on_stale_status() {
        let db = test_db().await;
        let now = Utc::now();
        let task = db.create_task("work", now).await.unwrap();

        let err = db
            .update_task(
                task.id,
                TaskGuard::status(TaskStatus::Leased),
                TaskUpdate::processing(1, now),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict { .. }));

        let unchanged = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn update_task_conflicts_on_wrong_owner() {
        let db = test_db().await;
        let now = Utc::now();
        let task = db.create_task("work", now).await.unwrap();
        db.update_task(
            task.id,
            TaskGuard::status(TaskStatus::Pending),
            TaskUpdate::lease(1, now, now),
        )
        .await
        .unwrap();

        let err = db
            .update_task(
                task.id,
                TaskGuard::owned(TaskStatus::Leased, 2),
                TaskUpdate::processing(2, now),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict { .. }));
    }

    #[tokio::test]
    async fn update_task_rejects_illegal_transition() {
        let db = test_db().await;
        let now = Utc::now();
        let task = db.create_task("work", now).await.unwrap();

        let err = db
            .update_task(
                task.id,
                TaskGuard::status(TaskStatus::Pending),
                TaskUpdate::finish(TaskStatus::Completed, "skipped".into(), 1, now),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict { .. }));
        assert_eq!(
            db.get_task(task.id).await.unwrap().unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn update_missing_task_is_not_found() {
        let db = test_db().await;
        let err = db
            .update_task(
                7,
                TaskGuard::status(TaskStatus::Pending),
                TaskUpdate::lease(1, Utc::now(), Utc::now()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn finish_records_result_and_clears_owner() {
        let db = test_db().await;
        let now = Utc::now();
        let task = db.create_task("work", now).await.unwrap();
        db.update_task(task.id, TaskGuard::status(TaskStatus::Pending), TaskUpdate::lease(3, now, now))
            .await
            .unwrap();
        db.update_task(task.id, TaskGuard::owned(TaskStatus::Leased, 3), TaskUpdate::processing(3, now))
            .await
            .unwrap();

        let done = db
            .update_task(
                task.id,
                TaskGuard::owned(TaskStatus::Processing, 3),
                TaskUpdate::finish(TaskStatus::Completed, "3.14159".into(), 3, now),
            )
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result.as_deref(), Some("3.14159"));
        assert_eq!(done.completed_by, Some(3));
        assert!(done.worker_id.is_none());
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn list_tasks_by_status_in_id_order() {
        let db = test_db().await;
        let now = Utc::now();
        for name in ["a", "b", "c"] {
            db.create_task(name, now).await.unwrap();
        }
        db.update_task(2, TaskGuard::status(TaskStatus::Pending), TaskUpdate::lease(1, now, now))
            .await
            .unwrap();

        let pending: Vec<TaskId> = db
            .list_tasks_by_status(TaskStatus::Pending)
            .await
            .unwrap()
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(pending, vec![1, 3]);

        let leased = db.list_tasks_by_status(TaskStatus::Leased).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].id, 2);
    }

    // ── Worker tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn create_and_list_workers() {
        let db = test_db().await;
        let now = Utc::now();
        let w1 = db.create_worker(now).await.unwrap();
        let w2 = db.create_worker(now).await.unwrap();
        assert_eq!(w1.status, WorkerStatus::Active);
        assert!(w2.id > w1.id);

        let all = db.list_workers().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(db.get_worker(w1.id).await.unwrap().unwrap(), w1);
    }

    #[tokio::test]
    async fn mark_failed_is_one_shot() {
        let db = test_db().await;
        let worker = db.create_worker(Utc::now()).await.unwrap();

        let seen = worker.last_heartbeat;
        assert!(db.mark_worker_failed(worker.id, seen).await.unwrap());
        assert!(!db.mark_worker_failed(worker.id, seen).await.unwrap());
        assert_eq!(
            db.get_worker(worker.id).await.unwrap().unwrap().status,
            WorkerStatus::Failed
        );
        assert!(matches!(
            db.mark_worker_failed(99, seen).await,
            Err(DatabaseError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn mark_failed_skips_worker_that_heartbeated_since() {
        let db = test_db().await;
        let start = Utc::now();
        let worker = db.create_worker(start).await.unwrap();

        db.update_worker_heartbeat(worker.id, start + chrono::Duration::seconds(20))
            .await
            .unwrap();

        assert!(!db.mark_worker_failed(worker.id, worker.last_heartbeat).await.unwrap());
        assert_eq!(
            db.get_worker(worker.id).await.unwrap().unwrap().status,
            WorkerStatus::Active
        );
    }

    #[tokio::test]
    async fn heartbeat_reactivates_failed_worker() {
        let db = test_db().await;
        let start = Utc::now();
        let worker = db.create_worker(start).await.unwrap();
        db.mark_worker_failed(worker.id, worker.last_heartbeat)
            .await
            .unwrap();

        let later = start + chrono::Duration::seconds(60);
        let refreshed = db.update_worker_heartbeat(worker.id, later).await.unwrap();
        assert_eq!(refreshed.status, WorkerStatus::Active);
        assert_eq!(refreshed.last_heartbeat.timestamp(), later.timestamp());
    }

    #[tokio::test]
    async fn heartbeat_unknown_worker_is_not_found() {
        let db = test_db().await;
        let err = db.update_worker_heartbeat(5, Utc::now()).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    // ── Persistence tests ───────────────────────────────────────────

    #[tokio::test]
    async fn records_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("taskgrid.db");

        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.create_task("durable", Utc::now()).await.unwrap();
            db.create_worker(Utc::now()).await.unwrap();
        }

        let db = LibSqlBackend::new_local(&path).await.unwrap();
        let pending = db.list_tasks_by_status(TaskStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].description, "durable");
        assert_eq!(db.list_workers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let db = test_db().await;
        db.run_migrations().await.unwrap();
    }
}
