//! Integration tests for the coordinator REST API and the HTTP worker client.
//!
//! Each test spins up an Axum server on a random port backed by a libSQL
//! database and a manual clock, then drives it through reqwest.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use taskgrid::clock::ManualClock;
use taskgrid::config::AgentConfig;
use taskgrid::coordinator::{Coordinator, LivenessMonitor, coordinator_routes};
use taskgrid::error::{AgentError, DispatchError};
use taskgrid::store::{Database, LibSqlBackend};
use taskgrid::tasks::{Completion, Task, TaskStatus};
use taskgrid::worker::{CoordinatorApi, HttpCoordinator, TaskExecutor, WorkerAgent};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const LEASE: Duration = Duration::from_secs(30);
const WORKER_TIMEOUT: Duration = Duration::from_secs(15);

struct TestServer {
    base_url: String,
    coordinator: Arc<Coordinator>,
    clock: Arc<ManualClock>,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn client(&self) -> HttpCoordinator {
        HttpCoordinator::new(&self.base_url, Duration::from_secs(5)).unwrap()
    }

    fn monitor(&self) -> LivenessMonitor {
        LivenessMonitor::new(Arc::clone(&self.coordinator), Duration::from_secs(5))
    }
}

/// Start an Axum server on a random port over `db`.
async fn start_server_with(db: Arc<dyn Database>) -> TestServer {
    let clock = Arc::new(ManualClock::default());
    let coordinator = Arc::new(Coordinator::new(db, clock.clone(), LEASE, WORKER_TIMEOUT));
    coordinator.rebuild_queue().await.unwrap();
    let app = coordinator_routes(Arc::clone(&coordinator));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        base_url: format!("http://127.0.0.1:{port}"),
        coordinator,
        clock,
    }
}

async fn start_server() -> TestServer {
    start_server_with(Arc::new(LibSqlBackend::new_memory().await.unwrap())).await
}

async fn submit(server: &TestServer, description: &str) -> i64 {
    let resp = reqwest::Client::new()
        .post(server.url("/tasks"))
        .json(&json!({ "description": description }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    resp.json::<Value>().await.unwrap()["id"].as_i64().unwrap()
}

async fn get_json(server: &TestServer, path: &str) -> Value {
    reqwest::get(server.url(path))
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap()
}

/// Executor that answers immediately.
struct InstantExecutor;

#[async_trait]
impl TaskExecutor for InstantExecutor {
    async fn execute(&self, task: &Task) -> anyhow::Result<String> {
        Ok(format!("done: {}", task.description))
    }
}

#[tokio::test]
async fn compute_pi_end_to_end() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let client = server.client();

        let worker_id = client.register().await.unwrap();
        let id = submit(&server, "compute pi").await;

        let leased = client.fetch(worker_id).await.unwrap();
        assert_eq!(leased.id, id);
        assert_eq!(leased.status, TaskStatus::Leased);

        let acked = client.acknowledge(id, worker_id).await.unwrap();
        assert_eq!(acked.status, TaskStatus::Processing);

        let done = client
            .complete(id, worker_id, &Completion::Succeeded("3.14159".into()))
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);

        let task = get_json(&server, &format!("/tasks/{id}")).await;
        assert_eq!(task["status"], "completed");
        assert_eq!(task["result"], "3.14159");
        assert!(task["completed_at"].is_string());

        // A retried report is accepted unchanged.
        let again = client
            .complete(id, worker_id, &Completion::Succeeded("3.14159".into()))
            .await
            .unwrap();
        assert_eq!(again, done);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn empty_queue_is_reported_not_waited_on() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let client = server.client();
        let worker_id = client.register().await.unwrap();

        let err = client.fetch(worker_id).await.unwrap_err();
        assert!(matches!(err, AgentError::Dispatch(DispatchError::QueueEmpty)));

        let err = client.fetch(worker_id + 100).await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::Dispatch(DispatchError::NotFound { .. })
        ));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn dead_worker_task_goes_to_survivor() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let client = server.client();
        let monitor = server.monitor();

        let dead = client.register().await.unwrap();
        let survivor = client.register().await.unwrap();
        let id = submit(&server, "long job").await;

        client.fetch(dead).await.unwrap();
        client.acknowledge(id, dead).await.unwrap();

        // The first worker goes silent; the survivor keeps heartbeating.
        server.clock.advance(WORKER_TIMEOUT + Duration::from_secs(1));
        client.heartbeat(survivor).await.unwrap();

        let report = monitor.sweep().await;
        assert_eq!(report.failed_workers, 1);
        assert_eq!(report.recovered_tasks, 1);

        let workers = get_json(&server, "/workers").await;
        let dead_entry = workers
            .as_array()
            .unwrap()
            .iter()
            .find(|w| w["id"] == dead)
            .unwrap();
        assert_eq!(dead_entry["status"], "failed");

        let task = client.fetch(survivor).await.unwrap();
        assert_eq!(task.id, id);
        client.acknowledge(id, survivor).await.unwrap();
        client
            .complete(id, survivor, &Completion::Succeeded("recovered".into()))
            .await
            .unwrap();

        // The original owner comes back too late.
        let err = client
            .complete(id, dead, &Completion::Succeeded("stale".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Dispatch(DispatchError::Conflict(_))));

        let stored = get_json(&server, &format!("/tasks/{id}")).await;
        assert_eq!(stored["result"], "recovered");
        assert_eq!(stored["completed_by"], survivor);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unacknowledged_lease_is_redelivered() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let client = server.client();
        let monitor = server.monitor();

        let slow = client.register().await.unwrap();
        let id = submit(&server, "redeliver me").await;
        client.fetch(slow).await.unwrap();

        let snapshot = get_json(&server, "/queue").await;
        assert_eq!(snapshot["depth"], 0);

        server.clock.advance(LEASE + Duration::from_secs(1));
        client.heartbeat(slow).await.unwrap();
        assert_eq!(monitor.sweep().await.expired_leases, 1);

        let snapshot = get_json(&server, "/queue").await;
        assert_eq!(snapshot["task_ids"], json!([id]));

        let err = client.acknowledge(id, slow).await.unwrap_err();
        assert!(matches!(err, AgentError::Dispatch(DispatchError::Conflict(_))));

        // Redelivered exactly once.
        assert_eq!(client.fetch(slow).await.unwrap().id, id);
        assert!(matches!(
            client.fetch(slow).await.unwrap_err(),
            AgentError::Dispatch(DispatchError::QueueEmpty)
        ));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn pending_tasks_survive_restart() {
    timeout(TEST_TIMEOUT, async {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("taskgrid.db");

        let (first, second) = {
            let db = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
            let server = start_server_with(db).await;
            (submit(&server, "first").await, submit(&server, "second").await)
        };

        let db = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
        let server = start_server_with(db).await;
        let snapshot = get_json(&server, "/queue").await;
        assert_eq!(snapshot["task_ids"], json!([first, second]));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn agent_drains_queue_over_http() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let ids = [
            submit(&server, "a").await,
            submit(&server, "b").await,
            submit(&server, "c").await,
        ];

        let config = AgentConfig {
            coordinator_url: server.base_url.clone(),
            heartbeat_interval: Duration::from_millis(50),
            poll_min: Duration::from_millis(5),
            poll_max: Duration::from_millis(20),
            ..AgentConfig::default()
        };
        let api: Arc<dyn CoordinatorApi> = Arc::new(server.client());
        let agent = WorkerAgent::new(api, Arc::new(InstantExecutor), config);
        let shutdown = agent.shutdown_handle();
        let handle = tokio::spawn(agent.run());

        for id in ids {
            loop {
                let task = get_json(&server, &format!("/tasks/{id}")).await;
                if task["status"] == "completed" {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        shutdown.store(true, Ordering::Relaxed);
        let ctx = handle.await.unwrap().unwrap();
        assert_eq!(ctx.tasks_completed, 3);

        let task = get_json(&server, &format!("/tasks/{}", ids[0])).await;
        assert_eq!(task["result"], "done: a");
    })
    .await
    .expect("test timed out");
}
