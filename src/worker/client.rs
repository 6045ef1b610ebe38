//! Coordinator client: the seam between a worker agent and the coordinator.
//!
//! `HttpCoordinator` speaks the REST API over reqwest. `Coordinator` itself
//! implements the same trait so agents can run in-process.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::coordinator::Coordinator;
use crate::error::{AgentError, DispatchError};
use crate::tasks::model::{AckRequest, CompleteRequest, ErrorBody, IdResponse};
use crate::tasks::{Completion, Task, TaskId, Worker, WorkerId};

/// Operations a worker agent needs from the coordinator.
#[async_trait]
pub trait CoordinatorApi: Send + Sync {
    async fn register(&self) -> Result<WorkerId, AgentError>;

    async fn heartbeat(&self, worker_id: WorkerId) -> Result<(), AgentError>;

    /// Claim and lease the next task. `DispatchError::QueueEmpty` when there is none.
    async fn fetch(&self, worker_id: WorkerId) -> Result<Task, AgentError>;

    async fn acknowledge(&self, task_id: TaskId, worker_id: WorkerId) -> Result<Task, AgentError>;

    async fn complete(
        &self,
        task_id: TaskId,
        worker_id: WorkerId,
        completion: &Completion,
    ) -> Result<Task, AgentError>;
}

// ── In-process ──────────────────────────────────────────────────────────

#[async_trait]
impl CoordinatorApi for Coordinator {
    async fn register(&self) -> Result<WorkerId, AgentError> {
        Ok(Coordinator::register(self).await?.id)
    }

    async fn heartbeat(&self, worker_id: WorkerId) -> Result<(), AgentError> {
        Coordinator::heartbeat(self, worker_id).await?;
        Ok(())
    }

    async fn fetch(&self, worker_id: WorkerId) -> Result<Task, AgentError> {
        Ok(Coordinator::fetch(self, worker_id).await?)
    }

    async fn acknowledge(&self, task_id: TaskId, worker_id: WorkerId) -> Result<Task, AgentError> {
        Ok(Coordinator::acknowledge(self, task_id, worker_id).await?)
    }

    async fn complete(
        &self,
        task_id: TaskId,
        worker_id: WorkerId,
        completion: &Completion,
    ) -> Result<Task, AgentError> {
        Ok(Coordinator::complete(self, task_id, worker_id, completion.clone()).await?)
    }
}

// ── HTTP ────────────────────────────────────────────────────────────────

/// REST client for a remote coordinator.
#[derive(Debug, Clone)]
pub struct HttpCoordinator {
    client: Client,
    base_url: String,
}

impl HttpCoordinator {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, AgentError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::Transport(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Decode a success body, or turn an error response into a `DispatchError`.
    ///
    /// `entity`/`id` name the resource a 404 refers to.
    async fn decode<T: DeserializeOwned>(
        resp: Response,
        entity: &str,
        id: i64,
    ) -> Result<T, AgentError> {
        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<T>()
                .await
                .map_err(|e| AgentError::Transport(format!("Invalid response body: {e}")));
        }

        let text = resp.text().await.unwrap_or_default();
        debug!(status = %status, body = %text, "Coordinator returned error");
        match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => Err(AgentError::Dispatch(dispatch_error(body, entity, id))),
            Err(_) if status.is_server_error() => Err(AgentError::Dispatch(
                DispatchError::StoreUnavailable(format!("{status}: {text}")),
            )),
            Err(_) => Err(AgentError::Transport(format!(
                "Unexpected response {status}: {text}"
            ))),
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        entity: &str,
        id: i64,
    ) -> Result<T, AgentError> {
        let resp = request
            .send()
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))?;
        Self::decode(resp, entity, id).await
    }
}

/// Rebuild the typed error from an `{error, kind}` body.
fn dispatch_error(body: ErrorBody, entity: &str, id: i64) -> DispatchError {
    match body.kind.as_str() {
        "validation" => DispatchError::Validation(body.error),
        "not_found" => DispatchError::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        },
        "queue_empty" => DispatchError::QueueEmpty,
        "conflict" => DispatchError::Conflict(body.error),
        _ => DispatchError::StoreUnavailable(body.error),
    }
}

#[async_trait]
impl CoordinatorApi for HttpCoordinator {
    async fn register(&self) -> Result<WorkerId, AgentError> {
        let resp: IdResponse = self
            .send(self.client.post(self.url("/workers")), "worker", 0)
            .await?;
        Ok(resp.id)
    }

    async fn heartbeat(&self, worker_id: WorkerId) -> Result<(), AgentError> {
        let _: Worker = self
            .send(
                self.client
                    .post(self.url(&format!("/workers/{worker_id}/heartbeat"))),
                "worker",
                worker_id,
            )
            .await?;
        Ok(())
    }

    async fn fetch(&self, worker_id: WorkerId) -> Result<Task, AgentError> {
        self.send(
            self.client
                .get(self.url("/tasks/next"))
                .query(&[("worker_id", worker_id)]),
            "worker",
            worker_id,
        )
        .await
    }

    async fn acknowledge(&self, task_id: TaskId, worker_id: WorkerId) -> Result<Task, AgentError> {
        self.send(
            self.client
                .post(self.url(&format!("/tasks/{task_id}/ack")))
                .json(&AckRequest { worker_id }),
            "task",
            task_id,
        )
        .await
    }

    async fn complete(
        &self,
        task_id: TaskId,
        worker_id: WorkerId,
        completion: &Completion,
    ) -> Result<Task, AgentError> {
        self.send(
            self.client
                .post(self.url(&format!("/tasks/{task_id}/complete")))
                .json(&CompleteRequest::from_completion(worker_id, completion)),
            "task",
            task_id,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_bodies_map_back_to_kinds() {
        let body = |kind: &str| ErrorBody {
            error: "boom".into(),
            kind: kind.into(),
        };
        assert_eq!(dispatch_error(body("queue_empty"), "worker", 1), DispatchError::QueueEmpty);
        assert_eq!(
            dispatch_error(body("not_found"), "worker", 4),
            DispatchError::worker_not_found(4)
        );
        assert_eq!(
            dispatch_error(body("conflict"), "task", 2),
            DispatchError::Conflict("boom".into())
        );
        assert!(dispatch_error(body("unavailable"), "task", 2).is_transient());
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = HttpCoordinator::new("http://localhost:5000/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.url("/tasks"), "http://localhost:5000/tasks");
    }

    #[tokio::test]
    async fn unreachable_coordinator_is_transient() {
        // Port 9 (discard) on localhost is not expected to accept HTTP.
        let client = HttpCoordinator::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let err = client.register().await.unwrap_err();
        assert!(err.is_transient());
    }
}
