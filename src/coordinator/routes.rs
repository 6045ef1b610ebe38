//! REST endpoints for task submission, dispatch, and worker liveness.

use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use super::Coordinator;
use crate::error::DispatchError;
use crate::tasks::model::{
    AckRequest, CompleteRequest, ErrorBody, FetchQuery, IdResponse, SubmitRequest,
};
use crate::tasks::{TaskId, WorkerId};

/// Build the coordinator router.
pub fn coordinator_routes(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tasks", post(submit_task))
        .route("/tasks/next", get(fetch_task))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/ack", post(ack_task))
        .route("/tasks/{id}/complete", post(complete_task))
        .route("/workers", post(register_worker).get(list_workers))
        .route("/workers/{id}/heartbeat", post(heartbeat))
        .route("/queue", get(queue_snapshot))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(coordinator)
}

/// Dispatch error rendered as `{error, kind}` JSON.
#[derive(Debug)]
pub struct ApiError(DispatchError);

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(DispatchError::Validation(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self(DispatchError::Validation(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            DispatchError::Validation(_) => StatusCode::BAD_REQUEST,
            DispatchError::NotFound { .. } | DispatchError::QueueEmpty => StatusCode::NOT_FOUND,
            DispatchError::Conflict(_) => StatusCode::CONFLICT,
            DispatchError::StoreUnavailable(msg) => {
                error!(error = %msg, "Store unavailable");
                StatusCode::SERVICE_UNAVAILABLE
            }
        };

        let body = ErrorBody {
            error: self.0.to_string(),
            kind: self.0.kind().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "taskgrid-coordinator"
    }))
}

// ── Tasks ───────────────────────────────────────────────────────────────

async fn submit_task(
    State(coordinator): State<Arc<Coordinator>>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = body?;
    let description = req.description.unwrap_or_default();
    let id = coordinator.submit(&description).await?;
    Ok((StatusCode::CREATED, Json(IdResponse { id })))
}

async fn get_task(
    State(coordinator): State<Arc<Coordinator>>,
    Path(id): Path<TaskId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(coordinator.get_task(id).await?))
}

async fn fetch_task(
    State(coordinator): State<Arc<Coordinator>>,
    query: Result<Query<FetchQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(query) = query?;
    Ok(Json(coordinator.fetch(query.worker_id).await?))
}

async fn ack_task(
    State(coordinator): State<Arc<Coordinator>>,
    Path(id): Path<TaskId>,
    body: Result<Json<AckRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = body?;
    Ok(Json(coordinator.acknowledge(id, req.worker_id).await?))
}

async fn complete_task(
    State(coordinator): State<Arc<Coordinator>>,
    Path(id): Path<TaskId>,
    body: Result<Json<CompleteRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = body?;
    let worker_id = req.worker_id;
    Ok(Json(
        coordinator
            .complete(id, worker_id, req.into_completion())
            .await?,
    ))
}

// ── Workers ─────────────────────────────────────────────────────────────

async fn register_worker(State(coordinator): State<Arc<Coordinator>>) -> ApiResult<impl IntoResponse> {
    let worker = coordinator.register().await?;
    Ok((StatusCode::CREATED, Json(IdResponse { id: worker.id })))
}

async fn heartbeat(
    State(coordinator): State<Arc<Coordinator>>,
    Path(id): Path<WorkerId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(coordinator.heartbeat(id).await?))
}

async fn list_workers(State(coordinator): State<Arc<Coordinator>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(coordinator.list_workers().await?))
}

// ── Queue ───────────────────────────────────────────────────────────────

async fn queue_snapshot(State(coordinator): State<Arc<Coordinator>>) -> impl IntoResponse {
    Json(coordinator.ready_snapshot().await)
}
