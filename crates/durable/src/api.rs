//! HTTP frontend for the engine
//!
//! Lets starters in other processes submit runs and follow their history.
//! [`HttpWorkflowClient`](crate::HttpWorkflowClient) is the matching client.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::client::{
    ClientError, ErrorResponse, ListResponse, RunDescription, RunHandle, SubmitRequest,
    WorkflowClient,
};
use crate::workflow::HistoryEvent;

#[derive(Clone)]
struct AppState {
    client: Arc<dyn WorkflowClient>,
}

/// Query parameters for history listing
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Only events with a greater sequence number
    pub after: Option<i32>,
}

/// Error wrapper mapping client errors onto HTTP statuses
struct ApiError(ClientError);

impl From<ClientError> for ApiError {
    fn from(error: ClientError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ClientError::NotFound(_) => StatusCode::NOT_FOUND,
            ClientError::Rejected(_) => StatusCode::BAD_REQUEST,
            _ => {
                tracing::error!(error = %self.0, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(ErrorResponse::new(self.0.to_string()))).into_response()
    }
}

/// Build the frontend router
pub fn router(client: Arc<dyn WorkflowClient>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/runs", post(submit_run))
        .route("/v1/runs/:run_id", get(describe_run))
        .route("/v1/executions/:execution_id", get(describe_execution))
        .route("/v1/executions/:execution_id/history", get(list_history))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { client })
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /v1/runs - 201 for a new execution, 200 when attaching to one in flight
async fn submit_run(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<RunHandle>), ApiError> {
    let handle = state.client.submit(request).await?;
    let status = if handle.existing {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(handle)))
}

async fn describe_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunDescription>, ApiError> {
    Ok(Json(state.client.describe_run(&run_id).await?))
}

async fn describe_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> Result<Json<RunDescription>, ApiError> {
    Ok(Json(state.client.describe_execution(execution_id).await?))
}

async fn list_history(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<ListResponse<HistoryEvent>>, ApiError> {
    let data = state.client.history(execution_id, query.after).await?;
    Ok(Json(ListResponse { data }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::WorkflowExecutor;
    use crate::persistence::{InMemoryWorkflowEventStore, RunStatus};
    use crate::workflow::{Workflow, WorkflowAction};
    use crate::{ActivityError, HttpWorkflowClient};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    struct NoopWorkflow;

    impl Workflow for NoopWorkflow {
        const TYPE: &'static str = "noop";
        type Input = Value;
        type Output = Value;

        fn new(_: Value) -> Self {
            Self
        }

        fn on_start(&mut self) -> Vec<WorkflowAction> {
            vec![WorkflowAction::complete(json!("done"))]
        }

        fn on_activity_completed(&mut self, _: &str, _: Value) -> Vec<WorkflowAction> {
            vec![]
        }

        fn on_activity_failed(&mut self, _: &str, _: &ActivityError) -> Vec<WorkflowAction> {
            vec![]
        }

        fn is_completed(&self) -> bool {
            false
        }

        fn result(&self) -> Option<Value> {
            None
        }
    }

    fn executor() -> Arc<WorkflowExecutor<InMemoryWorkflowEventStore>> {
        let mut executor = WorkflowExecutor::new(InMemoryWorkflowEventStore::new());
        executor.register::<NoopWorkflow>();
        Arc::new(executor)
    }

    fn submit_body(run_id: &str, workflow_type: &str) -> Body {
        Body::from(
            json!({
                "run_id": run_id,
                "workflow_type": workflow_type,
                "task_queue": "NOOP_TASK_QUEUE",
                "input": {}
            })
            .to_string(),
        )
    }

    fn post_run(body: Body) -> Request<Body> {
        Request::post("/v1/runs")
            .header("content-type", "application/json")
            .body(body)
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = router(executor());
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_submit_then_attach() {
        let app = router(executor());

        let response = app
            .clone()
            .oneshot(post_run(submit_body("noop-1", "noop")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let first = body_json(response).await;
        assert_eq!(first["existing"], false);

        let response = app
            .oneshot(post_run(submit_body("noop-1", "noop")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let second = body_json(response).await;
        assert_eq!(second["existing"], true);
        assert_eq!(second["execution_id"], first["execution_id"]);
    }

    #[tokio::test]
    async fn test_submit_unknown_type_rejected() {
        let app = router(executor());
        let response = app
            .oneshot(post_run(submit_body("x", "missing")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn test_describe_unknown_run() {
        let app = router(executor());
        let response = app
            .oneshot(Request::get("/v1/runs/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_http_client_round_trip() {
        let executor = executor();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(executor.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = HttpWorkflowClient::new(&addr.to_string());
        let handle = client
            .submit(SubmitRequest::new("noop-1", "noop", "NOOP_TASK_QUEUE", json!({})))
            .await
            .unwrap();
        assert!(!handle.existing);

        executor.start_attempt(handle.execution_id).await.unwrap();

        let run = client.describe_run("noop-1").await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.result, Some(json!("done")));

        let history = client.history(handle.execution_id, Some(0)).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].event.is_terminal());

        let missing = client.describe_run("nope").await;
        assert!(matches!(missing, Err(ClientError::NotFound(_))));
    }
}
