//! Client interface for submitting and observing runs
//!
//! [`WorkflowClient`] is implemented in-process by [`WorkflowExecutor`] and
//! over HTTP by [`HttpWorkflowClient`], which talks to the frontend in
//! [`crate::api`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::engine::{ExecutorError, RegistryError, WorkflowExecutor};
use crate::persistence::{RunInfo, RunStatus, StoreError, WorkflowEventStore};
use crate::reliability::RetryPolicy;
use crate::workflow::{HistoryEvent, WorkflowError};

/// A request to start a run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitRequest {
    /// Deduplication key: at most one in-flight execution per run id
    pub run_id: String,
    pub workflow_type: String,
    pub task_queue: String,
    pub input: Value,
    /// Restart the whole run when it fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
}

impl SubmitRequest {
    pub fn new(
        run_id: impl Into<String>,
        workflow_type: impl Into<String>,
        task_queue: impl Into<String>,
        input: Value,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            workflow_type: workflow_type.into(),
            task_queue: task_queue.into(),
            input,
            retry_policy: None,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

/// Handle to a submitted run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunHandle {
    pub run_id: String,
    pub execution_id: Uuid,
    /// True when the submission attached to an in-flight execution
    pub existing: bool,
}

impl RunHandle {
    pub(crate) fn new(run: &RunInfo, existing: bool) -> Self {
        Self {
            run_id: run.run_id.clone(),
            execution_id: run.execution_id,
            existing,
        }
    }
}

/// Snapshot of an execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunDescription {
    pub run_id: String,
    pub execution_id: Uuid,
    pub workflow_type: String,
    pub task_queue: String,
    pub status: RunStatus,
    pub attempt: u32,
    pub result: Option<Value>,
    pub error: Option<WorkflowError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<RunInfo> for RunDescription {
    fn from(run: RunInfo) -> Self {
        Self {
            run_id: run.run_id,
            execution_id: run.execution_id,
            workflow_type: run.workflow_type,
            task_queue: run.task_queue,
            status: run.status,
            attempt: run.attempt,
            result: run.result,
            error: run.error,
            created_at: run.created_at,
            updated_at: run.updated_at,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not found: {0}")]
    NotFound(String),

    /// The engine refused the request (e.g. unknown workflow type)
    #[error("rejected: {0}")]
    Rejected(String),

    /// The run reached a failed terminal state
    #[error("run failed: {0}")]
    RunFailed(WorkflowError),

    #[error("engine error: {0}")]
    Engine(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },
}

impl From<ExecutorError> for ClientError {
    fn from(error: ExecutorError) -> Self {
        match error {
            ExecutorError::Store(StoreError::RunNotFound(run_id)) => Self::NotFound(run_id),
            ExecutorError::Store(StoreError::ExecutionNotFound(id)) => {
                Self::NotFound(id.to_string())
            }
            ExecutorError::Registry(e @ RegistryError::UnknownWorkflowType(_)) => {
                Self::Rejected(e.to_string())
            }
            ExecutorError::Registry(e @ RegistryError::Deserialization(_)) => {
                Self::Rejected(e.to_string())
            }
            other => Self::Engine(other.to_string()),
        }
    }
}

impl From<StoreError> for ClientError {
    fn from(error: StoreError) -> Self {
        ExecutorError::from(error).into()
    }
}

/// Submit and observe runs
#[async_trait]
pub trait WorkflowClient: Send + Sync {
    /// Start a run, or attach to the in-flight one with the same run id
    async fn submit(&self, request: SubmitRequest) -> Result<RunHandle, ClientError>;

    /// Describe the latest execution submitted under `run_id`
    async fn describe_run(&self, run_id: &str) -> Result<RunDescription, ClientError>;

    async fn describe_execution(&self, execution_id: Uuid)
        -> Result<RunDescription, ClientError>;

    /// History events with a sequence greater than `after`
    async fn history(
        &self,
        execution_id: Uuid,
        after: Option<i32>,
    ) -> Result<Vec<HistoryEvent>, ClientError>;

    /// Poll until the execution is terminal
    ///
    /// Returns the result on success and [`ClientError::RunFailed`] on failure.
    async fn wait_for_result(
        &self,
        execution_id: Uuid,
        poll_interval: Duration,
    ) -> Result<Value, ClientError> {
        loop {
            let run = self.describe_execution(execution_id).await?;
            match run.status {
                RunStatus::Completed => return Ok(run.result.unwrap_or(Value::Null)),
                RunStatus::Failed => {
                    return Err(ClientError::RunFailed(
                        run.error.unwrap_or_else(|| WorkflowError::new("run failed")),
                    ))
                }
                RunStatus::Pending | RunStatus::Running => {
                    tokio::time::sleep(poll_interval).await
                }
            }
        }
    }
}

#[async_trait]
impl<C: WorkflowClient + ?Sized> WorkflowClient for Arc<C> {
    async fn submit(&self, request: SubmitRequest) -> Result<RunHandle, ClientError> {
        (**self).submit(request).await
    }

    async fn describe_run(&self, run_id: &str) -> Result<RunDescription, ClientError> {
        (**self).describe_run(run_id).await
    }

    async fn describe_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<RunDescription, ClientError> {
        (**self).describe_execution(execution_id).await
    }

    async fn history(
        &self,
        execution_id: Uuid,
        after: Option<i32>,
    ) -> Result<Vec<HistoryEvent>, ClientError> {
        (**self).history(execution_id, after).await
    }
}

#[async_trait]
impl<S: WorkflowEventStore> WorkflowClient for WorkflowExecutor<S> {
    async fn submit(&self, request: SubmitRequest) -> Result<RunHandle, ClientError> {
        Ok(WorkflowExecutor::submit(self, request).await?)
    }

    async fn describe_run(&self, run_id: &str) -> Result<RunDescription, ClientError> {
        Ok(self.store().latest_run(run_id).await?.into())
    }

    async fn describe_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<RunDescription, ClientError> {
        Ok(self.store().get_run(execution_id).await?.into())
    }

    async fn history(
        &self,
        execution_id: Uuid,
        after: Option<i32>,
    ) -> Result<Vec<HistoryEvent>, ClientError> {
        let events = self.store().load_events(execution_id).await?;
        Ok(events
            .into_iter()
            .filter(|e| after.map_or(true, |after| e.sequence > after))
            .collect())
    }
}

/// Follow an execution's history until its terminal event
///
/// Yields every event once, in order. The stream ends after
/// `WorkflowCompleted`/`WorkflowFailed` or after the first error.
pub fn stream_history<'a, C>(
    client: &'a C,
    execution_id: Uuid,
    poll_interval: Duration,
) -> BoxStream<'a, Result<HistoryEvent, ClientError>>
where
    C: WorkflowClient + ?Sized + 'a,
{
    struct StreamState {
        after: Option<i32>,
        buffered: VecDeque<HistoryEvent>,
        finished: bool,
    }

    let initial = StreamState {
        after: None,
        buffered: VecDeque::new(),
        finished: false,
    };

    stream::unfold(initial, move |mut state| async move {
        loop {
            if let Some(event) = state.buffered.pop_front() {
                state.after = Some(event.sequence);
                if event.event.is_terminal() {
                    state.finished = true;
                    state.buffered.clear();
                }
                return Some((Ok(event), state));
            }

            if state.finished {
                return None;
            }

            match client.history(execution_id, state.after).await {
                Ok(events) if events.is_empty() => tokio::time::sleep(poll_interval).await,
                Ok(events) => state.buffered.extend(events),
                Err(e) => {
                    state.finished = true;
                    return Some((Err(e), state));
                }
            }
        }
    })
    .boxed()
}

// =============================================================================
// HTTP client
// =============================================================================

/// Error body returned by the frontend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// Response wrapper for list endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
}

/// [`WorkflowClient`] over the engine's HTTP frontend
pub struct HttpWorkflowClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpWorkflowClient {
    /// `frontend` may be a bare `host:port`; `http://` is assumed then
    pub fn new(frontend: &str) -> Self {
        let base = frontend.trim_end_matches('/');
        let base_url = if base.starts_with("http://") || base.starts_with("https://") {
            base.to_string()
        } else {
            format!("http://{base}")
        };
        Self {
            base_url,
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.get(&url).send().await?;
        handle_response(response).await
    }

    async fn post<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.post(&url).json(body).send().await?;
        handle_response(response).await
    }
}

async fn handle_response<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&text)
        .map(|body| body.error)
        .unwrap_or(text);

    Err(match status {
        StatusCode::NOT_FOUND => ClientError::NotFound(message),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            ClientError::Rejected(message)
        }
        _ => ClientError::Api {
            status: status.as_u16(),
            message,
        },
    })
}

#[async_trait]
impl WorkflowClient for HttpWorkflowClient {
    async fn submit(&self, request: SubmitRequest) -> Result<RunHandle, ClientError> {
        self.post("/v1/runs", &request).await
    }

    async fn describe_run(&self, run_id: &str) -> Result<RunDescription, ClientError> {
        self.get(&format!("/v1/runs/{run_id}")).await
    }

    async fn describe_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<RunDescription, ClientError> {
        self.get(&format!("/v1/executions/{execution_id}")).await
    }

    async fn history(
        &self,
        execution_id: Uuid,
        after: Option<i32>,
    ) -> Result<Vec<HistoryEvent>, ClientError> {
        let path = match after {
            Some(after) => format!("/v1/executions/{execution_id}/history?after={after}"),
            None => format!("/v1/executions/{execution_id}/history"),
        };
        let list: ListResponse<HistoryEvent> = self.get(&path).await?;
        Ok(list.data)
    }
}
