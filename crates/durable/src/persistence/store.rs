//! WorkflowEventStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::activity::ActivityError;
use crate::reliability::RetryPolicy;
use crate::workflow::{ActivityOptions, HistoryEvent, WorkflowError, WorkflowEvent};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No execution was ever submitted under this run id
    #[error("run not found: {0}")]
    RunNotFound(String),

    /// Execution not found
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// Concurrency conflict (optimistic locking failed)
    #[error("concurrency conflict: expected sequence {expected}, got {actual}")]
    ConcurrencyConflict { expected: i32, actual: i32 },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Stored value could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Status of a run execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Submitted, no worker has started it yet
    Pending,

    /// An attempt is in progress (or a retry of the run is scheduled)
    Running,

    /// Completed successfully
    Completed,

    /// Failed for good
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A run submission
#[derive(Debug, Clone)]
pub struct NewRun {
    pub run_id: String,
    pub workflow_type: String,
    pub task_queue: String,
    pub input: serde_json::Value,
    /// Workflow-level retry policy (restarts the whole run on failure)
    pub retry_policy: Option<RetryPolicy>,
}

/// Stored state of one execution of a run
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub execution_id: Uuid,
    pub run_id: String,
    pub workflow_type: String,
    pub task_queue: String,
    pub status: RunStatus,
    /// Current workflow attempt (0 until a worker starts the run)
    pub attempt: u32,
    pub input: serde_json::Value,
    pub retry_policy: Option<RetryPolicy>,
    pub result: Option<serde_json::Value>,
    pub error: Option<WorkflowError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of submitting a run
#[derive(Debug, Clone)]
pub enum CreateRunOutcome {
    /// A new execution was created
    Created(RunInfo),

    /// A non-terminal execution with the same run id already exists
    Existing(RunInfo),
}

/// What a task asks the worker to do
#[derive(Debug, Clone, PartialEq)]
pub enum TaskKind {
    /// Start the next attempt of the workflow
    Workflow,

    /// Execute one activity
    Activity {
        activity_id: String,
        activity_type: String,
        input: serde_json::Value,
        options: ActivityOptions,
    },
}

/// Definition of a task to be enqueued
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub execution_id: Uuid,
    pub run_id: String,
    pub task_queue: String,
    pub kind: TaskKind,
    /// How long the task stays invisible to workers
    pub delay: Duration,
}

/// A task that has been claimed by a worker
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub run_id: String,
    pub task_queue: String,
    pub kind: TaskKind,
    pub attempt: u32,
    pub max_attempts: u32,
}

/// Outcome of failing a task
#[derive(Debug, Clone, PartialEq)]
pub enum TaskFailureOutcome {
    /// Task will be retried after `delay`
    WillRetry { next_attempt: u32, delay: Duration },

    /// Error is permanent, task is dropped
    NonRetryable,

    /// No attempts left, task is dropped
    Exhausted,
}

impl TaskFailureOutcome {
    pub fn will_retry(&self) -> bool {
        matches!(self, Self::WillRetry { .. })
    }
}

/// Store for run state, history and task queues
///
/// Implementations must be thread-safe and support concurrent access.
#[async_trait]
pub trait WorkflowEventStore: Send + Sync + 'static {
    // =========================================================================
    // Run Operations
    // =========================================================================

    /// Create a new execution, unless one with the same run id is in flight
    ///
    /// The check and the insert must be atomic: this is what guarantees at
    /// most one in-flight execution per run id.
    async fn create_run(&self, run: NewRun) -> Result<CreateRunOutcome, StoreError>;

    /// Get an execution
    async fn get_run(&self, execution_id: Uuid) -> Result<RunInfo, StoreError>;

    /// Get the most recent execution submitted under `run_id`
    async fn latest_run(&self, run_id: &str) -> Result<RunInfo, StoreError>;

    /// Mark the execution running and bump its attempt counter
    ///
    /// Returns the new attempt number.
    async fn begin_attempt(&self, execution_id: Uuid) -> Result<u32, StoreError>;

    /// Update execution status
    async fn update_run_status(
        &self,
        execution_id: Uuid,
        status: RunStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // History Operations
    // =========================================================================

    /// Append events (with optimistic concurrency)
    ///
    /// Returns the new history length.
    async fn append_events(
        &self,
        execution_id: Uuid,
        expected_sequence: i32,
        events: Vec<WorkflowEvent>,
    ) -> Result<i32, StoreError>;

    /// Load the full history of an execution
    async fn load_events(&self, execution_id: Uuid) -> Result<Vec<HistoryEvent>, StoreError>;

    // =========================================================================
    // Task Queue Operations
    // =========================================================================

    /// Enqueue a task
    async fn enqueue_task(&self, task: TaskDefinition) -> Result<Uuid, StoreError>;

    /// Claim visible tasks from one queue, oldest first
    async fn claim_tasks(
        &self,
        worker_id: &str,
        task_queue: &str,
        max_tasks: usize,
    ) -> Result<Vec<ClaimedTask>, StoreError>;

    /// Complete a task successfully
    async fn complete_task(&self, task_id: Uuid) -> Result<(), StoreError>;

    /// Fail an activity task attempt
    ///
    /// Applies the task's retry policy: either requeues the task with a
    /// delay or drops it.
    async fn fail_task(
        &self,
        task_id: Uuid,
        error: &ActivityError,
    ) -> Result<TaskFailureOutcome, StoreError>;

    /// Extend the claim a worker holds on a task
    ///
    /// Returns false when the task is no longer claimed by `worker_id`.
    async fn heartbeat_task(&self, task_id: Uuid, worker_id: &str) -> Result<bool, StoreError>;

    /// Return claimed tasks without a heartbeat for `stale_threshold` to
    /// their queue
    ///
    /// A reclaimed task becomes visible at once and keeps its attempt count.
    async fn reclaim_stale_tasks(&self, stale_threshold: Duration)
        -> Result<Vec<Uuid>, StoreError>;
}
