//! In-memory implementation of WorkflowEventStore

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

use super::store::*;
use crate::activity::ActivityError;
use crate::reliability::RetryDecision;
use crate::workflow::{HistoryEvent, WorkflowError, WorkflowEvent};

struct RunState {
    info: RunInfo,
    events: Vec<HistoryEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskStatus {
    Pending,
    Claimed,
}

struct TaskState {
    definition: TaskDefinition,
    status: TaskStatus,
    attempt: u32,
    visible_at: Instant,
    claimed_by: Option<String>,
    /// Last sign of life from the claiming worker
    heartbeat_at: Instant,
}

impl TaskState {
    fn max_attempts(&self) -> u32 {
        match &self.definition.kind {
            TaskKind::Workflow => 1,
            TaskKind::Activity { options, .. } => options.retry_policy.max_attempts,
        }
    }
}

#[derive(Default)]
struct Runs {
    executions: HashMap<Uuid, RunState>,
    /// run id -> most recent execution
    latest: HashMap<String, Uuid>,
}

/// In-memory implementation of WorkflowEventStore
///
/// State lives as long as the process. Task visibility uses the tokio clock,
/// so paused-time tests can fast-forward through retry delays.
///
/// # Example
///
/// ```
/// use benchflow_durable::InMemoryWorkflowEventStore;
///
/// let store = InMemoryWorkflowEventStore::new();
/// assert_eq!(store.run_count(), 0);
/// ```
pub struct InMemoryWorkflowEventStore {
    runs: RwLock<Runs>,
    // Keyed by v7 ids so iteration order is enqueue order
    tasks: RwLock<BTreeMap<Uuid, TaskState>>,
}

impl InMemoryWorkflowEventStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(Runs::default()),
            tasks: RwLock::new(BTreeMap::new()),
        }
    }

    /// Number of executions ever created
    pub fn run_count(&self) -> usize {
        self.runs.read().executions.len()
    }

    /// Number of tasks waiting to be claimed (visible or delayed)
    pub fn pending_task_count(&self) -> usize {
        self.tasks
            .read()
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    /// Number of tasks currently held by workers
    pub fn claimed_task_count(&self) -> usize {
        self.tasks
            .read()
            .values()
            .filter(|t| t.status == TaskStatus::Claimed)
            .count()
    }
}

impl Default for InMemoryWorkflowEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowEventStore for InMemoryWorkflowEventStore {
    async fn create_run(&self, run: NewRun) -> Result<CreateRunOutcome, StoreError> {
        let mut runs = self.runs.write();

        if let Some(existing) = runs
            .latest
            .get(&run.run_id)
            .and_then(|id| runs.executions.get(id))
        {
            if !existing.info.status.is_terminal() {
                return Ok(CreateRunOutcome::Existing(existing.info.clone()));
            }
        }

        let now = Utc::now();
        let info = RunInfo {
            execution_id: Uuid::now_v7(),
            run_id: run.run_id,
            workflow_type: run.workflow_type,
            task_queue: run.task_queue,
            status: RunStatus::Pending,
            attempt: 0,
            input: run.input,
            retry_policy: run.retry_policy,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        };

        runs.latest
            .insert(info.run_id.clone(), info.execution_id);
        runs.executions.insert(
            info.execution_id,
            RunState {
                info: info.clone(),
                events: vec![],
            },
        );

        Ok(CreateRunOutcome::Created(info))
    }

    async fn get_run(&self, execution_id: Uuid) -> Result<RunInfo, StoreError> {
        self.runs
            .read()
            .executions
            .get(&execution_id)
            .map(|r| r.info.clone())
            .ok_or(StoreError::ExecutionNotFound(execution_id))
    }

    async fn latest_run(&self, run_id: &str) -> Result<RunInfo, StoreError> {
        let runs = self.runs.read();
        runs.latest
            .get(run_id)
            .and_then(|id| runs.executions.get(id))
            .map(|r| r.info.clone())
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))
    }

    async fn begin_attempt(&self, execution_id: Uuid) -> Result<u32, StoreError> {
        let mut runs = self.runs.write();
        let run = runs
            .executions
            .get_mut(&execution_id)
            .ok_or(StoreError::ExecutionNotFound(execution_id))?;

        run.info.attempt += 1;
        run.info.status = RunStatus::Running;
        run.info.updated_at = Utc::now();
        Ok(run.info.attempt)
    }

    async fn update_run_status(
        &self,
        execution_id: Uuid,
        status: RunStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        let run = runs
            .executions
            .get_mut(&execution_id)
            .ok_or(StoreError::ExecutionNotFound(execution_id))?;

        run.info.status = status;
        run.info.result = result;
        run.info.error = error;
        run.info.updated_at = Utc::now();
        Ok(())
    }

    async fn append_events(
        &self,
        execution_id: Uuid,
        expected_sequence: i32,
        events: Vec<WorkflowEvent>,
    ) -> Result<i32, StoreError> {
        let mut runs = self.runs.write();
        let run = runs
            .executions
            .get_mut(&execution_id)
            .ok_or(StoreError::ExecutionNotFound(execution_id))?;

        let current_sequence = run.events.len() as i32;
        if current_sequence != expected_sequence {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_sequence,
                actual: current_sequence,
            });
        }

        let recorded_at = Utc::now();
        for (offset, event) in events.into_iter().enumerate() {
            run.events.push(HistoryEvent {
                sequence: current_sequence + offset as i32,
                recorded_at,
                event,
            });
        }
        run.info.updated_at = recorded_at;
        Ok(run.events.len() as i32)
    }

    async fn load_events(&self, execution_id: Uuid) -> Result<Vec<HistoryEvent>, StoreError> {
        self.runs
            .read()
            .executions
            .get(&execution_id)
            .map(|r| r.events.clone())
            .ok_or(StoreError::ExecutionNotFound(execution_id))
    }

    async fn enqueue_task(&self, task: TaskDefinition) -> Result<Uuid, StoreError> {
        let task_id = Uuid::now_v7();
        let visible_at = Instant::now() + task.delay;
        self.tasks.write().insert(
            task_id,
            TaskState {
                definition: task,
                status: TaskStatus::Pending,
                attempt: 0,
                visible_at,
                claimed_by: None,
                heartbeat_at: visible_at,
            },
        );
        Ok(task_id)
    }

    async fn claim_tasks(
        &self,
        worker_id: &str,
        task_queue: &str,
        max_tasks: usize,
    ) -> Result<Vec<ClaimedTask>, StoreError> {
        let now = Instant::now();
        let mut tasks = self.tasks.write();
        let mut claimed = vec![];

        for (task_id, task) in tasks.iter_mut() {
            if claimed.len() >= max_tasks {
                break;
            }

            if task.status == TaskStatus::Pending
                && task.visible_at <= now
                && task.definition.task_queue == task_queue
            {
                task.status = TaskStatus::Claimed;
                task.claimed_by = Some(worker_id.to_string());
                task.heartbeat_at = now;
                task.attempt += 1;

                claimed.push(ClaimedTask {
                    id: *task_id,
                    execution_id: task.definition.execution_id,
                    run_id: task.definition.run_id.clone(),
                    task_queue: task.definition.task_queue.clone(),
                    kind: task.definition.kind.clone(),
                    attempt: task.attempt,
                    max_attempts: task.max_attempts(),
                });
            }
        }

        Ok(claimed)
    }

    async fn complete_task(&self, task_id: Uuid) -> Result<(), StoreError> {
        self.tasks
            .write()
            .remove(&task_id)
            .map(|_| ())
            .ok_or(StoreError::TaskNotFound(task_id))
    }

    async fn fail_task(
        &self,
        task_id: Uuid,
        error: &ActivityError,
    ) -> Result<TaskFailureOutcome, StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        let decision = match &task.definition.kind {
            TaskKind::Activity { options, .. } => options.retry_policy.decide(task.attempt, error),
            TaskKind::Workflow => RetryDecision::NonRetryable,
        };

        match decision {
            RetryDecision::Retry {
                next_attempt,
                delay,
            } => {
                task.status = TaskStatus::Pending;
                task.claimed_by = None;
                task.visible_at = Instant::now() + delay;
                Ok(TaskFailureOutcome::WillRetry {
                    next_attempt,
                    delay,
                })
            }
            RetryDecision::NonRetryable => {
                tasks.remove(&task_id);
                Ok(TaskFailureOutcome::NonRetryable)
            }
            RetryDecision::Exhausted => {
                tasks.remove(&task_id);
                Ok(TaskFailureOutcome::Exhausted)
            }
        }
    }

    async fn heartbeat_task(&self, task_id: Uuid, worker_id: &str) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        if task.status != TaskStatus::Claimed || task.claimed_by.as_deref() != Some(worker_id) {
            return Ok(false);
        }
        task.heartbeat_at = Instant::now();
        Ok(true)
    }

    async fn reclaim_stale_tasks(
        &self,
        stale_threshold: Duration,
    ) -> Result<Vec<Uuid>, StoreError> {
        let now = Instant::now();
        let mut reclaimed = vec![];

        for (task_id, task) in self.tasks.write().iter_mut() {
            if task.status == TaskStatus::Claimed && task.heartbeat_at + stale_threshold <= now {
                task.status = TaskStatus::Pending;
                task.claimed_by = None;
                task.visible_at = now;
                reclaimed.push(*task_id);
            }
        }

        Ok(reclaimed)
    }
}
