//! Workflow executor with replay support
//!
//! The `WorkflowExecutor` is responsible for:
//! - Accepting run submissions (with run-id deduplication)
//! - Starting workflow attempts
//! - Replaying the current attempt from history and feeding it new events
//! - Turning workflow actions into history events, tasks and status changes

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::activity::ActivityError;
use crate::client::{RunHandle, SubmitRequest};
use crate::persistence::{
    CreateRunOutcome, NewRun, RunInfo, RunStatus, StoreError, TaskDefinition, TaskKind,
    WorkflowEventStore,
};
use crate::workflow::{Workflow, WorkflowAction, WorkflowError, WorkflowEvent};

use super::registry::{AnyWorkflow, RegistryError, WorkflowRegistry};

/// Configuration for the workflow executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum history length per execution
    pub max_events_per_run: usize,

    /// How often an event is re-applied after losing an append race
    pub max_conflict_retries: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_events_per_run: 10_000,
            max_conflict_retries: 8,
        }
    }
}

/// Errors from executor operations
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// History cannot be replayed
    #[error("replay error: {0}")]
    ReplayError(String),

    #[error("run {0} has too many events ({1} >= {2})")]
    TooManyEvents(Uuid, usize, usize),
}

/// Result of applying an event to a run
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ProcessResult {
    /// Whether the run is now terminal
    pub completed: bool,

    /// Number of new events written
    pub events_written: usize,

    /// Number of tasks enqueued
    pub tasks_enqueued: usize,
}

enum Outcome {
    Completed(Value),
    Failed(WorkflowError),
    RetryScheduled(WorkflowError),
}

#[derive(Default)]
struct Effects {
    tasks: Vec<TaskDefinition>,
    outcome: Option<Outcome>,
}

/// Workflow executor
///
/// Drives workflow state machines by replaying the current attempt's history
/// and processing the actions the workflow returns. History appends use
/// optimistic concurrency; a lost race re-runs the whole step.
///
/// # Example
///
/// ```ignore
/// use benchflow_durable::prelude::*;
///
/// let mut executor = WorkflowExecutor::new(InMemoryWorkflowEventStore::new());
/// executor.register::<CreateWorkflow<Workbench>>();
///
/// let handle = executor
///     .submit(SubmitRequest::new("ws1-create", "create_workbench", "CREATE_WORKBENCH_TASK_QUEUE", input))
///     .await?;
/// ```
pub struct WorkflowExecutor<S: WorkflowEventStore> {
    store: Arc<S>,
    registry: WorkflowRegistry,
    config: ExecutorConfig,
}

impl<S: WorkflowEventStore> WorkflowExecutor<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, ExecutorConfig::default())
    }

    pub fn with_config(store: S, config: ExecutorConfig) -> Self {
        Self {
            store: Arc::new(store),
            registry: WorkflowRegistry::new(),
            config,
        }
    }

    /// Register a workflow type
    pub fn register<W: Workflow>(&mut self) {
        self.registry.register::<W>();
        info!(workflow_type = W::TYPE, "registered workflow type");
    }

    pub fn is_registered(&self, workflow_type: &str) -> bool {
        self.registry.contains(workflow_type)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn shared_store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    /// Submit a run
    ///
    /// Creates a new execution and queues its first attempt, or attaches to
    /// the in-flight execution with the same run id.
    #[instrument(skip(self, request), fields(run_id = %request.run_id, workflow_type = %request.workflow_type))]
    pub async fn submit(&self, request: SubmitRequest) -> Result<RunHandle, ExecutorError> {
        if !self.registry.contains(&request.workflow_type) {
            return Err(RegistryError::UnknownWorkflowType(request.workflow_type).into());
        }

        let outcome = self
            .store
            .create_run(NewRun {
                run_id: request.run_id,
                workflow_type: request.workflow_type,
                task_queue: request.task_queue,
                input: request.input,
                retry_policy: request.retry_policy,
            })
            .await?;

        match outcome {
            CreateRunOutcome::Created(run) => {
                self.store
                    .enqueue_task(TaskDefinition {
                        execution_id: run.execution_id,
                        run_id: run.run_id.clone(),
                        task_queue: run.task_queue.clone(),
                        kind: TaskKind::Workflow,
                        delay: Duration::ZERO,
                    })
                    .await?;

                info!(
                    execution_id = %run.execution_id,
                    task_queue = %run.task_queue,
                    "run submitted"
                );
                Ok(RunHandle::new(&run, false))
            }
            CreateRunOutcome::Existing(run) => {
                info!(
                    execution_id = %run.execution_id,
                    status = %run.status,
                    "run already in flight, attaching"
                );
                Ok(RunHandle::new(&run, true))
            }
        }
    }

    /// Start the next attempt of a run
    ///
    /// Called by a worker for each claimed workflow task.
    #[instrument(skip(self))]
    pub async fn start_attempt(&self, execution_id: Uuid) -> Result<ProcessResult, ExecutorError> {
        let run = self.store.get_run(execution_id).await?;
        if run.status.is_terminal() {
            debug!(run_id = %run.run_id, status = %run.status, "run already terminal");
            return Ok(ProcessResult {
                completed: true,
                ..Default::default()
            });
        }

        let sequence = self.store.load_events(execution_id).await?.len() as i32;
        let attempt = self.store.begin_attempt(execution_id).await?;
        let started = WorkflowEvent::WorkflowStarted {
            workflow_type: run.workflow_type.clone(),
            input: run.input.clone(),
            attempt,
        };

        let actions = match self.registry.create(&run.workflow_type, run.input.clone()) {
            Ok(mut workflow) => {
                info!(run_id = %run.run_id, attempt, "workflow attempt started");
                workflow.on_start()
            }
            Err(e) => {
                error!(run_id = %run.run_id, error = %e, "cannot instantiate workflow");
                vec![WorkflowAction::fail(
                    WorkflowError::new(e.to_string()).with_code("InvalidWorkflow"),
                )]
            }
        };

        self.commit(&run, attempt, sequence, started, actions).await
    }

    /// Record that a worker picked up an activity attempt
    pub async fn on_activity_started(
        &self,
        execution_id: Uuid,
        activity_id: &str,
        attempt: u32,
        worker_id: &str,
    ) -> Result<(), ExecutorError> {
        self.record(
            execution_id,
            WorkflowEvent::ActivityStarted {
                activity_id: activity_id.to_string(),
                attempt,
                worker_id: worker_id.to_string(),
            },
        )
        .await
    }

    /// Handle activity completion
    #[instrument(skip(self, result))]
    pub async fn on_activity_completed(
        &self,
        execution_id: Uuid,
        activity_id: &str,
        result: Value,
    ) -> Result<ProcessResult, ExecutorError> {
        self.apply(
            execution_id,
            WorkflowEvent::ActivityCompleted {
                activity_id: activity_id.to_string(),
                result,
            },
        )
        .await
    }

    /// Handle an activity attempt failure
    ///
    /// The workflow only hears about the failure once no retry follows.
    #[instrument(skip(self, error))]
    pub async fn on_activity_failed(
        &self,
        execution_id: Uuid,
        activity_id: &str,
        error: ActivityError,
        attempt: u32,
        will_retry: bool,
    ) -> Result<ProcessResult, ExecutorError> {
        let event = WorkflowEvent::ActivityFailed {
            activity_id: activity_id.to_string(),
            error,
            attempt,
            will_retry,
        };

        if will_retry {
            self.record(execution_id, event).await?;
            Ok(ProcessResult {
                events_written: 1,
                ..Default::default()
            })
        } else {
            self.apply(execution_id, event).await
        }
    }

    // =========================================================================
    // Internal Methods
    // =========================================================================

    /// Append an informational event that the workflow does not react to
    async fn record(&self, execution_id: Uuid, event: WorkflowEvent) -> Result<(), ExecutorError> {
        let mut conflicts = 0;
        loop {
            let sequence = self.store.load_events(execution_id).await?.len() as i32;
            match self
                .store
                .append_events(execution_id, sequence, vec![event.clone()])
                .await
            {
                Err(StoreError::ConcurrencyConflict { .. })
                    if conflicts < self.config.max_conflict_retries =>
                {
                    conflicts += 1;
                }
                other => return other.map(|_| ()).map_err(Into::into),
            }
        }
    }

    /// Feed an event to the workflow, retrying on append races
    async fn apply(
        &self,
        execution_id: Uuid,
        event: WorkflowEvent,
    ) -> Result<ProcessResult, ExecutorError> {
        let mut conflicts = 0;
        loop {
            match self.try_apply(execution_id, event.clone()).await {
                Err(ExecutorError::Store(StoreError::ConcurrencyConflict { expected, actual }))
                    if conflicts < self.config.max_conflict_retries =>
                {
                    conflicts += 1;
                    debug!(%execution_id, expected, actual, "history moved, re-applying event");
                }
                other => return other,
            }
        }
    }

    async fn try_apply(
        &self,
        execution_id: Uuid,
        event: WorkflowEvent,
    ) -> Result<ProcessResult, ExecutorError> {
        let run = self.store.get_run(execution_id).await?;
        if run.status.is_terminal() {
            debug!(run_id = %run.run_id, kind = event.kind(), "run already terminal, dropping event");
            return Ok(ProcessResult {
                completed: true,
                ..Default::default()
            });
        }

        let history = self.store.load_events(execution_id).await?;
        if history.len() >= self.config.max_events_per_run {
            return Err(ExecutorError::TooManyEvents(
                execution_id,
                history.len(),
                self.config.max_events_per_run,
            ));
        }
        let sequence = history.len() as i32;

        let attempt_start = history
            .iter()
            .rposition(|h| matches!(h.event, WorkflowEvent::WorkflowStarted { .. }))
            .ok_or_else(|| {
                ExecutorError::ReplayError(format!("run {} has no started attempt", run.run_id))
            })?;

        let mut workflow = self.registry.create(&run.workflow_type, run.input.clone())?;
        let mut outstanding = HashSet::new();
        track(&mut outstanding, &workflow.on_start());

        for recorded in &history[attempt_start + 1..] {
            replay_event(&mut *workflow, &recorded.event, &mut outstanding);
        }

        let Some(activity_id) = event.activity_id() else {
            return Err(ExecutorError::ReplayError(format!(
                "{} cannot be applied to a workflow",
                event.kind()
            )));
        };
        if !outstanding.contains(activity_id) {
            warn!(
                run_id = %run.run_id,
                activity_id,
                kind = event.kind(),
                "ignoring event for an activity that is not outstanding"
            );
            return Ok(ProcessResult::default());
        }

        let actions = dispatch(&mut *workflow, &event);
        self.commit(&run, run.attempt, sequence, event, actions)
            .await
    }

    /// Write `head` plus the events for `actions` in one append, then carry
    /// out the resulting effects
    async fn commit(
        &self,
        run: &RunInfo,
        attempt: u32,
        expected_sequence: i32,
        head: WorkflowEvent,
        actions: Vec<WorkflowAction>,
    ) -> Result<ProcessResult, ExecutorError> {
        let (events, effects) = self.plan(run, attempt, head, actions);
        let events_written = events.len();

        self.store
            .append_events(run.execution_id, expected_sequence, events)
            .await?;

        let tasks_enqueued = effects.tasks.len();
        for task in effects.tasks {
            self.store.enqueue_task(task).await?;
        }

        let completed = match effects.outcome {
            Some(Outcome::Completed(result)) => {
                info!(run_id = %run.run_id, attempt, "workflow completed");
                self.store
                    .update_run_status(run.execution_id, RunStatus::Completed, Some(result), None)
                    .await?;
                true
            }
            Some(Outcome::Failed(error)) => {
                error!(run_id = %run.run_id, attempt, error = %error, "workflow failed");
                self.store
                    .update_run_status(run.execution_id, RunStatus::Failed, None, Some(error))
                    .await?;
                true
            }
            Some(Outcome::RetryScheduled(error)) => {
                warn!(run_id = %run.run_id, attempt, error = %error, "workflow attempt failed, retry scheduled");
                self.store
                    .update_run_status(run.execution_id, RunStatus::Running, None, Some(error))
                    .await?;
                false
            }
            None => false,
        };

        Ok(ProcessResult {
            completed,
            events_written,
            tasks_enqueued,
        })
    }

    fn plan(
        &self,
        run: &RunInfo,
        attempt: u32,
        head: WorkflowEvent,
        actions: Vec<WorkflowAction>,
    ) -> (Vec<WorkflowEvent>, Effects) {
        let mut events = vec![head];
        let mut effects = Effects::default();

        for action in actions {
            match action {
                WorkflowAction::ScheduleActivity {
                    activity_id,
                    activity_type,
                    input,
                    options,
                } => {
                    debug!(run_id = %run.run_id, %activity_id, %activity_type, "scheduling activity");

                    events.push(WorkflowEvent::ActivityScheduled {
                        activity_id: activity_id.clone(),
                        activity_type: activity_type.clone(),
                        input: input.clone(),
                        options: options.clone(),
                    });
                    effects.tasks.push(TaskDefinition {
                        execution_id: run.execution_id,
                        run_id: run.run_id.clone(),
                        task_queue: run.task_queue.clone(),
                        kind: TaskKind::Activity {
                            activity_id,
                            activity_type,
                            input,
                            options,
                        },
                        delay: Duration::ZERO,
                    });
                }

                WorkflowAction::CompleteWorkflow { result } => {
                    events.push(WorkflowEvent::WorkflowCompleted {
                        result: result.clone(),
                    });
                    effects.outcome = Some(Outcome::Completed(result));
                    break;
                }

                WorkflowAction::FailWorkflow { error } => {
                    let retry = run.retry_policy.as_ref().filter(|policy| {
                        error.retryable
                            && policy.should_retry(error.code.as_deref())
                            && policy.has_attempts_remaining(attempt)
                    });

                    match retry {
                        Some(policy) => {
                            let next_attempt = attempt + 1;
                            let delay = policy.delay_for_attempt(next_attempt);
                            events.push(WorkflowEvent::WorkflowRetryScheduled {
                                error: error.clone(),
                                next_attempt,
                                delay_ms: delay.as_millis() as u64,
                            });
                            effects.tasks.push(TaskDefinition {
                                execution_id: run.execution_id,
                                run_id: run.run_id.clone(),
                                task_queue: run.task_queue.clone(),
                                kind: TaskKind::Workflow,
                                delay,
                            });
                            effects.outcome = Some(Outcome::RetryScheduled(error));
                        }
                        None => {
                            events.push(WorkflowEvent::WorkflowFailed {
                                error: error.clone(),
                            });
                            effects.outcome = Some(Outcome::Failed(error));
                        }
                    }
                    break;
                }
            }
        }

        (events, effects)
    }
}

/// Activities scheduled by `actions` become outstanding
fn track(outstanding: &mut HashSet<String>, actions: &[WorkflowAction]) {
    for action in actions {
        if let WorkflowAction::ScheduleActivity { activity_id, .. } = action {
            outstanding.insert(activity_id.clone());
        }
    }
}

/// Re-run a recorded event; resulting actions were already carried out
fn replay_event(
    workflow: &mut dyn AnyWorkflow,
    event: &WorkflowEvent,
    outstanding: &mut HashSet<String>,
) {
    if !matches!(
        event,
        WorkflowEvent::ActivityCompleted { .. }
            | WorkflowEvent::ActivityFailed {
                will_retry: false,
                ..
            }
    ) {
        return;
    }
    if let Some(activity_id) = event.activity_id() {
        outstanding.remove(activity_id);
    }
    let actions = dispatch(workflow, event);
    track(outstanding, &actions);
}

fn dispatch(workflow: &mut dyn AnyWorkflow, event: &WorkflowEvent) -> Vec<WorkflowAction> {
    match event {
        WorkflowEvent::ActivityCompleted {
            activity_id,
            result,
        } => workflow.on_activity_completed(activity_id, result.clone()),
        WorkflowEvent::ActivityFailed {
            activity_id,
            error,
            will_retry: false,
            ..
        } => workflow.on_activity_failed(activity_id, error),
        _ => vec![],
    }
}
