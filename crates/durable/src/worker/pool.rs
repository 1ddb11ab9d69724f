//! Worker pool for task execution
//!
//! Polls one task queue, runs workflow and activity tasks with bounded
//! concurrency and drains in-flight work on shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::poller::{PollerConfig, TaskPoller};
use crate::activity::{Activity, ActivityContext, ActivityError};
use crate::engine::WorkflowExecutor;
use crate::persistence::{ClaimedTask, StoreError, TaskKind, WorkflowEventStore};

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Queue this pool claims tasks from
    pub task_queue: String,

    /// Maximum concurrent task executions
    pub max_concurrency: usize,

    pub poller: PollerConfig,

    /// How long shutdown waits for in-flight tasks
    pub shutdown_timeout: Duration,

    /// How often a running activity extends its claim
    pub heartbeat_interval: Duration,

    /// How often to look for abandoned claims
    pub stale_reclaim_interval: Duration,

    /// How long a claim may go without a heartbeat before it is reclaimed
    pub stale_threshold: Duration,
}

impl WorkerPoolConfig {
    pub fn new(task_queue: impl Into<String>) -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            task_queue: task_queue.into(),
            max_concurrency: 10,
            poller: PollerConfig::default(),
            shutdown_timeout: Duration::from_secs(20),
            heartbeat_interval: Duration::from_secs(5),
            stale_reclaim_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(60),
        }
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set how often stale claims are reclaimed and after how long
    pub fn with_stale_reclaim(mut self, interval: Duration, threshold: Duration) -> Self {
        self.stale_reclaim_interval = interval;
        self.stale_threshold = threshold;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Running and accepting tasks
    Running,
    /// Completing current tasks, not accepting new ones
    Draining,
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("worker pool is already running")]
    AlreadyRunning,

    /// In-flight tasks were still running when the grace period ended
    #[error("graceful shutdown timed out with {0} task(s) in flight")]
    ShutdownTimeout(usize),
}

/// Activity handler function type
pub type ActivityHandler = Arc<
    dyn Fn(ActivityContext, Value) -> BoxFuture<'static, Result<Value, ActivityError>>
        + Send
        + Sync,
>;

/// Worker pool for one task queue
///
/// Workflow tasks start run attempts through the executor; activity tasks
/// are routed by activity type to registered handlers.
///
/// # Example
///
/// ```ignore
/// use benchflow_durable::worker::{WorkerPool, WorkerPoolConfig};
///
/// let pool = WorkerPool::new(executor, WorkerPoolConfig::new("CREATE_WORKBENCH_TASK_QUEUE"));
/// pool.register_activity(Arc::new(ExistsActivity::new(executor_backend)));
/// pool.start()?;
///
/// // ... later, graceful shutdown
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool<S: WorkflowEventStore> {
    executor: Arc<WorkflowExecutor<S>>,
    config: WorkerPoolConfig,
    handlers: RwLock<HashMap<String, ActivityHandler>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    status: RwLock<WorkerPoolStatus>,
    active_tasks: Arc<Semaphore>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
    reclaim_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<S: WorkflowEventStore> WorkerPool<S> {
    pub fn new(executor: Arc<WorkflowExecutor<S>>, config: WorkerPoolConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let active_tasks = Arc::new(Semaphore::new(config.max_concurrency));

        Self {
            executor,
            config,
            handlers: RwLock::new(HashMap::new()),
            shutdown_tx,
            shutdown_rx,
            status: RwLock::new(WorkerPoolStatus::Stopped),
            active_tasks,
            poll_handle: Mutex::new(None),
            reclaim_handle: Mutex::new(None),
        }
    }

    /// Register a raw JSON activity handler
    pub fn register_handler<F, Fut>(&self, activity_type: &str, handler: F)
    where
        F: Fn(ActivityContext, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, ActivityError>> + Send + 'static,
    {
        let handler: ActivityHandler = Arc::new(move |ctx, input| Box::pin(handler(ctx, input)));
        self.handlers
            .write()
            .insert(activity_type.to_string(), handler);
    }

    /// Register a typed activity under its `TYPE`
    pub fn register_activity<A: Activity>(&self, activity: Arc<A>) {
        self.register_handler(A::TYPE, move |ctx, input| {
            let activity = Arc::clone(&activity);
            async move {
                let input: A::Input = serde_json::from_value(input).map_err(|e| {
                    ActivityError::non_retryable(format!("invalid input for {}: {e}", A::TYPE))
                        .with_type("InvalidInput")
                })?;
                let output = activity.execute(&ctx, input).await?;
                serde_json::to_value(output).map_err(|e| {
                    ActivityError::non_retryable(format!("cannot encode {} output: {e}", A::TYPE))
                        .with_type("InvalidOutput")
                })
            }
        });
    }

    pub fn has_handler(&self, activity_type: &str) -> bool {
        self.handlers.read().contains_key(activity_type)
    }

    /// Start polling
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id, task_queue = %self.config.task_queue))]
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status == WorkerPoolStatus::Running {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Running;
        }

        info!(
            activity_types = ?self.handlers.read().keys().collect::<Vec<_>>(),
            max_concurrency = self.config.max_concurrency,
            "Starting worker pool"
        );

        self.start_poll_loop();
        self.start_reclaim_loop();
        Ok(())
    }

    /// Stop polling and wait for in-flight tasks
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id, task_queue = %self.config.task_queue))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
            *status = WorkerPoolStatus::Draining;
        }

        info!("Initiating graceful shutdown");
        let _ = self.shutdown_tx.send(true);

        let poll_handle = self.poll_handle.lock().take();
        if let Some(handle) = poll_handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Poll loop panicked");
            }
        }
        let reclaim_handle = self.reclaim_handle.lock().take();
        if let Some(handle) = reclaim_handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Reclaim loop panicked");
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let in_flight = self.in_flight();
            if in_flight == 0 {
                debug!("All tasks completed");
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(remaining_tasks = in_flight, "Shutdown timeout reached");
                *self.status.write() = WorkerPoolStatus::Stopped;
                return Err(WorkerPoolError::ShutdownTimeout(in_flight));
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        *self.status.write() = WorkerPoolStatus::Stopped;
        info!("Worker pool stopped");
        Ok(())
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn task_queue(&self) -> &str {
        &self.config.task_queue
    }

    /// Number of tasks currently executing
    pub fn in_flight(&self) -> usize {
        self.config.max_concurrency - self.active_tasks.available_permits()
    }

    fn start_poll_loop(&self) {
        let executor = Arc::clone(&self.executor);
        let config = self.config.clone();
        let handlers = Arc::new(self.handlers.read().clone());
        let active_tasks = Arc::clone(&self.active_tasks);

        let mut poller = TaskPoller::new(
            executor.shared_store(),
            config.worker_id.clone(),
            config.task_queue.clone(),
            config.poller.clone(),
            self.shutdown_rx.clone(),
        );

        let handle = tokio::spawn(async move {
            loop {
                if poller.is_shutdown() {
                    debug!("Poll loop: shutdown requested");
                    break;
                }

                let available_slots = active_tasks.available_permits();
                if available_slots == 0 {
                    if poller.wait().await {
                        break;
                    }
                    continue;
                }

                match poller.poll(available_slots).await {
                    Ok(tasks) => {
                        for task in tasks {
                            let permit = match Arc::clone(&active_tasks).try_acquire_owned() {
                                Ok(permit) => permit,
                                Err(_) => {
                                    // Claimed without capacity; run it anyway once a slot frees
                                    match Arc::clone(&active_tasks).acquire_owned().await {
                                        Ok(permit) => permit,
                                        Err(_) => break,
                                    }
                                }
                            };

                            let executor = Arc::clone(&executor);
                            let handlers = Arc::clone(&handlers);
                            let config = config.clone();

                            tokio::spawn(async move {
                                execute_task(&executor, &handlers, &config, task).await;
                                drop(permit);
                            });
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Poll error");
                    }
                }

                if poller.wait().await {
                    break;
                }
            }

            debug!("Poll loop exited");
        });

        *self.poll_handle.lock() = Some(handle);
    }

    /// Return claims abandoned by crashed or stuck workers to their queue
    fn start_reclaim_loop(&self) {
        let store = self.executor.shared_store();
        let interval = self.config.stale_reclaim_interval;
        let threshold = self.config.stale_threshold;
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store.reclaim_stale_tasks(threshold).await {
                            Ok(reclaimed) => {
                                if !reclaimed.is_empty() {
                                    info!(count = reclaimed.len(), "Reclaimed stale tasks");
                                }
                            }
                            Err(e) => {
                                error!(error = %e, "Stale task reclamation failed");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Reclaim loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Reclaim loop exited");
        });

        *self.reclaim_handle.lock() = Some(handle);
    }
}

/// Wait for a spawned activity while heartbeating its claim
async fn supervise<S: WorkflowEventStore, T>(
    store: &S,
    task_id: Uuid,
    worker_id: &str,
    interval: Duration,
    mut running: JoinHandle<T>,
) -> Result<T, JoinError> {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        tokio::select! {
            joined = &mut running => return joined,
            _ = ticker.tick() => match store.heartbeat_task(task_id, worker_id).await {
                Ok(true) => {}
                Ok(false) => warn!(%task_id, "Claim was reclaimed while the activity was running"),
                Err(e) => warn!(%task_id, error = %e, "Heartbeat failed"),
            },
        }
    }
}

/// Run one claimed task to completion and report the outcome
async fn execute_task<S: WorkflowEventStore>(
    executor: &WorkflowExecutor<S>,
    handlers: &HashMap<String, ActivityHandler>,
    config: &WorkerPoolConfig,
    task: ClaimedTask,
) {
    let worker_id = config.worker_id.as_str();
    let task_id = task.id;
    let execution_id = task.execution_id;

    match task.kind {
        TaskKind::Workflow => {
            if let Err(e) = executor.start_attempt(execution_id).await {
                error!(%execution_id, run_id = %task.run_id, error = %e, "Failed to start workflow attempt");
            }
            if let Err(e) = executor.store().complete_task(task_id).await {
                error!(%task_id, error = %e, "Failed to complete task");
            }
        }

        TaskKind::Activity {
            activity_id,
            activity_type,
            input,
            options,
        } => {
            if let Err(e) = executor
                .on_activity_started(execution_id, &activity_id, task.attempt, worker_id)
                .await
            {
                warn!(%execution_id, %activity_id, error = %e, "Failed to record activity start");
            }

            let ctx = ActivityContext::new(
                task.run_id.clone(),
                execution_id,
                activity_id.clone(),
                task.attempt,
                task.max_attempts,
            )
            .with_worker_id(worker_id);

            let outcome = match handlers.get(&activity_type) {
                Some(handler) => {
                    let timeout = options.start_to_close_timeout;
                    let running = tokio::spawn(tokio::time::timeout(timeout, handler(ctx, input)));
                    let joined = supervise(
                        executor.store(),
                        task_id,
                        worker_id,
                        config.heartbeat_interval,
                        running,
                    )
                    .await;
                    match joined {
                        Ok(Ok(result)) => result,
                        Ok(Err(_)) => Err(ActivityError::retryable(format!(
                            "activity did not finish within {}s",
                            timeout.as_secs()
                        ))
                        .with_type("StartToCloseTimeout")),
                        Err(e) if e.is_panic() => {
                            error!(run_id = %task.run_id, %activity_id, "Activity panicked");
                            Err(ActivityError::retryable(format!(
                                "activity {activity_type} panicked"
                            ))
                            .with_type("ActivityPanicked"))
                        }
                        Err(_) => Err(ActivityError::retryable(format!(
                            "activity {activity_type} was cancelled"
                        ))
                        .with_type("ActivityCancelled")),
                    }
                }
                None => Err(ActivityError::non_retryable(format!(
                    "no handler registered for activity type: {activity_type}"
                ))
                .with_type("HandlerNotFound")),
            };

            match outcome {
                Ok(output) => {
                    debug!(run_id = %task.run_id, %activity_id, attempt = task.attempt, "Activity succeeded");
                    if let Err(e) = executor.store().complete_task(task_id).await {
                        error!(%task_id, error = %e, "Failed to complete task");
                    }
                    if let Err(e) = executor
                        .on_activity_completed(execution_id, &activity_id, output)
                        .await
                    {
                        error!(%execution_id, %activity_id, error = %e, "Failed to apply activity result");
                    }
                }
                Err(error) => {
                    let will_retry = match executor.store().fail_task(task_id, &error).await {
                        Ok(failure) => failure.will_retry(),
                        Err(e) => {
                            error!(%task_id, error = %e, "Failed to fail task");
                            return;
                        }
                    };
                    debug!(
                        run_id = %task.run_id,
                        %activity_id,
                        attempt = task.attempt,
                        will_retry,
                        error = %error,
                        "Activity attempt failed"
                    );
                    if let Err(e) = executor
                        .on_activity_failed(execution_id, &activity_id, error, task.attempt, will_retry)
                        .await
                    {
                        error!(%execution_id, %activity_id, error = %e, "Failed to apply activity failure");
                    }
                }
            }
        }
    }
}
