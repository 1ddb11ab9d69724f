// Progress watcher
//
// Tails the history of a run and turns it into log lines. Purely
// observational: the watcher never submits, retries or cancels anything,
// and its errors never change the outcome of the run.

use std::collections::HashMap;
use std::time::Duration;

use benchflow_durable::{stream_history, ClientError, RunStatus, WorkflowClient, WorkflowEvent};
use futures::StreamExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What the watcher saw
#[derive(Debug, Clone, PartialEq)]
pub struct WatchSummary {
    pub execution_id: Uuid,
    /// Event kinds in history order
    pub events: Vec<&'static str>,
    /// Whether the run ended with `WorkflowCompleted`
    pub succeeded: bool,
}

/// Follows a run and logs its progress
pub struct ProgressWatcher<'a, C: WorkflowClient + ?Sized> {
    client: &'a C,
    poll_interval: Duration,
    start_timeout: Duration,
}

impl<'a, C: WorkflowClient + ?Sized> ProgressWatcher<'a, C> {
    pub fn new(client: &'a C) -> Self {
        Self {
            client,
            poll_interval: Duration::from_millis(500),
            start_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// How long to wait for the run to appear and leave `pending`
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// Wait for `run_id` to start, then follow it to its terminal event
    pub async fn watch(&self, run_id: &str) -> Result<WatchSummary, ClientError> {
        let execution_id = self.wait_started(run_id).await?;
        self.follow(run_id, execution_id).await
    }

    async fn wait_started(&self, run_id: &str) -> Result<Uuid, ClientError> {
        let deadline = tokio::time::Instant::now() + self.start_timeout;
        loop {
            match self.client.describe_run(run_id).await {
                Ok(run) if run.status != RunStatus::Pending => return Ok(run.execution_id),
                Ok(_) => debug!(run_id, "Run still pending"),
                Err(ClientError::NotFound(_)) => debug!(run_id, "Run not visible yet"),
                Err(e) => return Err(e),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClientError::NotFound(format!(
                    "run {run_id} did not start within {:?}",
                    self.start_timeout
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Follow one execution to its terminal event
    pub async fn follow(&self, run_id: &str, execution_id: Uuid) -> Result<WatchSummary, ClientError> {
        let mut summary = WatchSummary {
            execution_id,
            events: Vec::new(),
            succeeded: false,
        };
        let mut workflow = String::new();
        let mut activities: HashMap<String, String> = HashMap::new();

        let mut events = stream_history(self.client, execution_id, self.poll_interval);
        while let Some(item) = events.next().await {
            let item = item?;
            let time = item.recorded_at;
            summary.events.push(item.event.kind());

            match item.event {
                WorkflowEvent::WorkflowStarted {
                    workflow_type,
                    attempt,
                    ..
                } => {
                    info!(event_time = %time, workflow = %workflow_type, run_id, attempt, "Workflow started");
                    workflow = workflow_type;
                }
                WorkflowEvent::WorkflowRetryScheduled {
                    error: failure,
                    next_attempt,
                    delay_ms,
                } => {
                    warn!(
                        event_time = %time,
                        workflow = %workflow,
                        run_id,
                        next_attempt,
                        delay_ms,
                        error = %failure,
                        "Workflow retry scheduled"
                    );
                }
                WorkflowEvent::ActivityScheduled {
                    activity_id,
                    activity_type,
                    ..
                } => {
                    info!(event_time = %time, activity = %activity_type, run_id, "Activity scheduled");
                    activities.insert(activity_id, activity_type);
                }
                WorkflowEvent::ActivityStarted {
                    activity_id,
                    attempt,
                    ..
                } => {
                    let activity = activities.get(&activity_id).unwrap_or(&activity_id);
                    info!(event_time = %time, activity = %activity, run_id, attempt, "Activity started");
                }
                WorkflowEvent::ActivityCompleted { activity_id, .. } => {
                    let activity = activities.get(&activity_id).unwrap_or(&activity_id);
                    info!(event_time = %time, activity = %activity, run_id, "Activity completed successfully");
                }
                WorkflowEvent::ActivityFailed {
                    activity_id,
                    error: failure,
                    attempt,
                    will_retry,
                } => {
                    let activity = activities.get(&activity_id).unwrap_or(&activity_id);
                    if will_retry {
                        debug!(event_time = %time, activity = %activity, run_id, attempt, error = %failure, "Activity attempt failed");
                    } else {
                        warn!(event_time = %time, activity = %activity, run_id, attempt, error = %failure, "Activity failed");
                    }
                }
                WorkflowEvent::WorkflowCompleted { .. } => {
                    info!(event_time = %time, workflow = %workflow, run_id, "Workflow completed successfully");
                    summary.succeeded = true;
                }
                WorkflowEvent::WorkflowFailed { error: failure } => {
                    error!(event_time = %time, workflow = %workflow, run_id, error = %failure, "Workflow failed");
                }
            }
        }
        Ok(summary)
    }
}
