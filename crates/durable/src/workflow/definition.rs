//! Workflow trait definition

use serde::{de::DeserializeOwned, Serialize};

use super::WorkflowAction;
use crate::activity::ActivityError;

/// Error type for workflow failures
#[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    /// Error message
    pub message: String,

    /// Error code for programmatic handling
    pub code: Option<String>,

    /// Whether a new attempt of the whole run may succeed
    ///
    /// Only consulted when the run was submitted with a workflow-level
    /// retry policy.
    pub retryable: bool,
}

impl WorkflowError {
    /// Create a new (non-retryable) workflow error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: false,
        }
    }

    /// Create a retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: true,
        }
    }

    /// Set the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkflowError {}

/// A workflow is a deterministic state machine driven by events
///
/// The engine calls `on_start` once per attempt and then feeds back the
/// outcome of every activity the workflow scheduled. Returned actions are
/// recorded in the run's history before they are carried out.
///
/// # Determinism
///
/// Given the same input and the same sequence of activity outcomes, a
/// workflow must return the same actions. The engine rebuilds workflow state
/// by replaying history, so no I/O, clocks or randomness belong here.
///
/// # Example
///
/// ```ignore
/// use benchflow_durable::prelude::*;
///
/// struct PingWorkflow {
///     host: String,
///     reachable: Option<bool>,
/// }
///
/// impl Workflow for PingWorkflow {
///     const TYPE: &'static str = "ping_workflow";
///     type Input = String;
///     type Output = bool;
///
///     fn new(host: String) -> Self {
///         Self { host, reachable: None }
///     }
///
///     fn on_start(&mut self) -> Vec<WorkflowAction> {
///         vec![WorkflowAction::schedule_activity("ping-1", "ping", json!(self.host))]
///     }
///
///     // ... implement other methods
/// }
/// ```
pub trait Workflow: Send + Sync + 'static {
    /// Workflow type name, used to look up the workflow in the registry
    const TYPE: &'static str;

    /// Input type for starting the workflow
    type Input: Serialize + DeserializeOwned + Send + Clone;

    /// Output type when workflow completes successfully
    type Output: Serialize + DeserializeOwned + Send;

    /// Create a new workflow instance from input
    ///
    /// Called both when an attempt starts and when replaying it.
    fn new(input: Self::Input) -> Self;

    /// Called when an attempt starts
    fn on_start(&mut self) -> Vec<WorkflowAction>;

    /// Called when an activity completes successfully
    fn on_activity_completed(
        &mut self,
        activity_id: &str,
        result: serde_json::Value,
    ) -> Vec<WorkflowAction>;

    /// Called when an activity fails for good (retries exhausted or permanent error)
    fn on_activity_failed(
        &mut self,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<WorkflowAction>;

    /// Check if workflow has reached a terminal state
    fn is_completed(&self) -> bool;

    /// Get the workflow result (if completed successfully)
    fn result(&self) -> Option<Self::Output>;

    /// Get the workflow error (if failed)
    fn error(&self) -> Option<WorkflowError> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_error_display() {
        let error = WorkflowError::new("instance ws1 not found");
        assert_eq!(error.to_string(), "instance ws1 not found");
        assert!(!error.retryable);
    }

    #[test]
    fn test_workflow_error_with_code() {
        let error = WorkflowError::retryable("poll exhausted").with_code("OperationPending");
        assert_eq!(error.code.as_deref(), Some("OperationPending"));
        assert!(error.retryable);
    }
}
