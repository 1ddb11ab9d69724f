//! Workflow events for persistence

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ActivityOptions, WorkflowError};
use crate::activity::ActivityError;

/// Events in a run's append-only history
///
/// The history is used for:
/// - Replaying the current attempt to rebuild workflow state
/// - Streaming progress to watchers
/// - Auditing and debugging
///
/// Events are immutable once written. A run may contain several attempts;
/// each begins with `WorkflowStarted`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    // =========================================================================
    // Workflow Lifecycle Events
    // =========================================================================
    /// An attempt of the workflow was started
    WorkflowStarted {
        workflow_type: String,
        input: serde_json::Value,
        /// Workflow attempt (1-based)
        attempt: u32,
    },

    /// The failed attempt will be followed by another one
    WorkflowRetryScheduled {
        error: WorkflowError,
        next_attempt: u32,
        delay_ms: u64,
    },

    /// Workflow completed successfully
    WorkflowCompleted { result: serde_json::Value },

    /// Workflow failed with an error
    WorkflowFailed { error: WorkflowError },

    // =========================================================================
    // Activity Lifecycle Events
    // =========================================================================
    /// Activity was scheduled for execution
    ActivityScheduled {
        activity_id: String,
        activity_type: String,
        input: serde_json::Value,
        options: ActivityOptions,
    },

    /// An activity attempt was claimed by a worker
    ActivityStarted {
        activity_id: String,
        /// Current attempt number (1-based)
        attempt: u32,
        worker_id: String,
    },

    /// Activity completed successfully
    ActivityCompleted {
        activity_id: String,
        result: serde_json::Value,
    },

    /// An activity attempt failed
    ActivityFailed {
        activity_id: String,
        error: ActivityError,
        attempt: u32,
        /// Whether another attempt is scheduled
        will_retry: bool,
    },
}

impl WorkflowEvent {
    /// Get the activity_id if this is an activity-related event
    pub fn activity_id(&self) -> Option<&str> {
        match self {
            Self::ActivityScheduled { activity_id, .. }
            | Self::ActivityStarted { activity_id, .. }
            | Self::ActivityCompleted { activity_id, .. }
            | Self::ActivityFailed { activity_id, .. } => Some(activity_id),
            _ => None,
        }
    }

    /// Check if this event ends the run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted { .. } | Self::WorkflowFailed { .. }
        )
    }

    /// Short name of the event type
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow_started",
            Self::WorkflowRetryScheduled { .. } => "workflow_retry_scheduled",
            Self::WorkflowCompleted { .. } => "workflow_completed",
            Self::WorkflowFailed { .. } => "workflow_failed",
            Self::ActivityScheduled { .. } => "activity_scheduled",
            Self::ActivityStarted { .. } => "activity_started",
            Self::ActivityCompleted { .. } => "activity_completed",
            Self::ActivityFailed { .. } => "activity_failed",
        }
    }
}

/// An event as stored in a run's history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEvent {
    /// Position in the history (0-based, gap-free)
    pub sequence: i32,

    /// When the event was recorded
    pub recorded_at: DateTime<Utc>,

    pub event: WorkflowEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serialization() {
        let event = WorkflowEvent::ActivityFailed {
            activity_id: "poll-3".to_string(),
            error: ActivityError::retryable("operation is not done yet"),
            attempt: 2,
            will_retry: true,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "activity_failed");
        assert_eq!(json["attempt"], 2);

        let parsed: WorkflowEvent = serde_json::from_value(json).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn test_activity_id() {
        let event = WorkflowEvent::ActivityCompleted {
            activity_id: "exists-1".to_string(),
            result: json!(false),
        };
        assert_eq!(event.activity_id(), Some("exists-1"));

        let event = WorkflowEvent::WorkflowCompleted { result: json!({}) };
        assert_eq!(event.activity_id(), None);
    }

    #[test]
    fn test_terminal_events() {
        assert!(WorkflowEvent::WorkflowCompleted { result: json!(null) }.is_terminal());
        assert!(WorkflowEvent::WorkflowFailed {
            error: WorkflowError::new("boom")
        }
        .is_terminal());
        assert!(!WorkflowEvent::WorkflowRetryScheduled {
            error: WorkflowError::retryable("boom"),
            next_attempt: 2,
            delay_ms: 60_000,
        }
        .is_terminal());
    }
}
