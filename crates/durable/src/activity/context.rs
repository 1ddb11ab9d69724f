//! Activity execution context

use uuid::Uuid;

/// Context provided to activities during execution
///
/// Identifies the run and the attempt being executed. Activities use it for
/// logging and for deciding how to report the final attempt.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    /// Run identifier (deduplication key) of the owning workflow
    pub run_id: String,

    /// Execution of the run that scheduled this activity
    pub execution_id: Uuid,

    /// Activity ID within the workflow
    pub activity_id: String,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed
    pub max_attempts: u32,

    /// Worker executing this attempt
    pub worker_id: String,
}

impl ActivityContext {
    pub fn new(
        run_id: impl Into<String>,
        execution_id: Uuid,
        activity_id: impl Into<String>,
        attempt: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            execution_id,
            activity_id: activity_id.into(),
            attempt,
            max_attempts,
            worker_id: String::new(),
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Whether a failure of this attempt will be final
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}
