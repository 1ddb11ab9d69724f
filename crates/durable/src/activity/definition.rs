//! Activity trait definition

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::ActivityContext;

/// Error type for activity failures
///
/// The `error_type` is matched against a retry policy's
/// `non_retryable_error_types`, so activities classify failures by type and
/// the calling workflow decides which types are permanent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Whether this error is retryable
    ///
    /// Non-retryable errors fail the activity without further attempts,
    /// regardless of the retry policy.
    pub retryable: bool,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl ActivityError {
    /// Create a new retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
            details: None,
        }
    }

    /// Create a non-retryable error
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
            details: None,
        }
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Check the error type
    pub fn is_type(&self, error_type: &str) -> bool {
        self.error_type.as_deref() == Some(error_type)
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error_type {
            Some(error_type) => write!(f, "{} ({})", self.message, error_type),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ActivityError {}

impl From<anyhow::Error> for ActivityError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

/// An activity is a single unit of side-effecting work
///
/// Activities run on workers, outside the deterministic workflow code. An
/// activity performs one attempt per call; retries are scheduled by the
/// engine according to the [`ActivityOptions`](crate::ActivityOptions)
/// chosen by the workflow.
///
/// # Example
///
/// ```ignore
/// use benchflow_durable::prelude::*;
///
/// struct PingActivity;
///
/// #[async_trait]
/// impl Activity for PingActivity {
///     const TYPE: &'static str = "ping";
///     type Input = String;
///     type Output = bool;
///
///     async fn execute(&self, _ctx: &ActivityContext, host: String) -> Result<bool, ActivityError> {
///         Ok(!host.is_empty())
///     }
/// }
/// ```
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    /// Activity type name, used to route tasks to handlers
    const TYPE: &'static str;

    type Input: Serialize + DeserializeOwned + Send;

    type Output: Serialize + DeserializeOwned + Send;

    /// Execute one attempt of the activity
    ///
    /// # Errors
    ///
    /// Return `ActivityError::retryable()` for transient failures and
    /// `ActivityError::non_retryable()` for permanent ones.
    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_error_retryable() {
        let error = ActivityError::retryable("timeout");
        assert!(error.retryable);
        assert_eq!(error.to_string(), "timeout");
    }

    #[test]
    fn test_activity_error_display_includes_type() {
        let error = ActivityError::retryable("operation is not done yet").with_type("OperationPending");
        assert_eq!(error.to_string(), "operation is not done yet (OperationPending)");
        assert!(error.is_type("OperationPending"));
    }

    #[test]
    fn test_activity_error_from_anyhow() {
        let error: ActivityError = anyhow::anyhow!("connection reset").into();
        assert!(error.retryable);
        assert_eq!(error.error_type, None);
    }

    #[test]
    fn test_activity_error_serialization() {
        let error = ActivityError::non_retryable("aborted")
            .with_type("OperationFailed")
            .with_details(serde_json::json!({"operation": "op-1"}));

        let json = serde_json::to_string(&error).unwrap();
        let parsed: ActivityError = serde_json::from_str(&json).unwrap();

        assert_eq!(error, parsed);
    }
}
