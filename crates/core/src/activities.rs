// Lifecycle activities
//
// Thin wrappers around an Executor. Each call is a single attempt; the
// engine retries according to the policy the workflow attached. Executor
// errors are classified into activity error types here:
// - a pending operation is a retryable OperationPending
// - an aborted operation is a non-retryable OperationFailed
// - an empty URL where one is required is a retryable NotActive

use std::sync::Arc;

use async_trait::async_trait;
use benchflow_durable::persistence::WorkflowEventStore;
use benchflow_durable::{Activity, ActivityContext, ActivityError, WorkerPool};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::executor::{Executor, ExecutorError, PollOutcome};
use crate::kind::{HandleOf, OptionOf};
use crate::model::ResourceStatus;

/// Activity error types
pub mod error_types {
    /// The backend reported the operation aborted; never retried
    pub const OPERATION_FAILED: &str = "OperationFailed";
    /// The operation has not finished yet
    pub const OPERATION_PENDING: &str = "OperationPending";
    /// The resource exists but has no access URL yet
    pub const NOT_ACTIVE: &str = "NotActive";
    pub const NOT_FOUND: &str = "NotFound";
    /// Create found the resource already provisioned; never retried
    pub const ALREADY_EXISTS: &str = "AlreadyExists";
    pub const INVALID_OPTION: &str = "InvalidOption";
    pub const BACKEND: &str = "Backend";
}

/// Activity type names
pub mod activity_types {
    pub const GET_OR_CREATE_USER: &str = "get_or_create_user";
    pub const EXISTS: &str = "exists";
    pub const CREATE: &str = "create";
    pub const START: &str = "start";
    pub const STOP: &str = "stop";
    pub const DELETE: &str = "delete";
    pub const OPERATION_COMPLETED: &str = "operation_completed";
    pub const DESCRIBE: &str = "describe";
}

fn classify(error: ExecutorError) -> ActivityError {
    let error_type = match &error {
        ExecutorError::AlreadyExists(_) => {
            return ActivityError::non_retryable(error.to_string())
                .with_type(error_types::ALREADY_EXISTS)
        }
        ExecutorError::NotFound(_) => error_types::NOT_FOUND,
        ExecutorError::InvalidOption(_) => error_types::INVALID_OPTION,
        _ => error_types::BACKEND,
    };
    ActivityError::retryable(error.to_string()).with_type(error_type)
}

/// Input of the describe activity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescribeRequest<O> {
    pub option: O,
    /// Treat an empty URL as a retryable error
    #[serde(default)]
    pub require_url: bool,
}

// ============================================================================
// Owner and existence
// ============================================================================

/// Make sure the owning user exists before touching its sessions
pub struct GetOrCreateUserActivity<E: ?Sized> {
    executor: Arc<E>,
}

impl<E: Executor + ?Sized> GetOrCreateUserActivity<E> {
    pub fn new(executor: Arc<E>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl<E: Executor + ?Sized> Activity for GetOrCreateUserActivity<E> {
    const TYPE: &'static str = activity_types::GET_OR_CREATE_USER;
    type Input = OptionOf<E::Kind>;
    type Output = ();

    async fn execute(&self, ctx: &ActivityContext, option: Self::Input) -> Result<(), ActivityError> {
        debug!(run_id = %ctx.run_id, attempt = ctx.attempt, "Preparing resource owner");
        self.executor
            .get_or_create_owner(&option)
            .await
            .map_err(classify)
    }
}

/// Check whether the resource exists
///
/// Only a recognized not-found counts as absent; any other failure is
/// retried.
pub struct ExistsActivity<E: ?Sized> {
    executor: Arc<E>,
}

impl<E: Executor + ?Sized> ExistsActivity<E> {
    pub fn new(executor: Arc<E>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl<E: Executor + ?Sized> Activity for ExistsActivity<E> {
    const TYPE: &'static str = activity_types::EXISTS;
    type Input = OptionOf<E::Kind>;
    type Output = bool;

    async fn execute(&self, ctx: &ActivityContext, option: Self::Input) -> Result<bool, ActivityError> {
        match self.executor.exists(&option).await {
            Ok(exists) => {
                debug!(run_id = %ctx.run_id, exists, "Checked resource existence");
                Ok(exists)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => {
                warn!(run_id = %ctx.run_id, attempt = ctx.attempt, error = %e, "Existence check failed");
                Err(classify(e))
            }
        }
    }
}

// ============================================================================
// Mutations
// ============================================================================

macro_rules! mutation_activity {
    ($(#[$doc:meta])* $name:ident, $type_name:expr, $method:ident) => {
        $(#[$doc])*
        pub struct $name<E: ?Sized> {
            executor: Arc<E>,
        }

        impl<E: Executor + ?Sized> $name<E> {
            pub fn new(executor: Arc<E>) -> Self {
                Self { executor }
            }
        }

        #[async_trait]
        impl<E: Executor + ?Sized> Activity for $name<E> {
            const TYPE: &'static str = $type_name;
            type Input = OptionOf<E::Kind>;
            type Output = HandleOf<E::Kind>;

            async fn execute(
                &self,
                ctx: &ActivityContext,
                option: Self::Input,
            ) -> Result<Self::Output, ActivityError> {
                match self.executor.$method(&option).await {
                    Ok(handle) => {
                        info!(run_id = %ctx.run_id, activity = $type_name, "Backend accepted mutation");
                        Ok(handle)
                    }
                    Err(e) => {
                        warn!(
                            run_id = %ctx.run_id,
                            activity = $type_name,
                            attempt = ctx.attempt,
                            error = %e,
                            "Backend rejected mutation"
                        );
                        Err(classify(e))
                    }
                }
            }
        }
    };
}

mutation_activity!(
    /// Provision the resource and return its operation handle
    CreateActivity,
    activity_types::CREATE,
    create
);
mutation_activity!(
    /// Start a stopped resource
    StartActivity,
    activity_types::START,
    start
);
mutation_activity!(
    /// Stop a running resource
    StopActivity,
    activity_types::STOP,
    stop
);
mutation_activity!(
    /// Delete the resource
    DeleteActivity,
    activity_types::DELETE,
    delete
);

// ============================================================================
// Polling and describe
// ============================================================================

/// Check an operation handle once
///
/// Pending is reported as a retryable error so each engine retry is one
/// poll.
pub struct OperationCompletedActivity<E: ?Sized> {
    executor: Arc<E>,
}

impl<E: Executor + ?Sized> OperationCompletedActivity<E> {
    pub fn new(executor: Arc<E>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl<E: Executor + ?Sized> Activity for OperationCompletedActivity<E> {
    const TYPE: &'static str = activity_types::OPERATION_COMPLETED;
    type Input = HandleOf<E::Kind>;
    type Output = bool;

    async fn execute(&self, ctx: &ActivityContext, handle: Self::Input) -> Result<bool, ActivityError> {
        match self.executor.operation_completed(&handle).await {
            Ok(PollOutcome::Done) => {
                info!(run_id = %ctx.run_id, attempt = ctx.attempt, "Operation completed");
                Ok(true)
            }
            Ok(PollOutcome::Pending) => {
                debug!(run_id = %ctx.run_id, attempt = ctx.attempt, "Operation still pending");
                Err(ActivityError::retryable("operation has not completed yet")
                    .with_type(error_types::OPERATION_PENDING))
            }
            Ok(PollOutcome::Failed(reason)) => {
                warn!(run_id = %ctx.run_id, reason = %reason, "Operation aborted");
                Err(ActivityError::non_retryable(reason).with_type(error_types::OPERATION_FAILED))
            }
            Err(e) => Err(classify(e)),
        }
    }
}

/// Read the current status of the resource
pub struct DescribeActivity<E: ?Sized> {
    executor: Arc<E>,
}

impl<E: Executor + ?Sized> DescribeActivity<E> {
    pub fn new(executor: Arc<E>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl<E: Executor + ?Sized> Activity for DescribeActivity<E> {
    const TYPE: &'static str = activity_types::DESCRIBE;
    type Input = DescribeRequest<OptionOf<E::Kind>>;
    type Output = ResourceStatus;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        request: Self::Input,
    ) -> Result<ResourceStatus, ActivityError> {
        let status = self
            .executor
            .describe(&request.option)
            .await
            .map_err(classify)?;

        if request.require_url && !status.is_reachable() {
            debug!(run_id = %ctx.run_id, status = %status.status, "Resource not reachable yet");
            return Err(ActivityError::retryable(format!(
                "resource {} has no access URL yet (status {})",
                status.name, status.status
            ))
            .with_type(error_types::NOT_ACTIVE));
        }
        Ok(status)
    }
}

/// Register every lifecycle activity of `executor` on `pool`
pub fn register_activities<E, S>(pool: &WorkerPool<S>, executor: Arc<E>)
where
    E: Executor + ?Sized,
    S: WorkflowEventStore,
{
    pool.register_activity(Arc::new(GetOrCreateUserActivity::new(Arc::clone(&executor))));
    pool.register_activity(Arc::new(ExistsActivity::new(Arc::clone(&executor))));
    pool.register_activity(Arc::new(CreateActivity::new(Arc::clone(&executor))));
    pool.register_activity(Arc::new(StartActivity::new(Arc::clone(&executor))));
    pool.register_activity(Arc::new(StopActivity::new(Arc::clone(&executor))));
    pool.register_activity(Arc::new(DeleteActivity::new(Arc::clone(&executor))));
    pool.register_activity(Arc::new(OperationCompletedActivity::new(Arc::clone(&executor))));
    pool.register_activity(Arc::new(DescribeActivity::new(executor)));
}
