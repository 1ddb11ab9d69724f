// Lifecycle workflows
//
// One state machine drives all four operations of every kind:
//
//   [owner] -> exists -> mutate -> poll -> [describe]
//
// - create skips the mutation when the resource already exists
// - delete succeeds without calling the backend when it is absent
// - start and stop fail permanently when it is absent
// - create and start finish by describing until an access URL appears
//
// The workflow performs no I/O. Every step is an activity with the retry
// policy of its operation class, so a pending poll is simply a retry.

use std::marker::PhantomData;
use std::time::Duration;

use benchflow_durable::persistence::WorkflowEventStore;
use benchflow_durable::{
    ActivityError, ActivityOptions, RetryPolicy, SubmitRequest, Workflow, WorkflowAction,
    WorkflowError, WorkflowExecutor,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::activities::{activity_types, error_types, DescribeRequest};
use crate::kind::{OptionOf, ResourceKind};
use crate::model::{Operation, ResourceStatus};

/// Spacing between attempts of every lifecycle activity
pub const RETRY_INTERVAL: Duration = Duration::from_secs(5);
/// Attempts for create and start (6 minutes at 5 s)
pub const LONG_WAIT_ATTEMPTS: u32 = 72;
/// Attempts for delete and stop (3 minutes at 5 s)
pub const SHORT_WAIT_ATTEMPTS: u32 = 36;
pub const START_TO_CLOSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Retry policy of the activities of one operation
pub fn retry_policy(op: Operation) -> RetryPolicy {
    let attempts = if op.is_long_wait() {
        LONG_WAIT_ATTEMPTS
    } else {
        SHORT_WAIT_ATTEMPTS
    };
    RetryPolicy::fixed(RETRY_INTERVAL, attempts)
        .with_non_retryable_error(error_types::OPERATION_FAILED)
}

pub fn activity_options(op: Operation) -> ActivityOptions {
    ActivityOptions::default()
        .with_retry(retry_policy(op))
        .with_start_to_close_timeout(START_TO_CLOSE_TIMEOUT)
}

/// Type-level operation selector
pub trait LifecycleOp: Send + Sync + 'static {
    const OPERATION: Operation;

    /// `ResourceStatus` for create/start, `()` for delete/stop
    type Output: Serialize + DeserializeOwned + Send;

    fn output(status: Option<ResourceStatus>) -> Option<Self::Output>;
}

pub mod ops {
    use super::*;

    pub struct Create;
    pub struct Delete;
    pub struct Start;
    pub struct Stop;

    impl LifecycleOp for Create {
        const OPERATION: Operation = Operation::Create;
        type Output = ResourceStatus;

        fn output(status: Option<ResourceStatus>) -> Option<ResourceStatus> {
            status
        }
    }

    impl LifecycleOp for Start {
        const OPERATION: Operation = Operation::Start;
        type Output = ResourceStatus;

        fn output(status: Option<ResourceStatus>) -> Option<ResourceStatus> {
            status
        }
    }

    impl LifecycleOp for Delete {
        const OPERATION: Operation = Operation::Delete;
        type Output = ();

        fn output(_: Option<ResourceStatus>) -> Option<()> {
            Some(())
        }
    }

    impl LifecycleOp for Stop {
        const OPERATION: Operation = Operation::Stop;
        type Output = ();

        fn output(_: Option<ResourceStatus>) -> Option<()> {
            Some(())
        }
    }
}

/// Step the workflow is waiting on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Init,
    PreparingOwner,
    CheckingExistence,
    Mutating,
    Polling,
    Describing,
    Completed,
    Failed,
}

/// Deterministic lifecycle workflow for kind `K` and operation `O`
pub struct LifecycleWorkflow<K: ResourceKind, O: LifecycleOp> {
    option: OptionOf<K>,
    state: LifecycleState,
    status: Option<ResourceStatus>,
    error: Option<WorkflowError>,
    _marker: PhantomData<fn() -> (K, O)>,
}

pub type CreateWorkflow<K> = LifecycleWorkflow<K, ops::Create>;
pub type DeleteWorkflow<K> = LifecycleWorkflow<K, ops::Delete>;
pub type StartWorkflow<K> = LifecycleWorkflow<K, ops::Start>;
pub type StopWorkflow<K> = LifecycleWorkflow<K, ops::Stop>;

impl<K: ResourceKind, O: LifecycleOp> LifecycleWorkflow<K, O> {
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    fn operation() -> Operation {
        O::OPERATION
    }

    fn schedule(&mut self, state: LifecycleState, activity_type: &str, input: Value) -> Vec<WorkflowAction> {
        self.state = state;
        vec![WorkflowAction::ScheduleActivity {
            activity_id: activity_type.replace('_', "-"),
            activity_type: activity_type.to_string(),
            input,
            options: activity_options(Self::operation()),
        }]
    }

    fn schedule_with<T: Serialize>(
        &mut self,
        state: LifecycleState,
        activity_type: &str,
        input: &T,
    ) -> Vec<WorkflowAction> {
        match serde_json::to_value(input) {
            Ok(input) => self.schedule(state, activity_type, input),
            Err(e) => self.fail(
                WorkflowError::new(format!("cannot encode {activity_type} input: {e}"))
                    .with_code("InvalidInput"),
            ),
        }
    }

    fn check_existence(&mut self) -> Vec<WorkflowAction> {
        let option = self.option.clone();
        self.schedule_with(LifecycleState::CheckingExistence, activity_types::EXISTS, &option)
    }

    fn mutate(&mut self) -> Vec<WorkflowAction> {
        let activity_type = match Self::operation() {
            Operation::Create => activity_types::CREATE,
            Operation::Delete => activity_types::DELETE,
            Operation::Start => activity_types::START,
            Operation::Stop => activity_types::STOP,
        };
        let option = self.option.clone();
        self.schedule_with(LifecycleState::Mutating, activity_type, &option)
    }

    fn describe(&mut self) -> Vec<WorkflowAction> {
        let request = DescribeRequest {
            option: self.option.clone(),
            require_url: true,
        };
        self.schedule_with(LifecycleState::Describing, activity_types::DESCRIBE, &request)
    }

    /// After the operation finished: recover the URL or stop here
    fn after_operation(&mut self) -> Vec<WorkflowAction> {
        if Self::operation().is_long_wait() {
            self.describe()
        } else {
            self.complete(None)
        }
    }

    fn complete(&mut self, status: Option<ResourceStatus>) -> Vec<WorkflowAction> {
        let result = match O::output(status.clone()).map(|output| serde_json::to_value(&output)) {
            Some(Ok(result)) => result,
            Some(Err(e)) => {
                return self.fail(
                    WorkflowError::new(format!("cannot encode result: {e}"))
                        .with_code("InvalidOutput"),
                )
            }
            None => {
                return self.fail(
                    WorkflowError::new("workflow finished without a status")
                        .with_code("InvalidOutput"),
                )
            }
        };
        self.status = status;
        self.state = LifecycleState::Completed;
        vec![WorkflowAction::complete(result)]
    }

    fn fail(&mut self, error: WorkflowError) -> Vec<WorkflowAction> {
        self.state = LifecycleState::Failed;
        self.error = Some(error.clone());
        vec![WorkflowAction::fail(error)]
    }

    fn invalid_result(&mut self, activity_id: &str, e: serde_json::Error) -> Vec<WorkflowAction> {
        self.fail(
            WorkflowError::new(format!("unexpected result from {activity_id}: {e}"))
                .with_code("InvalidActivityResult"),
        )
    }
}

impl<K: ResourceKind, O: LifecycleOp> Workflow for LifecycleWorkflow<K, O> {
    const TYPE: &'static str = K::WORKFLOWS.name(O::OPERATION);
    type Input = OptionOf<K>;
    type Output = O::Output;

    fn new(option: OptionOf<K>) -> Self {
        Self {
            option,
            state: LifecycleState::Init,
            status: None,
            error: None,
            _marker: PhantomData,
        }
    }

    fn on_start(&mut self) -> Vec<WorkflowAction> {
        if K::OWNER_SCOPED {
            let option = self.option.clone();
            self.schedule_with(
                LifecycleState::PreparingOwner,
                activity_types::GET_OR_CREATE_USER,
                &option,
            )
        } else {
            self.check_existence()
        }
    }

    fn on_activity_completed(&mut self, activity_id: &str, result: Value) -> Vec<WorkflowAction> {
        match self.state {
            LifecycleState::PreparingOwner => self.check_existence(),

            LifecycleState::CheckingExistence => {
                let exists: bool = match serde_json::from_value(result) {
                    Ok(exists) => exists,
                    Err(e) => return self.invalid_result(activity_id, e),
                };
                match (Self::operation(), exists) {
                    (Operation::Create, true) => self.describe(),
                    (Operation::Delete, false) => self.complete(None),
                    (Operation::Start | Operation::Stop, false) => self.fail(
                        WorkflowError::new(format!(
                            "cannot {} {}: resource does not exist",
                            Self::operation(),
                            K::run_id(&self.option, Self::operation())
                        ))
                        .with_code(error_types::NOT_FOUND),
                    ),
                    _ => self.mutate(),
                }
            }

            // The handle is opaque here and passed through to the poller
            LifecycleState::Mutating => self.schedule(
                LifecycleState::Polling,
                activity_types::OPERATION_COMPLETED,
                result,
            ),

            LifecycleState::Polling => self.after_operation(),

            LifecycleState::Describing => {
                let status: ResourceStatus = match serde_json::from_value(result) {
                    Ok(status) => status,
                    Err(e) => return self.invalid_result(activity_id, e),
                };
                if !status.is_reachable() {
                    return self.fail(
                        WorkflowError::retryable(format!(
                            "{} finished without an access URL (status {})",
                            status.name, status.status
                        ))
                        .with_code(error_types::NOT_ACTIVE),
                    );
                }
                self.complete(Some(status))
            }

            LifecycleState::Init | LifecycleState::Completed | LifecycleState::Failed => vec![],
        }
    }

    fn on_activity_failed(&mut self, activity_id: &str, error: &ActivityError) -> Vec<WorkflowAction> {
        let code = error
            .error_type
            .clone()
            .unwrap_or_else(|| "ActivityFailed".to_string());
        // Lost a race with another creator: the resource is there, report it
        if self.state == LifecycleState::Mutating
            && Self::operation() == Operation::Create
            && code == error_types::ALREADY_EXISTS
        {
            return self.describe();
        }

        let message = format!("{activity_id} failed: {}", error.message);

        let failure = if code == error_types::OPERATION_FAILED {
            WorkflowError::new(message)
        } else {
            WorkflowError::retryable(message)
        };
        self.fail(failure.with_code(code))
    }

    fn is_completed(&self) -> bool {
        matches!(
            self.state,
            LifecycleState::Completed | LifecycleState::Failed
        )
    }

    fn result(&self) -> Option<O::Output> {
        if self.state == LifecycleState::Completed {
            O::output(self.status.clone())
        } else {
            None
        }
    }

    fn error(&self) -> Option<WorkflowError> {
        self.error.clone()
    }
}

/// Register the lifecycle workflow of kind `K` for one operation
pub fn register_workflow<K: ResourceKind, S: WorkflowEventStore>(
    executor: &mut WorkflowExecutor<S>,
    op: Operation,
) {
    match op {
        Operation::Create => executor.register::<CreateWorkflow<K>>(),
        Operation::Delete => executor.register::<DeleteWorkflow<K>>(),
        Operation::Start => executor.register::<StartWorkflow<K>>(),
        Operation::Stop => executor.register::<StopWorkflow<K>>(),
    }
}

/// Register the four lifecycle workflows of kind `K`
pub fn register_workflows<K: ResourceKind, S: WorkflowEventStore>(executor: &mut WorkflowExecutor<S>) {
    for op in Operation::ALL {
        register_workflow::<K, S>(executor, op);
    }
}

/// Submission for `op` on `option`, keyed by the kind's run id
pub fn lifecycle_request<K: ResourceKind>(
    op: Operation,
    option: &OptionOf<K>,
) -> Result<SubmitRequest, serde_json::Error> {
    Ok(SubmitRequest::new(
        K::run_id(option, op),
        K::WORKFLOWS.name(op),
        K::task_queue(op),
        serde_json::to_value(option)?,
    ))
}
