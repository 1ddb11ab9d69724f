// Lifecycle orchestration for hosted notebook resources
//
// This crate drives create/start/stop/delete of two resource kinds on top of
// the benchflow-durable engine:
// - workbench: VM notebook instances whose mutations return operation handles
// - jupyterhub: named hub servers that only expose readiness flags
//
// Key design decisions:
// - One deterministic LifecycleWorkflow per (kind, operation), replayed by the engine
// - Activities make single attempts; pending polls are retryable errors
// - Backends sit behind the Executor trait and are chosen via ExecutorRegistry
// - The watcher only reads history and never influences a run

pub mod activities;
pub mod executor;
pub mod kind;
pub mod model;
pub mod telemetry;
pub mod watcher;
pub mod workflows;

pub use activities::{error_types, register_activities, DescribeRequest};
pub use executor::{
    BoxedExecutor, Executor, ExecutorError, ExecutorRegistry, ExecutorSettings,
    FakeInstanceExecutor, FakeScript, FakeSessionExecutor, JupyterHubExecutor, NotebooksExecutor,
    PollOutcome,
};
pub use kind::{JupyterHub, ResourceKind, Workbench};
pub use model::{
    InstanceOption, Operation, OperationName, Readiness, ResourceStatus, SessionOption,
    SessionProbe,
};
pub use watcher::{ProgressWatcher, WatchSummary};
pub use workflows::{
    lifecycle_request, register_workflow, register_workflows, CreateWorkflow, DeleteWorkflow, LifecycleWorkflow,
    StartWorkflow, StopWorkflow,
};
