//! Workflow execution engine
//!
//! The engine module provides the `WorkflowExecutor` which drives workflow
//! state machines through event replay and action processing.

mod executor;
mod registry;

pub use executor::{ExecutorConfig, ExecutorError, ProcessResult, WorkflowExecutor};
pub use registry::{AnyWorkflow, RegistryError, WorkflowFactory, WorkflowRegistry};
