//! Persistence layer for durable execution
//!
//! This module provides:
//! - [`WorkflowEventStore`] trait for run state, history and task queues
//! - [`InMemoryWorkflowEventStore`], the process-local store
//! - [`PostgresWorkflowEventStore`], the store that survives restarts

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryWorkflowEventStore;
pub use postgres::PostgresWorkflowEventStore;
pub use store::{
    ClaimedTask, CreateRunOutcome, NewRun, RunInfo, RunStatus, StoreError, TaskDefinition,
    TaskFailureOutcome, TaskKind, WorkflowEventStore,
};
