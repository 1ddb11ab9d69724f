//! # Durable Execution Engine
//!
//! An in-process workflow orchestration engine for reliable task execution.
//!
//! ## Features
//!
//! - **Event-sourced runs**: every state change is recorded in an append-only
//!   history; workflow state is rebuilt by replaying it
//! - **Run-id deduplication**: at most one in-flight execution per run id
//! - **Retry policies**: fixed or exponential backoff, bounded attempts and
//!   non-retryable error types, for activities and whole runs
//! - **Task queues**: named queues polled by worker pools with graceful drain
//! - **HTTP frontend**: other processes submit and follow runs over HTTP
//! - **Pluggable storage**: in-memory for tests and single-shot use,
//!   PostgreSQL when runs must survive a restart
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   HTTP    ┌───────────────────────────────┐
//! │ HttpWorkflowClient│ ───────► │ api::router                    │
//! └──────────────────┘           └───────────────┬───────────────┘
//!                                                ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowExecutor                        │
//! │  (submits runs, replays history, processes actions)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   WorkflowEventStore                         │
//! │  (runs, histories, delayed task queues)                     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  WorkerHost / WorkerPool                     │
//! │  (claims tasks per queue, runs activities)                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use benchflow_durable::prelude::*;
//!
//! let mut executor = WorkflowExecutor::new(InMemoryWorkflowEventStore::new());
//! executor.register::<MyWorkflow>();
//! let executor = Arc::new(executor);
//!
//! let pool = WorkerPool::new(executor.clone(), WorkerPoolConfig::new("MY_TASK_QUEUE"));
//! pool.register_activity(Arc::new(MyActivity));
//! pool.start()?;
//!
//! let handle = executor
//!     .submit(SubmitRequest::new("job-1", MyWorkflow::TYPE, "MY_TASK_QUEUE", json!({})))
//!     .await?;
//! let result = executor.wait_for_result(handle.execution_id, Duration::from_secs(1)).await?;
//! ```

pub mod activity;
pub mod api;
pub mod client;
pub mod engine;
pub mod persistence;
pub mod reliability;
pub mod worker;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{Activity, ActivityContext, ActivityError};
    pub use crate::client::{
        stream_history, ClientError, HttpWorkflowClient, RunDescription, RunHandle, SubmitRequest,
        WorkflowClient,
    };
    pub use crate::engine::{ExecutorConfig, ExecutorError, WorkflowExecutor, WorkflowRegistry};
    pub use crate::persistence::{
        InMemoryWorkflowEventStore, PostgresWorkflowEventStore, RunStatus, StoreError,
        WorkflowEventStore,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::worker::{WorkerHost, WorkerPool, WorkerPoolConfig, WorkerPoolError};
    pub use crate::workflow::{
        ActivityOptions, HistoryEvent, Workflow, WorkflowAction, WorkflowError, WorkflowEvent,
    };
}

// Re-export key types at crate root
pub use activity::{Activity, ActivityContext, ActivityError};
pub use client::{
    stream_history, ClientError, HttpWorkflowClient, RunDescription, RunHandle, SubmitRequest,
    WorkflowClient,
};
pub use engine::{ExecutorConfig, ExecutorError, WorkflowExecutor, WorkflowRegistry};
pub use persistence::{
    InMemoryWorkflowEventStore, PostgresWorkflowEventStore, RunStatus, StoreError,
    WorkflowEventStore,
};
pub use reliability::RetryPolicy;
pub use worker::{WorkerHost, WorkerPool, WorkerPoolConfig, WorkerPoolError};
pub use workflow::{
    ActivityOptions, HistoryEvent, Workflow, WorkflowAction, WorkflowError, WorkflowEvent,
};
