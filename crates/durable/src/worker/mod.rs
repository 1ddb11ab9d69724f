//! Worker pools for task execution
//!
//! This module provides:
//! - [`WorkerPool`] - claims tasks from one queue and runs them concurrently
//! - [`WorkerHost`] - starts and drains a set of pools together
//! - [`PollerConfig`] - task polling with exponential backoff
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                        WorkerHost                          │
//! │  ┌──────────────────────┐   ┌──────────────────────┐       │
//! │  │ WorkerPool (queue A) │   │ WorkerPool (queue B) │  ...  │
//! │  │  TaskPoller          │   │  TaskPoller          │       │
//! │  │  Semaphore-limited   │   │  Semaphore-limited   │       │
//! │  │  task executions     │   │  task executions     │       │
//! │  └──────────┬───────────┘   └──────────┬───────────┘       │
//! └─────────────┼──────────────────────────┼───────────────────┘
//!               ▼                          ▼
//!        WorkflowExecutor (start attempts, apply activity outcomes)
//! ```

mod host;
mod poller;
mod pool;

pub use host::WorkerHost;
pub use poller::{PollerConfig, PollerError, TaskPoller};
pub use pool::{ActivityHandler, WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
