//! Runs several worker pools as one unit

use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};

use super::pool::{WorkerPool, WorkerPoolError};
use crate::persistence::WorkflowEventStore;

/// A set of worker pools, typically one per task queue
///
/// Shutdown drains every pool concurrently so the grace period is shared,
/// not multiplied by the number of queues.
pub struct WorkerHost<S: WorkflowEventStore> {
    pools: Vec<Arc<WorkerPool<S>>>,
}

impl<S: WorkflowEventStore> Default for WorkerHost<S> {
    fn default() -> Self {
        Self { pools: Vec::new() }
    }
}

impl<S: WorkflowEventStore> WorkerHost<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pool(&mut self, pool: WorkerPool<S>) -> Arc<WorkerPool<S>> {
        let pool = Arc::new(pool);
        self.pools.push(Arc::clone(&pool));
        pool
    }

    pub fn pools(&self) -> &[Arc<WorkerPool<S>>] {
        &self.pools
    }

    pub fn task_queues(&self) -> Vec<&str> {
        self.pools.iter().map(|p| p.task_queue()).collect()
    }

    /// Start every pool
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        for pool in &self.pools {
            pool.start()?;
        }
        info!(queues = ?self.task_queues(), "Worker host started");
        Ok(())
    }

    /// Drain all pools concurrently
    ///
    /// Returns the first error, after every pool has been asked to stop.
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        let results = join_all(self.pools.iter().map(|pool| pool.shutdown())).await;

        let mut first_error = None;
        for (pool, result) in self.pools.iter().zip(results) {
            if let Err(e) = result {
                warn!(task_queue = pool.task_queue(), error = %e, "Pool did not drain cleanly");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("Worker host stopped");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::WorkflowExecutor;
    use crate::persistence::InMemoryWorkflowEventStore;
    use crate::worker::{WorkerPoolConfig, WorkerPoolStatus};

    #[tokio::test]
    async fn test_start_and_shutdown_all() {
        let executor = Arc::new(WorkflowExecutor::new(InMemoryWorkflowEventStore::new()));
        let mut host = WorkerHost::new();
        for queue in ["A_TASK_QUEUE", "B_TASK_QUEUE"] {
            host.add_pool(WorkerPool::new(
                Arc::clone(&executor),
                WorkerPoolConfig::new(queue),
            ));
        }

        host.start().unwrap();
        assert_eq!(host.task_queues(), vec!["A_TASK_QUEUE", "B_TASK_QUEUE"]);
        assert!(host
            .pools()
            .iter()
            .all(|p| p.status() == WorkerPoolStatus::Running));

        host.shutdown().await.unwrap();
        assert!(host
            .pools()
            .iter()
            .all(|p| p.status() == WorkerPoolStatus::Stopped));
    }
}
