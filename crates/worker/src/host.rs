// Worker host
//
// Builds the in-process engine over the configured workflow store, registers
// the lifecycle workflows of every hosted kind and operation and starts one
// worker pool per task queue. The engine is exposed to starters through the
// HTTP frontend.

use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use benchflow_core::{
    register_activities, register_workflow, Executor, ExecutorError, ExecutorRegistry,
    ExecutorSettings, JupyterHub, Operation, ResourceKind, Workbench,
};
use benchflow_durable::{
    api, InMemoryWorkflowEventStore, PostgresWorkflowEventStore, WorkerHost, WorkerPool,
    WorkerPoolConfig, WorkerPoolError, WorkflowClient, WorkflowEventStore, WorkflowExecutor,
};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{KindName, WorkerConfig};

#[derive(Debug, Error)]
pub enum HostError {
    #[error("{kind} executor '{name}': {source}")]
    Executor {
        kind: &'static str,
        name: String,
        #[source]
        source: ExecutorError,
    },

    #[error("no resource kind selected")]
    NothingToHost,

    #[error(transparent)]
    Pool(#[from] WorkerPoolError),
}

/// Open the configured store, build the worker on it and run until interrupted
pub async fn serve(config: WorkerConfig) -> anyhow::Result<()> {
    match config.database_url.clone() {
        Some(url) => {
            let store = PostgresWorkflowEventStore::connect(&url, config.database_max_connections)
                .await
                .context("Failed to open PostgreSQL workflow store")?;
            info!("Using PostgreSQL workflow store");
            Worker::build_on(config, store)
                .context("Failed to build worker")?
                .run()
                .await
        }
        None => {
            warn!("DATABASE_URL is not set; in-flight runs will not survive a restart");
            Worker::build(config)
                .context("Failed to build worker")?
                .run()
                .await
        }
    }
}

/// Engine plus the worker pools serving its task queues
pub struct Worker<S: WorkflowEventStore = InMemoryWorkflowEventStore> {
    engine: Arc<WorkflowExecutor<S>>,
    host: WorkerHost<S>,
    queues: Vec<String>,
    config: WorkerConfig,
}

impl Worker {
    /// Build on an in-memory store with the default executor registries
    pub fn build(config: WorkerConfig) -> Result<Self, HostError> {
        Self::build_on(config, InMemoryWorkflowEventStore::new())
    }
}

impl<S: WorkflowEventStore> Worker<S> {
    /// Build on `store` with the default executor registries
    pub fn build_on(config: WorkerConfig, store: S) -> Result<Self, HostError> {
        Self::build_with(
            config,
            store,
            ExecutorRegistry::<Workbench>::with_defaults(),
            ExecutorRegistry::<JupyterHub>::with_defaults(),
        )
    }

    /// Build with caller-supplied registries
    ///
    /// Executors are constructed eagerly so a bad name or missing credential
    /// fails here instead of on the first activity. Only the workflows of the
    /// hosted operations are registered, so the frontend rejects submissions
    /// no pool would ever pick up.
    pub fn build_with(
        config: WorkerConfig,
        store: S,
        workbench: ExecutorRegistry<Workbench>,
        jupyterhub: ExecutorRegistry<JupyterHub>,
    ) -> Result<Self, HostError> {
        if config.kinds.is_empty() {
            return Err(HostError::NothingToHost);
        }
        let settings = config.executor_settings();

        let workbench_executor = config
            .hosts(KindName::Workbench)
            .then(|| build_executor(&workbench, &config.workbench_executor, &settings))
            .transpose()?;
        let jupyterhub_executor = config
            .hosts(KindName::Jupyterhub)
            .then(|| build_executor(&jupyterhub, &config.jupyterhub_executor, &settings))
            .transpose()?;

        let mut engine = WorkflowExecutor::new(store);
        for op in config.operations() {
            if workbench_executor.is_some() {
                register_workflow::<Workbench, _>(&mut engine, op);
            }
            if jupyterhub_executor.is_some() {
                register_workflow::<JupyterHub, _>(&mut engine, op);
            }
        }
        let engine = Arc::new(engine);

        let mut worker = Self {
            engine,
            host: WorkerHost::new(),
            queues: Vec::new(),
            config,
        };
        if let Some(executor) = workbench_executor {
            worker.add_pools(executor);
        }
        if let Some(executor) = jupyterhub_executor {
            worker.add_pools(executor);
        }
        Ok(worker)
    }

    fn add_pools<E: Executor + ?Sized>(&mut self, executor: Arc<E>) {
        let worker_id = self
            .config
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", Uuid::now_v7()));

        for op in self.config.operations() {
            let queue = <E::Kind as ResourceKind>::task_queue(op);
            let pool_config = WorkerPoolConfig::new(queue.clone())
                .with_worker_id(format!("{worker_id}-{}", queue.to_ascii_lowercase()))
                .with_max_concurrency(self.config.max_concurrency)
                .with_shutdown_timeout(self.config.shutdown_grace());
            let pool = self
                .host
                .add_pool(WorkerPool::new(Arc::clone(&self.engine), pool_config));
            register_activities(&pool, Arc::clone(&executor));
            info!(kind = <E::Kind as ResourceKind>::NAME, task_queue = %queue, "Worker pool registered");
            self.queues.push(queue);
        }
    }

    /// Task queues served by this worker
    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    pub fn engine(&self) -> Arc<WorkflowExecutor<S>> {
        Arc::clone(&self.engine)
    }

    /// HTTP frontend over this worker's engine
    pub fn router(&self) -> Router {
        api::router(Arc::clone(&self.engine) as Arc<dyn WorkflowClient>)
    }

    /// Start polling without serving the frontend
    pub fn start(&self) -> Result<(), HostError> {
        self.host.start()?;
        Ok(())
    }

    /// Drain in-flight activities, bounded by the grace period
    pub async fn shutdown(&self) -> Result<(), HostError> {
        self.host.shutdown().await?;
        Ok(())
    }

    /// Serve the frontend and poll until interrupted, then drain
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.listen_addr))?;
        self.start().context("Failed to start worker pools")?;

        info!(
            listen_addr = %self.config.listen_addr,
            queues = self.queues.len(),
            "Worker started"
        );

        let served = tokio::select! {
            result = axum::serve(listener, self.router()) => result.context("Frontend server error"),
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                Ok(())
            }
        };

        info!(grace = ?self.config.shutdown_grace(), "Draining worker pools");
        self.shutdown().await.context("Worker shutdown failed")?;
        served
    }
}

fn build_executor<K: ResourceKind>(
    registry: &ExecutorRegistry<K>,
    name: &str,
    settings: &ExecutorSettings,
) -> Result<Arc<dyn Executor<Kind = K>>, HostError> {
    let executor = registry
        .create(name, settings)
        .map_err(|source| HostError::Executor {
            kind: K::NAME,
            name: name.to_string(),
            source,
        })?;
    info!(kind = K::NAME, executor = name, "Executor ready");
    Ok(executor)
}

/// Queues a worker would serve for `kind` and `ops`
pub fn queues_for(kind: KindName, ops: &[Operation]) -> Vec<String> {
    ops.iter()
        .map(|op| match kind {
            KindName::Workbench => Workbench::task_queue(*op),
            KindName::Jupyterhub => JupyterHub::task_queue(*op),
        })
        .collect()
}
