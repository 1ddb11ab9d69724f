// Starter commands
//
// Every subcommand submits one lifecycle run, optionally follows it with the
// progress watcher and waits for the terminal result.

pub mod jupyterhub;
pub mod workbench;

use std::time::Duration;

use anyhow::{bail, Context, Result};
use benchflow_core::kind::OptionOf;
use benchflow_core::{lifecycle_request, Operation, ProgressWatcher, ResourceKind, ResourceStatus};
use benchflow_durable::{RetryPolicy, RunHandle, WorkflowClient};
use clap::Args;
use tracing::{info, warn};

use crate::output::OutputFormat;

/// Restart a failed run after a minute, three attempts in total
pub const RUN_RETRY_INTERVAL: Duration = Duration::from_secs(60);
pub const RUN_MAX_ATTEMPTS: u32 = 3;

const RESULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, Args)]
pub struct RunFlags {
    /// Wait for the run to finish
    #[arg(long, global = true)]
    pub wait: bool,

    /// Do not log run progress while waiting
    #[arg(long, global = true)]
    pub silent: bool,
}

/// What a finished run produced
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Submitted(RunHandle),
    Finished(Option<ResourceStatus>),
}

/// Submit `op` for `option` and, with `--wait`, block until it finishes
pub async fn run_lifecycle<K, C>(
    client: &C,
    op: Operation,
    option: &OptionOf<K>,
    flags: RunFlags,
) -> Result<Outcome>
where
    K: ResourceKind,
    C: WorkflowClient + ?Sized,
{
    let request = lifecycle_request::<K>(op, option)
        .context("Failed to encode run input")?
        .with_retry_policy(RetryPolicy::fixed(RUN_RETRY_INTERVAL, RUN_MAX_ATTEMPTS));
    let run_id = request.run_id.clone();

    info!(run_id = %run_id, task_queue = %request.task_queue, "Triggering {} {} workflow", K::NAME, op);
    let handle = client
        .submit(request)
        .await
        .with_context(|| format!("Could not trigger {} {op} workflow", K::NAME))?;

    if handle.existing {
        info!(run_id = %run_id, execution_id = %handle.execution_id, "Attached to run already in flight");
    }
    if !flags.wait {
        info!(run_id = %run_id, "Successfully triggered {} {op} workflow", K::NAME);
        return Ok(Outcome::Submitted(handle));
    }

    let result = async {
        let wait = client.wait_for_result(handle.execution_id, RESULT_POLL_INTERVAL);
        if flags.silent {
            return wait.await;
        }
        let watcher = ProgressWatcher::new(client);
        let (watched, result) = tokio::join!(watcher.watch(&run_id), wait);
        if let Err(e) = watched {
            warn!(run_id = %run_id, error = %e, "Progress watcher stopped");
        }
        result
    };

    let value = tokio::select! {
        result = result => result
            .with_context(|| format!("Could not complete {} {op} workflow", K::NAME))?,
        _ = tokio::signal::ctrl_c() => bail!("Interrupted while waiting for {run_id}"),
    };

    let status = if op.is_long_wait() {
        Some(serde_json::from_value::<ResourceStatus>(value).context("Unexpected run result")?)
    } else {
        None
    };
    match &status {
        Some(status) => info!(
            name = %status.name,
            url = %status.url,
            status = %status.status,
            "{} {op} workflow completed successfully", K::NAME
        ),
        None => info!(run_id = %run_id, "{} {op} workflow completed successfully", K::NAME),
    }
    Ok(Outcome::Finished(status))
}

/// Print what the user asked to see
pub fn report(outcome: &Outcome, output: OutputFormat) -> Result<()> {
    match outcome {
        Outcome::Submitted(handle) => output.print_value(handle),
        Outcome::Finished(Some(status)) => output.print_status(status),
        Outcome::Finished(None) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use benchflow_core::{
        register_activities, register_workflows, FakeInstanceExecutor, FakeScript,
        InstanceOption, Workbench,
    };
    use benchflow_durable::{
        ClientError, InMemoryWorkflowEventStore, WorkerHost, WorkerPool, WorkerPoolConfig,
        WorkflowExecutor,
    };
    use std::sync::Arc;

    type Engine = WorkflowExecutor<InMemoryWorkflowEventStore>;

    fn option() -> InstanceOption {
        InstanceOption {
            name: "ws1".into(),
            email: "dev@example.com".into(),
            zone: "asia-northeast1-a".into(),
            location: "asia-northeast1".into(),
            project_id: "gcp-sample".into(),
            machine_type: "n1-standard-1".into(),
            network: "default".into(),
            subnet: "default".into(),
        }
    }

    fn engine_with_workers(
        fake: Arc<FakeInstanceExecutor>,
    ) -> (Arc<Engine>, WorkerHost<InMemoryWorkflowEventStore>) {
        let mut engine = WorkflowExecutor::new(InMemoryWorkflowEventStore::new());
        register_workflows::<Workbench, _>(&mut engine);
        let engine = Arc::new(engine);
        let mut host = WorkerHost::new();
        for queue in Workbench::task_queues() {
            let pool = host.add_pool(WorkerPool::new(
                Arc::clone(&engine),
                WorkerPoolConfig::new(queue),
            ));
            register_activities(&pool, Arc::clone(&fake));
        }
        (engine, host)
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_wait_returns_after_submit() {
        let (engine, _host) = engine_with_workers(Arc::new(FakeInstanceExecutor::default()));

        let outcome = run_lifecycle::<Workbench, _>(
            engine.as_ref(),
            Operation::Create,
            &option(),
            RunFlags::default(),
        )
        .await
        .unwrap();

        match outcome {
            Outcome::Submitted(handle) => {
                assert_eq!(handle.run_id, "ws1-create");
                assert!(!handle.existing);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_final_status() {
        let fake = Arc::new(FakeInstanceExecutor::new(
            FakeScript::default().with_pending_polls(2),
        ));
        let (engine, host) = engine_with_workers(fake);
        host.start().unwrap();

        let flags = RunFlags {
            wait: true,
            silent: false,
        };
        let outcome = run_lifecycle::<Workbench, _>(engine.as_ref(), Operation::Create, &option(), flags)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            Outcome::Finished(Some(ResourceStatus::new("ws1", "https://ws1", "ACTIVE")))
        );
        host.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_run_is_an_error() {
        let fake = Arc::new(FakeInstanceExecutor::default());
        let (engine, host) = engine_with_workers(fake);
        host.start().unwrap();

        let flags = RunFlags {
            wait: true,
            silent: true,
        };
        let error = run_lifecycle::<Workbench, _>(engine.as_ref(), Operation::Start, &option(), flags)
            .await
            .unwrap_err();

        let cause = error.downcast_ref::<ClientError>().unwrap();
        assert!(matches!(cause, ClientError::RunFailed(e) if e.code.as_deref() == Some("NotFound")));
        host.shutdown().await.unwrap();
    }
}
