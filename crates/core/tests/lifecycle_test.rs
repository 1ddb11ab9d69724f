//! End-to-end lifecycle runs against the in-process engine and fake backends

use std::sync::Arc;
use std::time::Duration;

use benchflow_core::{
    lifecycle_request, register_activities, register_workflows, Executor, FakeInstanceExecutor,
    FakeScript, FakeSessionExecutor, InstanceOption, JupyterHub, Operation, ProgressWatcher,
    ResourceKind, ResourceStatus, SessionOption, Workbench,
};
use benchflow_durable::{
    ClientError, InMemoryWorkflowEventStore, WorkerHost, WorkerPool, WorkerPoolConfig,
    WorkflowClient, WorkflowExecutor,
};
use serde_json::{json, Value};

type Engine = WorkflowExecutor<InMemoryWorkflowEventStore>;

struct Harness {
    engine: Arc<Engine>,
    host: WorkerHost<InMemoryWorkflowEventStore>,
}

impl Harness {
    fn start<K, E>(executor: Arc<E>) -> Self
    where
        K: ResourceKind,
        E: Executor<Kind = K>,
    {
        let mut engine = WorkflowExecutor::new(InMemoryWorkflowEventStore::new());
        register_workflows::<K, _>(&mut engine);
        let engine = Arc::new(engine);

        let mut host = WorkerHost::new();
        for queue in K::task_queues() {
            let pool = host.add_pool(WorkerPool::new(
                Arc::clone(&engine),
                WorkerPoolConfig::new(queue),
            ));
            register_activities(&pool, Arc::clone(&executor));
        }
        host.start().unwrap();

        Self { engine, host }
    }

    async fn run<K: ResourceKind>(&self, op: Operation, option: &K::Option) -> Result<Value, ClientError> {
        let request = lifecycle_request::<K>(op, option).unwrap();
        let handle = WorkflowClient::submit(self.engine.as_ref(), request)
            .await
            .unwrap();
        self.engine
            .wait_for_result(handle.execution_id, Duration::from_secs(1))
            .await
    }

    async fn stop(self) {
        self.host.shutdown().await.unwrap();
    }
}

fn instance(name: &str) -> InstanceOption {
    InstanceOption {
        name: name.into(),
        email: "dev@example.com".into(),
        zone: "asia-northeast1-a".into(),
        location: "asia-northeast1".into(),
        project_id: "gcp-sample".into(),
        machine_type: "n1-standard-1".into(),
        network: "default".into(),
        subnet: "default".into(),
    }
}

fn run_failure(result: Result<Value, ClientError>) -> benchflow_durable::WorkflowError {
    match result {
        Err(ClientError::RunFailed(error)) => error,
        other => panic!("expected run failure, got {other:?}"),
    }
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_create_waits_for_pending_operation() {
    let fake = Arc::new(FakeInstanceExecutor::new(
        FakeScript::default().with_pending_polls(2),
    ));
    let harness = Harness::start(Arc::clone(&fake));

    let result = harness
        .run::<Workbench>(Operation::Create, &instance("ws1"))
        .await
        .unwrap();

    assert_eq!(
        result,
        json!({"name": "ws1", "url": "https://ws1", "status": "ACTIVE"})
    );
    assert_eq!(fake.calls("create"), 1);
    assert_eq!(fake.calls("operation_completed"), 3);
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_create_is_idempotent() {
    let fake = Arc::new(FakeInstanceExecutor::default());
    let harness = Harness::start(Arc::clone(&fake));

    let first = harness
        .run::<Workbench>(Operation::Create, &instance("ws1"))
        .await
        .unwrap();
    let second = harness
        .run::<Workbench>(Operation::Create, &instance("ws1"))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(fake.calls("create"), 1);
    assert_eq!(fake.calls("exists"), 2);
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_delete_absent_makes_no_backend_call() {
    let fake = Arc::new(FakeInstanceExecutor::default());
    let harness = Harness::start(Arc::clone(&fake));

    let result = harness
        .run::<Workbench>(Operation::Delete, &instance("ws1"))
        .await
        .unwrap();

    assert_eq!(result, Value::Null);
    assert_eq!(fake.calls("delete"), 0);
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_delete_existing_waits_for_removal() {
    let fake = Arc::new(
        FakeInstanceExecutor::new(FakeScript::default().with_pending_polls(1))
            .with_instance("ws1", "ACTIVE"),
    );
    let harness = Harness::start(Arc::clone(&fake));

    harness
        .run::<Workbench>(Operation::Delete, &instance("ws1"))
        .await
        .unwrap();

    assert_eq!(fake.calls("delete"), 1);
    assert_eq!(fake.calls("operation_completed"), 2);
    assert!(fake.instance("ws1").is_none());
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_always_pending_poll_exhausts_long_wait_budget() {
    let fake = Arc::new(FakeInstanceExecutor::new(
        FakeScript::default().with_pending_polls(u32::MAX),
    ));
    let harness = Harness::start(Arc::clone(&fake));

    let started = tokio::time::Instant::now();
    let error = run_failure(
        harness
            .run::<Workbench>(Operation::Create, &instance("ws1"))
            .await,
    );

    assert_eq!(error.code.as_deref(), Some("OperationPending"));
    assert_eq!(fake.calls("operation_completed"), 72);
    // 71 retries spaced 5 s apart
    assert!(started.elapsed() >= Duration::from_secs(71 * 5));
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_uses_short_wait_budget() {
    let fake = Arc::new(
        FakeInstanceExecutor::new(FakeScript::default().with_pending_polls(u32::MAX))
            .with_instance("ws1", "ACTIVE"),
    );
    let harness = Harness::start(Arc::clone(&fake));

    run_failure(
        harness
            .run::<Workbench>(Operation::Stop, &instance("ws1"))
            .await,
    );
    assert_eq!(fake.calls("operation_completed"), 36);
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_operation_short_circuits() {
    let fake = Arc::new(FakeInstanceExecutor::new(
        FakeScript::default().with_failed_operations("zone out of capacity"),
    ));
    let harness = Harness::start(Arc::clone(&fake));

    let error = run_failure(
        harness
            .run::<Workbench>(Operation::Create, &instance("ws1"))
            .await,
    );

    assert_eq!(error.code.as_deref(), Some("OperationFailed"));
    assert!(!error.retryable);
    assert!(error.message.contains("zone out of capacity"));
    assert!(fake.calls("operation_completed") < 72);
    assert_eq!(fake.calls("operation_completed"), 1);
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_start_absent_fails_without_mutation() {
    let fake = Arc::new(FakeInstanceExecutor::default());
    let harness = Harness::start(Arc::clone(&fake));

    let error = run_failure(
        harness
            .run::<Workbench>(Operation::Start, &instance("ghost"))
            .await,
    );

    assert_eq!(error.code.as_deref(), Some("NotFound"));
    assert!(!error.retryable);
    assert_eq!(fake.calls("start"), 0);
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_start_recovers_access_url() {
    let fake = Arc::new(
        FakeInstanceExecutor::new(FakeScript::default().with_unreachable_describes(3))
            .with_instance("ws1", "STOPPED"),
    );
    let harness = Harness::start(Arc::clone(&fake));

    let result = harness
        .run::<Workbench>(Operation::Start, &instance("ws1"))
        .await
        .unwrap();
    let status: ResourceStatus = serde_json::from_value(result).unwrap();

    assert_eq!(status.url, "https://ws1");
    assert_eq!(status.status, "ACTIVE");
    assert_eq!(fake.calls("describe"), 4);
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_transient_backend_errors_are_retried() {
    let fake = Arc::new(FakeInstanceExecutor::new(
        FakeScript::default().with_transient_errors(3),
    ));
    let harness = Harness::start(Arc::clone(&fake));

    harness
        .run::<Workbench>(Operation::Create, &instance("ws1"))
        .await
        .unwrap();
    assert_eq!(fake.calls("exists"), 4);
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_submissions_share_one_run() {
    let fake = Arc::new(FakeInstanceExecutor::new(
        FakeScript::default().with_pending_polls(3),
    ));
    let harness = Harness::start(Arc::clone(&fake));
    let engine = harness.engine.as_ref();

    let request = lifecycle_request::<Workbench>(Operation::Create, &instance("ws1")).unwrap();
    let (a, b) = tokio::join!(
        WorkflowClient::submit(engine, request.clone()),
        WorkflowClient::submit(engine, request),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.execution_id, b.execution_id);
    assert!(a.existing != b.existing);

    let poll = Duration::from_secs(1);
    let (ra, rb) = tokio::join!(
        engine.wait_for_result(a.execution_id, poll),
        engine.wait_for_result(b.execution_id, poll),
    );
    assert_eq!(ra.unwrap(), rb.unwrap());
    assert_eq!(fake.calls("create"), 1);
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_session_create_prepares_owner() {
    let fake = Arc::new(FakeSessionExecutor::new(
        FakeScript::default().with_pending_polls(1),
    ));
    let harness = Harness::start(Arc::clone(&fake));
    let option = SessionOption::new("alice", "lab");

    let result = harness
        .run::<JupyterHub>(Operation::Create, &option)
        .await
        .unwrap();

    assert_eq!(
        result,
        json!({"name": "lab", "url": "https://hub/user/alice/lab/", "status": "Ready"})
    );
    assert!(fake.has_owner("alice"));
    assert_eq!(fake.calls("get_or_create_owner"), 1);
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_session_stop_then_delete() {
    let option = SessionOption::new("alice", "lab");
    let fake = Arc::new(FakeSessionExecutor::default().with_session(&option, true));
    let harness = Harness::start(Arc::clone(&fake));

    harness
        .run::<JupyterHub>(Operation::Stop, &option)
        .await
        .unwrap();
    assert_eq!(fake.session(&option).unwrap().status, "Stopped");

    harness
        .run::<JupyterHub>(Operation::Delete, &option)
        .await
        .unwrap();
    assert!(fake.session(&option).is_none());
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_session_start_when_ready() {
    let option = SessionOption::new("alice", "lab");
    let fake = Arc::new(FakeSessionExecutor::default().with_session(&option, true));
    let harness = Harness::start(Arc::clone(&fake));

    let result = harness
        .run::<JupyterHub>(Operation::Start, &option)
        .await
        .unwrap();

    assert_eq!(
        result,
        json!({"name": "lab", "url": "https://hub/user/alice/lab/", "status": "Ready"})
    );
    assert_eq!(fake.calls("start"), 1);
    assert_eq!(fake.calls("operation_completed"), 1);
    assert_eq!(fake.session(&option).unwrap().status, "Ready");
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_session_start_spawns_stopped_server() {
    let option = SessionOption::new("alice", "lab");
    let fake = Arc::new(
        FakeSessionExecutor::new(FakeScript::default().with_pending_polls(2))
            .with_session(&option, false),
    );
    let harness = Harness::start(Arc::clone(&fake));

    harness
        .run::<JupyterHub>(Operation::Start, &option)
        .await
        .unwrap();

    assert_eq!(fake.calls("operation_completed"), 3);
    assert_eq!(fake.session(&option).unwrap().status, "Ready");
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_watcher_follows_run_to_completion() {
    let fake = Arc::new(FakeInstanceExecutor::new(
        FakeScript::default().with_pending_polls(1),
    ));
    let harness = Harness::start(Arc::clone(&fake));
    let engine = harness.engine.as_ref();

    let request = lifecycle_request::<Workbench>(Operation::Create, &instance("ws1")).unwrap();
    let handle = WorkflowClient::submit(engine, request).await.unwrap();

    let summary = ProgressWatcher::new(engine)
        .with_poll_interval(Duration::from_millis(200))
        .watch(&handle.run_id)
        .await
        .unwrap();

    assert!(summary.succeeded);
    assert_eq!(summary.execution_id, handle.execution_id);
    assert_eq!(summary.events.first(), Some(&"workflow_started"));
    assert_eq!(summary.events.last(), Some(&"workflow_completed"));
    assert!(summary.events.contains(&"activity_failed"));
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_watcher_gives_up_on_unknown_run() {
    let engine = WorkflowExecutor::new(InMemoryWorkflowEventStore::new());
    let result = ProgressWatcher::new(&engine)
        .with_start_timeout(Duration::from_secs(2))
        .watch("missing-create")
        .await;
    assert!(matches!(result, Err(ClientError::NotFound(_))));
}
