// In-memory executors
//
// Used by tests and by `--executor fake` for local runs. Mutations register
// an operation that stays pending for a scripted number of polls and then
// applies its transition. Every call is counted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{Executor, ExecutorError, PollOutcome};
use crate::kind::{JupyterHub, Workbench};
use crate::model::{
    session_status, InstanceOption, OperationName, Readiness, ResourceStatus, SessionOption,
    SessionProbe,
};

/// Scripted behaviour shared by the fake executors
#[derive(Debug, Clone, Default)]
pub struct FakeScript {
    /// Polls reporting `Pending` before an operation completes
    pub pending_polls: u32,
    /// When set, every operation aborts with this reason
    pub fail_operations: Option<String>,
    /// Describes of an active resource that still report an empty URL
    pub unreachable_describes: u32,
    /// Calls that fail with a transient backend error before any succeed
    pub transient_errors: u32,
}

impl FakeScript {
    pub fn with_pending_polls(mut self, polls: u32) -> Self {
        self.pending_polls = polls;
        self
    }

    pub fn with_failed_operations(mut self, reason: impl Into<String>) -> Self {
        self.fail_operations = Some(reason.into());
        self
    }

    pub fn with_unreachable_describes(mut self, describes: u32) -> Self {
        self.unreachable_describes = describes;
        self
    }

    pub fn with_transient_errors(mut self, errors: u32) -> Self {
        self.transient_errors = errors;
        self
    }
}

/// What happens to a resource once its operation completes
#[derive(Debug, Clone)]
enum Transition {
    Settle(ResourceStatus),
    Remove,
}

#[derive(Debug)]
struct PendingOperation {
    key: String,
    polls_left: u32,
    transition: Transition,
}

#[derive(Debug, Default)]
struct FakeState {
    resources: HashMap<String, ResourceStatus>,
    operations: HashMap<String, PendingOperation>,
    owners: HashSet<String>,
    calls: HashMap<&'static str, usize>,
    unreachable_left: HashMap<String, u32>,
    transient_left: u32,
    next_operation: u64,
}

/// Backend state shared by both fakes
#[derive(Debug)]
struct FakeBackend {
    script: FakeScript,
    state: Mutex<FakeState>,
}

impl FakeBackend {
    fn new(script: FakeScript) -> Self {
        let state = FakeState {
            transient_left: script.transient_errors,
            ..FakeState::default()
        };
        Self {
            script,
            state: Mutex::new(state),
        }
    }

    /// Count the call and inject a transient failure if one is scripted
    fn record(&self, method: &'static str) -> Result<(), ExecutorError> {
        let mut state = self.state.lock();
        *state.calls.entry(method).or_default() += 1;
        if state.transient_left > 0 {
            state.transient_left -= 1;
            return Err(ExecutorError::Rejected {
                status: 503,
                message: format!("{method}: backend unavailable"),
            });
        }
        Ok(())
    }

    fn calls(&self, method: &str) -> usize {
        self.state.lock().calls.get(method).copied().unwrap_or(0)
    }

    fn insert(&self, key: String, status: ResourceStatus) {
        self.state.lock().resources.insert(key, status);
    }

    fn get(&self, key: &str) -> Option<ResourceStatus> {
        self.state.lock().resources.get(key).cloned()
    }

    fn describe(&self, key: &str) -> Result<ResourceStatus, ExecutorError> {
        let mut state = self.state.lock();
        let status = state
            .resources
            .get(key)
            .cloned()
            .ok_or_else(|| ExecutorError::NotFound(key.to_string()))?;
        if status.is_reachable() {
            if let Some(left) = state.unreachable_left.get_mut(key) {
                if *left > 0 {
                    *left -= 1;
                    return Ok(ResourceStatus {
                        url: String::new(),
                        ..status
                    });
                }
            }
        }
        Ok(status)
    }

    /// Register an operation and put the resource into its in-progress state
    fn begin(
        &self,
        key: &str,
        operation: Option<String>,
        in_progress: Option<ResourceStatus>,
        transition: Transition,
    ) -> String {
        let mut state = self.state.lock();
        let name = match operation {
            Some(name) => name,
            None => {
                state.next_operation += 1;
                format!("operations/op-{}", state.next_operation)
            }
        };
        if let Some(status) = in_progress {
            state.resources.insert(key.to_string(), status);
        }
        if let Transition::Settle(settled) = &transition {
            if settled.is_reachable() {
                state
                    .unreachable_left
                    .insert(key.to_string(), self.script.unreachable_describes);
            }
        }
        state.operations.insert(
            name.clone(),
            PendingOperation {
                key: key.to_string(),
                polls_left: self.script.pending_polls,
                transition,
            },
        );
        debug!(operation = %name, resource = %key, "Fake operation started");
        name
    }

    /// Advance an operation; `None` when no such operation is outstanding
    fn poll(&self, operation: &str) -> Option<PollOutcome> {
        let mut state = self.state.lock();
        let pending = state.operations.get_mut(operation)?;

        if let Some(reason) = &self.script.fail_operations {
            state.operations.remove(operation);
            return Some(PollOutcome::Failed(reason.clone()));
        }
        if pending.polls_left > 0 {
            pending.polls_left -= 1;
            return Some(PollOutcome::Pending);
        }

        let finished = state.operations.remove(operation)?;
        match finished.transition {
            Transition::Settle(status) => {
                state.resources.insert(finished.key, status);
            }
            Transition::Remove => {
                state.resources.remove(&finished.key);
            }
        }
        Some(PollOutcome::Done)
    }
}

// ============================================================================
// Workbench fake
// ============================================================================

/// Fake VM notebook backend
///
/// Active instances report `https://{name}` as their URL.
#[derive(Debug, Clone)]
pub struct FakeInstanceExecutor {
    backend: Arc<FakeBackend>,
}

impl Default for FakeInstanceExecutor {
    fn default() -> Self {
        Self::new(FakeScript::default())
    }
}

impl FakeInstanceExecutor {
    pub fn new(script: FakeScript) -> Self {
        Self {
            backend: Arc::new(FakeBackend::new(script)),
        }
    }

    /// Seed an existing instance
    pub fn with_instance(self, name: &str, status: &str) -> Self {
        let url = if status == "ACTIVE" {
            Self::url_for(name)
        } else {
            String::new()
        };
        self.backend
            .insert(name.to_string(), ResourceStatus::new(name, url, status));
        self
    }

    pub fn calls(&self, method: &str) -> usize {
        self.backend.calls(method)
    }

    pub fn instance(&self, name: &str) -> Option<ResourceStatus> {
        self.backend.get(name)
    }

    fn url_for(name: &str) -> String {
        format!("https://{name}")
    }

    fn mutate(
        &self,
        option: &InstanceOption,
        in_progress: &str,
        transition: Transition,
    ) -> Result<OperationName, ExecutorError> {
        let in_progress = ResourceStatus::new(&option.name, "", in_progress);
        Ok(OperationName(self.backend.begin(
            &option.name,
            None,
            Some(in_progress),
            transition,
        )))
    }

    fn require(&self, option: &InstanceOption) -> Result<(), ExecutorError> {
        match self.backend.get(&option.name) {
            Some(_) => Ok(()),
            None => Err(ExecutorError::NotFound(option.name.clone())),
        }
    }
}

#[async_trait]
impl Executor for FakeInstanceExecutor {
    type Kind = Workbench;

    async fn exists(&self, option: &InstanceOption) -> Result<bool, ExecutorError> {
        self.backend.record("exists")?;
        Ok(self.backend.get(&option.name).is_some())
    }

    async fn describe(&self, option: &InstanceOption) -> Result<ResourceStatus, ExecutorError> {
        self.backend.record("describe")?;
        self.backend.describe(&option.name)
    }

    async fn create(&self, option: &InstanceOption) -> Result<OperationName, ExecutorError> {
        self.backend.record("create")?;
        if self.backend.get(&option.name).is_some() {
            return Err(ExecutorError::AlreadyExists(option.name.clone()));
        }
        let active = ResourceStatus::new(&option.name, Self::url_for(&option.name), "ACTIVE");
        self.mutate(option, "PROVISIONING", Transition::Settle(active))
    }

    async fn start(&self, option: &InstanceOption) -> Result<OperationName, ExecutorError> {
        self.backend.record("start")?;
        self.require(option)?;
        let active = ResourceStatus::new(&option.name, Self::url_for(&option.name), "ACTIVE");
        self.mutate(option, "STARTING", Transition::Settle(active))
    }

    async fn stop(&self, option: &InstanceOption) -> Result<OperationName, ExecutorError> {
        self.backend.record("stop")?;
        self.require(option)?;
        let stopped = ResourceStatus::new(&option.name, "", "STOPPED");
        self.mutate(option, "STOPPING", Transition::Settle(stopped))
    }

    async fn delete(&self, option: &InstanceOption) -> Result<OperationName, ExecutorError> {
        self.backend.record("delete")?;
        self.require(option)?;
        self.mutate(option, "DELETING", Transition::Remove)
    }

    async fn operation_completed(&self, handle: &OperationName) -> Result<PollOutcome, ExecutorError> {
        self.backend.record("operation_completed")?;
        self.backend
            .poll(handle.as_str())
            .ok_or_else(|| ExecutorError::NotFound(handle.to_string()))
    }
}

// ============================================================================
// JupyterHub fake
// ============================================================================

/// Fake hub backend
///
/// Ready sessions report `https://hub/user/{user}/{server}/` as their URL.
/// Probes re-check session state directly once no transition is pending.
#[derive(Debug, Clone)]
pub struct FakeSessionExecutor {
    backend: Arc<FakeBackend>,
}

impl Default for FakeSessionExecutor {
    fn default() -> Self {
        Self::new(FakeScript::default())
    }
}

impl FakeSessionExecutor {
    pub fn new(script: FakeScript) -> Self {
        Self {
            backend: Arc::new(FakeBackend::new(script)),
        }
    }

    /// Seed an existing session (and its owner)
    pub fn with_session(self, option: &SessionOption, ready: bool) -> Self {
        let status = if ready {
            Self::ready_status(option)
        } else {
            ResourceStatus::new(&option.server, "", session_status::STOPPED)
        };
        self.backend.insert(Self::key(option), status);
        self.backend.state.lock().owners.insert(option.user.clone());
        self
    }

    pub fn calls(&self, method: &str) -> usize {
        self.backend.calls(method)
    }

    pub fn session(&self, option: &SessionOption) -> Option<ResourceStatus> {
        self.backend.get(&Self::key(option))
    }

    pub fn has_owner(&self, user: &str) -> bool {
        self.backend.state.lock().owners.contains(user)
    }

    fn key(option: &SessionOption) -> String {
        format!("{}/{}", option.user, option.server)
    }

    fn probe_key(probe: &SessionProbe) -> String {
        format!("{}/{}:{:?}", probe.user, probe.server, probe.until)
    }

    fn ready_status(option: &SessionOption) -> ResourceStatus {
        ResourceStatus::new(
            &option.server,
            format!("https://hub/user/{}/{}/", option.user, option.server),
            session_status::READY,
        )
    }

    fn require_owner(&self, option: &SessionOption) -> Result<(), ExecutorError> {
        if self.has_owner(&option.user) {
            Ok(())
        } else {
            Err(ExecutorError::NotFound(format!("user {}", option.user)))
        }
    }

    fn transition(
        &self,
        option: &SessionOption,
        until: Readiness,
        transition: Transition,
    ) -> SessionProbe {
        let probe = SessionProbe::new(option, until);
        let pending = ResourceStatus::new(&option.server, "", session_status::PENDING);
        self.backend.begin(
            &Self::key(option),
            Some(Self::probe_key(&probe)),
            Some(pending),
            transition,
        );
        probe
    }

    /// A ready server is left alone, like the hub does
    fn spawn_unless_ready(&self, option: &SessionOption) -> SessionProbe {
        let current = self.backend.get(&Self::key(option));
        if current.is_some_and(|s| s.status == session_status::READY) {
            return SessionProbe::new(option, Readiness::Ready);
        }
        let ready = Transition::Settle(Self::ready_status(option));
        self.transition(option, Readiness::Ready, ready)
    }
}

#[async_trait]
impl Executor for FakeSessionExecutor {
    type Kind = JupyterHub;

    async fn get_or_create_owner(&self, option: &SessionOption) -> Result<(), ExecutorError> {
        self.backend.record("get_or_create_owner")?;
        self.backend.state.lock().owners.insert(option.user.clone());
        Ok(())
    }

    async fn exists(&self, option: &SessionOption) -> Result<bool, ExecutorError> {
        self.backend.record("exists")?;
        Ok(self.backend.get(&Self::key(option)).is_some())
    }

    async fn describe(&self, option: &SessionOption) -> Result<ResourceStatus, ExecutorError> {
        self.backend.record("describe")?;
        self.require_owner(option)?;
        self.backend.describe(&Self::key(option))
    }

    async fn create(&self, option: &SessionOption) -> Result<SessionProbe, ExecutorError> {
        self.backend.record("create")?;
        self.require_owner(option)?;
        Ok(self.spawn_unless_ready(option))
    }

    async fn start(&self, option: &SessionOption) -> Result<SessionProbe, ExecutorError> {
        self.backend.record("start")?;
        self.require_owner(option)?;
        Ok(self.spawn_unless_ready(option))
    }

    async fn stop(&self, option: &SessionOption) -> Result<SessionProbe, ExecutorError> {
        self.backend.record("stop")?;
        self.require_owner(option)?;
        let stopped = ResourceStatus::new(&option.server, "", session_status::STOPPED);
        Ok(self.transition(option, Readiness::Stopped, Transition::Settle(stopped)))
    }

    async fn delete(&self, option: &SessionOption) -> Result<SessionProbe, ExecutorError> {
        self.backend.record("delete")?;
        self.require_owner(option)?;
        Ok(self.transition(option, Readiness::Removed, Transition::Remove))
    }

    async fn operation_completed(&self, probe: &SessionProbe) -> Result<PollOutcome, ExecutorError> {
        self.backend.record("operation_completed")?;
        if let Some(outcome) = self.backend.poll(&Self::probe_key(probe)) {
            return Ok(outcome);
        }

        let current = self.backend.get(&Self::key(&probe.session()));
        let outcome = match (probe.until, current) {
            (Readiness::Removed, None) | (Readiness::Stopped, None) => PollOutcome::Done,
            (Readiness::Ready, Some(s)) if s.status == session_status::READY => PollOutcome::Done,
            (Readiness::Stopped, Some(s)) if s.status == session_status::STOPPED => {
                PollOutcome::Done
            }
            (Readiness::Ready, None) => {
                PollOutcome::Failed(format!("session {} not found", Self::key(&probe.session())))
            }
            _ => PollOutcome::Pending,
        };
        Ok(outcome)
    }
}
