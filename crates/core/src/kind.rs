// Resource kinds
//
// A kind binds together the option and handle types of one backend family,
// its workflow type names, and how run ids and task queues are derived.

use std::fmt::Debug;

use serde::{de::DeserializeOwned, Serialize};

use crate::model::{InstanceOption, Operation, OperationName, SessionOption, SessionProbe};

/// Workflow type names of one kind, one per operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkflowTypes {
    pub create: &'static str,
    pub delete: &'static str,
    pub start: &'static str,
    pub stop: &'static str,
}

impl WorkflowTypes {
    pub const fn name(&self, op: Operation) -> &'static str {
        match op {
            Operation::Create => self.create,
            Operation::Delete => self.delete,
            Operation::Start => self.start,
            Operation::Stop => self.stop,
        }
    }
}

/// A family of resources driven through the same lifecycle
pub trait ResourceKind: Send + Sync + 'static {
    /// Lowercase kind name, e.g. `workbench`
    const NAME: &'static str;

    const WORKFLOWS: WorkflowTypes;

    /// Whether sessions belong to an owner that must exist first
    const OWNER_SCOPED: bool;

    /// Identity and desired shape of a resource
    type Option: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static;

    /// Token returned by mutations and consumed by polling
    type Handle: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static;

    /// Deterministic run identifier, the deduplication key
    fn run_id(option: &Self::Option, op: Operation) -> String;

    fn task_queue(op: Operation) -> String {
        format!(
            "{}_{}_TASK_QUEUE",
            op.as_str().to_ascii_uppercase(),
            Self::NAME.to_ascii_uppercase()
        )
    }

    /// Every task queue of this kind
    fn task_queues() -> Vec<String> {
        Operation::ALL.iter().map(|op| Self::task_queue(*op)).collect()
    }
}

pub type OptionOf<K> = <K as ResourceKind>::Option;
pub type HandleOf<K> = <K as ResourceKind>::Handle;

/// VM-backed notebook instances
#[derive(Debug, Clone, Copy, Default)]
pub struct Workbench;

impl ResourceKind for Workbench {
    const NAME: &'static str = "workbench";
    const WORKFLOWS: WorkflowTypes = WorkflowTypes {
        create: "workbench_create",
        delete: "workbench_delete",
        start: "workbench_start",
        stop: "workbench_stop",
    };
    const OWNER_SCOPED: bool = false;

    type Option = InstanceOption;
    type Handle = OperationName;

    fn run_id(option: &InstanceOption, op: Operation) -> String {
        format!("{}-{}", option.name, op)
    }
}

/// Named servers inside a JupyterHub
#[derive(Debug, Clone, Copy, Default)]
pub struct JupyterHub;

impl ResourceKind for JupyterHub {
    const NAME: &'static str = "jupyterhub";
    const WORKFLOWS: WorkflowTypes = WorkflowTypes {
        create: "jupyterhub_create",
        delete: "jupyterhub_delete",
        start: "jupyterhub_start",
        stop: "jupyterhub_stop",
    };
    const OWNER_SCOPED: bool = true;

    type Option = SessionOption;
    type Handle = SessionProbe;

    fn run_id(option: &SessionOption, op: Operation) -> String {
        format!("{}-{}-{}", option.user, option.server, op)
    }
}
