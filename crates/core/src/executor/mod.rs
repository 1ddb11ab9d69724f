// Backend executors
//
// An Executor is the narrow capability interface the activities call into.
// Adapters for concrete backends live in submodules:
// - notebooks: VM notebook instances behind long-running operations
// - jupyterhub: hub user servers with synchronous readiness flags
// - fake: in-memory executors for tests and local runs

mod fake;
mod jupyterhub;
mod notebooks;
mod registry;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::kind::{HandleOf, OptionOf, ResourceKind};
use crate::model::ResourceStatus;

pub use fake::{FakeInstanceExecutor, FakeScript, FakeSessionExecutor};
pub use jupyterhub::JupyterHubExecutor;
pub use notebooks::{NotebooksExecutor, DEFAULT_NOTEBOOKS_ENDPOINT};
pub use registry::{ExecutorFactory, ExecutorRegistry, ExecutorSettings};

/// Result of checking an operation handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Still running
    Pending,
    /// Finished successfully
    Done,
    /// The backend reports the operation aborted
    Failed(String),
}

/// Errors returned by executors
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The resource (or its owner) does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The backend answered with an unexpected status
    #[error("backend rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The backend answered 409: the resource is already there
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Transport failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("cannot decode backend response: {0}")]
    Decode(String),

    /// Executor cannot be built from the given settings
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl ExecutorError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ExecutorError::NotFound(_))
    }
}

/// Capability interface over one backend
///
/// Every method performs a single attempt. Retries belong to the engine.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    type Kind: ResourceKind;

    /// Make sure the owner of the resource exists
    async fn get_or_create_owner(&self, _option: &OptionOf<Self::Kind>) -> Result<(), ExecutorError> {
        Ok(())
    }

    /// Whether the resource exists; only `NotFound` counts as absent
    async fn exists(&self, option: &OptionOf<Self::Kind>) -> Result<bool, ExecutorError> {
        match self.describe(option).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn describe(&self, option: &OptionOf<Self::Kind>) -> Result<ResourceStatus, ExecutorError>;

    async fn create(&self, option: &OptionOf<Self::Kind>) -> Result<HandleOf<Self::Kind>, ExecutorError>;

    async fn start(&self, option: &OptionOf<Self::Kind>) -> Result<HandleOf<Self::Kind>, ExecutorError>;

    async fn stop(&self, option: &OptionOf<Self::Kind>) -> Result<HandleOf<Self::Kind>, ExecutorError>;

    async fn delete(&self, option: &OptionOf<Self::Kind>) -> Result<HandleOf<Self::Kind>, ExecutorError>;

    async fn operation_completed(
        &self,
        handle: &HandleOf<Self::Kind>,
    ) -> Result<PollOutcome, ExecutorError>;
}

/// Shared executor for one kind
pub type BoxedExecutor<K> = Arc<dyn Executor<Kind = K>>;

#[async_trait]
impl<E: Executor + ?Sized> Executor for Arc<E> {
    type Kind = E::Kind;

    async fn get_or_create_owner(&self, option: &OptionOf<Self::Kind>) -> Result<(), ExecutorError> {
        (**self).get_or_create_owner(option).await
    }

    async fn exists(&self, option: &OptionOf<Self::Kind>) -> Result<bool, ExecutorError> {
        (**self).exists(option).await
    }

    async fn describe(&self, option: &OptionOf<Self::Kind>) -> Result<ResourceStatus, ExecutorError> {
        (**self).describe(option).await
    }

    async fn create(&self, option: &OptionOf<Self::Kind>) -> Result<HandleOf<Self::Kind>, ExecutorError> {
        (**self).create(option).await
    }

    async fn start(&self, option: &OptionOf<Self::Kind>) -> Result<HandleOf<Self::Kind>, ExecutorError> {
        (**self).start(option).await
    }

    async fn stop(&self, option: &OptionOf<Self::Kind>) -> Result<HandleOf<Self::Kind>, ExecutorError> {
        (**self).stop(option).await
    }

    async fn delete(&self, option: &OptionOf<Self::Kind>) -> Result<HandleOf<Self::Kind>, ExecutorError> {
        (**self).delete(option).await
    }

    async fn operation_completed(
        &self,
        handle: &HandleOf<Self::Kind>,
    ) -> Result<PollOutcome, ExecutorError> {
        (**self).operation_completed(handle).await
    }
}

/// Map a non-success HTTP response into an executor error
pub(crate) async fn rejection(response: reqwest::Response) -> ExecutorError {
    let status = response.status();
    let message = response.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::NOT_FOUND {
        ExecutorError::NotFound(message)
    } else if status == reqwest::StatusCode::CONFLICT {
        ExecutorError::AlreadyExists(message)
    } else {
        ExecutorError::Rejected {
            status: status.as_u16(),
            message,
        }
    }
}
