// Executor registry
//
// Maps executor names to constructors for one resource kind. The worker
// resolves its configured executor through here at startup, so an unknown
// name or missing credentials fail before any queue is polled.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{
    BoxedExecutor, ExecutorError, FakeInstanceExecutor, FakeSessionExecutor, JupyterHubExecutor,
    NotebooksExecutor, DEFAULT_NOTEBOOKS_ENDPOINT,
};
use crate::kind::{JupyterHub, ResourceKind, Workbench};

/// Backend endpoints and credentials
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub notebooks_endpoint: String,
    pub notebooks_access_token: Option<String>,
    pub jupyterhub_url: Option<String>,
    pub jupyterhub_token: Option<String>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            notebooks_endpoint: DEFAULT_NOTEBOOKS_ENDPOINT.to_string(),
            notebooks_access_token: None,
            jupyterhub_url: None,
            jupyterhub_token: None,
        }
    }
}

/// Constructor for an executor of kind `K`
pub type ExecutorFactory<K> =
    Arc<dyn Fn(&ExecutorSettings) -> Result<BoxedExecutor<K>, ExecutorError> + Send + Sync>;

/// Named executor constructors for one kind
///
/// # Example
///
/// ```ignore
/// use benchflow_core::executor::{ExecutorRegistry, ExecutorSettings};
/// use benchflow_core::kind::Workbench;
///
/// let registry = ExecutorRegistry::<Workbench>::with_defaults();
/// let executor = registry.create("notebooks", &settings)?;
/// ```
pub struct ExecutorRegistry<K: ResourceKind> {
    factories: BTreeMap<String, ExecutorFactory<K>>,
}

impl<K: ResourceKind> Default for ExecutorRegistry<K> {
    fn default() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }
}

impl<K: ResourceKind> Clone for ExecutorRegistry<K> {
    fn clone(&self) -> Self {
        Self {
            factories: self.factories.clone(),
        }
    }
}

impl<K: ResourceKind> ExecutorRegistry<K> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor under `name`, replacing any previous one
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ExecutorSettings) -> Result<BoxedExecutor<K>, ExecutorError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Build the executor registered under `name`
    pub fn create(
        &self,
        name: &str,
        settings: &ExecutorSettings,
    ) -> Result<BoxedExecutor<K>, ExecutorError> {
        let factory = self.factories.get(name).ok_or_else(|| {
            ExecutorError::Unsupported(format!(
                "no {} executor named '{name}' (known: {})",
                K::NAME,
                self.names().join(", ")
            ))
        })?;
        factory(settings)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl ExecutorRegistry<Workbench> {
    /// `notebooks` and `fake`
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("notebooks", |settings| {
            let token = settings.notebooks_access_token.clone().ok_or_else(|| {
                ExecutorError::Config("notebooks executor needs an access token".into())
            })?;
            Ok(Arc::new(NotebooksExecutor::new(
                settings.notebooks_endpoint.clone(),
                token,
            )) as BoxedExecutor<Workbench>)
        });
        registry.register("fake", |_| {
            Ok(Arc::new(FakeInstanceExecutor::default()) as BoxedExecutor<Workbench>)
        });
        registry
    }
}

impl ExecutorRegistry<JupyterHub> {
    /// `jupyterhub` and `fake`
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("jupyterhub", |settings| {
            let url = settings.jupyterhub_url.as_deref().ok_or_else(|| {
                ExecutorError::Config("jupyterhub executor needs a hub URL".into())
            })?;
            let token = settings.jupyterhub_token.clone().ok_or_else(|| {
                ExecutorError::Config("jupyterhub executor needs an API token".into())
            })?;
            Ok(Arc::new(JupyterHubExecutor::new(url, token)?) as BoxedExecutor<JupyterHub>)
        });
        registry.register("fake", |_| {
            Ok(Arc::new(FakeSessionExecutor::default()) as BoxedExecutor<JupyterHub>)
        });
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_per_kind() {
        let workbench = ExecutorRegistry::<Workbench>::with_defaults();
        assert_eq!(workbench.names(), vec!["fake", "notebooks"]);

        let hub = ExecutorRegistry::<JupyterHub>::with_defaults();
        assert!(hub.contains("jupyterhub"));
        assert!(!hub.contains("notebooks"));
    }

    #[test]
    fn test_unknown_name_fails_fast() {
        let registry = ExecutorRegistry::<Workbench>::with_defaults();
        let err = registry
            .create("jupyterhub", &ExecutorSettings::default())
            .err()
            .unwrap();
        assert!(matches!(err, ExecutorError::Unsupported(_)));
        assert!(err.to_string().contains("fake, notebooks"));
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let registry = ExecutorRegistry::<Workbench>::with_defaults();
        assert!(matches!(
            registry.create("notebooks", &ExecutorSettings::default()),
            Err(ExecutorError::Config(_))
        ));

        let settings = ExecutorSettings {
            notebooks_access_token: Some("token".into()),
            ..ExecutorSettings::default()
        };
        assert!(registry.create("notebooks", &settings).is_ok());
    }

    #[test]
    fn test_hub_settings() {
        let registry = ExecutorRegistry::<JupyterHub>::with_defaults();
        let settings = ExecutorSettings {
            jupyterhub_url: Some("http://hub.local:8000".into()),
            jupyterhub_token: Some("secret".into()),
            ..ExecutorSettings::default()
        };
        assert!(registry.create("jupyterhub", &settings).is_ok());
        assert!(registry.create("fake", &ExecutorSettings::default()).is_ok());
    }
}
