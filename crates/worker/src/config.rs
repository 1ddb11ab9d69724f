// Worker configuration
//
// Built once at startup from flags, environment variables and an optional
// .env file, then passed by value into the host builder.

use std::net::SocketAddr;
use std::time::Duration;

use benchflow_core::executor::DEFAULT_NOTEBOOKS_ENDPOINT;
use benchflow_core::{ExecutorSettings, JupyterHub, Operation, ResourceKind, Workbench};
use clap::{Parser, ValueEnum};

/// Resource kinds a worker can host
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindName {
    Workbench,
    Jupyterhub,
}

impl KindName {
    pub fn as_str(&self) -> &'static str {
        match self {
            KindName::Workbench => Workbench::NAME,
            KindName::Jupyterhub => JupyterHub::NAME,
        }
    }
}

#[derive(Debug, Clone, Parser)]
#[command(name = "benchflow-worker")]
#[command(about = "Hosts lifecycle workflows and activities for notebook resources")]
#[command(version)]
pub struct WorkerConfig {
    /// Address of the engine HTTP frontend
    #[arg(long, env = "BENCHFLOW_LISTEN_ADDR", default_value = "0.0.0.0:7233")]
    pub listen_addr: SocketAddr,

    /// Resource kinds to host
    #[arg(
        long,
        env = "BENCHFLOW_KINDS",
        value_enum,
        value_delimiter = ',',
        default_value = "workbench,jupyterhub"
    )]
    pub kinds: Vec<KindName>,

    /// Operations to host (all when omitted)
    #[arg(long = "operations", env = "BENCHFLOW_OPERATIONS", value_delimiter = ',')]
    pub operations: Vec<Operation>,

    /// Backend for workbench activities
    #[arg(long, env = "WORKBENCH_EXECUTOR", default_value = "notebooks")]
    pub workbench_executor: String,

    /// Backend for jupyterhub activities
    #[arg(long, env = "JUPYTERHUB_EXECUTOR", default_value = "jupyterhub")]
    pub jupyterhub_executor: String,

    #[arg(long, env = "NOTEBOOKS_ENDPOINT", default_value = DEFAULT_NOTEBOOKS_ENDPOINT)]
    pub notebooks_endpoint: String,

    /// OAuth access token for the Notebooks API
    #[arg(long, env = "NOTEBOOKS_ACCESS_TOKEN", hide_env_values = true)]
    pub notebooks_access_token: Option<String>,

    /// Hub base URL, e.g. https://hub.example.com/
    #[arg(long, env = "JUPYTERHUB_URL")]
    pub jupyterhub_url: Option<String>,

    #[arg(long, env = "JUPYTERHUB_API_TOKEN", hide_env_values = true)]
    pub jupyterhub_token: Option<String>,

    /// Concurrent activities per task queue
    #[arg(long, env = "MAX_CONCURRENT_TASKS", default_value_t = 10)]
    pub max_concurrency: usize,

    /// Seconds to drain in-flight activities on shutdown
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value_t = 20)]
    pub shutdown_grace_secs: u64,

    #[arg(long, env = "WORKER_ID")]
    pub worker_id: Option<String>,

    /// PostgreSQL URL for the workflow store; runs only live in memory when unset
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 10)]
    pub database_max_connections: u32,

    /// Log filter, overrides RUST_LOG
    #[arg(long)]
    pub log_level: Option<String>,
}

impl WorkerConfig {
    /// Parse flags, falling back to the environment and `.env`
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::parse()
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Selected operations, all four when none were given
    pub fn operations(&self) -> Vec<Operation> {
        if self.operations.is_empty() {
            Operation::ALL.to_vec()
        } else {
            let mut ops = self.operations.clone();
            ops.sort_by_key(|op| op.as_str());
            ops.dedup();
            ops
        }
    }

    pub fn hosts(&self, kind: KindName) -> bool {
        self.kinds.contains(&kind)
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            notebooks_endpoint: self.notebooks_endpoint.clone(),
            notebooks_access_token: self.notebooks_access_token.clone(),
            jupyterhub_url: self.jupyterhub_url.clone(),
            jupyterhub_token: self.jupyterhub_token.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> WorkerConfig {
        let mut argv = vec!["benchflow-worker"];
        argv.extend_from_slice(args);
        WorkerConfig::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]);
        assert_eq!(config.listen_addr.port(), 7233);
        assert_eq!(config.kinds, vec![KindName::Workbench, KindName::Jupyterhub]);
        assert_eq!(config.operations(), Operation::ALL.to_vec());
        assert_eq!(config.shutdown_grace(), Duration::from_secs(20));
        assert_eq!(config.notebooks_endpoint, DEFAULT_NOTEBOOKS_ENDPOINT);
    }

    #[test]
    fn test_operation_subset() {
        let config = parse(&["--operations", "stop,create,stop"]);
        assert_eq!(config.operations(), vec![Operation::Create, Operation::Stop]);
    }

    #[test]
    fn test_rejects_unknown_operation() {
        let result = WorkerConfig::try_parse_from(["benchflow-worker", "--operations", "resize"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_kind_selection() {
        let config = parse(&["--kinds", "jupyterhub", "--jupyterhub-executor", "fake"]);
        assert!(!config.hosts(KindName::Workbench));
        assert!(config.hosts(KindName::Jupyterhub));
        assert_eq!(config.jupyterhub_executor, "fake");
    }

    #[test]
    fn test_database_store_selection() {
        let config = parse(&[
            "--database-url",
            "postgres://benchflow@db:5432/benchflow",
            "--database-max-connections",
            "4",
        ]);
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://benchflow@db:5432/benchflow")
        );
        assert_eq!(config.database_max_connections, 4);
    }

    #[test]
    fn test_executor_settings() {
        let config = parse(&[
            "--notebooks-access-token",
            "ya29.token",
            "--jupyterhub-url",
            "https://hub.example.com/",
        ]);
        let settings = config.executor_settings();
        assert_eq!(settings.notebooks_access_token.as_deref(), Some("ya29.token"));
        assert_eq!(settings.jupyterhub_url.as_deref(), Some("https://hub.example.com/"));
        assert!(settings.jupyterhub_token.is_none());
    }
}
