// Domain model
//
// Resource options identify a target resource and are immutable once a
// workflow starts. Handles are opaque tokens returned by mutating calls and
// consumed by the polling activity of the same run.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Delete,
    Start,
    Stop,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Create,
        Operation::Delete,
        Operation::Start,
        Operation::Stop,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Delete => "delete",
            Operation::Start => "start",
            Operation::Stop => "stop",
        }
    }

    /// Create and start wait for a reachable resource; delete and stop wait
    /// for it to go away, which is faster.
    pub const fn is_long_wait(&self) -> bool {
        matches!(self, Operation::Create | Operation::Start)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(Operation::Create),
            "delete" => Ok(Operation::Delete),
            "start" => Ok(Operation::Start),
            "stop" => Ok(Operation::Stop),
            other => Err(format!("unknown operation: {other}")),
        }
    }
}

/// Observed state of a resource
///
/// The URL is non-empty only while the resource is active and reachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResourceStatus {
    pub name: String,
    pub url: String,
    pub status: String,
}

impl ResourceStatus {
    pub fn new(name: impl Into<String>, url: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            status: status.into(),
        }
    }

    pub fn is_reachable(&self) -> bool {
        !self.url.is_empty()
    }
}

// ============================================================================
// Workbench
// ============================================================================

/// A VM-backed notebook instance
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InstanceOption {
    pub name: String,
    /// Instance owner
    pub email: String,
    pub zone: String,
    /// Network region of the subnet
    pub location: String,
    pub project_id: String,
    pub machine_type: String,
    pub network: String,
    pub subnet: String,
}

impl InstanceOption {
    /// `projects/{project}/locations/{zone}`
    pub fn parent(&self) -> String {
        format!("projects/{}/locations/{}", self.project_id, self.zone)
    }

    /// `projects/{project}/locations/{zone}/instances/{name}`
    pub fn full_name(&self) -> String {
        format!("{}/instances/{}", self.parent(), self.name)
    }

    pub fn network_path(&self) -> String {
        format!("projects/{}/global/networks/{}", self.project_id, self.network)
    }

    pub fn subnet_path(&self) -> String {
        format!(
            "projects/{}/regions/{}/subnetworks/{}",
            self.project_id, self.location, self.subnet
        )
    }
}

/// Name of a long-running backend operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationName(pub String);

impl OperationName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// JupyterHub
// ============================================================================

/// A named server of a hub user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOption {
    /// Owning hub user
    pub user: String,
    pub server: String,
}

impl SessionOption {
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            server: server.into(),
        }
    }
}

/// Status labels of hub sessions
pub mod session_status {
    pub const READY: &str = "Ready";
    pub const PENDING: &str = "Pending";
    pub const STOPPED: &str = "Stopped";
}

/// Condition a session probe waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Readiness {
    Ready,
    Stopped,
    Removed,
}

/// Stand-in for an operation handle on a backend without async operations
///
/// Polling re-checks the session until `until` holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionProbe {
    pub user: String,
    pub server: String,
    pub until: Readiness,
}

impl SessionProbe {
    pub fn new(option: &SessionOption, until: Readiness) -> Self {
        Self {
            user: option.user.clone(),
            server: option.server.clone(),
            until,
        }
    }

    pub fn session(&self) -> SessionOption {
        SessionOption::new(&self.user, &self.server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> InstanceOption {
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

    #[test]
    fn test_instance_paths() {
        let option = instance();
        assert_eq!(
            option.full_name(),
            "projects/gcp-sample/locations/asia-northeast1-a/instances/ws1"
        );
        assert_eq!(
            option.network_path(),
            "projects/gcp-sample/global/networks/default"
        );
        assert_eq!(
            option.subnet_path(),
            "projects/gcp-sample/regions/asia-northeast1/subnetworks/default"
        );
    }

    #[test]
    fn test_operation_parse_and_display() {
        for op in Operation::ALL {
            assert_eq!(op.to_string().parse::<Operation>().unwrap(), op);
        }
        assert!("restart".parse::<Operation>().is_err());
        assert!(Operation::Create.is_long_wait());
        assert!(!Operation::Stop.is_long_wait());
    }

    #[test]
    fn test_operation_name_is_transparent() {
        let handle = OperationName::new("operations/op-1");
        assert_eq!(
            serde_json::to_value(&handle).unwrap(),
            serde_json::json!("operations/op-1")
        );
    }

    #[test]
    fn test_status_reachability() {
        assert!(!ResourceStatus::new("ws1", "", "PROVISIONING").is_reachable());
        assert!(ResourceStatus::new("ws1", "https://ws1", "ACTIVE").is_reachable());
    }
}
