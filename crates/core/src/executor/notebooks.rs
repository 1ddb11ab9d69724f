// Notebooks API executor
//
// Talks to the Notebooks REST API (v1) for user-managed instances. Every
// mutation returns a long-running operation whose name is the handle.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument};

use super::{rejection, Executor, ExecutorError, PollOutcome};
use crate::kind::Workbench;
use crate::model::{InstanceOption, OperationName, ResourceStatus};

pub const DEFAULT_NOTEBOOKS_ENDPOINT: &str = "https://notebooks.googleapis.com";

const IMAGE_PROJECT: &str = "deeplearning-platform-release";
const IMAGE_FAMILY: &str = "common-cpu-notebooks";
const DISK_TYPE: &str = "PD_BALANCED";
// Smallest boot disk the image accepts
const BOOT_DISK_SIZE_GB: u32 = 50;
const DATA_DISK_SIZE_GB: u32 = 20;

/// Executor for VM notebook instances
#[derive(Clone)]
pub struct NotebooksExecutor {
    client: reqwest::Client,
    endpoint: String,
    access_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VmImage {
    project: &'static str,
    image_family: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NewInstance {
    vm_image: VmImage,
    boot_disk_type: &'static str,
    boot_disk_size_gb: u32,
    data_disk_type: &'static str,
    data_disk_size_gb: u32,
    network: String,
    subnet: String,
    instance_owners: Vec<String>,
    machine_type: String,
}

impl NewInstance {
    fn from_option(option: &InstanceOption) -> Self {
        Self {
            vm_image: VmImage {
                project: IMAGE_PROJECT,
                image_family: IMAGE_FAMILY,
            },
            boot_disk_type: DISK_TYPE,
            boot_disk_size_gb: BOOT_DISK_SIZE_GB,
            data_disk_type: DISK_TYPE,
            data_disk_size_gb: DATA_DISK_SIZE_GB,
            network: option.network_path(),
            subnet: option.subnet_path(),
            instance_owners: vec![option.email.clone()],
            machine_type: option.machine_type.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Instance {
    #[serde(default)]
    name: String,
    #[serde(default)]
    proxy_uri: String,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Deserialize)]
struct LongRunningOperation {
    name: String,
    #[serde(default)]
    done: bool,
    error: Option<OperationStatus>,
}

#[derive(Debug, Deserialize)]
struct OperationStatus {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

impl NotebooksExecutor {
    pub fn new(endpoint: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.endpoint, path.trim_start_matches('/'))
    }

    fn validate(option: &InstanceOption) -> Result<(), ExecutorError> {
        if option.name.is_empty() {
            return Err(ExecutorError::InvalidOption("instance name is empty".into()));
        }
        if option.project_id.is_empty() || option.zone.is_empty() {
            return Err(ExecutorError::InvalidOption(
                "project id and zone are required".into(),
            ));
        }
        Ok(())
    }

    async fn send_operation(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<OperationName, ExecutorError> {
        let response = request.bearer_auth(&self.access_token).send().await?;
        if !response.status().is_success() {
            return Err(rejection(response).await);
        }
        let operation: LongRunningOperation = response
            .json()
            .await
            .map_err(|e| ExecutorError::Decode(e.to_string()))?;
        debug!(operation = %operation.name, "Operation accepted");
        Ok(OperationName(operation.name))
    }

    async fn post_verb(
        &self,
        option: &InstanceOption,
        verb: &str,
    ) -> Result<OperationName, ExecutorError> {
        Self::validate(option)?;
        let url = self.url(&format!("{}:{verb}", option.full_name()));
        self.send_operation(self.client.post(url).json(&json!({})))
            .await
    }
}

#[async_trait]
impl Executor for NotebooksExecutor {
    type Kind = Workbench;

    #[instrument(skip(self, option), fields(instance = %option.name))]
    async fn describe(&self, option: &InstanceOption) -> Result<ResourceStatus, ExecutorError> {
        Self::validate(option)?;
        let response = self
            .client
            .get(self.url(&option.full_name()))
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejection(response).await);
        }
        let instance: Instance = response
            .json()
            .await
            .map_err(|e| ExecutorError::Decode(e.to_string()))?;
        Ok(ResourceStatus::new(
            instance.name,
            instance.proxy_uri,
            instance.state,
        ))
    }

    #[instrument(skip(self, option), fields(instance = %option.name))]
    async fn create(&self, option: &InstanceOption) -> Result<OperationName, ExecutorError> {
        Self::validate(option)?;
        let url = self.url(&format!("{}/instances", option.parent()));
        let request = self
            .client
            .post(url)
            .query(&[("instanceId", option.name.as_str())])
            .json(&NewInstance::from_option(option));
        self.send_operation(request).await
    }

    #[instrument(skip(self, option), fields(instance = %option.name))]
    async fn start(&self, option: &InstanceOption) -> Result<OperationName, ExecutorError> {
        self.post_verb(option, "start").await
    }

    #[instrument(skip(self, option), fields(instance = %option.name))]
    async fn stop(&self, option: &InstanceOption) -> Result<OperationName, ExecutorError> {
        self.post_verb(option, "stop").await
    }

    #[instrument(skip(self, option), fields(instance = %option.name))]
    async fn delete(&self, option: &InstanceOption) -> Result<OperationName, ExecutorError> {
        Self::validate(option)?;
        let request = self.client.delete(self.url(&option.full_name()));
        self.send_operation(request).await
    }

    #[instrument(skip(self), fields(operation = %handle))]
    async fn operation_completed(&self, handle: &OperationName) -> Result<PollOutcome, ExecutorError> {
        let response = self
            .client
            .get(self.url(handle.as_str()))
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejection(response).await);
        }
        let operation: LongRunningOperation = response
            .json()
            .await
            .map_err(|e| ExecutorError::Decode(e.to_string()))?;

        if let Some(error) = operation.error {
            return Ok(PollOutcome::Failed(format!(
                "operation {} aborted (code {}): {}",
                operation.name, error.code, error.message
            )));
        }
        Ok(if operation.done {
            PollOutcome::Done
        } else {
            PollOutcome::Pending
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

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

    const INSTANCE_PATH: &str = "/v1/projects/gcp-sample/locations/asia-northeast1-a/instances/ws1";

    #[tokio::test]
    async fn test_create_sends_instance_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(
                "/v1/projects/gcp-sample/locations/asia-northeast1-a/instances",
            ))
            .and(query_param("instanceId", "ws1"))
            .and(header("authorization", "Bearer token-1"))
            .and(body_partial_json(json!({
                "vmImage": {
                    "project": "deeplearning-platform-release",
                    "imageFamily": "common-cpu-notebooks"
                },
                "bootDiskType": "PD_BALANCED",
                "bootDiskSizeGb": 50,
                "dataDiskSizeGb": 20,
                "network": "projects/gcp-sample/global/networks/default",
                "subnet": "projects/gcp-sample/regions/asia-northeast1/subnetworks/default",
                "instanceOwners": ["dev@example.com"],
                "machineType": "n1-standard-1"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "projects/gcp-sample/locations/asia-northeast1-a/operations/op-1",
                "done": false
            })))
            .expect(1)
            .mount(&server)
            .await;

        let executor = NotebooksExecutor::new(server.uri(), "token-1");
        let handle = executor.create(&option()).await.unwrap();
        assert_eq!(
            handle.as_str(),
            "projects/gcp-sample/locations/asia-northeast1-a/operations/op-1"
        );
    }

    #[tokio::test]
    async fn test_describe_maps_fields() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(INSTANCE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "projects/gcp-sample/locations/asia-northeast1-a/instances/ws1",
                "proxyUri": "abc-dot-asia-northeast1.notebooks.googleusercontent.com",
                "state": "ACTIVE"
            })))
            .mount(&server)
            .await;

        let executor = NotebooksExecutor::new(server.uri(), "token-1");
        let status = executor.describe(&option()).await.unwrap();
        assert_eq!(status.status, "ACTIVE");
        assert_eq!(
            status.url,
            "abc-dot-asia-northeast1.notebooks.googleusercontent.com"
        );
        assert!(executor.exists(&option()).await.unwrap());
    }

    #[tokio::test]
    async fn test_not_found_means_absent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(INSTANCE_PATH))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let executor = NotebooksExecutor::new(server.uri(), "token-1");
        assert!(!executor.exists(&option()).await.unwrap());
    }

    #[tokio::test]
    async fn test_server_error_is_not_absence() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(INSTANCE_PATH))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let executor = NotebooksExecutor::new(server.uri(), "token-1");
        let err = executor.exists(&option()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Rejected { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_create_conflict_is_already_exists() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(
                "/v1/projects/gcp-sample/locations/asia-northeast1-a/instances",
            ))
            .respond_with(ResponseTemplate::new(409).set_body_string("instance ws1 already exists"))
            .expect(1)
            .mount(&server)
            .await;

        let executor = NotebooksExecutor::new(server.uri(), "token-1");
        let err = executor.create(&option()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::AlreadyExists(ref m) if m.contains("ws1")));
    }

    #[tokio::test]
    async fn test_start_and_stop_use_custom_verbs() {
        let server = MockServer::start().await;
        for verb in ["start", "stop"] {
            Mock::given(method("POST"))
                .and(path(format!("{INSTANCE_PATH}:{verb}")))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "name": format!("operations/{verb}-1")
                })))
                .expect(1)
                .mount(&server)
                .await;
        }

        let executor = NotebooksExecutor::new(server.uri(), "token-1");
        assert_eq!(executor.start(&option()).await.unwrap().as_str(), "operations/start-1");
        assert_eq!(executor.stop(&option()).await.unwrap().as_str(), "operations/stop-1");
    }

    #[tokio::test]
    async fn test_operation_outcomes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/operations/pending"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"name": "operations/pending"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/operations/done"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"name": "operations/done", "done": true})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/operations/failed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "operations/failed",
                "done": true,
                "error": {"code": 9, "message": "quota exceeded"}
            })))
            .mount(&server)
            .await;

        let executor = NotebooksExecutor::new(server.uri(), "token-1");
        let pending = OperationName::new("operations/pending");
        let done = OperationName::new("operations/done");
        let failed = OperationName::new("operations/failed");
        assert_eq!(
            executor.operation_completed(&pending).await.unwrap(),
            PollOutcome::Pending
        );
        assert_eq!(
            executor.operation_completed(&done).await.unwrap(),
            PollOutcome::Done
        );
        match executor.operation_completed(&failed).await.unwrap() {
            PollOutcome::Failed(reason) => assert!(reason.contains("quota exceeded")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_name_rejected_before_request() {
        let executor = NotebooksExecutor::new("http://127.0.0.1:9", "token-1");
        let mut option = option();
        option.name.clear();
        assert!(matches!(
            executor.delete(&option).await,
            Err(ExecutorError::InvalidOption(_))
        ));
    }
}
