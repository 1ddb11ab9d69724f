// JupyterHub executor
//
// The hub has no operation handles: spawning and stopping report only
// readiness flags on the user's server map. Mutations return a SessionProbe
// and polling re-reads the server until the probe condition holds.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument};
use url::Url;

use super::{rejection, Executor, ExecutorError, PollOutcome};
use crate::kind::JupyterHub;
use crate::model::{session_status, Readiness, ResourceStatus, SessionOption, SessionProbe};

/// Executor for named servers of hub users
#[derive(Clone)]
pub struct JupyterHubExecutor {
    client: reqwest::Client,
    base: Url,
    api_base: Url,
    token: String,
}

#[derive(Debug, Deserialize)]
struct HubUser {
    #[serde(default)]
    servers: HashMap<String, HubServer>,
}

#[derive(Debug, Deserialize)]
struct HubServer {
    #[serde(default)]
    ready: bool,
    #[serde(default)]
    stopped: bool,
    /// `spawn` or `stop` while a transition is in progress
    pending: Option<String>,
    #[serde(default)]
    url: String,
}

impl HubServer {
    fn is_pending(&self) -> bool {
        matches!(self.pending.as_deref(), Some("spawn") | Some("stop"))
    }

    fn label(&self) -> &'static str {
        if self.is_pending() {
            session_status::PENDING
        } else if self.ready {
            session_status::READY
        } else {
            session_status::STOPPED
        }
    }
}

impl JupyterHubExecutor {
    /// Build an executor for the hub served at `base_url`
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, ExecutorError> {
        let base = Url::parse(base_url)
            .map_err(|e| ExecutorError::Config(format!("invalid hub URL {base_url:?}: {e}")))?;
        let mut api_base = base.clone();
        api_base
            .path_segments_mut()
            .map_err(|_| ExecutorError::Config(format!("hub URL {base_url:?} cannot be a base")))?
            .pop_if_empty()
            .extend(["hub", "api"]);

        Ok(Self {
            client: reqwest::Client::new(),
            base,
            api_base,
            token: token.into(),
        })
    }

    pub fn api_base(&self) -> &Url {
        &self.api_base
    }

    fn api_url(&self, segments: &[&str]) -> Url {
        let mut url = self.api_base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.api_url(segments))
            .header("Authorization", format!("token {}", self.token))
    }

    async fn get_user(&self, user: &str) -> Result<HubUser, ExecutorError> {
        let response = self.request(Method::GET, &["users", user]).send().await?;
        if !response.status().is_success() {
            return Err(rejection(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ExecutorError::Decode(e.to_string()))
    }

    async fn find_server(&self, option: &SessionOption) -> Result<HubServer, ExecutorError> {
        let mut user = self.get_user(&option.user).await?;
        user.servers.remove(&option.server).ok_or_else(|| {
            ExecutorError::NotFound(format!("server {}/{}", option.user, option.server))
        })
    }

    async fn spawn_unless_ready(&self, option: &SessionOption) -> Result<(), ExecutorError> {
        match self.find_server(option).await {
            Ok(server) if server.ready => {
                debug!("Server already ready, nothing to spawn");
                Ok(())
            }
            Ok(_) => self.spawn(option).await,
            Err(e) if e.is_not_found() => self.spawn(option).await,
            Err(e) => Err(e),
        }
    }

    async fn spawn(&self, option: &SessionOption) -> Result<(), ExecutorError> {
        let response = self
            .request(Method::POST, &["users", option.user.as_str(), "servers", option.server.as_str()])
            .send()
            .await?;
        match response.status() {
            StatusCode::CREATED | StatusCode::ACCEPTED => Ok(()),
            StatusCode::CONFLICT => {
                debug!(user = %option.user, server = %option.server, "Server already exists");
                Ok(())
            }
            _ => Err(rejection(response).await),
        }
    }

    async fn shut_down(&self, option: &SessionOption, remove: bool) -> Result<(), ExecutorError> {
        let mut request =
            self.request(Method::DELETE, &["users", option.user.as_str(), "servers", option.server.as_str()]);
        if remove {
            request = request.json(&json!({ "remove": true }));
        }
        let response = request.send().await?;
        match response.status() {
            StatusCode::ACCEPTED | StatusCode::NO_CONTENT => Ok(()),
            StatusCode::NOT_FOUND => {
                debug!(user = %option.user, server = %option.server, "Server already gone");
                Ok(())
            }
            _ => Err(rejection(response).await),
        }
    }
}

#[async_trait]
impl Executor for JupyterHubExecutor {
    type Kind = JupyterHub;

    #[instrument(skip(self, option), fields(user = %option.user))]
    async fn get_or_create_owner(&self, option: &SessionOption) -> Result<(), ExecutorError> {
        match self.get_user(&option.user).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let response = self
            .request(Method::POST, &["users", option.user.as_str()])
            .send()
            .await?;
        match response.status() {
            StatusCode::CREATED | StatusCode::CONFLICT => {
                info!(user = %option.user, "Hub user ready");
                Ok(())
            }
            _ => Err(rejection(response).await),
        }
    }

    #[instrument(skip(self, option), fields(user = %option.user, server = %option.server))]
    async fn describe(&self, option: &SessionOption) -> Result<ResourceStatus, ExecutorError> {
        let server = self.find_server(option).await?;
        let url = if server.ready && !server.is_pending() && !server.url.is_empty() {
            self.base
                .join(&server.url)
                .map_err(|e| ExecutorError::Decode(format!("invalid server url: {e}")))?
                .to_string()
        } else {
            String::new()
        };
        Ok(ResourceStatus::new(&option.server, url, server.label()))
    }

    #[instrument(skip(self, option), fields(user = %option.user, server = %option.server))]
    async fn create(&self, option: &SessionOption) -> Result<SessionProbe, ExecutorError> {
        self.spawn_unless_ready(option).await?;
        Ok(SessionProbe::new(option, Readiness::Ready))
    }

    // The hub answers 400 to a spawn request for a running server
    #[instrument(skip(self, option), fields(user = %option.user, server = %option.server))]
    async fn start(&self, option: &SessionOption) -> Result<SessionProbe, ExecutorError> {
        self.spawn_unless_ready(option).await?;
        Ok(SessionProbe::new(option, Readiness::Ready))
    }

    #[instrument(skip(self, option), fields(user = %option.user, server = %option.server))]
    async fn stop(&self, option: &SessionOption) -> Result<SessionProbe, ExecutorError> {
        self.shut_down(option, false).await?;
        Ok(SessionProbe::new(option, Readiness::Stopped))
    }

    #[instrument(skip(self, option), fields(user = %option.user, server = %option.server))]
    async fn delete(&self, option: &SessionOption) -> Result<SessionProbe, ExecutorError> {
        self.shut_down(option, true).await?;
        Ok(SessionProbe::new(option, Readiness::Removed))
    }

    #[instrument(skip(self), fields(user = %probe.user, server = %probe.server, until = ?probe.until))]
    async fn operation_completed(&self, probe: &SessionProbe) -> Result<PollOutcome, ExecutorError> {
        let server = match self.find_server(&probe.session()).await {
            Ok(server) => Some(server),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        let outcome = match (probe.until, server) {
            (Readiness::Removed, None) | (Readiness::Stopped, None) => PollOutcome::Done,
            (Readiness::Removed, Some(_)) => PollOutcome::Pending,
            (Readiness::Ready, None) => PollOutcome::Failed(format!(
                "server {}/{} disappeared while spawning",
                probe.user, probe.server
            )),
            (_, Some(server)) if server.is_pending() => PollOutcome::Pending,
            (Readiness::Ready, Some(server)) if server.ready => PollOutcome::Done,
            (Readiness::Ready, Some(_)) => PollOutcome::Failed(format!(
                "server {}/{} stopped before becoming ready",
                probe.user, probe.server
            )),
            (Readiness::Stopped, Some(server)) if server.stopped || !server.ready => {
                PollOutcome::Done
            }
            (Readiness::Stopped, Some(_)) => PollOutcome::Pending,
        };
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn option() -> SessionOption {
        SessionOption::new("alice", "lab")
    }

    fn user_with(server: serde_json::Value) -> serde_json::Value {
        json!({ "name": "alice", "servers": { "lab": server } })
    }

    async fn mount_user(server: &MockServer, body: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/hub/api/users/alice"))
            .and(header("authorization", "token secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    #[test]
    fn test_api_base_appends_hub_api() {
        let executor = JupyterHubExecutor::new("https://hub.example.com/", "t").unwrap();
        assert_eq!(executor.api_base().as_str(), "https://hub.example.com/hub/api");
        assert!(JupyterHubExecutor::new("not a url", "t").is_err());
    }

    #[tokio::test]
    async fn test_describe_ready_server() {
        let hub = MockServer::start().await;
        mount_user(
            &hub,
            user_with(json!({"name": "lab", "ready": true, "stopped": false, "pending": null, "url": "/user/alice/lab/"})),
        )
        .await;

        let executor = JupyterHubExecutor::new(&hub.uri(), "secret").unwrap();
        let status = executor.describe(&option()).await.unwrap();
        assert_eq!(status.name, "lab");
        assert_eq!(status.status, "Ready");
        assert_eq!(status.url, format!("{}/user/alice/lab/", hub.uri()));
    }

    #[tokio::test]
    async fn test_pending_server_has_no_url() {
        let hub = MockServer::start().await;
        mount_user(
            &hub,
            user_with(json!({"ready": false, "stopped": false, "pending": "spawn", "url": "/user/alice/lab/"})),
        )
        .await;

        let executor = JupyterHubExecutor::new(&hub.uri(), "secret").unwrap();
        let status = executor.describe(&option()).await.unwrap();
        assert_eq!(status.status, "Pending");
        assert!(status.url.is_empty());
        assert_eq!(
            executor
                .operation_completed(&SessionProbe::new(&option(), Readiness::Ready))
                .await
                .unwrap(),
            PollOutcome::Pending
        );
    }

    #[tokio::test]
    async fn test_missing_server_or_user_is_absent() {
        let hub = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hub/api/users/alice"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "alice", "servers": {}})))
            .mount(&hub)
            .await;
        Mock::given(method("GET"))
            .and(path("/hub/api/users/bob"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&hub)
            .await;

        let executor = JupyterHubExecutor::new(&hub.uri(), "secret").unwrap();
        assert!(!executor.exists(&option()).await.unwrap());
        assert!(!executor
            .exists(&SessionOption::new("bob", "lab"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_create_spawns_and_tolerates_conflict() {
        let hub = MockServer::start().await;
        mount_user(&hub, json!({"name": "alice", "servers": {}})).await;
        Mock::given(method("POST"))
            .and(path("/hub/api/users/alice/servers/lab"))
            .respond_with(ResponseTemplate::new(409))
            .expect(1)
            .mount(&hub)
            .await;

        let executor = JupyterHubExecutor::new(&hub.uri(), "secret").unwrap();
        let probe = executor.create(&option()).await.unwrap();
        assert_eq!(probe.until, Readiness::Ready);
    }

    #[tokio::test]
    async fn test_create_skips_ready_server() {
        let hub = MockServer::start().await;
        mount_user(&hub, user_with(json!({"ready": true, "url": "/user/alice/lab/"}))).await;
        Mock::given(method("POST"))
            .and(path("/hub/api/users/alice/servers/lab"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&hub)
            .await;

        let executor = JupyterHubExecutor::new(&hub.uri(), "secret").unwrap();
        executor.create(&option()).await.unwrap();
    }

    #[tokio::test]
    async fn test_start_skips_ready_server() {
        let hub = MockServer::start().await;
        mount_user(
            &hub,
            user_with(json!({"ready": true, "stopped": false, "pending": null, "url": "/user/alice/lab/"})),
        )
        .await;
        Mock::given(method("POST"))
            .and(path("/hub/api/users/alice/servers/lab"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({"message": "already running"})))
            .expect(0)
            .mount(&hub)
            .await;

        let executor = JupyterHubExecutor::new(&hub.uri(), "secret").unwrap();
        let probe = executor.start(&option()).await.unwrap();
        assert_eq!(probe.until, Readiness::Ready);
        assert_eq!(
            executor.operation_completed(&probe).await.unwrap(),
            PollOutcome::Done
        );
    }

    #[tokio::test]
    async fn test_start_spawns_stopped_server() {
        let hub = MockServer::start().await;
        mount_user(
            &hub,
            user_with(json!({"ready": false, "stopped": true, "pending": null, "url": ""})),
        )
        .await;
        Mock::given(method("POST"))
            .and(path("/hub/api/users/alice/servers/lab"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&hub)
            .await;

        let executor = JupyterHubExecutor::new(&hub.uri(), "secret").unwrap();
        executor.start(&option()).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_sends_remove_flag() {
        let hub = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/hub/api/users/alice/servers/lab"))
            .and(body_json(json!({"remove": true})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&hub)
            .await;

        let executor = JupyterHubExecutor::new(&hub.uri(), "secret").unwrap();
        let probe = executor.delete(&option()).await.unwrap();
        assert_eq!(probe.until, Readiness::Removed);
    }

    #[tokio::test]
    async fn test_stop_tolerates_missing_server() {
        let hub = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/hub/api/users/alice/servers/lab"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&hub)
            .await;

        let executor = JupyterHubExecutor::new(&hub.uri(), "secret").unwrap();
        let probe = executor.stop(&option()).await.unwrap();
        assert_eq!(probe.until, Readiness::Stopped);
    }

    #[tokio::test]
    async fn test_owner_created_when_missing() {
        let hub = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hub/api/users/alice"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&hub)
            .await;
        Mock::given(method("POST"))
            .and(path("/hub/api/users/alice"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"name": "alice"})))
            .expect(1)
            .mount(&hub)
            .await;

        let executor = JupyterHubExecutor::new(&hub.uri(), "secret").unwrap();
        executor.get_or_create_owner(&option()).await.unwrap();
    }

    #[tokio::test]
    async fn test_stopped_server_fails_ready_probe() {
        let hub = MockServer::start().await;
        mount_user(&hub, user_with(json!({"ready": false, "stopped": true, "pending": null}))).await;

        let executor = JupyterHubExecutor::new(&hub.uri(), "secret").unwrap();
        let ready = SessionProbe::new(&option(), Readiness::Ready);
        let stopped = SessionProbe::new(&option(), Readiness::Stopped);
        let removed = SessionProbe::new(&option(), Readiness::Removed);
        assert!(matches!(
            executor.operation_completed(&ready).await.unwrap(),
            PollOutcome::Failed(_)
        ));
        assert_eq!(
            executor.operation_completed(&stopped).await.unwrap(),
            PollOutcome::Done
        );
        assert_eq!(
            executor.operation_completed(&removed).await.unwrap(),
            PollOutcome::Pending
        );
    }
}
