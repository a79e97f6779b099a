use std::time::Duration;

use reqwest::{header, Client, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use crate::attributes::Registration;
use crate::error::{ClientError, ControlError};
use crate::types::{InstanceConfig, RemoteTask};

const USER_AGENT: &str = "orchestrator-client";

/// Upper bound on how much of an error response body is kept for logging.
const MAX_ERROR_BODY: usize = 1024;

/// Authenticated client for the orchestrator's control API.
///
/// Each operation is a single request; there is no client-side retry. Callers wanting bounded
/// latency configure it through `request_timeout`.
#[derive(Clone, Debug)]
pub struct ControlChannel {
    base: Url,
    http_client: Client,
}

fn build_http_client(
    secret: &str,
    request_timeout: Option<Duration>,
) -> Result<Client, ClientError> {
    let mut auth = header::HeaderValue::from_str(&format!("Bearer {secret}"))
        .map_err(|_| ClientError::InvalidSecret)?;
    auth.set_sensitive(true);

    let mut headers = header::HeaderMap::new();
    headers.insert(header::AUTHORIZATION, auth);

    let mut builder = Client::builder()
        .default_headers(headers)
        .user_agent(USER_AGENT);
    if let Some(timeout) = request_timeout {
        builder = builder.timeout(timeout);
    }
    builder.build().map_err(ClientError::HttpClient)
}

impl ControlChannel {
    pub fn new(
        base_url: &str,
        secret: &str,
        request_timeout: Option<Duration>,
    ) -> Result<Self, ClientError> {
        let base = Url::parse(base_url)
            .map_err(|e| ClientError::InvalidBaseUrl(format!("{base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(ClientError::InvalidBaseUrl(base_url.to_owned()));
        }
        Ok(Self {
            base,
            http_client: build_http_client(secret, request_timeout)?,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        // Checked in `new`: the base url can always carry a path.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    pub async fn register(&self, registration: &Registration) -> Result<String, ControlError> {
        let response = self
            .http_client
            .post(self.endpoint(&["api", "register-instance"]))
            .json(registration)
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.text().await?)
    }

    pub async fn fetch_config(&self, instance_id: &str) -> Result<InstanceConfig, ControlError> {
        let response = self
            .http_client
            .get(self.endpoint(&["api", "config"]))
            .query(&[("instanceId", instance_id)])
            .send()
            .await?;
        let config: Option<InstanceConfig> =
            decode_optional(check_status(response).await?).await?;
        Ok(config.unwrap_or_default())
    }

    /// Report liveness. An empty body means no tasks.
    pub async fn heartbeat(&self, instance_id: &str) -> Result<Vec<RemoteTask>, ControlError> {
        let response = self
            .http_client
            .get(self.endpoint(&["api", "heartbeat", instance_id]))
            .send()
            .await?;
        let tasks: Option<Vec<RemoteTask>> =
            decode_optional(check_status(response).await?).await?;
        Ok(tasks.unwrap_or_default())
    }

    /// Best-effort removal of the instance. Failures are logged, never returned.
    pub async fn unregister(&self, instance_id: &str) {
        match self.delete_instance(instance_id).await {
            Ok(()) => debug!(instance_id, "unregistered instance"),
            Err(error) => {
                metrics::counter!("orchestrator_unregister_failures_total").increment(1);
                warn!(instance_id, %error, "failed to unregister instance");
            }
        }
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<(), ControlError> {
        let response = self
            .http_client
            .delete(self.endpoint(&["api", "destroy", instance_id]))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}

async fn check_status(response: Response) -> Result<Response, ControlError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    Err(ControlError::Status { status, body })
}

/// Decode a JSON body, treating an empty body as `None`.
async fn decode_optional<T: DeserializeOwned>(
    response: Response,
) -> Result<Option<T>, ControlError> {
    let bytes = response.bytes().await?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::Attributes;
    use httpmock::prelude::*;
    use serde_json::json;

    const SECRET: &str = "s3cr3t";

    fn channel(server: &MockServer) -> ControlChannel {
        ControlChannel::new(&server.base_url(), SECRET, Some(Duration::from_secs(1)))
            .expect("failed to build control channel")
    }

    #[test]
    fn test_rejects_invalid_base_url() {
        assert!(matches!(
            ControlChannel::new("not a url", SECRET, None),
            Err(ClientError::InvalidBaseUrl(_))
        ));
        assert!(matches!(
            ControlChannel::new("mailto:ops@example.com", SECRET, None),
            Err(ClientError::InvalidBaseUrl(_))
        ));
    }

    #[test]
    fn test_endpoint_keeps_base_path_and_escapes_segments() {
        let channel =
            ControlChannel::new("http://localhost:3000/orchestrator/", SECRET, None).unwrap();
        assert_eq!(
            channel.endpoint(&["api", "heartbeat", "abc-x/y"]).as_str(),
            "http://localhost:3000/orchestrator/api/heartbeat/abc-x%2Fy"
        );
    }

    #[tokio::test]
    async fn test_register_sends_bearer_token_and_body() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/register-instance")
                    .header("authorization", "Bearer s3cr3t")
                    .json_body(json!({"instanceId": "device-8080", "port": 8080, "region": "eu"}));
                then.status(200).body("OK");
            })
            .await;

        let mut extra = Attributes::new();
        extra.insert("region".to_owned(), json!("eu"));
        let registration = Registration::new("device-8080", Some(8080), extra).unwrap();

        let ack = channel(&server).register(&registration).await.unwrap();

        assert_eq!(ack, "OK");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_register_rejection_carries_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/register-instance");
                then.status(400).body("Forbidden");
            })
            .await;

        let registration = Registration::new("device-8080", Some(8080), Attributes::new()).unwrap();
        let error = channel(&server).register(&registration).await.unwrap_err();

        assert_eq!(error.status(), Some(reqwest::StatusCode::BAD_REQUEST));
        assert!(error.to_string().contains("Forbidden"));
    }

    #[tokio::test]
    async fn test_fetch_config_passes_instance_id() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/config")
                    .query_param("instanceId", "device-8080");
                then.status(200).json_body(json!({
                    "modules": [{"type": "heartbeat", "config": {"heartbeat_interval": 1000}}]
                }));
            })
            .await;

        let config = channel(&server).fetch_config("device-8080").await.unwrap();

        assert_eq!(config.modules.len(), 1);
        assert_eq!(config.modules[0].kind, "heartbeat");
    }

    #[tokio::test]
    async fn test_fetch_config_empty_body_is_default() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/config");
                then.status(200);
            })
            .await;

        let config = channel(&server).fetch_config("device-8080").await.unwrap();

        assert_eq!(config, InstanceConfig::default());
    }

    #[tokio::test]
    async fn test_heartbeat_returns_tasks() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/heartbeat/device-8080");
                then.status(200).json_body(json!([{"type": "exit", "reason": "scale-down"}]));
            })
            .await;

        let tasks = channel(&server).heartbeat("device-8080").await.unwrap();

        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].is_exit());
        assert_eq!(tasks[0].payload["reason"], json!("scale-down"));
    }

    #[tokio::test]
    async fn test_heartbeat_empty_body_is_no_tasks() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/heartbeat/device-8080");
                then.status(200);
            })
            .await;

        let tasks = channel(&server).heartbeat("device-8080").await.unwrap();

        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_garbage_body_is_decode_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/heartbeat/device-8080");
                then.status(200).body("not json");
            })
            .await;

        let error = channel(&server).heartbeat("device-8080").await.unwrap_err();

        assert!(matches!(error, ControlError::Decode(_)));
    }

    #[tokio::test]
    async fn test_unregister_failure_is_swallowed() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(DELETE).path("/api/destroy/device-8080");
                then.status(500);
            })
            .await;

        channel(&server).unregister("device-8080").await;

        mock.assert_async().await;
    }
}
