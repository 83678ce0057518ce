//! HTTP transport for delivering envelopes to the LXPCloud API.
//!
//! [`Transport`] is the boundary the sender and agent talk to. [`LxpClient`]
//! is the production implementation on top of a pooled `reqwest::Client`.
//! A single attempt lives here; retries and backoff belong to the sender.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::ApiConfig;
use crate::protocol::Envelope;

/// Acknowledgement value the API uses for success.
const STATUS_OK: &str = "ok";

/// Body of an ingestion request.
#[derive(Debug, Serialize)]
pub struct IngestRequest<'a> {
    pub api_key: &'a str,
    pub payload: &'a Envelope,
    /// Unix seconds, copied from the envelope timestamp
    pub recorded_at: i64,
}

impl<'a> IngestRequest<'a> {
    pub fn new(api_key: &'a str, payload: &'a Envelope) -> Self {
        Self {
            api_key,
            payload,
            recorded_at: payload.timestamp.unix,
        }
    }
}

/// Response from the ingestion API.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct IngestResponse {
    /// Acknowledgement; only `"ok"` means the envelope was accepted
    #[serde(default)]
    pub status: String,

    #[serde(default)]
    pub error: Option<String>,

    #[serde(default)]
    pub message: Option<String>,
}

impl IngestResponse {
    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }

    fn reason(&self) -> String {
        self.error
            .clone()
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| "Unknown error".to_string())
    }
}

/// Errors that can occur during a single transport call.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("Request timed out")]
    Timeout,

    /// The server answered with a non-2xx status
    #[error("Server error ({code}): {message}")]
    Status { code: StatusCode, message: String },

    /// The server answered 2xx but did not acknowledge the envelope
    #[error("Envelope rejected with status '{status}': {message}")]
    Rejected { status: String, message: String },

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Client configuration error: {0}")]
    Config(String),

    #[error("Transport is closed")]
    Closed,
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout
        } else {
            ClientError::Request(err)
        }
    }
}

/// Request/response boundary to the remote endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Acquire the underlying connection resources.
    ///
    /// Called once when the agent starts; reopening an open transport is a no-op.
    async fn open(&self) -> Result<(), ClientError> {
        Ok(())
    }

    /// Deliver one envelope. One attempt, no retries.
    async fn send(&self, envelope: &Envelope) -> Result<IngestResponse, ClientError>;

    /// Ask the endpoint whether it is reachable and accepts our key.
    ///
    /// `Ok(false)` is a negative answer from a reachable server.
    async fn probe(&self) -> Result<bool, ClientError>;

    /// Release connection resources. Calling it twice is harmless.
    async fn close(&self);
}

/// HTTP transport for the LXPCloud ingestion endpoint.
///
/// The client uses connection pooling (via reqwest's internal pool) for as
/// long as it is open.
pub struct LxpClient {
    /// Pooled client; `None` once closed
    client: Mutex<Option<Client>>,

    /// Ingestion endpoint, shared by sends and probes
    url: String,

    api_key: String,

    /// Request timeout duration
    timeout: Duration,
}

impl LxpClient {
    /// Create a client for the configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` if the HTTP client cannot be built.
    pub fn new(config: &ApiConfig) -> Result<Self, ClientError> {
        Self::with_settings(config.url(), config.api_key.clone(), config.timeout())
    }

    /// Create a client with explicit settings.
    pub fn with_settings(
        url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        Ok(Self {
            client: Mutex::new(Some(build_http_client(timeout)?)),
            url: url.into(),
            api_key: api_key.into(),
            timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn is_open(&self) -> bool {
        self.client.lock().await.is_some()
    }

    /// Clone of the pooled client, or `Closed`.
    async fn http(&self) -> Result<Client, ClientError> {
        self.client.lock().await.clone().ok_or(ClientError::Closed)
    }
}

fn build_http_client(timeout: Duration) -> Result<Client, ClientError> {
    Client::builder()
        .timeout(timeout)
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .map_err(|e| ClientError::Config(e.to_string()))
}

#[async_trait]
impl Transport for LxpClient {
    async fn open(&self) -> Result<(), ClientError> {
        let mut client = self.client.lock().await;
        if client.is_none() {
            *client = Some(build_http_client(self.timeout)?);
            debug!(url = %self.url, "Transport reopened");
        }
        Ok(())
    }

    async fn send(&self, envelope: &Envelope) -> Result<IngestResponse, ClientError> {
        let client = self.http().await?;

        debug!(
            url = %self.url,
            device_id = %envelope.device_info.device_id,
            "Sending envelope"
        );

        let response = client
            .post(&self.url)
            .json(&IngestRequest::new(&self.api_key, envelope))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<IngestResponse>(&body)
                .ok()
                .and_then(|r| r.error)
                .unwrap_or(body);
            return Err(ClientError::Status {
                code: status,
                message,
            });
        }

        let parsed: IngestResponse =
            serde_json::from_str(&body).map_err(|e| ClientError::Parse(e.to_string()))?;

        if parsed.is_ok() {
            Ok(parsed)
        } else {
            Err(ClientError::Rejected {
                message: parsed.reason(),
                status: parsed.status,
            })
        }
    }

    async fn probe(&self) -> Result<bool, ClientError> {
        let client = self.http().await?;

        let response = client
            .get(&self.url)
            .query(&[("api_key", self.api_key.as_str()), ("test", "1")])
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            debug!(status = %response.status(), "Connectivity probe answered with error status");
            return Ok(false);
        }

        let body = response.text().await?;
        match serde_json::from_str::<IngestResponse>(&body) {
            Ok(parsed) => Ok(parsed.is_ok()),
            Err(e) => {
                debug!(error = %e, "Connectivity probe answered with unparseable body");
                Ok(false)
            }
        }
    }

    async fn close(&self) {
        if self.client.lock().await.take().is_some() {
            info!(url = %self.url, "Transport closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::SamplingRound;
    use crate::config::DeviceConfig;
    use crate::protocol::LxpFormatter;
    use mockito::{Matcher, Server, ServerGuard};
    use serde_json::json;

    const API_KEY: &str = "lxp_test_key_123";

    fn envelope() -> Envelope {
        let device = DeviceConfig {
            name: "test".to_string(),
            device_type: "raspberry_pi".to_string(),
            location: String::new(),
            timezone: "UTC".to_string(),
            device_id: Some("press-04".to_string()),
            firmware_version: None,
            hardware_version: None,
        };
        LxpFormatter::default()
            .format(SamplingRound::default(), &device)
            .unwrap()
    }

    fn client_for(server: &ServerGuard) -> LxpClient {
        LxpClient::with_settings(
            format!("{}/api/ingest", server.url()),
            API_KEY,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_client_error_display() {
        let err = ClientError::Timeout;
        assert_eq!(format!("{}", err), "Request timed out");

        let err = ClientError::Status {
            code: StatusCode::BAD_REQUEST,
            message: "Invalid JSON".to_string(),
        };
        assert!(format!("{}", err).contains("400"));
        assert!(format!("{}", err).contains("Invalid JSON"));

        let err = ClientError::Rejected {
            status: "error".to_string(),
            message: "quota exceeded".to_string(),
        };
        assert!(format!("{}", err).contains("quota exceeded"));
    }

    #[test]
    fn test_client_from_api_config() {
        let config = ApiConfig {
            base_url: "https://cloud.example.com/".to_string(),
            endpoint: "/api/device-data".to_string(),
            api_key: API_KEY.to_string(),
            timeout: 12,
            retry_attempts: 3,
        };
        let client = LxpClient::new(&config).unwrap();

        assert_eq!(client.url(), "https://cloud.example.com/api/device-data");
        assert_eq!(client.timeout(), Duration::from_secs(12));
    }

    #[test]
    fn test_ingest_response_deserialization() {
        let response: IngestResponse = serde_json::from_str(r#"{"status": "ok"}"#).unwrap();
        assert!(response.is_ok());
        assert!(response.error.is_none());

        let response: IngestResponse =
            serde_json::from_str(r#"{"status": "error", "error": "bad key"}"#).unwrap();
        assert!(!response.is_ok());
        assert_eq!(response.reason(), "bad key");

        let response: IngestResponse = serde_json::from_str("{}").unwrap();
        assert!(!response.is_ok());
    }

    #[test]
    fn test_ingest_request_shape() {
        let envelope = envelope();
        let json = serde_json::to_value(IngestRequest::new(API_KEY, &envelope)).unwrap();

        assert_eq!(json["api_key"], API_KEY);
        assert_eq!(json["recorded_at"], envelope.timestamp.unix);
        assert_eq!(json["payload"]["device_info"]["device_id"], "press-04");
    }

    #[tokio::test]
    async fn test_send_acknowledged() {
        let mut server = Server::new_async().await;
        let envelope = envelope();
        let mock = server
            .mock("POST", "/api/ingest")
            .match_body(Matcher::PartialJson(json!({
                "api_key": API_KEY,
                "recorded_at": envelope.timestamp.unix,
                "payload": {"lxp_version": "1.0"}
            })))
            .with_status(200)
            .with_header("Content-Type", "application/json")
            .with_body(r#"{"status": "ok"}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let response = client.send(&envelope).await.unwrap();

        assert!(response.is_ok());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_rejected_despite_2xx() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/ingest")
            .with_status(200)
            .with_body(r#"{"status": "error", "error": "device not registered"}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let err = client.send(&envelope()).await.unwrap_err();

        match err {
            ClientError::Rejected { status, message } => {
                assert_eq!(status, "error");
                assert_eq!(message, "device not registered");
            }
            other => panic!("expected Rejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_server_error() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/ingest")
            .with_status(401)
            .with_body(r#"{"status": "error", "error": "invalid api key"}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let err = client.send(&envelope()).await.unwrap_err();

        match err {
            ClientError::Status { code, message } => {
                assert_eq!(code, StatusCode::UNAUTHORIZED);
                assert_eq!(message, "invalid api key");
            }
            other => panic!("expected Status, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_unparseable_body() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/ingest")
            .with_status(200)
            .with_body("<html>maintenance</html>")
            .create_async()
            .await;

        let client = client_for(&server);
        let err = client.send(&envelope()).await.unwrap_err();
        assert!(matches!(err, ClientError::Parse(_)));
    }

    #[tokio::test]
    async fn test_probe_uses_query_parameters() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/ingest")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("api_key".into(), API_KEY.into()),
                Matcher::UrlEncoded("test".into(), "1".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"status": "ok"}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        assert!(client.probe().await.unwrap());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_probe_negative_answer() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/ingest")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"status": "error"}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        assert!(!client.probe().await.unwrap());
    }

    #[tokio::test]
    async fn test_probe_error_status() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/ingest")
            .match_query(Matcher::Any)
            .with_status(503)
            .create_async()
            .await;

        let client = client_for(&server);
        assert!(!client.probe().await.unwrap());
    }

    #[tokio::test]
    async fn test_probe_unreachable() {
        // Nothing listens on the discard port
        let client =
            LxpClient::with_settings("http://127.0.0.1:9/api", API_KEY, Duration::from_secs(2)).unwrap();
        assert!(client.probe().await.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_sends() {
        let server = Server::new_async().await;
        let client = client_for(&server);
        assert!(client.is_open().await);

        client.close().await;
        client.close().await;
        assert!(!client.is_open().await);

        let err = client.send(&envelope()).await.unwrap_err();
        assert!(matches!(err, ClientError::Closed));
        assert!(matches!(client.probe().await, Err(ClientError::Closed)));

        client.open().await.unwrap();
        assert!(client.is_open().await);
    }
}
