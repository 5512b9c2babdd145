//! HTTP client for the collection endpoint
//!
//! One POST per capture event. The client never retries; retry policy lives in
//! the coordinator.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::EndpointConfig;
use crate::error::{Error, Result};
use crate::types::{DeliveryFailure, DeliveryOutcome, Payload, UploadKind};

/// Header carrying the per-event idempotency key
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Longest response body excerpt kept in a failure reason
const MAX_ERROR_BODY: usize = 256;

/// Delivers one typed payload to the remote endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Attempt a single delivery. Never retries and never panics.
    async fn deliver(&self, kind: &UploadKind, payload: &Payload, event_id: Uuid) -> DeliveryOutcome;
}

/// Request body for POST to the endpoint URL
#[derive(Serialize)]
struct UploadRequest<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    payload: &'a Payload,
}

/// Optional response body; only used for logging
#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// reqwest-backed [`Transport`]
pub struct UploadClient {
    http_client: reqwest::Client,
    url: String,
    request_timeout: Duration,
}

impl UploadClient {
    /// Create a new upload client from configuration
    ///
    /// Returns an error if the endpoint configuration is invalid.
    pub fn new(config: &EndpointConfig) -> Result<Self> {
        config.validate()?;

        let url = config
            .url
            .clone()
            .ok_or_else(|| Error::Config("endpoint.url is required".to_string()))?;

        let mut headers = HeaderMap::new();
        if let Some(api_key) = &config.api_key {
            let auth_value = format!("Bearer {}", api_key);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth_value)
                    .map_err(|e| Error::Config(format!("invalid api_key: {}", e)))?,
            );
        }

        // reqwest has no write-phase timeout; the per-request deadline below
        // bounds connect + write + read together.
        let http_client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .read_timeout(config.read_timeout())
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Transport(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            url,
            request_timeout: config.connect_timeout()
                + config.write_timeout()
                + config.read_timeout(),
        })
    }

    /// Endpoint URL uploads are posted to
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post(
        &self,
        kind: &UploadKind,
        payload: &Payload,
        event_id: Uuid,
    ) -> std::result::Result<(), DeliveryFailure> {
        let body = UploadRequest {
            kind: kind.as_str(),
            payload,
        };

        let response = self
            .http_client
            .post(&self.url)
            .timeout(self.request_timeout)
            .header(IDEMPOTENCY_HEADER, event_id.to_string())
            .json(&body)
            .send()
            .await
            .map_err(classify_error)?;

        let status = response.status();

        if status.is_success() {
            // Endpoints may answer with an empty or non-JSON body.
            if let Ok(UploadResponse { result, error }) = response.json().await {
                tracing::trace!(?result, ?error, "Endpoint response");
            }
            Ok(())
        } else {
            let mut body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            truncate_utf8(&mut body, MAX_ERROR_BODY);
            Err(DeliveryFailure::Status {
                code: status.as_u16(),
                body,
            })
        }
    }
}

#[async_trait]
impl Transport for UploadClient {
    async fn deliver(&self, kind: &UploadKind, payload: &Payload, event_id: Uuid) -> DeliveryOutcome {
        match self.post(kind, payload, event_id).await {
            Ok(()) => DeliveryOutcome::Success,
            Err(failure) => DeliveryOutcome::Failure(failure),
        }
    }
}

/// Map a reqwest error onto a delivery failure reason
fn classify_error(error: reqwest::Error) -> DeliveryFailure {
    if error.is_timeout() {
        DeliveryFailure::Timeout(error.to_string())
    } else if error.is_builder() || error.is_body() {
        DeliveryFailure::Encode(error.to_string())
    } else {
        DeliveryFailure::Network(error.to_string())
    }
}

fn truncate_utf8(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn endpoint(url: String) -> EndpointConfig {
        EndpointConfig {
            url: Some(url),
            connect_timeout_secs: 2,
            read_timeout_secs: 2,
            write_timeout_secs: 2,
            ..Default::default()
        }
    }

    fn location() -> Payload {
        Payload::new()
            .with("timestamp", "6/01/2025 08:00:00")
            .with("latitude", 51.5)
            .with("longitude", -0.12)
    }

    #[test]
    fn test_client_requires_valid_config() {
        assert!(UploadClient::new(&EndpointConfig::default()).is_err());
    }

    #[test]
    fn test_client_with_valid_config() {
        let config = EndpointConfig {
            api_key: Some("secret".to_string()),
            ..endpoint("https://collector.example.com/exec".to_string())
        };
        let client = UploadClient::new(&config).unwrap();
        assert_eq!(client.url(), "https://collector.example.com/exec");
        assert_eq!(client.request_timeout, Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_deliver_success_posts_typed_body() {
        let server = MockServer::start().await;
        let event_id = Uuid::new_v4();

        Mock::given(method("POST"))
            .and(path("/exec"))
            .and(header(IDEMPOTENCY_HEADER, event_id.to_string().as_str()))
            .and(body_json(serde_json::json!({
                "type": "location",
                "payload": {
                    "timestamp": "6/01/2025 08:00:00",
                    "latitude": 51.5,
                    "longitude": -0.12
                }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": "success"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = UploadClient::new(&endpoint(format!("{}/exec", server.uri()))).unwrap();
        let outcome = client
            .deliver(&UploadKind::Location, &location(), event_id)
            .await;

        assert_eq!(outcome, DeliveryOutcome::Success);
    }

    #[tokio::test]
    async fn test_deliver_sends_bearer_token() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let config = EndpointConfig {
            api_key: Some("secret".to_string()),
            ..endpoint(server.uri())
        };
        let client = UploadClient::new(&config).unwrap();
        let outcome = client
            .deliver(&UploadKind::SmsLog, &Payload::new(), Uuid::new_v4())
            .await;

        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_deliver_non_success_status_is_failure() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(header_exists(IDEMPOTENCY_HEADER))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .expect(1)
            .mount(&server)
            .await;

        let client = UploadClient::new(&endpoint(server.uri())).unwrap();
        let outcome = client
            .deliver(&UploadKind::CallLog, &Payload::new(), Uuid::new_v4())
            .await;

        assert_eq!(
            outcome,
            DeliveryOutcome::Failure(DeliveryFailure::Status {
                code: 503,
                body: "maintenance".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_deliver_slow_endpoint_times_out() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
            .mount(&server)
            .await;

        let config = EndpointConfig {
            connect_timeout_secs: 1,
            read_timeout_secs: 1,
            write_timeout_secs: 1,
            ..endpoint(server.uri())
        };
        let client = UploadClient::new(&config).unwrap();
        let outcome = client
            .deliver(&UploadKind::Location, &location(), Uuid::new_v4())
            .await;

        assert!(matches!(
            outcome,
            DeliveryOutcome::Failure(DeliveryFailure::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_deliver_unreachable_endpoint_is_failure() {
        // Nothing listens on the discard port.
        let client = UploadClient::new(&endpoint("http://127.0.0.1:9/exec".to_string())).unwrap();
        let outcome = client
            .deliver(&UploadKind::Location, &location(), Uuid::new_v4())
            .await;

        assert!(!outcome.is_success());
    }

    #[test]
    fn test_truncate_utf8_respects_char_boundaries() {
        let mut text = "ééé".to_string();
        truncate_utf8(&mut text, 3);
        assert_eq!(text, "é");
    }
}
