//! Client for the remote audit-log API.
//!
//! One fetch covers a half-open time window. 429 and 5xx responses retry
//! inside the client with exponential backoff; only an exhausted budget or
//! an auth rejection surfaces to the handler.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use logrelay_core::config::UpstreamConfig;
use logrelay_queue::Backoff;

use crate::error::PipelineError;

/// Actor block as the upstream reports it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawActor {
    pub email: Option<String>,
    pub caller_ip: Option<String>,
    pub ip_address: Option<String>,
}

/// One named sub-event with its parameter list.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    pub name: Option<String>,
    #[serde(default)]
    pub parameters: Vec<RawParameter>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawParameter {
    pub name: Option<String>,
    pub value: Option<serde_json::Value>,
}

/// One audit record exactly as returned by the upstream API.
#[derive(Debug, Clone, Deserialize)]
pub struct RawRecord {
    /// Upstream identifier. Some record kinds arrive without one.
    pub id: Option<String>,
    /// Record timestamp (RFC 3339).
    pub time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub actor: RawActor,
    #[serde(default)]
    pub events: Vec<RawEvent>,
}

#[derive(Debug, Deserialize)]
struct ActivityListResponse {
    #[serde(default)]
    items: Vec<RawRecord>,
}

/// Capability consumed by the fetch handler.
#[async_trait]
pub trait RemoteLogClient: Send + Sync {
    /// Fetch all records in `[start, end)` for the authenticated account.
    async fn fetch_window(
        &self,
        access_token: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawRecord>, PipelineError>;
}

// Classification of a single request attempt, consumed by the backoff loop.
enum FetchAttemptError {
    Retryable(String),
    Auth(String),
    Fatal(String),
}

/// HTTP client against the upstream activities endpoint.
pub struct HttpLogClient {
    base_url: String,
    max_results: u32,
    backoff: Backoff,
    client: reqwest::Client,
}

impl HttpLogClient {
    pub fn new(upstream: &UpstreamConfig) -> Self {
        Self {
            base_url: upstream.base_url.trim_end_matches('/').to_string(),
            max_results: upstream.max_results,
            backoff: Backoff::new(Duration::from_secs(1), 5),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    async fn request_once(
        &self,
        access_token: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawRecord>, FetchAttemptError> {
        let url = format!("{}/activities", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .query(&[
                ("startTime", start.to_rfc3339()),
                ("endTime", end.to_rfc3339()),
                ("maxResults", self.max_results.to_string()),
            ])
            .send()
            .await
            .map_err(|e| FetchAttemptError::Retryable(format!("request failed: {e}")))?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchAttemptError::Auth(format!("{status}: {body}")));
        }
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(FetchAttemptError::Retryable(format!(
                "upstream returned {status}"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchAttemptError::Fatal(format!("{status}: {body}")));
        }

        let parsed: ActivityListResponse = response
            .json()
            .await
            .map_err(|e| FetchAttemptError::Fatal(format!("malformed response: {e}")))?;
        Ok(parsed.items)
    }
}

#[async_trait]
impl RemoteLogClient for HttpLogClient {
    async fn fetch_window(
        &self,
        access_token: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawRecord>, PipelineError> {
        let result = self
            .backoff
            .retry(
                |e| matches!(e, FetchAttemptError::Retryable(_)),
                || self.request_once(access_token, start, end),
            )
            .await;

        match result {
            Ok(records) => {
                debug!(
                    count = records.len(),
                    start = %start,
                    end = %end,
                    "fetched audit records"
                );
                Ok(records)
            }
            Err(FetchAttemptError::Auth(msg)) => Err(PipelineError::Credential(msg)),
            Err(FetchAttemptError::Retryable(msg)) | Err(FetchAttemptError::Fatal(msg)) => {
                Err(PipelineError::Upstream(msg))
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_record_deserializes_full_shape() {
        let json = serde_json::json!({
            "id": "evt-123",
            "time": "2024-03-01T10:15:00Z",
            "actor": { "email": "admin@example.com", "callerIp": "10.0.0.1" },
            "events": [{
                "name": "LOGIN_SUCCESS",
                "parameters": [
                    { "name": "login_type", "value": "password" },
                    { "name": "status", "value": "SUCCESS" }
                ]
            }]
        });

        let record: RawRecord = serde_json::from_value(json).unwrap();
        assert_eq!(record.id.as_deref(), Some("evt-123"));
        assert_eq!(record.actor.email.as_deref(), Some("admin@example.com"));
        assert_eq!(record.actor.caller_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(record.events.len(), 1);
        assert_eq!(record.events[0].parameters.len(), 2);
    }

    #[test]
    fn test_raw_record_tolerates_missing_fields() {
        // Records occasionally arrive without id, actor, or events.
        let record: RawRecord = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(record.id.is_none());
        assert!(record.time.is_none());
        assert!(record.actor.email.is_none());
        assert!(record.events.is_empty());
    }

    #[test]
    fn test_response_without_items_is_empty() {
        let parsed: ActivityListResponse = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(parsed.items.is_empty());
    }

    mod against_server {
        use super::*;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        fn fast_client(uri: &str, max_retries: u32) -> HttpLogClient {
            let mut client = HttpLogClient::new(&UpstreamConfig {
                base_url: uri.to_string(),
                token_url: format!("{uri}/token"),
                max_results: 100,
            });
            client.backoff = Backoff::new(Duration::from_millis(10), max_retries);
            client
        }

        fn window() -> (DateTime<Utc>, DateTime<Utc>) {
            let end = Utc::now();
            (end - chrono::Duration::hours(1), end)
        }

        #[tokio::test]
        async fn test_fetch_retries_429_then_succeeds() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/activities"))
                .respond_with(ResponseTemplate::new(429))
                .up_to_n_times(1)
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path("/activities"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "items": [{ "id": "evt-1" }]
                })))
                .mount(&server)
                .await;

            let client = fast_client(&server.uri(), 5);
            let (start, end) = window();
            let records = client.fetch_window("token", start, end).await.unwrap();

            assert_eq!(records.len(), 1);
            assert_eq!(records[0].id.as_deref(), Some("evt-1"));
            assert_eq!(server.received_requests().await.unwrap().len(), 2);
        }

        #[tokio::test]
        async fn test_fetch_401_is_credential_error() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(401).set_body_string("invalid grant"))
                .mount(&server)
                .await;

            let client = fast_client(&server.uri(), 5);
            let (start, end) = window();
            let result = client.fetch_window("token", start, end).await;

            assert!(matches!(result, Err(PipelineError::Credential(_))));
            // Auth rejections never retry.
            assert_eq!(server.received_requests().await.unwrap().len(), 1);
        }

        #[tokio::test]
        async fn test_fetch_other_4xx_is_upstream_without_retry() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(400).set_body_string("bad query"))
                .mount(&server)
                .await;

            let client = fast_client(&server.uri(), 5);
            let (start, end) = window();
            let result = client.fetch_window("token", start, end).await;

            assert!(matches!(result, Err(PipelineError::Upstream(_))));
            assert_eq!(server.received_requests().await.unwrap().len(), 1);
        }

        #[tokio::test]
        async fn test_fetch_exhausted_5xx_is_upstream() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(503))
                .mount(&server)
                .await;

            let client = fast_client(&server.uri(), 2);
            let (start, end) = window();
            let result = client.fetch_window("token", start, end).await;

            assert!(matches!(result, Err(PipelineError::Upstream(_))));
            // 1 initial call + 2 retries
            assert_eq!(server.received_requests().await.unwrap().len(), 3);
        }
    }
}
