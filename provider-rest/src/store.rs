//! `RemoteStore` over the REST API

use async_trait::async_trait;
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
use bridge_traits::{RecordKey, RemoteChangeStream, RemoteRecord, RemoteStore, WriteOutcome};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::error::{RestStoreError, Result};
use crate::types::{etag_for, parse_etag, RecordEnvelope, VersionBody, WriteBody};

/// Default per-request timeout
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection settings
#[derive(Debug, Clone)]
pub struct RestStoreConfig {
    /// API root, e.g. `https://sync.example.com/v1`
    pub base_url: String,
    pub bearer_token: Option<String>,
    pub request_timeout: Duration,
}

impl RestStoreConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            bearer_token: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Household records over HTTP with `If-Match` preconditions.
///
/// # Example
///
/// ```ignore
/// use provider_rest::{RestRemoteStore, RestStoreConfig};
///
/// let store = RestRemoteStore::new(
///     http_client,
///     RestStoreConfig::new("https://sync.example.com/v1").bearer_token(token),
/// )?;
/// let record = store.read_current_version(&key).await?;
/// ```
pub struct RestRemoteStore {
    http_client: Arc<dyn HttpClient>,
    base_url: String,
    bearer_token: Option<String>,
    request_timeout: Duration,
}

impl RestRemoteStore {
    pub fn new(http_client: Arc<dyn HttpClient>, config: RestStoreConfig) -> Result<Self> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(RestStoreError::Config(format!(
                "base URL must start with http:// or https://, got '{}'",
                config.base_url
            )));
        }

        Ok(Self {
            http_client,
            base_url,
            bearer_token: config.bearer_token,
            request_timeout: config.request_timeout,
        })
    }

    /// URL of one record
    pub fn record_url(&self, key: &RecordKey) -> String {
        format!(
            "{}/households/{}/{}/{}",
            self.base_url,
            urlencoding::encode(&key.household_id),
            urlencoding::encode(&key.entity_type),
            urlencoding::encode(&key.entity_id)
        )
    }

    fn request(&self, method: HttpMethod, key: &RecordKey) -> HttpRequest {
        let request = HttpRequest::new(method, self.record_url(key))
            .header("Accept", "application/json")
            .timeout(self.request_timeout);

        match &self.bearer_token {
            Some(token) => request.bearer_token(token.as_str()),
            None => request,
        }
    }

    /// Decode the current record a `409`/`412` response carries, if any.
    fn mismatch_record(response: &HttpResponse) -> Result<Option<RemoteRecord>> {
        if response.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        let envelope: Option<RecordEnvelope> = serde_json::from_slice(&response.body)
            .map_err(|e| RestStoreError::ParseError(e.to_string()))?;
        Ok(envelope.map(RemoteRecord::from))
    }

    /// Version assigned by a successful write: body first, then `ETag`.
    fn applied_version(response: &HttpResponse, fallback: u64) -> u64 {
        if let Ok(body) = serde_json::from_slice::<VersionBody>(&response.body) {
            return body.version;
        }
        if let Some(version) = response.header("ETag").and_then(parse_etag) {
            return version;
        }

        debug!(fallback, "Response carried no version; assuming the next one");
        fallback
    }

    fn status_error(response: &HttpResponse) -> RestStoreError {
        RestStoreError::from_status(
            response.status,
            &response.body,
            response.header("Retry-After"),
        )
    }
}

#[async_trait]
impl RemoteStore for RestRemoteStore {
    #[instrument(skip(self), fields(key = %key))]
    async fn read_current_version(&self, key: &RecordKey) -> BridgeResult<Option<RemoteRecord>> {
        let response = self
            .http_client
            .execute(self.request(HttpMethod::Get, key))
            .await?;

        match response.status {
            200 => {
                let envelope: RecordEnvelope = response.json()?;
                Ok(Some(envelope.into()))
            }
            404 => Ok(None),
            _ => {
                warn!(status = response.status, "Read failed");
                Err(Self::status_error(&response).into())
            }
        }
    }

    #[instrument(skip(self, payload), fields(key = %key))]
    async fn write_if_version_matches(
        &self,
        key: &RecordKey,
        expected_version: Option<u64>,
        payload: &Value,
    ) -> BridgeResult<WriteOutcome> {
        let request = self
            .request(HttpMethod::Put, key)
            .json(&WriteBody { payload })?;
        let request = match expected_version {
            Some(version) => request.header("If-Match", etag_for(version)),
            None => request.header("If-None-Match", "*"),
        };

        let response = self.http_client.execute(request).await?;

        match response.status {
            200 | 201 => {
                let fallback = expected_version.map(|v| v + 1).unwrap_or(1);
                let new_version = Self::applied_version(&response, fallback);
                debug!(new_version, "Write applied");
                Ok(WriteOutcome::Applied { new_version })
            }
            409 | 412 => {
                let current = Self::mismatch_record(&response)?;
                debug!(
                    expected = ?expected_version,
                    actual = ?current.as_ref().map(|r| r.version),
                    "Write precondition failed"
                );
                Ok(WriteOutcome::VersionMismatch { current })
            }
            // Conditional update of a record that no longer exists
            404 if expected_version.is_some() => Ok(WriteOutcome::VersionMismatch { current: None }),
            _ => {
                warn!(status = response.status, "Write failed");
                Err(Self::status_error(&response).into())
            }
        }
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn delete_if_version_matches(
        &self,
        key: &RecordKey,
        expected_version: Option<u64>,
    ) -> BridgeResult<WriteOutcome> {
        let Some(expected) = expected_version else {
            // An unversioned delete can only match an absent record, which
            // there is nothing to delete for.
            let current = self.read_current_version(key).await?;
            return Ok(WriteOutcome::VersionMismatch { current });
        };

        let request = self
            .request(HttpMethod::Delete, key)
            .header("If-Match", etag_for(expected));
        let response = self.http_client.execute(request).await?;

        match response.status {
            200 | 202 | 204 => Ok(WriteOutcome::Applied {
                new_version: Self::applied_version(&response, expected + 1),
            }),
            409 | 412 => Ok(WriteOutcome::VersionMismatch {
                current: Self::mismatch_record(&response)?,
            }),
            404 => Ok(WriteOutcome::VersionMismatch { current: None }),
            _ => {
                warn!(status = response.status, "Delete failed");
                Err(Self::status_error(&response).into())
            }
        }
    }

    async fn subscribe_changes(&self) -> BridgeResult<Option<Box<dyn RemoteChangeStream>>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::BridgeError;
    use bytes::Bytes;
    use mockall::mock;
    use serde_json::json;
    use std::collections::HashMap;

    mock! {
        HttpClient {}

        #[async_trait]
        impl HttpClient for HttpClient {
            async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse>;
        }
    }

    fn response(status: u16, body: &str) -> HttpResponse {
        HttpResponse {
            status,
            headers: HashMap::new(),
            body: Bytes::from(body.to_string()),
        }
    }

    fn store(http: MockHttpClient) -> RestRemoteStore {
        RestRemoteStore::new(
            Arc::new(http),
            RestStoreConfig::new("https://sync.example.com/v1/").bearer_token("t0k3n"),
        )
        .unwrap()
    }

    fn key() -> RecordKey {
        RecordKey::new("hh 1", "asset", "A1")
    }

    #[test]
    fn test_rejects_non_http_base_url() {
        let result = RestRemoteStore::new(
            Arc::new(MockHttpClient::new()),
            RestStoreConfig::new("ftp://example.com"),
        );
        assert!(matches!(result, Err(RestStoreError::Config(_))));
    }

    #[test]
    fn test_record_url_encodes_segments() {
        let store = store(MockHttpClient::new());
        assert_eq!(
            store.record_url(&key()),
            "https://sync.example.com/v1/households/hh%201/asset/A1"
        );
    }

    #[tokio::test]
    async fn test_read_found_and_absent() {
        let mut http = MockHttpClient::new();
        let mut calls = 0;
        http.expect_execute().times(2).returning(move |req| {
            assert_eq!(req.method, HttpMethod::Get);
            assert_eq!(
                req.headers.get("Authorization"),
                Some(&"Bearer t0k3n".to_string())
            );
            calls += 1;
            if calls == 1 {
                Ok(response(
                    200,
                    r#"{"version":4,"payload":{"name":"Car"},"updatedAt":"2024-06-01T12:00:00Z"}"#,
                ))
            } else {
                Ok(response(404, ""))
            }
        });
        let store = store(http);

        let record = store.read_current_version(&key()).await.unwrap().unwrap();
        assert_eq!(record.version, 4);
        assert_eq!(record.payload, json!({ "name": "Car" }));

        assert!(store.read_current_version(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_uses_if_none_match() {
        let mut http = MockHttpClient::new();
        http.expect_execute().times(1).returning(|req| {
            assert_eq!(req.method, HttpMethod::Put);
            assert_eq!(req.headers.get("If-None-Match"), Some(&"*".to_string()));
            assert!(!req.headers.contains_key("If-Match"));

            let body: Value = serde_json::from_slice(req.body.as_ref().unwrap()).unwrap();
            assert_eq!(body, json!({ "payload": { "amount": 42 } }));

            Ok(response(201, r#"{"version":1}"#))
        });

        let outcome = store(http)
            .write_if_version_matches(&key(), None, &json!({ "amount": 42 }))
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Applied { new_version: 1 });
    }

    #[tokio::test]
    async fn test_update_sends_if_match_and_reads_etag() {
        let mut http = MockHttpClient::new();
        http.expect_execute().times(1).returning(|req| {
            assert_eq!(req.headers.get("If-Match"), Some(&"\"3\"".to_string()));
            let mut reply = response(200, "");
            reply
                .headers
                .insert("etag".to_string(), "\"4\"".to_string());
            Ok(reply)
        });

        let outcome = store(http)
            .write_if_version_matches(&key(), Some(3), &json!({}))
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Applied { new_version: 4 });
    }

    #[tokio::test]
    async fn test_precondition_failed_is_mismatch() {
        let mut http = MockHttpClient::new();
        http.expect_execute().times(1).returning(|_| {
            Ok(response(
                412,
                r#"{"version":4,"payload":{"name":"Boat"},"updatedAt":"2024-06-01T12:00:00Z"}"#,
            ))
        });

        match store(http)
            .write_if_version_matches(&key(), Some(3), &json!({}))
            .await
            .unwrap()
        {
            WriteOutcome::VersionMismatch {
                current: Some(record),
            } => {
                assert_eq!(record.version, 4);
                assert_eq!(record.payload, json!({ "name": "Boat" }));
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_status_classification_on_write() {
        let mut http = MockHttpClient::new();
        let mut calls = 0;
        http.expect_execute().times(2).returning(move |_| {
            calls += 1;
            Ok(if calls == 1 {
                response(503, "maintenance")
            } else {
                response(403, "forbidden")
            })
        });
        let store = store(http);

        let transient = store
            .write_if_version_matches(&key(), Some(1), &json!({}))
            .await
            .unwrap_err();
        assert!(transient.is_transient());

        let rejected = store
            .write_if_version_matches(&key(), Some(1), &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(rejected, BridgeError::Rejected { status: 403, .. }));
    }

    #[tokio::test]
    async fn test_transport_errors_pass_through() {
        let mut http = MockHttpClient::new();
        http.expect_execute()
            .times(1)
            .returning(|_| Err(BridgeError::Network("connection reset".to_string())));

        let err = store(http).read_current_version(&key()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_delete() {
        let mut http = MockHttpClient::new();
        let mut calls = 0;
        http.expect_execute().times(2).returning(move |req| {
            assert_eq!(req.method, HttpMethod::Delete);
            assert_eq!(req.headers.get("If-Match"), Some(&"\"2\"".to_string()));
            calls += 1;
            Ok(if calls == 1 {
                response(204, "")
            } else {
                response(404, "")
            })
        });
        let store = store(http);

        assert_eq!(
            store.delete_if_version_matches(&key(), Some(2)).await.unwrap(),
            WriteOutcome::Applied { new_version: 3 }
        );
        assert_eq!(
            store.delete_if_version_matches(&key(), Some(2)).await.unwrap(),
            WriteOutcome::VersionMismatch { current: None }
        );
    }

    #[tokio::test]
    async fn test_no_change_feed() {
        let store = store(MockHttpClient::new());
        assert!(store.subscribe_changes().await.unwrap().is_none());
    }
}
