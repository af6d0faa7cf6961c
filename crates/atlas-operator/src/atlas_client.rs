//! Atlas Admin API client
//!
//! A thin JSON client bound to one Admin API version. Handlers talk to
//! [`AtlasApi`] only, so tests swap in an in-memory fake and dry-run mode
//! wraps the real client in a recorder.

use crate::connection::Credentials;
use crate::dispatch::ApiVersion;
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, instrument, warn};

/// Default timeout of a single request
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Error bodies are truncated to this many bytes
const MAX_ERROR_BODY_BYTES: usize = 4096;

/// Path of the versioned Admin API below the Atlas domain
const API_PREFIX: &str = "api/atlas/v2";

/// Error reported by the Admin API, or a transport failure (`status == 0`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: u16,
    pub error_code: Option<String>,
    pub detail: String,
}

impl ApiError {
    pub fn new(status: u16, error_code: Option<String>, detail: impl Into<String>) -> Self {
        Self {
            status,
            error_code,
            detail: detail.into(),
        }
    }

    /// Request never produced a response
    pub fn transport(detail: impl Into<String>) -> Self {
        Self::new(0, None, detail)
    }

    /// Network failures, rate limiting and server errors
    pub fn is_transient(&self) -> bool {
        self.status == 0 || self.status == 429 || self.status >= 500
    }

    pub fn is_not_found(&self) -> bool {
        self.status == 404
            || self
                .error_code
                .as_deref()
                .is_some_and(|code| code.ends_with("_NOT_FOUND"))
    }

    /// Terminal "not available in this environment" responses
    pub fn is_unsupported_feature(&self) -> bool {
        self.error_code
            .as_deref()
            .is_some_and(|code| code.contains("UNSUPPORTED"))
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.status, &self.error_code) {
            (0, _) => write!(f, "Atlas API request failed: {}", self.detail),
            (status, Some(code)) => write!(f, "Atlas API error {} ({}): {}", status, code, self.detail),
            (status, None) => write!(f, "Atlas API error {}: {}", status, self.detail),
        }
    }
}

impl std::error::Error for ApiError {}

/// Whether an operator error is a not-found answer from Atlas
pub fn is_not_found(error: &OperatorError) -> bool {
    matches!(error, OperatorError::AtlasApi(e) if e.is_not_found())
}

/// JSON access to the Admin API, bound to one API version.
///
/// Paths are relative to the versioned API root, e.g. `/groups/{id}`.
#[async_trait]
pub trait AtlasApi: Send + Sync {
    fn version(&self) -> ApiVersion;

    async fn get(&self, path: &str) -> Result<Value>;

    async fn post(&self, path: &str, body: &Value) -> Result<Value>;

    async fn patch(&self, path: &str, body: &Value) -> Result<Value>;

    async fn put(&self, path: &str, body: &Value) -> Result<Value>;

    async fn delete(&self, path: &str) -> Result<()>;
}

/// Builds a client for one set of credentials and one API version.
///
/// `regarding` is the object the client acts for; recorders attach events to it.
pub trait ClientFactory: Send + Sync {
    fn client(
        &self,
        credentials: &Credentials,
        version: ApiVersion,
        regarding: &ObjectReference,
    ) -> Result<Arc<dyn AtlasApi>>;
}

/// Configuration of the HTTP client
#[derive(Debug, Clone)]
pub struct AtlasClientConfig {
    /// Atlas domain, e.g. `https://cloud.mongodb.com/`
    pub domain: String,
    /// Timeout applied to every request
    pub request_timeout: Duration,
    /// Maximum retry attempts for transient failures
    pub max_retries: u32,
    /// Backoff before the first retry, doubled for each further attempt
    pub retry_backoff: Duration,
}

impl Default for AtlasClientConfig {
    fn default() -> Self {
        Self {
            domain: "https://cloud.mongodb.com/".to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

impl AtlasClientConfig {
    /// Root URL of the versioned Admin API
    pub fn base_url(&self) -> String {
        format!("{}/{}", self.domain.trim_end_matches('/'), API_PREFIX)
    }
}

/// [`ClientFactory`] producing [`HttpAtlasClient`]s over a shared connection pool
pub struct HttpClientFactory {
    config: AtlasClientConfig,
    http: reqwest::Client,
}

impl HttpClientFactory {
    pub fn new(config: AtlasClientConfig) -> Result<Self> {
        if config.domain.starts_with("http://")
            && !config.domain.contains("localhost")
            && !config.domain.contains("127.0.0.1")
        {
            warn!(domain = %config.domain, "Atlas domain uses plain HTTP, API keys are sent in cleartext");
        }

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| OperatorError::InvalidConfig(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, http })
    }
}

impl ClientFactory for HttpClientFactory {
    fn client(
        &self,
        credentials: &Credentials,
        version: ApiVersion,
        _regarding: &ObjectReference,
    ) -> Result<Arc<dyn AtlasApi>> {
        Ok(Arc::new(HttpAtlasClient {
            http: self.http.clone(),
            base_url: self.config.base_url(),
            credentials: credentials.clone(),
            version,
            request_timeout: self.config.request_timeout,
            max_retries: self.config.max_retries,
            retry_backoff: self.config.retry_backoff,
        }))
    }
}

/// Admin API client over HTTPS
pub struct HttpAtlasClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Credentials,
    version: ApiVersion,
    request_timeout: Duration,
    max_retries: u32,
    retry_backoff: Duration,
}

impl fmt::Debug for HttpAtlasClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpAtlasClient")
            .field("base_url", &self.base_url)
            .field("version", &self.version)
            .field("credentials", &self.credentials)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// Decode an Admin API error response
pub(crate) fn api_error_from_body(status: u16, body: &[u8]) -> ApiError {
    let body = if body.len() > MAX_ERROR_BODY_BYTES {
        &body[..MAX_ERROR_BODY_BYTES]
    } else {
        body
    };
    match serde_json::from_slice::<ErrorBody>(body) {
        Ok(parsed) => ApiError::new(
            status,
            parsed.error_code,
            parsed
                .detail
                .or(parsed.reason)
                .unwrap_or_else(|| format!("HTTP {}", status)),
        ),
        Err(_) => {
            let text = String::from_utf8_lossy(body).trim().to_string();
            ApiError::new(
                status,
                None,
                if text.is_empty() {
                    format!("HTTP {}", status)
                } else {
                    text
                },
            )
        }
    }
}

/// Answer a digest challenge of the Admin API.
///
/// `uri` is the request target (path and query) the header is computed for.
pub(crate) fn digest_authorization(
    challenge: &str,
    credentials: &Credentials,
    method: &reqwest::Method,
    uri: &str,
    body: Option<&[u8]>,
) -> std::result::Result<String, ApiError> {
    let mut prompt = digest_auth::parse(challenge)
        .map_err(|e| ApiError::new(401, None, format!("invalid digest challenge: {e}")))?;
    let context = digest_auth::AuthContext::new_with_method(
        credentials.public_key.as_str(),
        credentials.private_key.expose_secret(),
        uri,
        body,
        digest_auth::HttpMethod::from(method.as_str()),
    );
    prompt
        .respond(&context)
        .map(|answer| answer.to_header_string())
        .map_err(|e| ApiError::new(401, None, format!("cannot answer digest challenge: {e}")))
}

impl HttpAtlasClient {
    async fn execute(
        &self,
        method: &reqwest::Method,
        url: &reqwest::Url,
        body: Option<&[u8]>,
        authorization: Option<&str>,
    ) -> std::result::Result<reqwest::Response, ApiError> {
        let mut request = self
            .http
            .request(method.clone(), url.clone())
            .header(reqwest::header::ACCEPT, self.version.media_type());
        if let Some(authorization) = authorization {
            request = request.header(reqwest::header::AUTHORIZATION, authorization);
        }
        if let Some(body) = body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, self.version.media_type())
                .body(body.to_vec());
        }

        timeout(self.request_timeout, request.send())
            .await
            .map_err(|_| ApiError::transport(format!("{} {} timed out", method, url.path())))?
            .map_err(|e| ApiError::transport(e.to_string()))
    }

    /// One request, answering the digest challenge of the first attempt
    async fn send_once(
        &self,
        method: &reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> std::result::Result<Value, ApiError> {
        let url = reqwest::Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|e| ApiError::new(400, None, format!("invalid URL for {}: {e}", path)))?;
        let body = body
            .map(serde_json::to_vec)
            .transpose()
            .map_err(|e| ApiError::new(400, None, format!("cannot encode request body: {e}")))?;

        let mut response = self.execute(method, &url, body.as_deref(), None).await?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(reqwest::header::WWW_AUTHENTICATE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            if let Some(challenge) = challenge {
                let uri = match url.query() {
                    Some(query) => format!("{}?{}", url.path(), query),
                    None => url.path().to_string(),
                };
                let authorization =
                    digest_authorization(&challenge, &self.credentials, method, &uri, body.as_deref())?;
                response = self
                    .execute(method, &url, body.as_deref(), Some(&authorization))
                    .await?;
            }
        }

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ApiError::transport(e.to_string()))?;

        if !status.is_success() {
            return Err(api_error_from_body(status.as_u16(), &bytes));
        }
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| ApiError::new(status.as_u16(), None, format!("malformed response: {e}")))
    }

    #[instrument(skip(self, body), fields(version = %self.version))]
    async fn send(&self, method: reqwest::Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let mut attempt = 0;
        loop {
            match self.send_once(&method, path, body).await {
                Ok(value) => {
                    debug!(%method, path, "Atlas request succeeded");
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = self.retry_backoff * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    warn!(
                        %method,
                        path,
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Transient Atlas error, retrying"
                    );
                    sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl AtlasApi for HttpAtlasClient {
    fn version(&self) -> ApiVersion {
        self.version
    }

    async fn get(&self, path: &str) -> Result<Value> {
        self.send(reqwest::Method::GET, path, None).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        self.send(reqwest::Method::POST, path, Some(body)).await
    }

    async fn patch(&self, path: &str, body: &Value) -> Result<Value> {
        self.send(reqwest::Method::PATCH, path, Some(body)).await
    }

    async fn put(&self, path: &str, body: &Value) -> Result<Value> {
        self.send(reqwest::Method::PUT, path, Some(body)).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.send(reqwest::Method::DELETE, path, None).await.map(|_| ())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_decoding() {
        let body = br#"{"detail":"Feature not supported in this environment.","error":400,"errorCode":"FEATURE_UNSUPPORTED","reason":"Bad Request"}"#;
        let err = api_error_from_body(400, body);
        assert_eq!(err.error_code.as_deref(), Some("FEATURE_UNSUPPORTED"));
        assert_eq!(err.detail, "Feature not supported in this environment.");
        assert!(err.is_unsupported_feature());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_non_json_error_body() {
        let err = api_error_from_body(502, b"Bad Gateway");
        assert_eq!(err.detail, "Bad Gateway");
        assert!(err.is_transient());

        let err = api_error_from_body(500, b"");
        assert_eq!(err.detail, "HTTP 500");
    }

    #[test]
    fn test_not_found_classification() {
        assert!(ApiError::new(404, None, "gone").is_not_found());
        assert!(ApiError::new(400, Some("GROUP_NOT_FOUND".into()), "gone").is_not_found());
        assert!(!ApiError::new(400, Some("INVALID_ATTRIBUTE".into()), "bad").is_not_found());

        let err: OperatorError = ApiError::new(404, None, "gone").into();
        assert!(is_not_found(&err));
        assert!(!is_not_found(&OperatorError::Internal("x".into())));
    }

    #[test]
    fn test_transient_classification() {
        assert!(ApiError::transport("connection reset").is_transient());
        assert!(ApiError::new(429, Some("RATE_LIMITED".into()), "slow down").is_transient());
        assert!(ApiError::new(503, None, "unavailable").is_transient());
        assert!(!ApiError::new(409, None, "conflict").is_transient());
    }

    #[test]
    fn test_display() {
        let err = ApiError::new(400, Some("INVALID_ATTRIBUTE".into()), "name is invalid");
        assert_eq!(err.to_string(), "Atlas API error 400 (INVALID_ATTRIBUTE): name is invalid");
        assert_eq!(
            ApiError::transport("dns error").to_string(),
            "Atlas API request failed: dns error"
        );
    }

    #[test]
    fn test_base_url() {
        let config = AtlasClientConfig::default();
        assert_eq!(config.base_url(), "https://cloud.mongodb.com/api/atlas/v2");

        let config = AtlasClientConfig {
            domain: "https://cloud-qa.mongodb.com".to_string(),
            ..Default::default()
        };
        assert_eq!(config.base_url(), "https://cloud-qa.mongodb.com/api/atlas/v2");
    }

    fn credentials() -> Credentials {
        Credentials {
            org_id: "o".into(),
            public_key: "pub-key".into(),
            private_key: secrecy::SecretString::from("priv-key".to_string()),
            source: "ns/s".into(),
        }
    }

    const CHALLENGE: &str =
        r#"Digest realm="MMS Public API", domain="", nonce="4o3vNZJm8xPEBqdq", algorithm=MD5, qop="auth", stale=false"#;

    /// Serves `requests` HTTP requests; only digest-signed ones succeed
    async fn digest_server(
        requests: usize,
    ) -> (String, tokio::task::JoinHandle<Vec<Option<String>>>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let domain = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..requests {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut raw = Vec::new();
                let mut buf = [0u8; 1024];
                while !raw.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    raw.extend_from_slice(&buf[..n]);
                }
                let head = String::from_utf8_lossy(&raw).to_string();
                let authorization = head
                    .lines()
                    .find(|line| line.to_ascii_lowercase().starts_with("authorization:"))
                    .map(|line| line["authorization:".len()..].trim().to_string());
                let response = match &authorization {
                    Some(_) => {
                        let body = r#"{"id":"g1"}"#;
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        )
                    }
                    None => format!(
                        "HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                        CHALLENGE
                    ),
                };
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
                seen.push(authorization);
            }
            seen
        });
        (domain, handle)
    }

    #[test]
    fn test_digest_authorization_header() {
        let header = digest_authorization(
            CHALLENGE,
            &credentials(),
            &reqwest::Method::GET,
            "/api/atlas/v2/groups/g1",
            None,
        )
        .unwrap();
        assert!(header.starts_with("Digest "));
        assert!(header.contains(r#"username="pub-key""#));
        assert!(header.contains(r#"uri="/api/atlas/v2/groups/g1""#));
        assert!(header.contains("response="));
        assert!(!header.contains("priv-key"));

        let err = digest_authorization(
            "Basic realm=\"x\"",
            &credentials(),
            &reqwest::Method::GET,
            "/",
            None,
        )
        .unwrap_err();
        assert_eq!(err.status, 401);
    }

    #[tokio::test]
    async fn test_client_answers_digest_challenge() {
        let (domain, server) = digest_server(2).await;
        let factory = HttpClientFactory::new(AtlasClientConfig {
            domain,
            ..Default::default()
        })
        .unwrap();
        let client = factory
            .client(&credentials(), ApiVersion::V20250312, &ObjectReference::default())
            .unwrap();

        let group = client.get("/groups/g1").await.unwrap();
        assert_eq!(group["id"], "g1");

        let seen = server.await.unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].is_none());
        let authorization = seen[1].as_deref().unwrap();
        assert!(authorization.starts_with("Digest "));
        assert!(authorization.contains(r#"uri="/api/atlas/v2/groups/g1""#));
    }

    #[test]
    fn test_factory_builds_client() {
        let factory = HttpClientFactory::new(AtlasClientConfig::default()).unwrap();
        let creds = Credentials {
            org_id: "o".into(),
            public_key: "p".into(),
            private_key: secrecy::SecretString::from("k".to_string()),
            source: "ns/s".into(),
        };
        let client = factory
            .client(&creds, ApiVersion::V20250312, &ObjectReference::default())
            .unwrap();
        assert_eq!(client.version(), ApiVersion::V20250312);
    }
}
