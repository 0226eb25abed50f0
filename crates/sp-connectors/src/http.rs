//! HTTP client shared by all integrations.
//!
//! Wraps `reqwest` with base URL joining, instance authentication, optional
//! rate limiting, bounded retries and the status-to-error mapping every vendor
//! adapter relies on.

use crate::secure_string::SecureString;
use crate::traits::{AuthConfig, ConnectorConfig, ConnectorError, ConnectorResult};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{debug, info, warn};

type RateLimiterType = GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Authenticated HTTP client for one integration instance.
pub struct HttpClient {
    client: Client,
    config: ConnectorConfig,
    oauth_token: Arc<RwLock<Option<OAuthToken>>>,
    rate_limiter: Option<Arc<RateLimiterType>>,
}

#[derive(Clone)]
struct OAuthToken {
    access_token: SecureString,
    expires_at: Instant,
}

/// Client-side request budget.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub period: Duration,
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            period: Duration::from_secs(60),
            burst_size: 10,
        }
    }
}

/// Whether a response status is mapped to an error before it is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusPolicy {
    Checked,
    Unchecked,
}

impl HttpClient {
    pub fn new(config: ConnectorConfig) -> ConnectorResult<Self> {
        Self::with_rate_limit(config, None)
    }

    /// Creates a client that waits on a `governor` quota before each request.
    pub fn with_rate_limit(
        config: ConnectorConfig,
        rate_limit: Option<RateLimitConfig>,
    ) -> ConnectorResult<Self> {
        if !config.verify_tls {
            warn!(
                base_url = %config.base_url,
                instance = %config.name,
                "TLS certificate verification disabled for this instance"
            );
        }

        let mut headers = reqwest::header::HeaderMap::new();
        for (key, value) in &config.headers {
            let name = reqwest::header::HeaderName::try_from(key.as_str())
                .map_err(|e| ConnectorError::ConfigError(format!("header {}: {}", key, e)))?;
            let value = reqwest::header::HeaderValue::try_from(value.as_str())
                .map_err(|e| ConnectorError::ConfigError(format!("header {}: {}", key, e)))?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(!config.verify_tls)
            .default_headers(headers)
            .build()
            .map_err(|e| ConnectorError::ConfigError(e.to_string()))?;

        let rate_limiter = match rate_limit {
            Some(rl) => {
                let per_request = rl.period / rl.max_requests.max(1);
                let quota = Quota::with_period(per_request)
                    .ok_or_else(|| {
                        ConnectorError::ConfigError("rate limit period must be non-zero".into())
                    })?
                    .allow_burst(NonZeroU32::new(rl.burst_size).unwrap_or(NonZeroU32::MIN));
                Some(Arc::new(GovernorRateLimiter::direct(quota)))
            }
            None => None,
        };

        Ok(Self {
            client,
            config,
            oauth_token: Arc::new(RwLock::new(None)),
            rate_limiter,
        })
    }

    /// Joins a path to the base URL. Absolute URLs are returned unchanged.
    pub fn build_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.config.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            return base.to_string();
        }
        format!("{}/{}", base, path)
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Starts a request; finish it with [`send`](Self::send) or
    /// [`send_unchecked`](Self::send_unchecked).
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, self.build_url(path))
    }

    /// Sends a request and maps non-success statuses to errors.
    pub async fn send(&self, request: RequestBuilder) -> ConnectorResult<Response> {
        self.execute_with_retry(request, StatusPolicy::Checked).await
    }

    /// Sends a request and returns the response whatever its status.
    ///
    /// Transport failures still error. Used by vendors whose error messages
    /// depend on the status code and body.
    pub async fn send_unchecked(&self, request: RequestBuilder) -> ConnectorResult<Response> {
        self.execute_with_retry(request, StatusPolicy::Unchecked).await
    }

    /// Sends a request and decodes the JSON body.
    pub async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> ConnectorResult<T> {
        let response = self.send(request).await?;
        Self::parse_json(response).await
    }

    pub async fn get(&self, path: &str) -> ConnectorResult<Response> {
        self.send(self.request(Method::GET, path)).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> ConnectorResult<T> {
        self.send_json(self.request(Method::GET, path)).await
    }

    pub async fn get_json_with_query<T, Q>(&self, path: &str, query: &Q) -> ConnectorResult<T>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        self.send_json(self.request(Method::GET, path).query(query)).await
    }

    pub async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> ConnectorResult<Response> {
        self.send(self.request(Method::POST, path).json(body)).await
    }

    pub async fn post_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &T,
    ) -> ConnectorResult<R> {
        self.send_json(self.request(Method::POST, path).json(body)).await
    }

    /// POSTs an `application/x-www-form-urlencoded` body.
    pub async fn post_form<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        path: &str,
        form: &T,
    ) -> ConnectorResult<R> {
        self.send_json(self.request(Method::POST, path).form(form)).await
    }

    pub async fn put_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &T,
    ) -> ConnectorResult<R> {
        self.send_json(self.request(Method::PUT, path).json(body)).await
    }

    pub async fn patch_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &T,
    ) -> ConnectorResult<R> {
        self.send_json(self.request(Method::PATCH, path).json(body)).await
    }

    pub async fn delete(&self, path: &str) -> ConnectorResult<Response> {
        self.send(self.request(Method::DELETE, path)).await
    }

    /// Decodes a JSON body, reporting the start of the body on failure.
    pub async fn parse_json<T: DeserializeOwned>(response: Response) -> ConnectorResult<T> {
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ConnectorError::InvalidResponse(e.to_string()))?;

        serde_json::from_str(&text).map_err(|e| {
            ConnectorError::InvalidResponse(format!(
                "Failed to parse response (status {}): {} - Body: {}",
                status,
                e,
                text.chars().take(500).collect::<String>()
            ))
        })
    }

    async fn execute_with_retry(
        &self,
        request: RequestBuilder,
        policy: StatusPolicy,
    ) -> ConnectorResult<Response> {
        if let Some(limiter) = &self.rate_limiter {
            limiter.until_ready().await;
        }

        let request = self.add_auth(request).await?;

        let mut last_error = None;
        let mut delay = Duration::from_millis(100);

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                debug!(attempt, ?delay, "Retrying request");
                sleep(delay).await;
                delay = std::cmp::min(delay * 2 + backoff_jitter(), Duration::from_secs(30));
            }

            let request_clone = request
                .try_clone()
                .ok_or_else(|| ConnectorError::Internal("Failed to clone request".to_string()))?;

            let response = match request_clone.send().await {
                Ok(response) => response,
                Err(e) => {
                    last_error = Some(transport_error(e));
                    continue;
                }
            };

            let status = response.status();
            let retries_left = attempt < self.config.max_retries;

            if status == StatusCode::TOO_MANY_REQUESTS && retries_left {
                let retry_after = retry_after_secs(&response);
                warn!(retry_after, "Rate limited, waiting before retry");
                sleep(Duration::from_secs(retry_after)).await;
                continue;
            }

            if status.is_server_error() && retries_left {
                warn!(%status, "Server error, retrying");
                last_error = Some(ConnectorError::Api {
                    status: status.as_u16(),
                    body: String::new(),
                });
                continue;
            }

            return match policy {
                StatusPolicy::Unchecked => Ok(response),
                StatusPolicy::Checked => check_status(response).await,
            };
        }

        Err(last_error.unwrap_or_else(|| ConnectorError::Internal("Unknown error".to_string())))
    }

    async fn add_auth(&self, request: RequestBuilder) -> ConnectorResult<RequestBuilder> {
        match &self.config.auth {
            AuthConfig::None => Ok(request),

            AuthConfig::ApiKey { key, header_name } => {
                Ok(request.header(header_name.as_str(), key.expose_secret()))
            }

            AuthConfig::Basic { username, password } => {
                Ok(request.basic_auth(username, Some(password.expose_secret())))
            }

            AuthConfig::OAuth2 {
                client_id,
                client_secret,
                token_url,
                scopes,
            } => {
                let token = self
                    .get_oauth_token(client_id, client_secret, token_url, scopes)
                    .await?;
                Ok(request.bearer_auth(token.expose_secret()))
            }
        }
    }

    /// Returns the cached client-credentials token, fetching a new one when it
    /// is missing or within a minute of expiry.
    async fn get_oauth_token(
        &self,
        client_id: &str,
        client_secret: &SecureString,
        token_url: &str,
        scopes: &[String],
    ) -> ConnectorResult<SecureString> {
        {
            let token = self.oauth_token.read().await;
            if let Some(t) = &*token {
                if t.expires_at > Instant::now() + Duration::from_secs(60) {
                    return Ok(t.access_token.clone());
                }
            }
        }

        info!(instance = %self.config.name, "Fetching new OAuth2 token");

        let scope = scopes.join(" ");
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", client_id),
            ("client_secret", client_secret.expose_secret()),
            ("scope", scope.as_str()),
        ];

        let response = self
            .client
            .post(token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| ConnectorError::AuthenticationFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectorError::AuthenticationFailed(format!(
                "OAuth2 token request failed: {} {}",
                status, body
            )));
        }

        #[derive(serde::Deserialize)]
        struct TokenResponse {
            access_token: String,
            #[serde(default = "default_expires_in")]
            expires_in: u64,
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| ConnectorError::InvalidResponse(e.to_string()))?;

        let access_token = SecureString::new(token_response.access_token);
        *self.oauth_token.write().await = Some(OAuthToken {
            access_token: access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(token_response.expires_in),
        });

        Ok(access_token)
    }
}

fn default_expires_in() -> u64 {
    3600
}

fn transport_error(e: reqwest::Error) -> ConnectorError {
    if e.is_timeout() {
        ConnectorError::Timeout(e.to_string())
    } else if e.is_connect() {
        ConnectorError::ConnectionFailed(e.to_string())
    } else {
        ConnectorError::RequestFailed(e.to_string())
    }
}

fn retry_after_secs(response: &Response) -> u64 {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(60)
}

/// Maps a non-success status to the matching [`ConnectorError`].
async fn check_status(response: Response) -> ConnectorResult<Response> {
    let status = response.status();
    if status.is_success() || status.is_redirection() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ConnectorError::RateLimited(retry_after_secs(&response)));
    }

    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED => ConnectorError::AuthenticationFailed(if body.is_empty() {
            "Unauthorized".to_string()
        } else {
            body
        }),
        StatusCode::FORBIDDEN => ConnectorError::AuthorizationDenied(if body.is_empty() {
            "Forbidden".to_string()
        } else {
            body
        }),
        StatusCode::NOT_FOUND => ConnectorError::NotFound(if body.is_empty() {
            "Resource not found".to_string()
        } else {
            body
        }),
        _ => ConnectorError::Api {
            status: status.as_u16(),
            body,
        },
    })
}

fn backoff_jitter() -> Duration {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    Instant::now().hash(&mut hasher);
    Duration::from_millis(hasher.finish() % 100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_connector_config;

    #[test]
    fn test_build_url() {
        let client = HttpClient::new(test_connector_config("test", "https://api.example.com/")).unwrap();

        assert_eq!(
            client.build_url("/api/v1/resource"),
            "https://api.example.com/api/v1/resource"
        );
        assert_eq!(
            client.build_url("api/v1/resource"),
            "https://api.example.com/api/v1/resource"
        );
        assert_eq!(client.build_url(""), "https://api.example.com");
        assert_eq!(
            client.build_url("https://other.example.com/x"),
            "https://other.example.com/x"
        );
    }

    #[test]
    fn test_rate_limited_client() {
        let client = HttpClient::with_rate_limit(
            test_connector_config("test", "https://api.example.com"),
            Some(RateLimitConfig::default()),
        );
        assert!(client.is_ok());
    }

    fn header_value(request: RequestBuilder, name: &str) -> String {
        let request = request.build().unwrap();
        request.headers()[name].to_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_basic_auth_header() {
        let config = test_connector_config("test", "https://api.example.com").with_auth(
            AuthConfig::Basic {
                username: "test".into(),
                password: SecureString::new("test_api_key".to_string()),
            },
        );
        let client = HttpClient::new(config).unwrap();
        let request = client.add_auth(client.request(Method::GET, "/x")).await.unwrap();
        assert_eq!(
            header_value(request, "authorization"),
            "Basic dGVzdDp0ZXN0X2FwaV9rZXk="
        );
    }

    #[tokio::test]
    async fn test_api_key_header() {
        let config = test_connector_config("test", "https://api.example.com").with_auth(
            AuthConfig::ApiKey {
                key: SecureString::new("accessKey=a;secretKey=b".to_string()),
                header_name: "X-ApiKeys".into(),
            },
        );
        let client = HttpClient::new(config).unwrap();
        let request = client.add_auth(client.request(Method::GET, "/x")).await.unwrap();
        assert_eq!(header_value(request, "x-apikeys"), "accessKey=a;secretKey=b");
    }

    #[test]
    fn test_invalid_default_header_rejected() {
        let config = test_connector_config("test", "https://api.example.com")
            .with_header("bad header", "x");
        assert!(matches!(
            HttpClient::new(config),
            Err(ConnectorError::ConfigError(_))
        ));
    }
}
