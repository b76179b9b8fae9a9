use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, RETRY_AFTER};
use reqwest::{Client, Method, Request, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::persist::{SessionKv, SqliteSessionKv};
use crate::auth::{
    extract_bearer, CredentialStore, HttpRefresher, RedirectToLogin, RefreshCoordinator,
    SessionObserver, TokenRefresher,
};
use crate::config::Config;
use crate::error::{transport_error_kind, ApiError, HttpError, Result};
use crate::middleware::{BearerAuth, BeforeRequest, ExpiryDetector, Pipeline, Verdict};
use crate::transport::{build_client, join_url, CookieMirror};

/// Path of the refresh endpoint, relative to the API base URL
pub const REFRESH_PATH: &str = "v1/auth/refresh";

/// Upper bound on a server-requested Retry-After wait
const MAX_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Statuses worth re-sending an idempotent request for
const TRANSIENT_STATUSES: &[u16] = &[408, 413, 429, 500, 502, 503, 504];

/// Immutable description of an API call; rendered afresh for every dispatch
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<Value>,
}

impl OutboundRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    /// Methods that may be re-sent on a transient failure
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self.method,
            Method::GET | Method::PUT | Method::HEAD | Method::DELETE | Method::OPTIONS | Method::TRACE
        )
    }

    fn render(&self, client: &Client, base_url: &str) -> Result<Request> {
        let mut builder = client.request(self.method.clone(), join_url(base_url, &self.path));
        if !self.query.is_empty() {
            builder = builder.query(&self.query);
        }
        if let Some(body) = &self.body {
            builder = builder.json(body);
        }
        builder.build().map_err(ApiError::Transport)
    }
}

/// Authenticated API client.
///
/// Attaches the access credential, refreshes it once on expiry (shared across
/// concurrent callers) and replays the failed call exactly once.
pub struct ApiClient {
    /// Shared HTTP client with cookie jar
    client: Client,

    base_url: String,

    store: CredentialStore,

    coordinator: RefreshCoordinator,

    pipeline: Pipeline,

    /// Cookie jar mirror, when session persistence is enabled
    cookies: Option<Arc<CookieMirror>>,

    /// Maximum re-sends of an idempotent request on transient statuses
    max_retries: u32,

    /// Base delay for exponential backoff (milliseconds)
    base_delay_ms: u64,
}

impl ApiClient {
    pub fn builder(base_url: impl Into<String>) -> ApiClientBuilder {
        ApiClientBuilder::new(base_url)
    }

    /// Client wired from configuration, with the session persisted on disk
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let kv: Arc<dyn SessionKv> = Arc::new(SqliteSessionKv::open(&config.session_db_file)?);

        ApiClient::builder(config.api_base_url.clone())
            .connect_timeout(Duration::from_secs(config.http_connect_timeout))
            .request_timeout(Duration::from_secs(config.http_request_timeout))
            .max_retries(config.http_max_retries)
            .session_kv(kv)
            .build()
    }

    /// Send a request through the pipeline and return the raw response.
    ///
    /// Error statuses other than 401 come back as `Ok` responses; a 401 on a
    /// self-auth endpoint is `AuthEndpointFailure`; any other 401 triggers a
    /// shared refresh and one replay whose response is returned as-is.
    pub async fn send(&self, request: &OutboundRequest) -> Result<Response> {
        let (response, used) = self.dispatch(request, None, true).await?;
        let status = response.status();

        match self.pipeline.verdict(request, status) {
            Verdict::Ok => Ok(response),
            Verdict::AuthEndpointFailure => {
                let error = HttpError::from_response(response).await;
                tracing::warn!(
                    path = %request.path(),
                    message = %error.message,
                    "Authentication endpoint rejected credentials"
                );
                Err(ApiError::AuthEndpointFailure(error))
            }
            Verdict::Expired => {
                tracing::info!(
                    method = %request.method(),
                    path = %request.path(),
                    "Access token expired, refreshing"
                );
                drop(response);
                self.handle_expired(request, used).await
            }
        }
    }

    /// Refresh (or reuse an already-renewed credential) and replay once.
    /// The replay is a single dispatch: no transient retries, no expiry check.
    async fn handle_expired(
        &self,
        request: &OutboundRequest,
        used: Option<String>,
    ) -> Result<Response> {
        let token = self.coordinator.renew(used.as_deref()).await?;

        let (response, _) = self.dispatch(request, Some(&token), false).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            tracing::warn!(
                path = %request.path(),
                "Request still unauthorized after token refresh"
            );
        }
        Ok(response)
    }

    /// Render, run before-hooks and send. With `retry_transient`, transient
    /// statuses on idempotent methods are re-sent with backoff; transport
    /// failures never are.
    async fn dispatch(
        &self,
        request: &OutboundRequest,
        token: Option<&str>,
        retry_transient: bool,
    ) -> Result<(Response, Option<String>)> {
        let mut attempt = 0;

        loop {
            let mut req = request.render(&self.client, &self.base_url)?;
            self.pipeline.run_before(&mut req);
            if let Some(token) = token {
                let value = HeaderValue::from_str(&format!("Bearer {}", token))
                    .context("Refreshed access token is not a valid header value")?;
                req.headers_mut().insert(AUTHORIZATION, value);
            }
            let used = extract_bearer(req.headers());

            let method = req.method().clone();
            let url = req.url().clone();
            tracing::debug!(
                method = %method,
                url = %url,
                attempt = attempt + 1,
                "Sending HTTP request"
            );

            let response = match self.client.execute(req).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(
                        error_kind = transport_error_kind(&e),
                        error = %e,
                        url = %url,
                        "HTTP request error"
                    );
                    return Err(ApiError::Transport(e));
                }
            };

            let status = response.status();
            tracing::debug!(status = %status, "Received HTTP response");

            if retry_transient
                && request.is_idempotent()
                && TRANSIENT_STATUSES.contains(&status.as_u16())
                && attempt < self.max_retries
            {
                let delay = retry_after(response.headers())
                    .unwrap_or_else(|| Duration::from_millis(self.calculate_backoff_delay(attempt)));
                tracing::warn!(
                    "Received {}, retrying after {}ms (attempt {}/{})",
                    status,
                    delay.as_millis(),
                    attempt + 1,
                    self.max_retries
                );

                drop(response);
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            return Ok((response, used));
        }
    }

    /// Calculate exponential backoff delay
    fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        // base_delay * 2^attempt, plus up to 10% jitter
        let delay = self.base_delay_ms.saturating_mul(2_u64.saturating_pow(attempt));
        let jitter = (delay as f64 * 0.1 * rand::random::<f64>()) as u64;
        delay + jitter
    }

    /// `request(method, path, body?)`: JSON in, JSON out
    pub async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let mut request = OutboundRequest::new(method, path);
        if let Some(body) = body {
            request = request.with_json(body);
        }
        self.execute_json(&request).await
    }

    /// Send and decode a JSON response; error statuses become `ApiError::Server`
    pub async fn execute_json<T: DeserializeOwned>(&self, request: &OutboundRequest) -> Result<T> {
        let response = self.send(request).await?;
        let status = response.status();

        if !status.is_success() {
            let error = HttpError::from_response(response).await;
            tracing::error!(
                status = error.status,
                path = %request.path(),
                message = %error.message,
                "HTTP request failed with error response"
            );
            return Err(ApiError::Server(error));
        }

        let text = response.text().await?;
        let body = if text.trim().is_empty() { "null" } else { &text };
        serde_json::from_str(body).map_err(|e| ApiError::Decode(e.to_string()))
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.execute_json(&OutboundRequest::get(path)).await
    }

    pub async fn post_json<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        self.execute_json(&OutboundRequest::post(path).with_json(to_json(body)?))
            .await
    }

    pub async fn put_json<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        self.execute_json(&OutboundRequest::put(path).with_json(to_json(body)?))
            .await
    }

    pub async fn delete_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.execute_json(&OutboundRequest::delete(path)).await
    }

    /// Adopt a credential issued by login or email verification
    pub fn start_session(&self, token: String) {
        self.store.set(token);
    }

    /// Persist cookies set by a token-issuing response
    pub fn remember_cookies(&self, headers: &HeaderMap) {
        if let Some(cookies) = &self.cookies {
            cookies.record(headers);
        }
    }

    /// Forget the local session (credential and mirrored cookies)
    pub fn end_session(&self) {
        self.store.clear();
        if let Some(cookies) = &self.cookies {
            cookies.forget();
        }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Get the underlying HTTP client
    pub fn client(&self) -> &Client {
        &self.client
    }
}

pub(crate) fn to_json<B: Serialize>(body: &B) -> Result<Value> {
    serde_json::to_value(body)
        .context("Failed to serialize request body")
        .map_err(ApiError::Internal)
}

/// Numeric `Retry-After` header, capped
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let secs: u64 = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()?;
    Some(Duration::from_secs(secs).min(MAX_RETRY_AFTER))
}

/// Builder for [`ApiClient`]
pub struct ApiClientBuilder {
    base_url: String,
    connect_timeout: Duration,
    request_timeout: Duration,
    max_retries: u32,
    base_delay_ms: u64,
    store: Option<CredentialStore>,
    session_kv: Option<Arc<dyn SessionKv>>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    observer: Option<Arc<dyn SessionObserver>>,
    self_auth_paths: Option<Vec<String>>,
    hooks: Vec<Arc<dyn BeforeRequest>>,
}

impl ApiClientBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_retries: 2,
            base_delay_ms: 300,
            store: None,
            session_kv: None,
            refresher: None,
            observer: None,
            self_auth_paths: None,
            hooks: Vec::new(),
        }
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Use an existing credential store (takes precedence over `session_kv`)
    pub fn credential_store(mut self, store: CredentialStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Persist the credential and refresh cookie in this slot
    pub fn session_kv(mut self, kv: Arc<dyn SessionKv>) -> Self {
        self.session_kv = Some(kv);
        self
    }

    pub fn refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn session_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn self_auth_paths(mut self, paths: Vec<String>) -> Self {
        self.self_auth_paths = Some(paths);
        self
    }

    /// Extra before-request hook, run after the bearer hook
    pub fn hook(mut self, hook: Arc<dyn BeforeRequest>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn build(self) -> anyhow::Result<ApiClient> {
        let origin = Url::parse(&join_url(&self.base_url, ""))
            .with_context(|| format!("Invalid API base URL: {}", self.base_url))?;

        let cookies = Arc::new(CookieMirror::new(origin, self.session_kv.clone()));
        let client = build_client(cookies.jar(), self.connect_timeout, self.request_timeout)?;

        let store = match (self.store, &self.session_kv) {
            (Some(store), _) => store,
            (None, Some(kv)) => CredentialStore::load(kv.clone()),
            (None, None) => CredentialStore::in_memory(),
        };

        let refresher = self.refresher.unwrap_or_else(|| {
            Arc::new(HttpRefresher::new(
                client.clone(),
                join_url(&self.base_url, REFRESH_PATH),
                Some(cookies.clone()),
            ))
        });
        let observer = self
            .observer
            .unwrap_or_else(|| Arc::new(RedirectToLogin::default()));
        let coordinator = RefreshCoordinator::new(store.clone(), refresher, observer);

        let detector = match self.self_auth_paths {
            Some(paths) => ExpiryDetector::new(paths),
            None => ExpiryDetector::default(),
        };
        let mut pipeline = Pipeline::new()
            .before(Arc::new(BearerAuth::new(store.clone())))
            .after(Arc::new(detector));
        for hook in self.hooks {
            pipeline = pipeline.before(hook);
        }

        Ok(ApiClient {
            client,
            base_url: self.base_url,
            store,
            coordinator,
            pipeline,
            cookies: Some(cookies),
            max_retries: self.max_retries,
            base_delay_ms: self.base_delay_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        let client = ApiClient::builder("http://localhost:8080/api")
            .base_delay(Duration::from_millis(1000))
            .build()
            .unwrap();

        // Exponential backoff
        let delay0 = client.calculate_backoff_delay(0);
        let delay1 = client.calculate_backoff_delay(1);
        let delay2 = client.calculate_backoff_delay(2);

        // Each delay should be roughly double the previous (with jitter)
        assert!(delay0 >= 1000 && delay0 <= 1100);
        assert!(delay1 >= 2000 && delay1 <= 2200);
        assert!(delay2 >= 4000 && delay2 <= 4400);
    }

    #[test]
    fn test_base_delay_saturates() {
        let builder = ApiClient::builder("http://localhost:8080/api").base_delay(Duration::MAX);
        assert_eq!(builder.base_delay_ms, u64::MAX);

        let builder =
            ApiClient::builder("http://localhost:8080/api").base_delay(Duration::from_millis(250));
        assert_eq!(builder.base_delay_ms, 250);
    }

    #[test]
    fn test_idempotent_methods() {
        assert!(OutboundRequest::get("v1/items").is_idempotent());
        assert!(OutboundRequest::put("v1/items/1").is_idempotent());
        assert!(OutboundRequest::delete("v1/items/1").is_idempotent());
        assert!(!OutboundRequest::post("v1/items").is_idempotent());
        assert!(!OutboundRequest::new(Method::PATCH, "v1/items/1").is_idempotent());
    }

    #[test]
    fn test_render_request() {
        let client = Client::new();
        let request = OutboundRequest::get("v1/auth/check-email")
            .with_query("email", "a+b@janchwi.site")
            .render(&client, "http://localhost:8080/api")
            .unwrap();

        assert_eq!(request.method(), Method::GET);
        assert_eq!(
            request.url().as_str(),
            "http://localhost:8080/api/v1/auth/check-email?email=a%2Bb%40janchwi.site"
        );
        assert!(request.body().is_none());
    }

    #[test]
    fn test_render_json_body() {
        let client = Client::new();
        let request = OutboundRequest::post("v1/auth/login")
            .with_json(serde_json::json!({"email": "a@b.c"}))
            .render(&client, "http://localhost:8080/api/")
            .unwrap();

        assert_eq!(request.url().path(), "/api/v1/auth/login");
        assert_eq!(
            request.headers().get("content-type").unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("2"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(2)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("3600"));
        assert_eq!(retry_after(&headers), Some(MAX_RETRY_AFTER));

        // HTTP-date form is not honoured
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(ApiClient::builder("not a url").build().is_err());
    }

    #[test]
    fn test_session_start_and_end() {
        let client = ApiClient::builder("http://localhost:8080/api").build().unwrap();
        assert!(!client.store().is_authenticated());

        client.start_session("T1".to_string());
        assert_eq!(client.store().get().as_deref(), Some("T1"));

        client.end_session();
        assert!(!client.store().is_authenticated());
    }
}
