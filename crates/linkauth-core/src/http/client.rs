use std::sync::Arc;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::auth::AuthError;
use crate::providers::{ProviderDescriptor, DEFAULT_ERROR_PATHS};

use super::interceptor::{RequestInterceptor, RetryDecision};
use super::{Method, RequestContext};

/// Errors returned by provider API calls.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("{reason}")]
    Failed { status: StatusCode, reason: String },
    #[error("HTTP error: {0}")]
    Connection(#[from] reqwest::Error),
    #[error("invalid API URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("failed to deserialize response: {0}")]
    Deserialize(#[from] serde_json::Error),
}

impl ApiError {
    /// The caller should send the user through an interactive login.
    pub fn requires_login(&self) -> bool {
        matches!(self, ApiError::Auth(err) if err.requires_login())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// A successful (2xx) response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> ApiResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Pulls a human-readable message out of an error response body.
#[derive(Debug, Clone)]
pub struct ErrorExtractor {
    paths: Vec<String>,
}

impl Default for ErrorExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_PATHS.iter().copied())
    }
}

impl ErrorExtractor {
    /// `paths` are JSON pointers (`/meta/errorDetail`) tried in order.
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    /// The provider's own locations first, then the generic ones.
    pub fn for_provider(provider: &ProviderDescriptor) -> Self {
        let mut paths: Vec<String> = provider.error_paths.iter().map(|p| p.to_string()).collect();
        for path in DEFAULT_ERROR_PATHS {
            if !paths.iter().any(|existing| existing == path) {
                paths.push(path.to_string());
            }
        }
        Self { paths }
    }

    pub fn extract(&self, body: &Value) -> Option<String> {
        self.paths
            .iter()
            .filter_map(|path| body.pointer(path))
            .find_map(message_in)
    }

    /// Message for a failed response, falling back to the status line.
    pub fn message(&self, status: StatusCode, body: &[u8]) -> String {
        serde_json::from_slice::<Value>(body)
            .ok()
            .and_then(|json| self.extract(&json))
            .unwrap_or_else(|| {
                format!(
                    "HTTP {}: {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("unexpected status")
                )
            })
    }
}

fn message_in(value: &Value) -> Option<String> {
    match value {
        Value::String(message) if !message.trim().is_empty() => Some(message.clone()),
        Value::Object(object) => object
            .get("message")
            .or_else(|| object.get("msg"))
            .and_then(message_in),
        Value::Array(items) => items.first().and_then(message_in),
        _ => None,
    }
}

/// Per-provider facade: base URL, request interceptor, and error extraction.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    base_url: Url,
    interceptor: Arc<RequestInterceptor>,
    errors: ErrorExtractor,
}

impl ApiClient {
    pub fn new(base_url: &str, interceptor: Arc<RequestInterceptor>) -> ApiResult<Self> {
        let base_url = Url::parse(base_url)?;
        let http = Client::builder().build()?;
        Ok(Self {
            http,
            base_url,
            interceptor,
            errors: ErrorExtractor::default(),
        })
    }

    pub fn for_provider(
        provider: &ProviderDescriptor,
        interceptor: Arc<RequestInterceptor>,
    ) -> ApiResult<Self> {
        Ok(Self::new(provider.api_base_url, interceptor)?
            .with_error_extractor(ErrorExtractor::for_provider(provider)))
    }

    /// Point the client at another base URL (useful for testing).
    pub fn with_base_url(mut self, base_url: &str) -> ApiResult<Self> {
        self.base_url = Url::parse(base_url)?;
        Ok(self)
    }

    pub fn with_error_extractor(mut self, errors: ErrorExtractor) -> Self {
        self.errors = errors;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn interceptor(&self) -> &Arc<RequestInterceptor> {
        &self.interceptor
    }

    /// Resolve `path` below the base URL, keeping the base path. Absolute URLs pass through.
    pub fn endpoint(&self, path: &str) -> ApiResult<Url> {
        if path.starts_with("https://") || path.starts_with("http://") {
            return Ok(Url::parse(path)?);
        }
        let base = self.base_url.as_str().trim_end_matches('/');
        let path = path.trim_start_matches('/');
        Ok(Url::parse(&format!("{base}/{path}"))?)
    }

    pub async fn perform(
        &self,
        path: &str,
        method: Method,
        params: Vec<(String, String)>,
        headers: Vec<(String, String)>,
    ) -> ApiResult<ApiResponse> {
        let request = RequestContext::new(method, self.endpoint(path)?)
            .with_params(params)
            .with_headers(headers);
        self.execute(request).await
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        params: Vec<(String, String)>,
    ) -> ApiResult<T> {
        self.perform(path, Method::GET, params, vec![])
            .await?
            .json()
    }

    /// Send a prepared request, refreshing and re-sending at most once on a 401.
    pub async fn execute(&self, request: RequestContext) -> ApiResult<ApiResponse> {
        let mut attempt = 0;
        loop {
            let adapted = self.interceptor.adapt(&request).await?;
            let response = self.send(&adapted).await?;
            let status = response.status();
            debug!(method = %adapted.method, path = adapted.url.path(), status = status.as_u16(), attempt, "provider API response");

            if status.is_success() {
                let body = response.bytes().await?.to_vec();
                return Ok(ApiResponse { status, body });
            }

            let body = response
                .bytes()
                .await
                .map(|bytes| bytes.to_vec())
                .unwrap_or_default();
            match self.interceptor.retry(&adapted, status, attempt).await? {
                RetryDecision::Retry => attempt += 1,
                RetryDecision::DoNotRetry => {
                    return Err(ApiError::Failed {
                        status,
                        reason: self.errors.message(status, &body),
                    })
                }
            }
        }
    }

    async fn send(&self, request: &RequestContext) -> Result<Response, reqwest::Error> {
        let mut builder = self
            .http
            .request(request.method.clone(), request.final_url());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some((body, content_type)) = request.body() {
            builder = builder.header(CONTENT_TYPE, content_type).body(body);
        }
        builder.send().await
    }
}
