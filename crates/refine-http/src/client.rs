//! Shared JSON-over-HTTP plumbing for the service clients.

use std::time::Duration;

use refine_core::{ServiceError, ServiceResult};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

/// Longest response excerpt carried in an error message.
const ERROR_BODY_LIMIT: usize = 200;

/// Where a service lives and how to authenticate against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    pub base_url: String,
    pub api_token: Option<String>,
    pub timeout: Duration,
}

impl ServiceEndpoint {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_token: None,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Set bearer token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Clone)]
pub(crate) struct JsonClient {
    endpoint: ServiceEndpoint,
    http: reqwest::Client,
}

impl JsonClient {
    pub(crate) fn new(endpoint: ServiceEndpoint) -> ServiceResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("refine-http/", env!("CARGO_PKG_VERSION")))
            .timeout(endpoint.timeout)
            .build()
            .map_err(|e| ServiceError::Http(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { endpoint, http })
    }

    pub(crate) fn endpoint(&self) -> &ServiceEndpoint {
        &self.endpoint
    }

    /// POST `body` as JSON and decode the JSON response.
    ///
    /// Connection failures, 429 and 5xx map to `Unavailable`; other non-2xx
    /// statuses to `Http`; undecodable bodies to `InvalidResponse`.
    pub(crate) async fn post<B, R>(&self, path: &str, body: &B) -> ServiceResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self.endpoint.url(path);
        let mut request = self.http.post(&url).json(body);
        if let Some(token) = &self.endpoint.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        debug!(url = %url, status = status.as_u16(), "service responded");
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(&url, status, &text));
        }

        let bytes = response.bytes().await.map_err(|e| self.transport_error(e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ServiceError::InvalidResponse(format!("{url}: {e}")))
    }

    fn transport_error(&self, err: reqwest::Error) -> ServiceError {
        if err.is_timeout() {
            ServiceError::Timeout {
                timeout_ms: self.endpoint.timeout.as_millis() as u64,
            }
        } else if err.is_connect() {
            ServiceError::Unavailable(err.to_string())
        } else {
            ServiceError::Http(err.to_string())
        }
    }
}

fn status_error(url: &str, status: StatusCode, body: &str) -> ServiceError {
    let excerpt: String = body.chars().take(ERROR_BODY_LIMIT).collect();
    let message = format!("{url} returned {status}: {excerpt}");
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ServiceError::Unavailable(message)
    } else {
        ServiceError::Http(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_join_handles_slashes() {
        let endpoint = ServiceEndpoint::new("http://judge.local/v1/");
        assert_eq!(endpoint.url("/evaluate"), "http://judge.local/v1/evaluate");
        assert_eq!(endpoint.url("verify"), "http://judge.local/v1/verify");
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            status_error("u", StatusCode::SERVICE_UNAVAILABLE, ""),
            ServiceError::Unavailable(_)
        ));
        assert!(matches!(
            status_error("u", StatusCode::TOO_MANY_REQUESTS, ""),
            ServiceError::Unavailable(_)
        ));
        assert!(matches!(
            status_error("u", StatusCode::UNAUTHORIZED, "bad token"),
            ServiceError::Http(msg) if msg.contains("bad token")
        ));
    }

    #[test]
    fn test_error_excerpt_is_bounded() {
        let body = "x".repeat(1_000);
        let ServiceError::Http(msg) = status_error("u", StatusCode::BAD_REQUEST, &body) else {
            panic!("expected http error");
        };
        assert!(msg.len() < 300);
    }
}
