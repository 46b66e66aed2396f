//! The remote fetch seam and its default HTTP implementation.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::{ETAG, IF_NONE_MATCH};

use crate::config::FetchOptions;
use crate::fetch::FetchError;

/// How much of an error response body to keep in the error message.
const BODY_EXCERPT_LEN: usize = 256;

/// A response from the remote source.
#[derive(Debug, Clone)]
pub struct RemoteResponse {
    /// HTTP status code (or an equivalent for non-HTTP transports).
    pub status: u16,
    /// The validator the remote supplied, if any.
    pub etag: Option<String>,
    /// The raw response body. Empty for not-modified responses.
    pub body: Bytes,
}

impl RemoteResponse {
    /// A successful response carrying content.
    pub fn ok(etag: Option<String>, body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            etag,
            body: body.into(),
        }
    }

    /// A response confirming the caller's validator still matches.
    pub fn not_modified(etag: Option<String>) -> Self {
        Self {
            status: 304,
            etag,
            body: Bytes::new(),
        }
    }

    /// Whether the remote confirmed "no change".
    pub fn is_not_modified(&self) -> bool {
        self.status == StatusCode::NOT_MODIFIED.as_u16()
    }
}

/// The remote fetch capability used by the cache fetcher.
///
/// Implementations perform one conditional request: when `if_none_match` is
/// set they should forward it as the validator, and may answer with a
/// not-modified response instead of the full body.
#[async_trait]
pub trait RemoteFetch: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        if_none_match: Option<&str>,
        options: &FetchOptions,
    ) -> Result<RemoteResponse, FetchError>;
}

/// The default [`RemoteFetch`]: a conditional HTTP GET.
#[derive(Debug, Clone, Default)]
pub struct HttpFetch {
    client: reqwest::Client,
}

impl HttpFetch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a preconfigured client (connection pools, proxies, TLS setup).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RemoteFetch for HttpFetch {
    async fn fetch(
        &self,
        url: &str,
        if_none_match: Option<&str>,
        options: &FetchOptions,
    ) -> Result<RemoteResponse, FetchError> {
        let mut request = self.client.get(url);
        for (name, value) in &options.headers {
            request = request.header(name, value);
        }
        if let Some(validator) = if_none_match {
            request = request.header(IF_NONE_MATCH, validator);
        }
        if let Some(timeout) = options.timeout {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|err| FetchError::Upstream(err.to_string()))?;

        let status = response.status();
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_owned());

        if status == StatusCode::NOT_MODIFIED {
            return Ok(RemoteResponse {
                status: status.as_u16(),
                etag,
                body: Bytes::new(),
            });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let excerpt: String = body.chars().take(BODY_EXCERPT_LEN).collect();
            return Err(FetchError::Upstream(format!("status {status}: {excerpt}")));
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| FetchError::Upstream(err.to_string()))?;

        Ok(RemoteResponse {
            status: status.as_u16(),
            etag,
            body,
        })
    }
}
