//! [`reqwest`]-backed implementation of [`HttpCaller`].

use core::time::Duration;

use futures::{FutureExt, StreamExt};

use super::{HttpCaller, HttpRequest, HttpResponse};

/// Error type for the reqwest-based caller.
#[derive(Debug, thiserror::Error)]
#[error("HTTP request failed: {0}")]
pub struct ReqwestCallerError(#[from] reqwest::Error);

/// A [`reqwest`]-backed implementation of [`HttpCaller`].
#[derive(Debug, Clone)]
pub struct ReqwestCaller {
    inner: reqwest::Client,
}

impl ReqwestCaller {
    /// Create a new reqwest-backed caller with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: reqwest::Client::new(),
        }
    }

    /// Create a new reqwest-backed caller with a whole-request timeout.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    /// Wrap an existing [`reqwest::Client`].
    #[must_use]
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { inner: client }
    }
}

impl Default for ReqwestCaller {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpCaller for ReqwestCaller {
    type Error = ReqwestCallerError;

    fn call(
        &self,
        request: HttpRequest,
    ) -> futures::future::BoxFuture<'_, Result<HttpResponse, Self::Error>> {
        let mut builder = self
            .inner
            .request(request.method, request.url.as_str())
            .headers(request.headers);
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        async move {
            let resp = builder.send().await?;
            let status = resp.status();
            let headers = resp.headers().clone();
            let body = resp
                .bytes_stream()
                .map(|chunk| chunk.map_err(std::io::Error::other))
                .boxed();

            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        }
        .boxed()
    }
}
