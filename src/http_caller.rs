//! Pluggable HTTP request executor for the client side.
//!
//! The runtime never opens connections itself: every outbound request goes
//! through an [`HttpCaller`], which owns the mechanics of making HTTP
//! requests (TLS, connection pooling, proxies) while the runtime owns the
//! protocol. A [`reqwest`]-backed implementation ships behind the `reqwest`
//! feature.

#[cfg(feature = "reqwest")]
mod reqwest_caller;

#[cfg(feature = "reqwest")]
pub use reqwest_caller::{ReqwestCaller, ReqwestCallerError};

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{HeaderMap, Method, StatusCode};
use url::Url;

use crate::payload::BodyStream;

/// An HTTP request ready to be executed.
#[derive(Debug)]
pub struct HttpRequest {
    /// Request method.
    pub method: Method,

    /// Fully-composed request URL, query included.
    pub url: Url,

    /// Request headers.
    pub headers: HeaderMap,

    /// Request body; empty means no body.
    pub body: Bytes,
}

/// An HTTP response whose body has not been read yet.
///
/// The body stream holds the sole live reference to the connection; dropping
/// it releases the connection without draining.
pub struct HttpResponse {
    /// Response status.
    pub status: StatusCode,

    /// Response headers.
    pub headers: HeaderMap,

    /// Lazily-consumable response body.
    pub body: BodyStream,
}

impl core::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Executes HTTP requests on behalf of the client.
pub trait HttpCaller: Clone + Send + Sync + 'static {
    /// The error type for failed request execution.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Execute a request and return the response with an unread body.
    fn call(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, Self::Error>>;
}
