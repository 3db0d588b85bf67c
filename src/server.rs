//! Hyper-based dispatcher for Nexus service endpoints.
//!
//! Routes inbound HTTP requests to a user-supplied [`Handler`]:
//!
//! | Endpoint                             | Method | Handler method         |
//! |--------------------------------------|--------|------------------------|
//! | `/{operation}`                       | POST   | `start_operation`      |
//! | `/{operation}/{operation_id}`        | GET    | `get_operation_info`   |
//! | `/{operation}/{operation_id}/result` | GET    | `get_operation_result` |
//! | `/{operation}/{operation_id}/cancel` | POST   | `cancel_operation`     |
//!
//! Routing operates on the raw, still-encoded request path and the
//! dispatcher decodes each segment itself, so a percent-encoded `/` inside
//! an operation name is part of the name, not a path separator. Handlers
//! receive fully decoded strings.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::{
    body::{Bytes, Incoming},
    Request, Response, StatusCode,
};
use percent_encoding::percent_decode_str;

use crate::{
    error::{Failure, HandlerError, OperationError},
    payload::{content_header_to_http, BodyStream, Content},
    OperationInfo, OperationState, CONTENT_TYPE_JSON, HEADER_OPERATION_STATE, HEADER_REQUEST_ID,
    QUERY_CALLBACK_URL, QUERY_WAIT, STATUS_OPERATION_FAILED, STATUS_OPERATION_RUNNING,
};

/// Default cap on how long a single long-poll get-result request may hold
/// the handler.
pub const DEFAULT_GET_RESULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default maximum request body size (4 MB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 4 * 1024 * 1024;

/// Input to [`Handler::start_operation`].
#[derive(Debug)]
pub struct StartOperationRequest {
    /// Operation name, percent-decoded.
    pub operation: String,

    /// Caller-supplied dedupe key for this start request.
    pub request_id: Option<String>,

    /// Callback URL to deliver a completion to if the started operation is
    /// async.
    pub callback_url: Option<String>,

    /// Head of the original HTTP request.
    pub http: http::request::Parts,

    /// Request body conveying the operation input.
    pub body: Bytes,
}

/// Input to [`Handler::get_operation_result`].
#[derive(Debug)]
pub struct GetOperationResultRequest {
    /// Operation name, percent-decoded.
    pub operation: String,

    /// Operation ID as originally issued by a handler. Validating it and
    /// authorizing access is the handler's responsibility.
    pub operation_id: String,

    /// How long the caller wants to wait for completion. Non-zero turns the
    /// request into a long poll; the handler should return
    /// [`OperationError::StillRunning`] once its own window closes.
    pub wait: Duration,

    /// Head of the original HTTP request.
    pub http: http::request::Parts,
}

/// Input to [`Handler::get_operation_info`].
#[derive(Debug)]
pub struct GetOperationInfoRequest {
    /// Operation name, percent-decoded.
    pub operation: String,

    /// Operation ID as originally issued by a handler.
    pub operation_id: String,

    /// Head of the original HTTP request.
    pub http: http::request::Parts,
}

/// Input to [`Handler::cancel_operation`].
#[derive(Debug)]
pub struct CancelOperationRequest {
    /// Operation name, percent-decoded.
    pub operation: String,

    /// Operation ID as originally issued by a handler.
    pub operation_id: String,

    /// Head of the original HTTP request.
    pub http: http::request::Parts,
}

/// Successful return from [`Handler::start_operation`].
#[derive(Debug)]
pub enum OperationResponse {
    /// The operation completed inline; the content is its result.
    Sync(Content),

    /// The operation was accepted and will complete asynchronously.
    Async {
        /// Handler-generated ID the caller uses to address the operation.
        operation_id: String,
    },
}

/// User-supplied implementation of the four service endpoints.
///
/// Any method may return [`OperationError::Handler`] to fail the request
/// with a custom status code and structured [`Failure`], or
/// [`OperationError::Unsuccessful`] to report the operation as failed or
/// canceled.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handle a start request. Return [`OperationResponse::Sync`] to answer
    /// inline or [`OperationResponse::Async`] when the operation was
    /// accepted for asynchronous execution.
    async fn start_operation(
        &self,
        request: StartOperationRequest,
    ) -> Result<OperationResponse, OperationError>;

    /// Handle a get-result request. Return the result content when the
    /// operation completed, or [`OperationError::StillRunning`] while it has
    /// not.
    ///
    /// When [`wait`](GetOperationResultRequest::wait) is non-zero the
    /// request is a long poll: the dispatcher bounds the call with its
    /// configured get-result timeout, which is decoupled from the caller's
    /// wait. Respect the wait and return in a timely fashion.
    async fn get_operation_result(
        &self,
        request: GetOperationResultRequest,
    ) -> Result<Content, OperationError>;

    /// Handle a get-info request.
    async fn get_operation_info(
        &self,
        request: GetOperationInfoRequest,
    ) -> Result<OperationInfo, OperationError>;

    /// Handle a cancel request. Cancelation is asynchronous (returning only
    /// confirms delivery) and idempotent (duplicate cancels are not errors).
    async fn cancel_operation(
        &self,
        request: CancelOperationRequest,
    ) -> Result<(), OperationError>;
}

/// Routes inbound HTTP requests to a [`Handler`] and renders its results
/// onto the wire.
///
/// The dispatcher is immutable after construction and cheap to clone;
/// concurrent requests share one handler instance.
#[derive(Debug)]
pub struct ServiceHandler<H> {
    handler: Arc<H>,
    base_path: String,
    get_result_timeout: Duration,
    max_body_size: usize,
}

impl<H> Clone for ServiceHandler<H> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            base_path: self.base_path.clone(),
            get_result_timeout: self.get_result_timeout,
            max_body_size: self.max_body_size,
        }
    }
}

impl<H: Handler> ServiceHandler<H> {
    /// Create a dispatcher for `handler`, mounted at the URL root.
    #[must_use]
    pub fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
            base_path: String::new(),
            get_result_timeout: DEFAULT_GET_RESULT_TIMEOUT,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }

    /// Mount the dispatcher under a path prefix, compared against the raw
    /// request path.
    #[must_use]
    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        let mut base_path = base_path.into();
        if !base_path.starts_with('/') {
            base_path.insert(0, '/');
        }
        while base_path.ends_with('/') {
            base_path.pop();
        }
        self.base_path = base_path;
        self
    }

    /// Cap how long a single long-poll get-result request may hold the
    /// handler. Distinct from the caller's requested wait.
    #[must_use]
    pub const fn with_get_result_timeout(mut self, timeout: Duration) -> Self {
        self.get_result_timeout = timeout;
        self
    }

    /// Set the maximum request body size.
    #[must_use]
    pub const fn with_max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    /// Route an incoming HTTP request to the appropriate handler method and
    /// render the outcome.
    ///
    /// # Errors
    ///
    /// Returns `hyper::Error` only if the underlying HTTP transport fails;
    /// handler failures are rendered as responses.
    pub async fn handle(
        &self,
        request: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let method = request.method().clone();
        let raw_path = request.uri().path().to_owned();
        tracing::debug!("{method} {raw_path}");

        let Some(relative) = raw_path.strip_prefix(self.base_path.as_str()) else {
            return Ok(not_found());
        };
        if !relative.is_empty() && !relative.starts_with('/') {
            return Ok(not_found());
        }
        let segments: Vec<&str> = relative.trim_start_matches('/').split('/').collect();

        let result = match (method.as_str(), segments.as_slice()) {
            ("POST", &[operation]) if !operation.is_empty() => {
                self.start_operation_http(operation, request).await
            }
            ("GET", &[operation, id]) if !operation.is_empty() && !id.is_empty() => {
                self.get_operation_info_http(operation, id, request).await
            }
            ("GET", &[operation, id, "result"]) if !operation.is_empty() && !id.is_empty() => {
                self.get_operation_result_http(operation, id, request).await
            }
            ("POST", &[operation, id, "cancel"]) if !operation.is_empty() && !id.is_empty() => {
                self.cancel_operation_http(operation, id, request).await
            }
            _ => return Ok(not_found()),
        };

        Ok(result.unwrap_or_else(failure_response))
    }

    async fn start_operation_http(
        &self,
        operation: &str,
        request: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, OperationError> {
        let operation = decode_segment(operation)?;
        let (parts, body) = request.into_parts();
        let body = read_body(body, self.max_body_size).await?;

        let handler_request = StartOperationRequest {
            operation,
            request_id: header_string(&parts.headers, HEADER_REQUEST_ID),
            callback_url: query_param(parts.uri.query(), QUERY_CALLBACK_URL),
            http: parts,
            body,
        };

        match self.handler.start_operation(handler_request).await? {
            OperationResponse::Sync(content) => Ok(sync_response(content)),
            OperationResponse::Async { operation_id } => {
                let info = OperationInfo {
                    id: operation_id,
                    state: OperationState::Running,
                };
                let body = serde_json::to_vec(&info)
                    .map_err(|e| OperationError::Internal(Box::new(e)))?;
                Ok(response_builder(StatusCode::CREATED)
                    .header(http::header::CONTENT_TYPE, CONTENT_TYPE_JSON)
                    .body(Full::new(Bytes::from(body)))
                    .unwrap_or_else(|_| empty_status(StatusCode::INTERNAL_SERVER_ERROR)))
            }
        }
    }

    async fn get_operation_result_http(
        &self,
        operation: &str,
        id: &str,
        request: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, OperationError> {
        let operation = decode_segment(operation)?;
        let operation_id = decode_segment(id)?;
        let (parts, _body) = request.into_parts();

        let wait = match query_param(parts.uri.query(), QUERY_WAIT) {
            Some(raw) => parse_wait_duration(&raw).ok_or_else(|| {
                tracing::warn!(wait = %raw, "invalid wait duration query parameter");
                HandlerError::bad_request("invalid wait query parameter")
            })?,
            None => Duration::ZERO,
        };

        let handler_request = GetOperationResultRequest {
            operation,
            operation_id,
            wait,
            http: parts,
        };

        let result = if wait > Duration::ZERO {
            match tokio::time::timeout(
                self.get_result_timeout,
                self.handler.get_operation_result(handler_request),
            )
            .await
            {
                Ok(result) => result,
                Err(_elapsed) => {
                    tracing::debug!("get-result wait window elapsed without completion");
                    return Ok(empty_status(StatusCode::REQUEST_TIMEOUT));
                }
            }
        } else {
            self.handler.get_operation_result(handler_request).await
        };

        match result {
            Ok(content) => Ok(sync_response(content)),
            Err(OperationError::StillRunning) => Ok(empty_status(reserved_status(
                STATUS_OPERATION_RUNNING,
            ))),
            Err(err) => Err(err),
        }
    }

    async fn get_operation_info_http(
        &self,
        operation: &str,
        id: &str,
        request: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, OperationError> {
        let operation = decode_segment(operation)?;
        let operation_id = decode_segment(id)?;
        let (parts, _body) = request.into_parts();

        let handler_request = GetOperationInfoRequest {
            operation,
            operation_id,
            http: parts,
        };
        let info = self.handler.get_operation_info(handler_request).await?;

        let body =
            serde_json::to_vec(&info).map_err(|e| OperationError::Internal(Box::new(e)))?;
        Ok(response_builder(StatusCode::OK)
            .header(http::header::CONTENT_TYPE, CONTENT_TYPE_JSON)
            .body(Full::new(Bytes::from(body)))
            .unwrap_or_else(|_| empty_status(StatusCode::INTERNAL_SERVER_ERROR)))
    }

    async fn cancel_operation_http(
        &self,
        operation: &str,
        id: &str,
        request: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, OperationError> {
        let operation = decode_segment(operation)?;
        let operation_id = decode_segment(id)?;
        let (parts, _body) = request.into_parts();

        let handler_request = CancelOperationRequest {
            operation,
            operation_id,
            http: parts,
        };
        self.handler.cancel_operation(handler_request).await?;

        Ok(empty_status(StatusCode::ACCEPTED))
    }
}

/// Percent-decode one raw path segment.
fn decode_segment(segment: &str) -> Result<String, OperationError> {
    percent_decode_str(segment)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| HandlerError::bad_request("failed to parse URL path").into())
}

/// Extract a query parameter from a raw query string.
fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    let query = query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

/// Read a request header as a string, treating absent and empty as missing.
fn header_string(headers: &http::HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

/// Read the request body up to `max_size` bytes.
pub(crate) async fn read_body(body: Incoming, max_size: usize) -> Result<Bytes, OperationError> {
    let collected = body
        .collect()
        .await
        .map_err(|e| HandlerError::bad_request(format!("failed to read request body: {e}")))?;
    let bytes = collected.to_bytes();
    if bytes.len() > max_size {
        return Err(HandlerError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "request body too large",
        )
        .into());
    }
    Ok(bytes)
}

/// Adapt a hyper body into the payload stream type.
pub(crate) fn incoming_stream(body: Incoming) -> BodyStream {
    use futures::StreamExt;

    http_body_util::BodyStream::new(body)
        .filter_map(|frame| async move {
            match frame {
                Ok(frame) => frame.into_data().ok().map(Ok),
                Err(e) => Some(Err(std::io::Error::other(e))),
            }
        })
        .boxed()
}

/// Render a sync operation result: status 200, content headers re-prefixed
/// onto the response, body from the content data.
pub(crate) fn sync_response(content: Content) -> Response<Full<Bytes>> {
    let mut builder = response_builder(StatusCode::OK);
    if let Some(headers) = builder.headers_mut() {
        content_header_to_http(&content.header, headers);
    }
    builder
        .body(Full::new(content.data))
        .unwrap_or_else(|_| empty_status(StatusCode::INTERNAL_SERVER_ERROR))
}

/// Render a handler error per the protocol's three failure channels.
///
/// Unsuccessful operations become the reserved operation-failed status with
/// a state header; handler errors keep their status code; everything else is
/// logged and rendered as a generic 500 whose body never carries the
/// original message.
pub(crate) fn failure_response(err: OperationError) -> Response<Full<Bytes>> {
    let (status, state, failure) = match err {
        OperationError::Unsuccessful(err) => match err.state {
            OperationState::Failed | OperationState::Canceled => (
                reserved_status(STATUS_OPERATION_FAILED),
                Some(err.state),
                Some(err.failure),
            ),
            state => {
                tracing::error!(%state, "unexpected operation state");
                return empty_status(StatusCode::INTERNAL_SERVER_ERROR);
            }
        },
        OperationError::Handler(err) => (err.status_code, None, err.failure),
        OperationError::StillRunning | OperationError::Internal(_) => {
            tracing::error!(error = %err, "handler failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                None,
                Some(Failure::new("internal server error")),
            )
        }
    };

    let mut builder = response_builder(status);
    if let Some(state) = state {
        builder = builder.header(HEADER_OPERATION_STATE, state.to_string());
    }

    let body = match failure {
        Some(failure) => match serde_json::to_vec(&failure) {
            Ok(bytes) => {
                builder = builder.header(http::header::CONTENT_TYPE, CONTENT_TYPE_JSON);
                Bytes::from(bytes)
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to marshal failure");
                return empty_status(StatusCode::INTERNAL_SERVER_ERROR);
            }
        },
        None => Bytes::new(),
    };

    builder
        .body(Full::new(body))
        .unwrap_or_else(|_| empty_status(StatusCode::INTERNAL_SERVER_ERROR))
}

fn response_builder(status: StatusCode) -> http::response::Builder {
    Response::builder().status(status)
}

#[allow(clippy::expect_used)]
fn empty_status(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .expect("static response")
}

fn not_found() -> Response<Full<Bytes>> {
    failure_response(HandlerError::not_found("not found").into())
}

/// A reserved protocol status code.
#[allow(clippy::expect_used)]
fn reserved_status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).expect("reserved status code in valid range")
}

/// Parse a wait duration in the `<decimal><unit>` sequence form, e.g.
/// `5000ms`, `1m30s`, `1.5h`. Negative durations collapse to zero.
fn parse_wait_duration(raw: &str) -> Option<Duration> {
    let (negative, mut rest) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    if rest == "0" {
        return Some(Duration::ZERO);
    }
    if rest.is_empty() {
        return None;
    }

    const UNITS: &[(&str, f64)] = &[
        ("ns", 1e-9),
        ("us", 1e-6),
        ("µs", 1e-6),
        ("ms", 1e-3),
        ("s", 1.0),
        ("m", 60.0),
        ("h", 3600.0),
    ];

    let mut total = 0.0_f64;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if number_len == 0 {
            return None;
        }
        let value: f64 = rest[..number_len].parse().ok()?;
        rest = &rest[number_len..];

        let (multiplier, remainder) = UNITS
            .iter()
            .find_map(|(unit, multiplier)| {
                rest.strip_prefix(unit).map(|rem| (*multiplier, rem))
            })?;
        rest = remainder;
        total += value * multiplier;
    }

    if negative {
        return Some(Duration::ZERO);
    }
    if !total.is_finite() || total > u64::MAX as f64 {
        return None;
    }
    Some(Duration::from_secs_f64(total))
}
