//! Client for invoking Nexus operations and driving their handles.
//!
//! A [`Client`] composes requests against
//! `<base>/<service>/<operation>[/<id>[/result|/cancel]]`, executes them
//! through an injected [`HttpCaller`], and interprets responses back into
//! typed results or one of the protocol's failure channels.
//!
//! # Long polling
//!
//! [`OperationHandle::get_result`] turns a positive
//! [`wait`](GetOperationResultOptions::wait) into a long poll: the request
//! carries `wait=<ms>ms`, the server may delay its answer up to its own
//! get-result timeout, and a 408 response means that window elapsed without
//! completion. The client then recomputes its remaining wait budget and
//! re-polls until the budget runs out, at which point the operation is
//! reported as still running.

use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use rand::Rng;
use serde::de::DeserializeOwned;
use url::Url;

use crate::{
    error::{ClientError, Failure, HandlerError, UnsuccessfulOperationError},
    http_caller::{HttpCaller, HttpRequest, HttpResponse},
    payload::{
        collect_stream, content_header_from_http, content_header_to_http, is_media_type_json,
        Content, JsonSerializer, LazyValue, Reader, Serializer,
    },
    OperationInfo, OperationState, HEADER_OPERATION_STATE, HEADER_REQUEST_ID,
    HEADER_REQUEST_TIMEOUT, QUERY_CALLBACK_URL, QUERY_WAIT, STATUS_OPERATION_FAILED,
    STATUS_OPERATION_RUNNING, USER_AGENT,
};

/// Padding added when clamping the long-poll wait to the caller's deadline,
/// so the server-side timeout fires first and the loop observes an
/// interpretable 408 rather than a bare deadline error.
const GET_RESULT_DEADLINE_PADDING: Duration = Duration::from_secs(5);

/// First backoff step after a repeated server-side wait timeout.
const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(10);

/// Upper bound on the backoff between polls.
const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Headers the runtime owns on every outbound request. User-supplied values
/// for these names are ignored.
const RESERVED_HEADERS: &[&str] = &["user-agent", HEADER_REQUEST_TIMEOUT];

/// A client for a single Nexus service.
///
/// Holds the base URL, the service name, the serializer used to decode
/// results, and the [`HttpCaller`] that executes requests.
#[derive(Debug, Clone)]
pub struct Client<C: HttpCaller, S: Serializer = JsonSerializer> {
    base_url: Url,
    service: String,
    serializer: S,
    user_agent: String,
    caller: C,
}

impl<C: HttpCaller> Client<C> {
    /// Create a client for `service`, reachable under `base_url`, executing
    /// requests through `caller`.
    ///
    /// # Errors
    ///
    /// Returns a transport error when `base_url` cannot carry path segments
    /// (e.g. a `data:` URL).
    pub fn new(base_url: Url, service: impl Into<String>, caller: C) -> Result<Self, ClientError> {
        if base_url.cannot_be_a_base() {
            return Err(ClientError::transport("base URL cannot be a base"));
        }
        Ok(Self {
            base_url,
            service: service.into(),
            serializer: JsonSerializer,
            user_agent: USER_AGENT.to_owned(),
            caller,
        })
    }
}

impl<C: HttpCaller, S: Serializer> Client<C, S> {
    /// Replace the serializer used to decode operation results.
    #[must_use]
    pub fn with_serializer<S2: Serializer>(self, serializer: S2) -> Client<C, S2> {
        Client {
            base_url: self.base_url,
            service: self.service,
            serializer,
            user_agent: self.user_agent,
            caller: self.caller,
        }
    }

    /// Override the user-agent string sent with every request.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// The serializer used to encode inputs and decode results.
    #[must_use]
    pub const fn serializer(&self) -> &S {
        &self.serializer
    }

    /// A handle for an operation whose ID is already known.
    #[must_use]
    pub fn handle(
        &self,
        operation: impl Into<String>,
        id: impl Into<String>,
    ) -> OperationHandle<'_, C, S> {
        OperationHandle {
            operation: operation.into(),
            id: id.into(),
            client: self,
        }
    }

    /// Start an operation.
    ///
    /// The service answers either inline (the result payload is returned as
    /// an unread [`LazyValue`]) or by accepting the operation for
    /// asynchronous execution (a handle for the server-issued ID is
    /// returned).
    ///
    /// # Errors
    ///
    /// [`ClientError::Unsuccessful`] when the operation completed as failed
    /// or canceled, [`ClientError::Handler`] for protocol-level failures,
    /// [`ClientError::Transport`] for I/O and malformed responses.
    pub async fn start_operation(
        &self,
        operation: &str,
        input: Content,
        options: StartOperationOptions,
    ) -> Result<StartOperationResult<'_, C, S>, ClientError> {
        let mut url = self.operation_url(&[operation])?;
        if let Some(callback_url) = &options.callback_url {
            url.query_pairs_mut()
                .append_pair(QUERY_CALLBACK_URL, callback_url);
        }

        let deadline = options.request_timeout.map(|t| Instant::now() + t);
        let mut headers = self.base_headers(deadline, &options.header)?;
        if let Some(request_id) = &options.request_id {
            let value = HeaderValue::from_str(request_id)
                .map_err(|e| ClientError::Transport(Box::new(e)))?;
            headers.insert(HEADER_REQUEST_ID, value);
        }
        content_header_to_http(&input.header, &mut headers);

        let request = HttpRequest {
            method: Method::POST,
            url,
            headers,
            body: input.data,
        };
        let response = self.send(request, deadline).await?;

        if response.status == StatusCode::OK {
            return Ok(StartOperationResult::Sync(self.lazy_value(response)));
        }

        let (status, headers, body) = buffer_response(response).await?;
        match status {
            StatusCode::CREATED => {
                let info: OperationInfo = serde_json::from_slice(&body)
                    .map_err(|e| ClientError::transport(format!("failed to decode operation info: {e}")))?;
                if info.id.is_empty() {
                    return Err(ClientError::transport("empty operation ID in response"));
                }
                Ok(StartOperationResult::Async(self.handle(operation, info.id)))
            }
            s if s.as_u16() == STATUS_OPERATION_FAILED => {
                Err(unsuccessful_from_parts(&headers, &body)?.into())
            }
            _ => Err(best_effort_handler_error(status, &headers, &body).into()),
        }
    }

    /// Start an operation and wait for its result.
    ///
    /// Equivalent to [`start_operation`](Self::start_operation) followed by
    /// [`get_result_lazy`](OperationHandle::get_result_lazy) with
    /// [`wait`](ExecuteOperationOptions::wait) when the start was accepted
    /// asynchronously.
    ///
    /// # Errors
    ///
    /// As for [`start_operation`](Self::start_operation), plus
    /// [`ClientError::StillRunning`] when the wait budget is exhausted.
    pub async fn execute_operation(
        &self,
        operation: &str,
        input: Content,
        options: ExecuteOperationOptions,
    ) -> Result<LazyValue<S>, ClientError> {
        let start_options = StartOperationOptions {
            header: options.header.clone(),
            request_id: options.request_id,
            callback_url: options.callback_url,
            request_timeout: options.request_timeout,
        };
        match self
            .start_operation(operation, input, start_options)
            .await?
        {
            StartOperationResult::Sync(result) => Ok(result),
            StartOperationResult::Async(handle) => {
                let result_options = GetOperationResultOptions {
                    header: options.header,
                    wait: options.wait,
                    request_timeout: options.request_timeout,
                };
                handle.get_result_lazy(result_options).await
            }
        }
    }

    /// Compose `<base>/<service>/<segments...>`, percent-escaping each
    /// segment independently.
    fn operation_url(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|()| ClientError::transport("base URL cannot be a base"))?;
            path.pop_if_empty();
            path.push(&self.service);
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    /// Headers carried by every request: forced user-agent, the deadline
    /// projection when one is set, then user-supplied headers. Reserved
    /// names cannot be overridden.
    fn base_headers(
        &self,
        deadline: Option<Instant>,
        user: &HeaderMap,
    ) -> Result<HeaderMap, ClientError> {
        let mut headers = HeaderMap::new();
        let agent = HeaderValue::from_str(&self.user_agent)
            .map_err(|e| ClientError::Transport(Box::new(e)))?;
        headers.insert(header::USER_AGENT, agent);

        if let Some(deadline) = deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let value = format!("{}ms", remaining.as_millis());
            headers.insert(
                HEADER_REQUEST_TIMEOUT,
                HeaderValue::from_str(&value).map_err(|e| ClientError::Transport(Box::new(e)))?,
            );
        }

        for (name, value) in user {
            if RESERVED_HEADERS.contains(&name.as_str()) {
                tracing::debug!(header = name.as_str(), "ignoring reserved header override");
                continue;
            }
            headers.append(name, value.clone());
        }
        Ok(headers)
    }

    /// Execute a request, enforcing the caller's deadline when one is set.
    async fn send(
        &self,
        request: HttpRequest,
        deadline: Option<Instant>,
    ) -> Result<HttpResponse, ClientError> {
        tracing::debug!(method = %request.method, url = %request.url, "sending request");
        let call = self.caller.call(request);
        let result = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                tokio::time::timeout(remaining, call)
                    .await
                    .map_err(|e| ClientError::Transport(Box::new(e)))?
            }
            None => call.await,
        };
        result.map_err(|e| ClientError::Transport(Box::new(e)))
    }

    fn lazy_value(&self, response: HttpResponse) -> LazyValue<S> {
        let header = content_header_from_http(&response.headers);
        LazyValue::new(Reader::new(response.body, header), self.serializer.clone())
    }
}

/// Options for [`Client::start_operation`].
#[derive(Debug, Clone, Default)]
pub struct StartOperationOptions {
    /// Additional headers to send. Reserved names are ignored.
    pub header: HeaderMap,

    /// Dedupe key for this start request, sent as `nexus-request-id`.
    pub request_id: Option<String>,

    /// Callback URL to deliver a completion to if the operation is async.
    pub callback_url: Option<String>,

    /// Deadline for the whole call, projected onto the
    /// `nexus-request-timeout` header and enforced locally.
    pub request_timeout: Option<Duration>,
}

/// Options for [`Client::execute_operation`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteOperationOptions {
    /// Additional headers to send. Reserved names are ignored.
    pub header: HeaderMap,

    /// Dedupe key for the start request.
    pub request_id: Option<String>,

    /// Callback URL to deliver a completion to if the operation is async.
    pub callback_url: Option<String>,

    /// How long to wait for the result when the start was asynchronous.
    /// Zero means a single immediate poll.
    pub wait: Duration,

    /// Deadline for each underlying call.
    pub request_timeout: Option<Duration>,
}

/// Options for [`OperationHandle::get_info`].
#[derive(Debug, Clone, Default)]
pub struct GetOperationInfoOptions {
    /// Additional headers to send. Reserved names are ignored.
    pub header: HeaderMap,

    /// Deadline for the call.
    pub request_timeout: Option<Duration>,
}

/// Options for [`OperationHandle::get_result`].
#[derive(Debug, Clone, Default)]
pub struct GetOperationResultOptions {
    /// Additional headers to send. Reserved names are ignored.
    pub header: HeaderMap,

    /// Total long-poll budget. Zero disables long polling: the server
    /// answers immediately and a running operation surfaces as
    /// [`ClientError::StillRunning`].
    pub wait: Duration,

    /// Deadline for the whole call. The outbound wait is clamped so the
    /// server-side window elapses before this deadline does.
    pub request_timeout: Option<Duration>,
}

/// Options for [`OperationHandle::cancel`].
#[derive(Debug, Clone, Default)]
pub struct CancelOperationOptions {
    /// Additional headers to send. Reserved names are ignored.
    pub header: HeaderMap,

    /// Deadline for the call.
    pub request_timeout: Option<Duration>,
}

/// Result of [`Client::start_operation`].
#[derive(Debug)]
pub enum StartOperationResult<'a, C: HttpCaller, S: Serializer = JsonSerializer> {
    /// The operation completed synchronously; the payload has not been read.
    Sync(LazyValue<S>),

    /// The operation was accepted and runs asynchronously.
    Async(OperationHandle<'a, C, S>),
}

/// Addresses one operation on a service: fetch its status, await its result,
/// or request cancelation.
pub struct OperationHandle<'a, C: HttpCaller, S: Serializer = JsonSerializer> {
    /// Name of the operation this handle represents.
    pub operation: String,

    /// Server-issued ID for this handle's operation.
    pub id: String,

    client: &'a Client<C, S>,
}

impl<C: HttpCaller, S: Serializer> core::fmt::Debug for OperationHandle<'_, C, S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OperationHandle")
            .field("operation", &self.operation)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Loop-internal outcome of one get-result request.
enum PollError {
    /// The server's wait window elapsed without completion (HTTP 408).
    WaitTimeout,
    /// A terminal outcome for the caller.
    Client(ClientError),
}

impl<C: HttpCaller, S: Serializer> OperationHandle<'_, C, S> {
    /// Fetch information about the operation.
    ///
    /// # Errors
    ///
    /// [`ClientError::Handler`] for any non-200 response,
    /// [`ClientError::Transport`] for I/O and decode failures.
    pub async fn get_info(
        &self,
        options: GetOperationInfoOptions,
    ) -> Result<OperationInfo, ClientError> {
        let url = self.client.operation_url(&[&self.operation, &self.id])?;
        let deadline = options.request_timeout.map(|t| Instant::now() + t);
        let headers = self.client.base_headers(deadline, &options.header)?;

        let request = HttpRequest {
            method: Method::GET,
            url,
            headers,
            body: Bytes::new(),
        };
        let response = self.client.send(request, deadline).await?;
        let (status, headers, body) = buffer_response(response).await?;

        if status != StatusCode::OK {
            return Err(best_effort_handler_error(status, &headers, &body).into());
        }
        serde_json::from_slice(&body)
            .map_err(|e| ClientError::transport(format!("failed to decode operation info: {e}")))
    }

    /// Await the operation result and decode it with the client's
    /// serializer.
    ///
    /// # Errors
    ///
    /// As for [`get_result_lazy`](Self::get_result_lazy), plus
    /// [`ClientError::Payload`] when decoding fails.
    pub async fn get_result<T: DeserializeOwned>(
        &self,
        options: GetOperationResultOptions,
    ) -> Result<T, ClientError> {
        let lazy = self.get_result_lazy(options).await?;
        Ok(lazy.consume().await?)
    }

    /// Await the operation result, returning the payload unread.
    ///
    /// With a positive [`wait`](GetOperationResultOptions::wait) this long
    /// polls, re-issuing the request whenever the server reports its wait
    /// window elapsed, until the budget runs out.
    ///
    /// # Errors
    ///
    /// [`ClientError::StillRunning`] when the operation has not completed
    /// within the wait budget, [`ClientError::Unsuccessful`] when it
    /// completed as failed or canceled, [`ClientError::Handler`] and
    /// [`ClientError::Transport`] as elsewhere.
    pub async fn get_result_lazy(
        &self,
        options: GetOperationResultOptions,
    ) -> Result<LazyValue<S>, ClientError> {
        let base_url = self
            .client
            .operation_url(&[&self.operation, &self.id, "result"])?;
        let start = Instant::now();
        let deadline = options.request_timeout.map(|t| start + t);
        let mut wait_remaining = options.wait;
        let mut timeouts: u32 = 0;

        loop {
            let mut url = base_url.clone();
            if wait_remaining > Duration::ZERO {
                let mut effective_wait = wait_remaining;
                if let Some(deadline) = deadline {
                    let until_deadline = deadline.saturating_duration_since(Instant::now());
                    effective_wait =
                        effective_wait.min(until_deadline + GET_RESULT_DEADLINE_PADDING);
                }
                url.query_pairs_mut()
                    .append_pair(QUERY_WAIT, &format!("{}ms", effective_wait.as_millis()));
            }

            let headers = self.client.base_headers(deadline, &options.header)?;
            let request = HttpRequest {
                method: Method::GET,
                url,
                headers,
                body: Bytes::new(),
            };

            match self.send_get_result_request(request, deadline).await {
                Ok(result) => return Ok(result),
                Err(PollError::Client(err)) => return Err(err),
                Err(PollError::WaitTimeout) => {
                    wait_remaining = options.wait.saturating_sub(start.elapsed());
                    if wait_remaining.is_zero() {
                        return Err(ClientError::StillRunning);
                    }
                    if timeouts > 0 {
                        let backoff = retry_backoff(timeouts).min(wait_remaining);
                        tracing::debug!(?backoff, "server wait window elapsed, backing off");
                        tokio::time::sleep(backoff).await;
                        wait_remaining = options.wait.saturating_sub(start.elapsed());
                        if wait_remaining.is_zero() {
                            return Err(ClientError::StillRunning);
                        }
                    }
                    timeouts += 1;
                }
            }
        }
    }

    /// Issue one get-result request and classify the response.
    async fn send_get_result_request(
        &self,
        request: HttpRequest,
        deadline: Option<Instant>,
    ) -> Result<LazyValue<S>, PollError> {
        let response = self
            .client
            .send(request, deadline)
            .await
            .map_err(PollError::Client)?;

        if response.status == StatusCode::OK {
            return Ok(self.client.lazy_value(response));
        }

        let (status, headers, body) = buffer_response(response)
            .await
            .map_err(PollError::Client)?;
        match status {
            StatusCode::REQUEST_TIMEOUT => Err(PollError::WaitTimeout),
            s if s.as_u16() == STATUS_OPERATION_RUNNING => {
                Err(PollError::Client(ClientError::StillRunning))
            }
            s if s.as_u16() == STATUS_OPERATION_FAILED => {
                Err(PollError::Client(match unsuccessful_from_parts(&headers, &body) {
                    Ok(err) => err.into(),
                    Err(err) => err,
                }))
            }
            _ => Err(PollError::Client(
                best_effort_handler_error(status, &headers, &body).into(),
            )),
        }
    }

    /// Request cancelation of the operation.
    ///
    /// Cancelation is asynchronous (success means the request was delivered,
    /// not that the operation stopped) and idempotent.
    ///
    /// # Errors
    ///
    /// [`ClientError::Handler`] for any response other than 202,
    /// [`ClientError::Transport`] for I/O failures.
    pub async fn cancel(&self, options: CancelOperationOptions) -> Result<(), ClientError> {
        let url = self
            .client
            .operation_url(&[&self.operation, &self.id, "cancel"])?;
        let deadline = options.request_timeout.map(|t| Instant::now() + t);
        let headers = self.client.base_headers(deadline, &options.header)?;

        let request = HttpRequest {
            method: Method::POST,
            url,
            headers,
            body: Bytes::new(),
        };
        let response = self.client.send(request, deadline).await?;
        let (status, headers, body) = buffer_response(response).await?;

        if status != StatusCode::ACCEPTED {
            return Err(best_effort_handler_error(status, &headers, &body).into());
        }
        Ok(())
    }
}

/// Bounded exponential backoff with uniform jitter.
fn retry_backoff(timeouts: u32) -> Duration {
    let shift = timeouts.saturating_sub(1).min(7);
    let step = RETRY_BACKOFF_BASE
        .saturating_mul(1 << shift)
        .min(RETRY_BACKOFF_MAX);
    step.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
}

/// Drain a response body into one buffer. Non-200 bodies are read exactly
/// once, here.
async fn buffer_response(
    response: HttpResponse,
) -> Result<(StatusCode, HeaderMap, Bytes), ClientError> {
    let HttpResponse {
        status,
        headers,
        body,
    } = response;
    let data = collect_stream(body)
        .await
        .map_err(|e| ClientError::Transport(Box::new(e)))?;
    Ok((status, headers, data))
}

/// Reconstruct a [`HandlerError`] from a non-success response: decode the
/// body as a [`Failure`] when it is JSON, otherwise fall back to the status
/// text.
pub(crate) fn best_effort_handler_error(
    status: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
) -> HandlerError {
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(is_media_type_json);

    let failure = if is_json {
        serde_json::from_slice(body).ok()
    } else {
        None
    };
    let failure = failure.unwrap_or_else(|| {
        Failure::new(status.canonical_reason().unwrap_or("unknown status"))
    });

    HandlerError {
        status_code: status,
        failure: Some(failure),
    }
}

/// Decode an operation-failed response. Both a valid terminal state header
/// and a decodable JSON [`Failure`] body are required; anything less is a
/// transport error.
fn unsuccessful_from_parts(
    headers: &HeaderMap,
    body: &[u8],
) -> Result<UnsuccessfulOperationError, ClientError> {
    let raw_state = headers
        .get(HEADER_OPERATION_STATE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            ClientError::transport("missing operation state header on operation-failed response")
        })?;
    let state: OperationState = raw_state
        .parse()
        .map_err(|e| ClientError::Transport(Box::new(e)))?;
    if !matches!(state, OperationState::Failed | OperationState::Canceled) {
        return Err(ClientError::transport(format!(
            "unexpected operation state {state} on operation-failed response"
        )));
    }

    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(is_media_type_json);
    if !is_json {
        return Err(ClientError::transport(
            "operation-failed response body is not JSON",
        ));
    }
    let failure: Failure = serde_json::from_slice(body)
        .map_err(|e| ClientError::transport(format!("failed to decode failure: {e}")))?;

    Ok(UnsuccessfulOperationError { state, failure })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use futures::{future::BoxFuture, stream, FutureExt, StreamExt};
    use percent_encoding::percent_decode_str;

    use super::*;
    use crate::CONTENT_TYPE_JSON;

    /// One canned response, optionally delayed to simulate a server-side
    /// wait.
    #[derive(Debug)]
    struct Scripted {
        status: u16,
        headers: Vec<(&'static str, String)>,
        body: Vec<u8>,
        delay: Duration,
    }

    impl Scripted {
        fn new(status: u16, body: &[u8]) -> Self {
            Self {
                status,
                headers: Vec::new(),
                body: body.to_vec(),
                delay: Duration::ZERO,
            }
        }

        fn json(status: u16, body: &str) -> Self {
            let mut scripted = Self::new(status, body.as_bytes());
            scripted
                .headers
                .push(("content-type", CONTENT_TYPE_JSON.to_owned()));
            scripted
        }

        fn header(mut self, name: &'static str, value: &str) -> Self {
            self.headers.push((name, value.to_owned()));
            self
        }

        fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[derive(Debug)]
    struct Recorded {
        method: Method,
        url: Url,
        headers: HeaderMap,
    }

    #[derive(Clone, Debug)]
    struct MockCaller {
        responses: Arc<Mutex<VecDeque<Scripted>>>,
        requests: Arc<Mutex<Vec<Recorded>>>,
    }

    impl MockCaller {
        fn new(responses: Vec<Scripted>) -> Self {
            Self {
                responses: Arc::new(Mutex::new(responses.into())),
                requests: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn recorded(&self) -> Vec<Recorded> {
            std::mem::take(&mut self.requests.lock().unwrap())
        }
    }

    impl HttpCaller for MockCaller {
        type Error = std::io::Error;

        fn call(
            &self,
            request: HttpRequest,
        ) -> BoxFuture<'_, Result<HttpResponse, Self::Error>> {
            self.requests.lock().unwrap().push(Recorded {
                method: request.method,
                url: request.url,
                headers: request.headers,
            });
            let next = self.responses.lock().unwrap().pop_front();

            async move {
                let scripted = next.ok_or_else(|| std::io::Error::other("script exhausted"))?;
                if !scripted.delay.is_zero() {
                    tokio::time::sleep(scripted.delay).await;
                }
                let mut headers = HeaderMap::new();
                for (name, value) in &scripted.headers {
                    headers.insert(*name, HeaderValue::from_str(value).unwrap());
                }
                Ok(HttpResponse {
                    status: StatusCode::from_u16(scripted.status).unwrap(),
                    headers,
                    body: stream::once(async move { Ok(Bytes::from(scripted.body)) }).boxed(),
                })
            }
            .boxed()
        }
    }

    fn client(responses: Vec<Scripted>) -> (Client<MockCaller>, MockCaller) {
        let caller = MockCaller::new(responses);
        let client = Client::new(
            Url::parse("http://service.test").unwrap(),
            "svc",
            caller.clone(),
        )
        .unwrap();
        (client, caller)
    }

    fn wait_query_ms(url: &Url) -> Option<u64> {
        url.query_pairs()
            .find(|(k, _)| k == QUERY_WAIT)
            .map(|(_, v)| v.trim_end_matches("ms").parse().unwrap())
    }

    #[tokio::test]
    async fn path_segments_are_escaped_and_decode_back() {
        let info = r#"{"id":"id 1/x","state":"running"}"#;
        let (client, caller) = client(vec![Scripted::json(200, info)]);

        let handle = client.handle("op/with space", "id 1/x");
        let fetched = handle.get_info(GetOperationInfoOptions::default()).await.unwrap();
        assert_eq!(fetched.state, OperationState::Running);

        let recorded = caller.recorded();
        assert_eq!(recorded[0].method, Method::GET);
        let path = recorded[0].url.path().to_owned();
        assert_eq!(path, "/svc/op%2Fwith%20space/id%201%2Fx");

        let decoded: Vec<String> = path
            .trim_start_matches('/')
            .split('/')
            .map(|s| percent_decode_str(s).decode_utf8().unwrap().into_owned())
            .collect();
        assert_eq!(decoded, vec!["svc", "op/with space", "id 1/x"]);
    }

    #[tokio::test]
    async fn get_result_clamps_wait_to_the_deadline() {
        let (client, caller) = client(vec![Scripted::json(200, "7")]);

        let options = GetOperationResultOptions {
            wait: Duration::from_secs(60),
            request_timeout: Some(Duration::from_secs(1)),
            ..Default::default()
        };
        let result: u32 = client.handle("op", "id").get_result(options).await.unwrap();
        assert_eq!(result, 7);

        let recorded = caller.recorded();
        let wait_ms = wait_query_ms(&recorded[0].url).unwrap();
        assert!(wait_ms <= 6_000, "wait {wait_ms}ms exceeds deadline + padding");
        assert!(wait_ms > 5_000, "wait {wait_ms}ms lost the deadline padding");

        let timeout_header = recorded[0]
            .headers
            .get(HEADER_REQUEST_TIMEOUT)
            .unwrap()
            .to_str()
            .unwrap()
            .to_owned();
        assert!(timeout_header.ends_with("ms"));
    }

    #[tokio::test]
    async fn zero_wait_sends_no_wait_query() {
        let (client, caller) = client(vec![Scripted::new(STATUS_OPERATION_RUNNING, b"")]);

        let err = client
            .handle("op", "id")
            .get_result::<u32>(GetOperationResultOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::StillRunning));

        let recorded = caller.recorded();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].url.query(), None);
    }

    #[tokio::test]
    async fn wait_timeout_re_polls_with_reduced_budget() {
        let (client, caller) = client(vec![
            Scripted::new(408, b"").delayed(Duration::from_millis(50)),
            Scripted::json(200, "\"done\""),
        ]);

        let options = GetOperationResultOptions {
            wait: Duration::from_secs(30),
            ..Default::default()
        };
        let result: String = client.handle("op", "id").get_result(options).await.unwrap();
        assert_eq!(result, "done");

        let recorded = caller.recorded();
        assert_eq!(recorded.len(), 2);
        let first = wait_query_ms(&recorded[0].url).unwrap();
        let second = wait_query_ms(&recorded[1].url).unwrap();
        assert_eq!(first, 30_000);
        assert!(second < first, "budget should shrink: {second} >= {first}");
    }

    #[tokio::test]
    async fn exhausted_wait_budget_surfaces_still_running() {
        let (client, caller) = client(vec![
            Scripted::new(408, b"").delayed(Duration::from_millis(80)),
        ]);

        let options = GetOperationResultOptions {
            wait: Duration::from_millis(50),
            ..Default::default()
        };
        let err = client
            .handle("op", "id")
            .get_result::<u32>(options)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::StillRunning));
        assert_eq!(caller.recorded().len(), 1);
    }

    #[tokio::test]
    async fn operation_failed_response_decodes_state_and_failure() {
        let (client, _) = client(vec![Scripted::json(
            STATUS_OPERATION_FAILED,
            r#"{"message":"boom"}"#,
        )
        .header(HEADER_OPERATION_STATE, "failed")]);

        let err = client
            .handle("op", "id")
            .get_result::<u32>(GetOperationResultOptions::default())
            .await
            .unwrap_err();
        match err {
            ClientError::Unsuccessful(err) => {
                assert_eq!(err.state, OperationState::Failed);
                assert_eq!(err.failure.message, "boom");
            }
            other => panic!("expected unsuccessful, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn operation_failed_without_state_header_is_a_transport_error() {
        let (client, _) = client(vec![Scripted::json(
            STATUS_OPERATION_FAILED,
            r#"{"message":"boom"}"#,
        )]);

        let err = client
            .handle("op", "id")
            .get_result::<u32>(GetOperationResultOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Transport(_)));
    }

    #[tokio::test]
    async fn handler_errors_are_reconstructed_best_effort() {
        let (client, _) = client(vec![
            Scripted::json(404, r#"{"message":"no such operation"}"#),
            Scripted::new(503, b"<html>down</html>"),
        ]);

        let handle = client.handle("op", "id");
        match handle.get_info(GetOperationInfoOptions::default()).await.unwrap_err() {
            ClientError::Handler(err) => {
                assert_eq!(err.status_code, StatusCode::NOT_FOUND);
                assert_eq!(err.failure.unwrap().message, "no such operation");
            }
            other => panic!("expected handler error, got {other:?}"),
        }
        match handle.get_info(GetOperationInfoOptions::default()).await.unwrap_err() {
            ClientError::Handler(err) => {
                assert_eq!(err.status_code, StatusCode::SERVICE_UNAVAILABLE);
                assert_eq!(err.failure.unwrap().message, "Service Unavailable");
            }
            other => panic!("expected handler error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_accepts_202_and_rejects_the_rest() {
        let (client, caller) = client(vec![
            Scripted::new(202, b""),
            Scripted::json(400, r#"{"message":"already done"}"#),
        ]);

        let handle = client.handle("op", "id");
        handle.cancel(CancelOperationOptions::default()).await.unwrap();

        let recorded = caller.recorded();
        assert_eq!(recorded[0].method, Method::POST);
        assert_eq!(recorded[0].url.path(), "/svc/op/id/cancel");

        let err = handle.cancel(CancelOperationOptions::default()).await.unwrap_err();
        assert!(matches!(err, ClientError::Handler(_)));
    }

    #[tokio::test]
    async fn start_routes_sync_and_async_responses() {
        let (client, caller) = client(vec![
            Scripted::json(200, "42"),
            Scripted::json(201, r#"{"id":"op-1","state":"running"}"#),
        ]);

        let options = StartOperationOptions {
            request_id: Some("req-1".to_owned()),
            callback_url: Some("http://caller.test/cb".to_owned()),
            ..Default::default()
        };
        let input = client.serializer().serialize(&42u32).unwrap();
        match client.start_operation("adder", input, options).await.unwrap() {
            StartOperationResult::Sync(lazy) => {
                let value: u32 = lazy.consume().await.unwrap();
                assert_eq!(value, 42);
            }
            StartOperationResult::Async(_) => panic!("expected sync result"),
        }

        let recorded = caller.recorded();
        assert_eq!(recorded[0].method, Method::POST);
        assert_eq!(recorded[0].url.path(), "/svc/adder");
        assert_eq!(
            recorded[0].headers.get(HEADER_REQUEST_ID).unwrap(),
            "req-1"
        );
        assert!(recorded[0]
            .url
            .query_pairs()
            .any(|(k, v)| k == QUERY_CALLBACK_URL && v == "http://caller.test/cb"));
        assert_eq!(
            recorded[0].headers.get(header::CONTENT_TYPE).unwrap(),
            CONTENT_TYPE_JSON
        );

        match client
            .start_operation("adder", Content::empty(), StartOperationOptions::default())
            .await
            .unwrap()
        {
            StartOperationResult::Async(handle) => {
                assert_eq!(handle.operation, "adder");
                assert_eq!(handle.id, "op-1");
            }
            StartOperationResult::Sync(_) => panic!("expected async result"),
        }
    }

    #[tokio::test]
    async fn async_start_with_empty_id_is_a_transport_error() {
        let (client, _) = client(vec![Scripted::json(
            201,
            r#"{"id":"","state":"running"}"#,
        )]);

        let err = client
            .start_operation("op", Content::empty(), StartOperationOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Transport(_)));
    }

    #[tokio::test]
    async fn execute_operation_polls_after_an_async_start() {
        let (client, caller) = client(vec![
            Scripted::json(201, r#"{"id":"op-9","state":"running"}"#),
            Scripted::json(200, "\"computed\""),
        ]);

        let options = ExecuteOperationOptions {
            wait: Duration::from_secs(10),
            ..Default::default()
        };
        let result = client
            .execute_operation("compute", Content::empty(), options)
            .await
            .unwrap();
        let value: String = result.consume().await.unwrap();
        assert_eq!(value, "computed");

        let recorded = caller.recorded();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].url.path(), "/svc/compute");
        assert_eq!(recorded[1].url.path(), "/svc/compute/op-9/result");
        assert_eq!(wait_query_ms(&recorded[1].url), Some(10_000));
    }

    #[tokio::test]
    async fn user_headers_cannot_shadow_reserved_ones() {
        let info = r#"{"id":"id","state":"running"}"#;
        let (client, caller) = client(vec![Scripted::json(200, info)]);

        let mut header = HeaderMap::new();
        header.insert(header::USER_AGENT, HeaderValue::from_static("impostor"));
        header.insert("nexus-tenant", HeaderValue::from_static("acme"));

        client
            .handle("op", "id")
            .get_info(GetOperationInfoOptions {
                header,
                request_timeout: None,
            })
            .await
            .unwrap();

        let recorded = caller.recorded();
        assert_eq!(
            recorded[0].headers.get(header::USER_AGENT).unwrap(),
            USER_AGENT
        );
        assert_eq!(recorded[0].headers.get("nexus-tenant").unwrap(), "acme");
    }
}
