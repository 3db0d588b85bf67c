//! Completion delivery: pushing a terminal operation outcome to the callback
//! URL a caller supplied at start time, and receiving such pushes.
//!
//! The caller side packages an [`OperationCompletion`] into an HTTP request
//! for an [`HttpCaller`] to execute. The receiver side is a
//! [`CompletionDispatcher`] (behind the `server` feature) that parses the
//! inbound request into a [`CompletionRequest`] and forwards it to a
//! user-supplied [`CompletionHandler`].

use std::time::SystemTime;

use http::{header, HeaderMap, HeaderValue, Method};
use url::Url;

use crate::{
    error::{ClientError, Failure},
    http_caller::{HttpCaller, HttpRequest},
    link::{add_links_to_headers, Link},
    payload::Content,
    OperationState, CONTENT_TYPE_JSON, HEADER_LINK, HEADER_OPERATION_ID,
    HEADER_OPERATION_START_TIME, HEADER_OPERATION_STATE, USER_AGENT,
};

/// A terminal operation outcome ready to be delivered to a callback URL.
#[derive(Debug)]
pub enum OperationCompletion {
    /// The operation succeeded; the payload carries the result.
    Successful(CompletionSuccessful),

    /// The operation completed as failed or canceled.
    Unsuccessful(CompletionUnsuccessful),
}

/// A successful completion: result content plus the identity fields a
/// receiver needs when the completion arrives before the originating start
/// response.
#[derive(Debug)]
pub struct CompletionSuccessful {
    /// Extra headers to send with the completion request.
    pub header: HeaderMap,

    /// The operation result.
    pub content: Content,

    /// ID of the completed operation.
    pub operation_id: Option<String>,

    /// When the operation started.
    pub start_time: Option<SystemTime>,

    /// Links back to the operation.
    pub start_links: Vec<Link>,
}

impl CompletionSuccessful {
    /// A successful completion carrying `content`, with no identity fields.
    #[must_use]
    pub fn new(content: Content) -> Self {
        Self {
            header: HeaderMap::new(),
            content,
            operation_id: None,
            start_time: None,
            start_links: Vec::new(),
        }
    }
}

/// An unsuccessful completion: a terminal failed or canceled state with its
/// [`Failure`].
#[derive(Debug)]
pub struct CompletionUnsuccessful {
    /// Extra headers to send with the completion request.
    pub header: HeaderMap,

    /// Terminal state, `failed` or `canceled`.
    pub state: OperationState,

    /// Failure payload to deliver.
    pub failure: Failure,

    /// ID of the completed operation.
    pub operation_id: Option<String>,

    /// When the operation started.
    pub start_time: Option<SystemTime>,

    /// Links back to the operation.
    pub start_links: Vec<Link>,
}

impl CompletionUnsuccessful {
    /// A completion reporting the operation as failed.
    #[must_use]
    pub fn failed(failure: Failure) -> Self {
        Self::with_state(OperationState::Failed, failure)
    }

    /// A completion reporting the operation as canceled.
    #[must_use]
    pub fn canceled(failure: Failure) -> Self {
        Self::with_state(OperationState::Canceled, failure)
    }

    fn with_state(state: OperationState, failure: Failure) -> Self {
        Self {
            header: HeaderMap::new(),
            state,
            failure,
            operation_id: None,
            start_time: None,
            start_links: Vec::new(),
        }
    }
}

impl OperationCompletion {
    /// Build the HTTP request that delivers this completion to `url`.
    ///
    /// # Errors
    ///
    /// Returns a transport error for link values or header fields that
    /// cannot appear on the wire, or an unsuccessful completion whose state
    /// is not terminal; a payload error when the failure cannot be encoded.
    pub fn into_http_request(self, url: Url) -> Result<HttpRequest, ClientError> {
        let (mut headers, state, operation_id, start_time, start_links, body) = match self {
            Self::Successful(completion) => {
                let mut headers = completion.header;
                crate::payload::content_header_to_http(&completion.content.header, &mut headers);
                headers.insert(
                    header::CONTENT_LENGTH,
                    HeaderValue::from(completion.content.data.len() as u64),
                );
                (
                    headers,
                    OperationState::Succeeded,
                    completion.operation_id,
                    completion.start_time,
                    completion.start_links,
                    completion.content.data,
                )
            }
            Self::Unsuccessful(completion) => {
                if !matches!(
                    completion.state,
                    OperationState::Failed | OperationState::Canceled
                ) {
                    return Err(ClientError::transport(format!(
                        "completion state must be failed or canceled, got {}",
                        completion.state
                    )));
                }
                let mut headers = completion.header;
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static(CONTENT_TYPE_JSON),
                );
                let body = serde_json::to_vec(&completion.failure)
                    .map_err(crate::error::PayloadError::from)?;
                (
                    headers,
                    completion.state,
                    completion.operation_id,
                    completion.start_time,
                    completion.start_links,
                    bytes::Bytes::from(body),
                )
            }
        };

        let state_value = HeaderValue::from_str(&state.to_string())
            .map_err(|e| ClientError::Transport(Box::new(e)))?;
        headers.insert(HEADER_OPERATION_STATE, state_value);

        if let (None, Some(operation_id)) = (headers.get(HEADER_OPERATION_ID), operation_id) {
            let value = HeaderValue::from_str(&operation_id)
                .map_err(|e| ClientError::Transport(Box::new(e)))?;
            headers.insert(HEADER_OPERATION_ID, value);
        }
        if let (None, Some(start_time)) = (headers.get(HEADER_OPERATION_START_TIME), start_time) {
            let value = HeaderValue::from_str(&httpdate::fmt_http_date(start_time))
                .map_err(|e| ClientError::Transport(Box::new(e)))?;
            headers.insert(HEADER_OPERATION_START_TIME, value);
        }
        if headers.get(HEADER_LINK).is_none() {
            add_links_to_headers(&start_links, &mut headers)
                .map_err(|e| ClientError::Transport(Box::new(e)))?;
        }
        headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));

        Ok(HttpRequest {
            method: Method::POST,
            url,
            headers,
            body,
        })
    }

    /// Deliver this completion to `url` through `caller`.
    ///
    /// # Errors
    ///
    /// As for [`into_http_request`](Self::into_http_request), plus a
    /// [`ClientError::Handler`] reconstructed from any non-2xx response.
    pub async fn deliver<C: HttpCaller>(self, caller: &C, url: Url) -> Result<(), ClientError> {
        let request = self.into_http_request(url)?;
        let response = caller
            .call(request)
            .await
            .map_err(|e| ClientError::Transport(Box::new(e)))?;

        let status = response.status;
        if status.is_success() {
            return Ok(());
        }
        let body = crate::payload::collect_stream(response.body)
            .await
            .map_err(|e| ClientError::Transport(Box::new(e)))?;
        Err(crate::client::best_effort_handler_error(status, &response.headers, &body).into())
    }
}

#[cfg(feature = "server")]
pub use dispatcher::{CompletionDispatcher, CompletionHandler, CompletionRequest};

#[cfg(feature = "server")]
mod dispatcher {
    use std::{sync::Arc, time::SystemTime};

    use async_trait::async_trait;
    use http_body_util::Full;
    use hyper::{body::Bytes, body::Incoming, Request, Response, StatusCode};

    use crate::{
        error::{Failure, HandlerError, OperationError},
        link::{links_from_headers, Link},
        payload::{content_header_from_http, is_media_type_json, JsonSerializer, LazyValue, Reader, Serializer},
        server::{incoming_stream, read_body, DEFAULT_MAX_BODY_SIZE},
        OperationState, HEADER_OPERATION_ID, HEADER_OPERATION_START_TIME, HEADER_OPERATION_STATE,
    };

    /// Input to [`CompletionHandler::complete_operation`].
    #[derive(Debug)]
    pub struct CompletionRequest<S: Serializer = JsonSerializer> {
        /// Terminal state reported by the completion.
        pub state: OperationState,

        /// ID of the operation, when the sender provided one. Lets a
        /// receiver correlate a completion that arrives before the
        /// originating start response.
        pub operation_id: Option<String>,

        /// When the operation started.
        pub start_time: Option<SystemTime>,

        /// Links back to the operation.
        pub start_links: Vec<Link>,

        /// Failure payload; set when the state is failed or canceled.
        pub failure: Option<Failure>,

        /// Result payload; set when the state is succeeded.
        pub result: Option<LazyValue<S>>,

        /// Head of the original HTTP request.
        pub http: http::request::Parts,
    }

    /// User-supplied sink for completion pushes.
    #[async_trait]
    pub trait CompletionHandler<S: Serializer = JsonSerializer>: Send + Sync + 'static {
        /// Consume one completion.
        async fn complete_operation(
            &self,
            request: CompletionRequest<S>,
        ) -> Result<(), OperationError>;
    }

    /// Parses inbound completion requests and forwards them to a
    /// [`CompletionHandler`].
    #[derive(Debug)]
    pub struct CompletionDispatcher<H, S: Serializer = JsonSerializer> {
        handler: Arc<H>,
        serializer: S,
        max_body_size: usize,
    }

    impl<H, S: Serializer> Clone for CompletionDispatcher<H, S> {
        fn clone(&self) -> Self {
            Self {
                handler: Arc::clone(&self.handler),
                serializer: self.serializer.clone(),
                max_body_size: self.max_body_size,
            }
        }
    }

    impl<H> CompletionDispatcher<H> {
        /// Create a dispatcher decoding successful results with the default
        /// JSON serializer.
        #[must_use]
        pub fn new(handler: H) -> Self {
            Self {
                handler: Arc::new(handler),
                serializer: JsonSerializer,
                max_body_size: DEFAULT_MAX_BODY_SIZE,
            }
        }
    }

    impl<H, S: Serializer> CompletionDispatcher<H, S> {
        /// Replace the serializer handed to successful-result
        /// [`LazyValue`]s.
        #[must_use]
        pub fn with_serializer<S2: Serializer>(self, serializer: S2) -> CompletionDispatcher<H, S2> {
            CompletionDispatcher {
                handler: self.handler,
                serializer,
                max_body_size: self.max_body_size,
            }
        }

        /// Set the maximum body size for failure payloads.
        #[must_use]
        pub const fn with_max_body_size(mut self, size: usize) -> Self {
            self.max_body_size = size;
            self
        }
    }

    impl<H, S> CompletionDispatcher<H, S>
    where
        H: CompletionHandler<S>,
        S: Serializer,
    {
        /// Parse an inbound completion request and forward it to the
        /// handler.
        ///
        /// # Errors
        ///
        /// Returns `hyper::Error` only if the underlying HTTP transport
        /// fails; parse and handler failures are rendered as responses.
        pub async fn handle(
            &self,
            request: Request<Incoming>,
        ) -> Result<Response<Full<Bytes>>, hyper::Error> {
            let completion = match self.completion_request(request).await {
                Ok(completion) => completion,
                Err(err) => return Ok(crate::server::failure_response(err)),
            };

            Ok(match self.handler.complete_operation(completion).await {
                Ok(()) => ok_response(),
                Err(err) => crate::server::failure_response(err),
            })
        }

        async fn completion_request(
            &self,
            request: Request<Incoming>,
        ) -> Result<CompletionRequest<S>, OperationError> {
            let (parts, body) = request.into_parts();

            let raw_state = parts
                .headers
                .get(HEADER_OPERATION_STATE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_owned();
            let state: OperationState = raw_state.parse().map_err(|_| {
                HandlerError::bad_request(format!(
                    "invalid request operation state: {raw_state:?}"
                ))
            })?;

            let operation_id = parts
                .headers
                .get(HEADER_OPERATION_ID)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_owned);

            let start_time = match parts.headers.get(HEADER_OPERATION_START_TIME) {
                Some(value) => {
                    let raw = value.to_str().map_err(|_| {
                        HandlerError::bad_request("failed to parse operation start time header")
                    })?;
                    Some(httpdate::parse_http_date(raw).map_err(|_| {
                        HandlerError::bad_request("failed to parse operation start time header")
                    })?)
                }
                None => None,
            };

            let start_links = links_from_headers(&parts.headers).map_err(|_| {
                HandlerError::bad_request("failed to decode links from request headers")
            })?;

            let (failure, result) = match state {
                OperationState::Failed | OperationState::Canceled => {
                    let content_type = parts
                        .headers
                        .get(http::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default();
                    if !is_media_type_json(content_type) {
                        return Err(HandlerError::bad_request(format!(
                            "invalid request content type: {content_type:?}"
                        ))
                        .into());
                    }
                    let body = read_body(body, self.max_body_size).await?;
                    let failure: Failure = serde_json::from_slice(&body).map_err(|_| {
                        HandlerError::bad_request("failed to read failure from request body")
                    })?;
                    (Some(failure), None)
                }
                OperationState::Succeeded => {
                    let header = content_header_from_http(&parts.headers);
                    let reader = Reader::new(incoming_stream(body), header);
                    (None, Some(LazyValue::new(reader, self.serializer.clone())))
                }
                OperationState::Running => {
                    return Err(HandlerError::bad_request(format!(
                        "invalid request operation state: {raw_state:?}"
                    ))
                    .into());
                }
            };

            Ok(CompletionRequest {
                state,
                operation_id,
                start_time,
                start_links,
                failure,
                result,
                http: parts,
            })
        }
    }

    #[allow(clippy::expect_used)]
    fn ok_response() -> Response<Full<Bytes>> {
        Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::new()))
            .expect("static response")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::CONTENT_TYPE_OCTET_STREAM;

    fn callback_url() -> Url {
        Url::parse("http://caller.test/callbacks/op").unwrap()
    }

    #[test]
    fn successful_completion_sets_state_and_content_headers() {
        let mut completion = CompletionSuccessful::new(Content::from_bytes(b"result".to_vec()));
        completion.operation_id = Some("op-7".to_owned());
        completion.start_links = vec![Link::from("<http://svc/op/op-7>")];

        let request = OperationCompletion::Successful(completion)
            .into_http_request(callback_url())
            .unwrap();

        assert_eq!(request.method, Method::POST);
        assert_eq!(
            request.headers.get(HEADER_OPERATION_STATE).unwrap(),
            "succeeded"
        );
        assert_eq!(request.headers.get(HEADER_OPERATION_ID).unwrap(), "op-7");
        assert_eq!(
            request.headers.get(header::CONTENT_TYPE).unwrap(),
            CONTENT_TYPE_OCTET_STREAM
        );
        assert_eq!(request.headers.get(header::CONTENT_LENGTH).unwrap(), "6");
        assert_eq!(
            request.headers.get(crate::HEADER_LINK).unwrap(),
            "<http://svc/op/op-7>"
        );
        assert_eq!(&request.body[..], b"result");
    }

    #[test]
    fn unsuccessful_completion_carries_a_json_failure() {
        let completion = CompletionUnsuccessful::canceled(Failure::new("stop requested"));
        let request = OperationCompletion::Unsuccessful(completion)
            .into_http_request(callback_url())
            .unwrap();

        assert_eq!(
            request.headers.get(HEADER_OPERATION_STATE).unwrap(),
            "canceled"
        );
        assert_eq!(
            request.headers.get(header::CONTENT_TYPE).unwrap(),
            CONTENT_TYPE_JSON
        );
        let failure: Failure = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(failure.message, "stop requested");
    }

    #[test]
    fn non_terminal_unsuccessful_state_is_rejected() {
        let mut completion = CompletionUnsuccessful::failed(Failure::new("boom"));
        completion.state = OperationState::Running;

        let err = OperationCompletion::Unsuccessful(completion)
            .into_http_request(callback_url())
            .unwrap_err();
        assert!(matches!(err, ClientError::Transport(_)));
    }

    #[test]
    fn start_time_round_trips_through_http_date() {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let mut completion = CompletionSuccessful::new(Content::empty());
        completion.start_time = Some(start);

        let request = OperationCompletion::Successful(completion)
            .into_http_request(callback_url())
            .unwrap();
        let raw = request
            .headers
            .get(HEADER_OPERATION_START_TIME)
            .unwrap()
            .to_str()
            .unwrap();
        assert_eq!(httpdate::parse_http_date(raw).unwrap(), start);
    }

    #[test]
    fn explicit_headers_take_precedence_over_identity_fields() {
        let mut completion = CompletionSuccessful::new(Content::empty());
        completion.operation_id = Some("from-field".to_owned());
        completion
            .header
            .insert(HEADER_OPERATION_ID, http::HeaderValue::from_static("from-header"));

        let request = OperationCompletion::Successful(completion)
            .into_http_request(callback_url())
            .unwrap();
        assert_eq!(
            request.headers.get(HEADER_OPERATION_ID).unwrap(),
            "from-header"
        );
    }

    #[test]
    fn user_agent_is_always_set() {
        let request = OperationCompletion::Successful(CompletionSuccessful::new(Content::empty()))
            .into_http_request(callback_url())
            .unwrap();
        assert_eq!(request.headers.get(header::USER_AGENT).unwrap(), USER_AGENT);
    }
}
