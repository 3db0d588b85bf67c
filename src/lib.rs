//! # Nexus HTTP runtime
//!
//! A client/server runtime for the Nexus asynchronous RPC protocol layered
//! over HTTP/1.1. A caller starts a named, possibly long-running operation on
//! a remote service; the operation either completes synchronously or is
//! accepted for asynchronous execution under a server-issued ID. The caller
//! may then poll for status, long-poll for the result, request cancelation,
//! or receive a server-initiated completion on a callback URL it supplied at
//! start time.
//!
//! # Protocol
//!
//! Every operation maps onto a small, uniform HTTP surface:
//!
//! | Endpoint                                  | Method | Success                 |
//! |-------------------------------------------|--------|-------------------------|
//! | `/{operation}`                            | POST   | 200 (sync result) or 201 (accepted, body = `{"id","state":"running"}`) |
//! | `/{operation}/{operation_id}`             | GET    | 200 (operation info)    |
//! | `/{operation}/{operation_id}/result`      | GET    | 200 (result payload)    |
//! | `/{operation}/{operation_id}/cancel`      | POST   | 202 (cancelation delivered) |
//! | callback URL (completion)                 | POST   | per completion handler  |
//!
//! Two reserved status codes outside the standard set disambiguate outcomes
//! on the result endpoint: [`STATUS_OPERATION_RUNNING`] when the operation
//! has not completed, and [`STATUS_OPERATION_FAILED`] when it reached a
//! terminal non-success state (the `nexus-operation-state` header carries
//! `failed` or `canceled` and the body carries a JSON
//! [`Failure`](error::Failure)). 408 means the server-side wait window for a
//! long poll elapsed without completion and the caller should re-poll if it
//! has wait budget left.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────┐                 ┌──────────────────────────┐
//! │ Client                  │                 │ ServiceHandler            │
//! │                         │   HTTP/1.1      │                          │
//! │ start_operation ───────►│ ──────────────► │ Handler::start_operation  │
//! │ handle.get_info ───────►│ ──────────────► │ Handler::get_operation_*  │
//! │ handle.get_result ─────►│ ◄── long poll ─ │ Handler::cancel_operation │
//! │ handle.cancel ─────────►│                 │                          │
//! └────────────────────────┘                 └──────────────────────────┘
//!          ▲                                              │
//!          │            POST <callback url>               ▼
//! ┌────────────────────────┐                 ┌──────────────────────────┐
//! │ CompletionDispatcher    │ ◄────────────── │ OperationCompletion       │
//! │  └► CompletionHandler   │                 │  (terminal outcome push)  │
//! └────────────────────────┘                 └──────────────────────────┘
//! ```
//!
//! The client executes requests through the pluggable
//! [`HttpCaller`](http_caller::HttpCaller) trait (a reqwest-backed
//! implementation ships behind the `reqwest` feature); the server side is a
//! hyper request handler behind the `server` feature.

use serde::{Deserialize, Serialize};

pub mod client;
pub mod completion;
pub mod error;
pub mod http_caller;
pub mod link;
pub mod payload;

#[cfg(feature = "server")]
pub mod server;

pub use client::{Client, OperationHandle, StartOperationResult};
pub use error::{ClientError, Failure, HandlerError, OperationError, UnsuccessfulOperationError};
pub use http_caller::HttpCaller;
pub use link::Link;
pub use payload::{Content, JsonSerializer, LazyValue, Reader, Serializer};

/// Header carrying an [`OperationState`] on responses that report a terminal
/// state, and on completion requests as the source of truth.
pub const HEADER_OPERATION_STATE: &str = "nexus-operation-state";

/// Header identifying the operation in completion requests, for completions
/// that arrive before the originating start response.
pub const HEADER_OPERATION_ID: &str = "nexus-operation-id";

/// Header carrying the operation start time on completion requests, in
/// HTTP-date format.
pub const HEADER_OPERATION_START_TIME: &str = "nexus-operation-start-time";

/// Header carrying the caller-supplied dedupe key for start requests.
pub const HEADER_REQUEST_ID: &str = "nexus-request-id";

/// Header projecting the caller's deadline onto the wire so downstream
/// intermediaries may observe and enforce it. Formatted as `<millis>ms`.
pub const HEADER_REQUEST_TIMEOUT: &str = "nexus-request-timeout";

/// Header carrying an ordered sequence of opaque [`Link`] values.
pub const HEADER_LINK: &str = "nexus-link";

/// Query parameter holding the long-poll wait duration on get-result
/// requests, e.g. `wait=5000ms`.
pub const QUERY_WAIT: &str = "wait";

/// Query parameter holding the callback URL on start requests.
pub const QUERY_CALLBACK_URL: &str = "callback";

/// JSON content type for info, failure, and default-serialized payloads.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Content type for raw byte payloads.
pub const CONTENT_TYPE_OCTET_STREAM: &str = "application/octet-stream";

/// Reserved status code: the operation has not yet completed. Served with an
/// empty body.
pub const STATUS_OPERATION_RUNNING: u16 = 468;

/// Reserved status code: the operation completed as failed or canceled. The
/// `nexus-operation-state` header names the state and the body is a JSON
/// [`Failure`](error::Failure).
pub const STATUS_OPERATION_FAILED: u16 = 466;

/// User agent sent on every client and completion request.
pub const USER_AGENT: &str = concat!("nexus-http-rust/", env!("CARGO_PKG_VERSION"));

/// Lifecycle state of an operation, as it appears on the wire both in JSON
/// bodies and in the `nexus-operation-state` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationState {
    /// The operation is in progress.
    Running,
    /// The operation completed successfully.
    Succeeded,
    /// The operation completed in a failed state.
    Failed,
    /// The operation was canceled.
    Canceled,
}

impl core::fmt::Display for OperationState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        })
    }
}

impl core::str::FromStr for OperationState {
    type Err = error::InvalidOperationState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(error::InvalidOperationState(other.to_owned())),
        }
    }
}

/// Information about an operation, marshaled as JSON on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationInfo {
    /// Server-issued ID, opaque to the client.
    pub id: String,
    /// Current lifecycle state.
    pub state: OperationState,
}
