//! Error types for the Nexus runtime.
//!
//! Three failure channels travel through the protocol and must stay
//! separable at every layer:
//!
//! 1. transport errors — request construction or network I/O failed;
//! 2. [`HandlerError`] — the request failed at the protocol level with an
//!    HTTP status code and an optional structured [`Failure`];
//! 3. [`UnsuccessfulOperationError`] — a successful protocol interaction
//!    reporting that the operation itself completed as failed or canceled.

use http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::OperationState;

/// A boxed error with no further structure.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Structured error payload carried on the wire as a JSON body.
///
/// Only `message` is interpreted by the runtime; any additional fields are
/// preserved and round-trip unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    /// Human-readable error message.
    pub message: String,

    /// Additional structured fields, opaque to the runtime.
    #[serde(flatten)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl Failure {
    /// Create a failure with the given message and no extra fields.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: serde_json::Map::new(),
        }
    }
}

/// Protocol-level failure attributable to the handler or the request.
///
/// Handlers return this to fail a request with a custom status code and
/// structured [`Failure`]; the client reconstructs it from any non-success
/// response via best-effort body decode.
#[derive(Debug, Clone, Error)]
#[error(
    "handler error ({}){}",
    .status_code.as_u16(),
    .failure.as_ref().map(|f| format!(": {}", f.message)).unwrap_or_default()
)]
pub struct HandlerError {
    /// HTTP status code to fail the request with.
    pub status_code: StatusCode,

    /// Failure payload to report in the response body.
    pub failure: Option<Failure>,
}

impl HandlerError {
    /// Create a handler error with the given status code and message.
    #[must_use]
    pub fn new(status_code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status_code,
            failure: Some(Failure::new(message)),
        }
    }

    /// A 400 Bad Request handler error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    /// A 404 Not Found handler error.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl Default for HandlerError {
    fn default() -> Self {
        Self {
            status_code: StatusCode::INTERNAL_SERVER_ERROR,
            failure: None,
        }
    }
}

/// The operation completed as failed or canceled.
///
/// Distinct from [`HandlerError`]: the protocol interaction succeeded, the
/// operation did not.
#[derive(Debug, Clone, Error)]
#[error("operation {state}: {}", .failure.message)]
pub struct UnsuccessfulOperationError {
    /// Terminal state, `failed` or `canceled`.
    pub state: OperationState,

    /// Failure payload reported by the operation.
    pub failure: Failure,
}

/// Failure to encode or decode an operation payload.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// JSON encoding or decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Reading the payload stream failed.
    #[error("failed to read payload stream: {0}")]
    Io(#[from] std::io::Error),
}

/// Error type returned from [`Handler`](crate::server::Handler) and
/// [`CompletionHandler`](crate::completion::CompletionHandler) methods.
///
/// The dispatcher renders each variant differently: `Unsuccessful` becomes
/// the reserved operation-failed status with a state header, `Handler` keeps
/// its status code, `StillRunning` becomes the reserved operation-running
/// status on the result endpoint, and anything else is logged and rendered
/// as a generic 500 without leaking the original message.
#[derive(Debug, Error)]
pub enum OperationError {
    /// The operation completed as failed or canceled.
    #[error(transparent)]
    Unsuccessful(#[from] UnsuccessfulOperationError),

    /// Fail the request with a custom status code and failure payload.
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// The operation has not completed yet. Meaningful only from
    /// `get_operation_result`; other endpoints treat it as internal.
    #[error("operation still running")]
    StillRunning,

    /// Any other failure. The message is logged server-side and never sent
    /// to the caller.
    #[error(transparent)]
    Internal(#[from] BoxError),
}

impl OperationError {
    /// Wrap an arbitrary error as an internal failure.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into().into())
    }
}

impl From<PayloadError> for OperationError {
    fn from(err: PayloadError) -> Self {
        Self::Internal(Box::new(err))
    }
}

/// Errors surfaced by [`Client`](crate::client::Client) operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Request construction or network I/O failed, or the response violated
    /// the protocol. Surfaced verbatim.
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),

    /// The server failed the request at the protocol level.
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// The operation completed as failed or canceled.
    #[error(transparent)]
    Unsuccessful(#[from] UnsuccessfulOperationError),

    /// The operation has not completed within the requested wait time.
    #[error("operation still running")]
    StillRunning,

    /// Encoding or decoding a payload failed.
    #[error(transparent)]
    Payload(#[from] PayloadError),
}

impl ClientError {
    /// Wrap an arbitrary error as a transport failure.
    #[must_use]
    pub fn transport(err: impl Into<BoxError>) -> Self {
        Self::Transport(err.into())
    }
}

/// A string did not name a known [`OperationState`].
#[derive(Debug, Clone, Error)]
#[error("invalid operation state: {0:?}")]
pub struct InvalidOperationState(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_preserves_unknown_fields() {
        let raw = r#"{"message":"boom","code":7,"meta":{"retryable":true}}"#;
        let failure: Failure = serde_json::from_str(raw).unwrap();
        assert_eq!(failure.message, "boom");
        assert_eq!(failure.details["code"], 7);

        let round_tripped = serde_json::to_value(&failure).unwrap();
        let original: serde_json::Value = serde_json::from_str(raw).unwrap();
        assert_eq!(round_tripped, original);
    }

    #[test]
    fn handler_error_display_includes_message_when_present() {
        let err = HandlerError::bad_request("bad wait");
        assert_eq!(err.to_string(), "handler error (400): bad wait");

        let bare = HandlerError::default();
        assert_eq!(bare.to_string(), "handler error (500)");
    }

    #[test]
    fn unsuccessful_display_names_the_state() {
        let err = UnsuccessfulOperationError {
            state: OperationState::Canceled,
            failure: Failure::new("stop requested"),
        };
        assert_eq!(err.to_string(), "operation canceled: stop requested");
    }
}
